//! Placement Computer.
//!
//! Pure functions over the desired document and the current placement snapshot. No I/O, no
//! `kube`/`reqwest` dependency: every function here is a plain data transform, which is what
//! makes placement safety and idempotence testable as property tests without a fake Kubernetes
//! server.
use crate::crd::IsolationGroupSpec;

use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use m3dbop_admin_client::model::{Placement, PlacementInstance};

/// A pod that currently exists, is ready, and whose identity has resolved — the only kind of pod
/// the Placement Computer ever reasons about. Unready or unresolved pods are simply absent from
/// this list; the reconciler decides when that absence should block a phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPod {
    pub group: String,
    pub ordinal: u32,
    pub instance_id: String,
    /// `<pod>.<headless-svc>.<namespace>.svc` style fully-qualified hostname.
    pub fqdn: String,
}

const DEFAULT_WEIGHT: u32 = 100;

/// E(D): for each isolation group with target count n(g), the resolved pods at ordinals
/// `0..n(g)` in ordinal order. Groups or ordinals with no resolved pod yet are simply absent —
/// the caller (bootstrap/add-instances phases) is responsible for deciding whether that's
/// acceptable for the phase it's running.
pub fn expected_instance_set<'a>(
    groups: &[IsolationGroupSpec],
    resolved_pods: &'a [ResolvedPod],
) -> Vec<&'a ResolvedPod> {
    let mut out = Vec::new();
    for g in groups {
        let mut group_pods: Vec<&ResolvedPod> = resolved_pods
            .iter()
            .filter(|p| p.group == g.name && p.ordinal < g.num_instances)
            .collect();
        group_pods.sort_by_key(|p| p.ordinal);
        out.extend(group_pods);
    }
    out
}

/// The instance list to submit to `InitPlacement`: the full expected set, each tagged with its
/// group as rack, a `<fqdn>:<port>` endpoint, and the default initial weight.
pub fn initial_placement_instances(
    groups: &[IsolationGroupSpec],
    resolved_pods: &[ResolvedPod],
    port: u32,
) -> Vec<PlacementInstance> {
    expected_instance_set(groups, resolved_pods)
        .into_iter()
        .map(|p| to_placement_instance(p, port))
        .collect()
}

fn to_placement_instance(pod: &ResolvedPod, port: u32) -> PlacementInstance {
    PlacementInstance {
        id: pod.instance_id.clone(),
        isolation_group: pod.group.clone(),
        zone: "embedded".to_string(),
        endpoint: format!("{}:{port}", pod.fqdn),
        weight: DEFAULT_WEIGHT,
        hostname: pod.fqdn.clone(),
        port,
        shard_set_id: None,
    }
}

/// Add set: E(D) minus the instances already present in the placement. Each returned instance is
/// ready to submit to `AddInstances`.
pub fn add_set(
    groups: &[IsolationGroupSpec],
    resolved_pods: &[ResolvedPod],
    placement: &Placement,
    port: u32,
) -> Vec<PlacementInstance> {
    let existing: HashSet<&str> = placement.instance_ids().collect();
    expected_instance_set(groups, resolved_pods)
        .into_iter()
        .filter(|p| !existing.contains(p.instance_id.as_str()))
        .map(|p| to_placement_instance(p, port))
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoveCandidate {
    pub instance_id: String,
    pub group: String,
}

/// Remove candidate: a single instance present in the placement but absent from E(D).
///
/// A candidate whose id matches a currently resolved (live) pod — the ordinary scale-down case,
/// where the pod still exists but its ordinal now exceeds the group's target — is eligible
/// immediately. A candidate with no matching live pod at all (a stale identity, e.g. the pod was
/// rescheduled with a non-durable identity source) is eligible only once `orphan_since` shows the
/// discrepancy has persisted for at least `grace_period`; callers are expected to have recorded
/// the first-observed time for every such id themselves (the Placement Computer holds no state
/// across passes).
///
/// Among eligible candidates: the highest ordinal (when known) wins, ties and unknown-ordinal
/// orphans broken by instance id, lexicographically. At most one candidate is ever returned.
pub fn remove_candidate(
    groups: &[IsolationGroupSpec],
    resolved_pods: &[ResolvedPod],
    placement: &Placement,
    orphan_since: &HashMap<String, DateTime<Utc>>,
    now: DateTime<Utc>,
    grace_period: Duration,
) -> Option<RemoveCandidate> {
    let expected: HashSet<&str> = expected_instance_set(groups, resolved_pods)
        .into_iter()
        .map(|p| p.instance_id.as_str())
        .collect();
    let live_by_id: HashMap<&str, &ResolvedPod> = resolved_pods
        .iter()
        .map(|p| (p.instance_id.as_str(), p))
        .collect();

    let mut candidates: Vec<(Option<u32>, String, String)> = Vec::new();
    for inst in &placement.instances {
        let id = inst.instance.id.as_str();
        if expected.contains(id) {
            continue;
        }
        match live_by_id.get(id) {
            Some(pod) => {
                candidates.push((Some(pod.ordinal), inst.instance.isolation_group.clone(), id.to_string()));
            }
            None => {
                let eligible = orphan_since
                    .get(id)
                    .is_some_and(|since| now.signed_duration_since(*since).to_std().unwrap_or_default() >= grace_period);
                if eligible {
                    candidates.push((None, inst.instance.isolation_group.clone(), id.to_string()));
                }
            }
        }
    }

    candidates.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.2.cmp(&b.2)));
    candidates
        .into_iter()
        .next()
        .map(|(_, group, instance_id)| RemoveCandidate { instance_id, group })
}

/// Safety predicate for removal: the placement must be stable, and removing the
/// candidate must still leave at least `replication_factor` instances spread across at least
/// `replication_factor` distinct isolation groups. `placement.is_stable()` already implies no
/// instance is mid-transition (INITIALIZING/LEAVING), which subsumes "no other instance is
/// currently LEAVING".
pub fn can_remove(placement: &Placement, candidate_id: &str, replication_factor: u8) -> bool {
    if !placement.is_stable() {
        return false;
    }
    let remaining: Vec<_> = placement
        .instances
        .iter()
        .filter(|i| i.instance.id != candidate_id)
        .collect();
    if remaining.len() < replication_factor as usize {
        return false;
    }
    let distinct_groups: BTreeSet<&str> = remaining
        .iter()
        .map(|i| i.instance.isolation_group.as_str())
        .collect();
    distinct_groups.len() >= replication_factor as usize
}

#[cfg(test)]
mod test {
    use super::*;
    use m3dbop_admin_client::model::{InstanceState, PlacementInstanceView, PlacementShard};

    pub(super) fn group(name: &str, n: u32) -> IsolationGroupSpec {
        IsolationGroupSpec {
            name: name.to_string(),
            num_instances: n,
        }
    }

    pub(super) fn pod(group: &str, ordinal: u32, id: &str) -> ResolvedPod {
        ResolvedPod {
            group: group.to_string(),
            ordinal,
            instance_id: id.to_string(),
            fqdn: format!("{group}-{ordinal}.headless.default.svc"),
        }
    }

    pub(super) fn stable_instance(id: &str, group: &str, num_shards: u32) -> PlacementInstanceView {
        PlacementInstanceView {
            instance: PlacementInstance {
                id: id.to_string(),
                isolation_group: group.to_string(),
                zone: "embedded".to_string(),
                endpoint: format!("{id}:9000"),
                weight: 100,
                hostname: id.to_string(),
                port: 9000,
                shard_set_id: None,
            },
            shards: (0..num_shards)
                .map(|s| PlacementShard {
                    id: s,
                    state: InstanceState::Available,
                })
                .collect(),
        }
    }

    pub(super) fn placement(instances: Vec<PlacementInstanceView>, rf: u32) -> Placement {
        Placement {
            instances,
            replica_factor: rf,
            num_shards: 64,
            is_sharded: true,
            version: 1,
        }
    }

    #[test]
    fn test_expected_instance_set_respects_group_order_and_target_count() {
        let groups = vec![group("g1", 1), group("g2", 2)];
        let pods = vec![pod("g2", 0, "b0"), pod("g1", 0, "a0"), pod("g2", 1, "b1"), pod("g2", 2, "b2")];
        let expected = expected_instance_set(&groups, &pods);
        let ids: Vec<_> = expected.iter().map(|p| p.instance_id.as_str()).collect();
        assert_eq!(ids, vec!["a0", "b0", "b1"]);
    }

    #[test]
    fn test_add_set_is_empty_when_placement_already_matches() {
        let groups = vec![group("g1", 1)];
        let pods = vec![pod("g1", 0, "a0")];
        let p = placement(vec![stable_instance("a0", "g1", 64)], 1);
        assert!(add_set(&groups, &pods, &p, 9000).is_empty());
    }

    #[test]
    fn test_add_set_returns_missing_instance() {
        let groups = vec![group("g1", 2)];
        let pods = vec![pod("g1", 0, "a0"), pod("g1", 1, "a1")];
        let p = placement(vec![stable_instance("a0", "g1", 64)], 1);
        let added = add_set(&groups, &pods, &p, 9000);
        assert_eq!(added.len(), 1);
        assert_eq!(added[0].id, "a1");
    }

    #[test]
    fn test_remove_candidate_picks_over_target_ordinal() {
        let groups = vec![group("g1", 1)];
        let pods = vec![pod("g1", 0, "a0"), pod("g1", 1, "a1")];
        let p = placement(
            vec![stable_instance("a0", "g1", 64), stable_instance("a1", "g1", 64)],
            1,
        );
        let candidate = remove_candidate(
            &groups,
            &pods,
            &p,
            &HashMap::new(),
            Utc::now(),
            Duration::from_secs(60),
        )
        .unwrap();
        assert_eq!(candidate.instance_id, "a1");
    }

    #[test]
    fn test_remove_candidate_none_when_placement_matches_expected() {
        let groups = vec![group("g1", 1)];
        let pods = vec![pod("g1", 0, "a0")];
        let p = placement(vec![stable_instance("a0", "g1", 64)], 1);
        assert!(remove_candidate(&groups, &pods, &p, &HashMap::new(), Utc::now(), Duration::from_secs(60)).is_none());
    }

    #[test]
    fn test_remove_candidate_defers_orphan_until_grace_period_elapses() {
        let groups = vec![group("g1", 1)];
        let pods = vec![pod("g1", 0, "a0")]; // "stale" instance has no live pod at all
        let p = placement(
            vec![stable_instance("a0", "g1", 64), stable_instance("stale", "g1", 64)],
            1,
        );
        let since = Utc::now();
        let mut orphans = HashMap::new();
        orphans.insert("stale".to_string(), since);

        assert!(remove_candidate(&groups, &pods, &p, &orphans, since, Duration::from_secs(300)).is_none());

        let later = since + chrono::Duration::seconds(301);
        let candidate = remove_candidate(&groups, &pods, &p, &orphans, later, Duration::from_secs(300)).unwrap();
        assert_eq!(candidate.instance_id, "stale");
    }

    #[test]
    fn test_can_remove_requires_stability() {
        let mut unstable = placement(vec![stable_instance("a0", "g1", 64), stable_instance("a1", "g2", 64)], 2);
        unstable.instances[0].shards[0].state = InstanceState::Initializing;
        assert!(!can_remove(&unstable, "a1", 2));
    }

    #[test]
    fn test_can_remove_requires_enough_remaining_groups_and_instances() {
        let p = placement(
            vec![
                stable_instance("a0", "g1", 64),
                stable_instance("b0", "g2", 64),
            ],
            2,
        );
        // removing either instance would drop below R=2 distinct groups
        assert!(!can_remove(&p, "a0", 2));
    }

    #[test]
    fn test_can_remove_allows_when_enough_groups_remain() {
        let p = placement(
            vec![
                stable_instance("a0", "g1", 64),
                stable_instance("b0", "g2", 64),
                stable_instance("c0", "g3", 64),
            ],
            2,
        );
        assert!(can_remove(&p, "c0", 2));
    }
}

#[cfg(test)]
mod proptests {
    use super::test::*;
    use super::*;

    use proptest::prelude::*;

    /// Invariant 1 (placement safety): whenever `can_remove` says yes, the instances left behind
    /// still span at least `replication_factor` distinct isolation groups and at least
    /// `replication_factor` instances overall, for any stable placement and any candidate in it.
    proptest! {
        #[test]
        fn prop_can_remove_never_drops_below_replication_factor(
            n in 2usize..8,
            rf in 1u8..4,
            remove_idx in 0usize..8,
        ) {
            let instances: Vec<_> = (0..n)
                .map(|i| stable_instance(&format!("i{i}"), &format!("g{i}"), 64))
                .collect();
            let p = placement(instances, rf as u32);
            let idx = remove_idx % n;
            let candidate_id = format!("i{idx}");

            if can_remove(&p, &candidate_id, rf) {
                let remaining: Vec<_> = p
                    .instances
                    .iter()
                    .filter(|inst| inst.instance.id != candidate_id)
                    .collect();
                let remaining_groups: BTreeSet<&str> = remaining
                    .iter()
                    .map(|inst| inst.instance.isolation_group.as_str())
                    .collect();
                prop_assert!(remaining.len() >= rf as usize);
                prop_assert!(remaining_groups.len() >= rf as usize);
            }
        }
    }

    /// Invariant 2 (idempotence): the add set computed against a placement that already holds the
    /// previous add set's output is always empty — applying the reconciler's own output never
    /// produces further additions for an unchanged desired state.
    proptest! {
        #[test]
        fn prop_add_set_is_idempotent_once_applied(
            num_groups in 1usize..4,
            instances_per_group in 1u32..4,
        ) {
            let groups: Vec<IsolationGroupSpec> = (0..num_groups)
                .map(|g| group(&format!("g{g}"), instances_per_group))
                .collect();
            let pods: Vec<ResolvedPod> = groups
                .iter()
                .flat_map(|g| {
                    (0..g.num_instances).map(|ord| pod(&g.name, ord, &format!("{}-{ord}", g.name)))
                })
                .collect();

            let empty = placement(Vec::new(), 1);
            let added = add_set(&groups, &pods, &empty, 9000);

            let applied: Vec<_> = added
                .iter()
                .map(|pi| stable_instance(&pi.id, &pi.isolation_group, 64))
                .collect();
            let settled = placement(applied, 1);

            prop_assert!(add_set(&groups, &pods, &settled, 9000).is_empty());
        }
    }

    /// Invariant 2 (idempotence): `expected_instance_set` is a pure function of its inputs, so
    /// calling it twice on the same desired state always agrees.
    proptest! {
        #[test]
        fn prop_expected_instance_set_is_deterministic(
            num_groups in 1usize..4,
            instances_per_group in 1u32..4,
        ) {
            let groups: Vec<IsolationGroupSpec> = (0..num_groups)
                .map(|g| group(&format!("g{g}"), instances_per_group))
                .collect();
            let pods: Vec<ResolvedPod> = groups
                .iter()
                .flat_map(|g| {
                    (0..g.num_instances).map(|ord| pod(&g.name, ord, &format!("{}-{ord}", g.name)))
                })
                .collect();

            let first: Vec<&str> = expected_instance_set(&groups, &pods)
                .into_iter()
                .map(|p| p.instance_id.as_str())
                .collect();
            let second: Vec<&str> = expected_instance_set(&groups, &pods)
                .into_iter()
                .map(|p| p.instance_id.as_str())
                .collect();
            prop_assert_eq!(first, second);
        }
    }
}
