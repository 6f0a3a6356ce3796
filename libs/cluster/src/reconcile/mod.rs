//! Cluster Reconciler (spec.md §4.5): gather observed state once per pass, then walk a fixed
//! phase order, applying at most one mutating action before deferring the rest to the next pass.
pub mod configmap;
pub mod context;
pub mod namespace;
pub mod pdb;
pub mod service;
pub mod statefulset;
pub mod status;

use crate::crd::{CLUSTER_FINALIZER, M3dbCluster};
use crate::error::{Error, Result};
use crate::identity::resolve_pod_identity;
use crate::placement::{self, ResolvedPod};

use self::configmap::ConfigMapExt;
use self::context::ClusterContext;
use self::namespace::{NamespaceAction, plan_namespace_action};
use self::pdb::PodDisruptionBudgetExt;
use self::service::ServiceExt;
use self::statefulset::{CONTAINER_NAME, PORT_NODE, StatefulSetExt};
use self::status::{StatusExt, StatusInputs};

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{ConfigMap, Node, Pod, ResourceRequirements, Service};
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use kube::api::{Api, ListParams};
use kube::runtime::controller::Action;
use kube::runtime::finalizer::{Event as FinalizerEvent, finalizer};
use kube::ResourceExt;
use m3dbop_admin_client::model::{NamespaceOptions, Placement};
use m3dbop_operator::controller::context::KubeOperations;
use tracing::{debug, info, instrument, warn};

const CLUSTER_OPERATOR_NAME: &str = "m3dbclusters.m3db.io";
/// How long a placement instance with no matching live pod must persist before it's eligible for
/// removal without one (spec.md §4.3's "stale identity" grace period).
const REMOVE_GRACE_PERIOD: Duration = Duration::from_secs(300);
/// Requeue interval while waiting on something outside the operator's control (pods still
/// bootstrapping, placement shards still transitioning).
const POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Outcome of a single reconcile phase. The driving loop in [`apply`] stops at the first phase
/// that returns anything other than `NoActionNeeded`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseOutcome {
    MutationApplied,
    NoActionNeeded,
    Requeue(Duration),
}

#[instrument(skip(ctx, cluster))]
pub async fn reconcile_cluster(cluster: Arc<M3dbCluster>, ctx: Arc<ClusterContext>) -> Result<Action> {
    let namespace = cluster.namespace_or_default();
    let api: Api<M3dbCluster> = Api::namespaced(ctx.base.client.clone(), &namespace);
    finalizer(&api, CLUSTER_FINALIZER, cluster, |event| async {
        match event {
            FinalizerEvent::Apply(c) => apply(c, ctx.clone()).await,
            FinalizerEvent::Cleanup(c) => cleanup(c, ctx.clone()).await,
        }
    })
    .await
    .map_err(|e| Error::FinalizerError("failed on cluster finalizer".to_string(), Box::new(e)))
}

/// Facts gathered once per pass so every phase reasons about the same snapshot.
struct Observed {
    placement: Option<Placement>,
    resolved_pods: Vec<ResolvedPod>,
    ready_instances: i32,
    total_instances: i32,
    namespaces: BTreeMap<String, NamespaceOptions>,
}

async fn apply(cluster: Arc<M3dbCluster>, ctx: Arc<ClusterContext>) -> Result<Action> {
    if let Err(message) = validate_spec(&cluster) {
        warn!(msg = "rejecting invalid cluster spec", %message);
        status::mark_invalid(&cluster, ctx.base.client.clone(), &message).await?;
        return Ok(Action::await_change());
    }

    let observed = gather(&cluster, &ctx).await?;
    let (namespace_action, namespace_mismatches) =
        plan_namespace_action(&cluster.spec.namespaces, &observed.namespaces)?;
    let namespaces_satisfied = namespace_action.is_none() && namespace_mismatches.is_empty();

    // Config objects are applied unconditionally every pass: server-side apply is idempotent,
    // so this never produces a spurious mutation.
    reconcile_child_resources(&cluster, &ctx).await?;

    let mut outcome = reconcile_statefulsets(&cluster, &ctx, &observed).await?;
    if outcome == PhaseOutcome::NoActionNeeded {
        outcome = reconcile_placement(&cluster, &ctx, &observed).await?;
    }
    if outcome == PhaseOutcome::NoActionNeeded {
        outcome = apply_namespace_action(&ctx, &cluster, namespace_action).await?;
    }

    let all_pods_ready = observed.total_instances > 0 && observed.ready_instances == observed.total_instances;
    cluster
        .update_status(
            ctx.base.client.clone(),
            &StatusInputs {
                placement: observed.placement.as_ref(),
                ready_instances: observed.ready_instances,
                total_instances: observed.total_instances,
                all_pods_ready,
                namespaces_satisfied,
                namespace_mismatches: &namespace_mismatches,
            },
        )
        .await?;

    Ok(match outcome {
        PhaseOutcome::MutationApplied => Action::requeue(Duration::from_millis(500)),
        PhaseOutcome::Requeue(d) => Action::requeue(d),
        PhaseOutcome::NoActionNeeded => Action::requeue(m3dbop_operator::controller::DEFAULT_RECONCILE_INTERVAL),
    })
}

async fn cleanup(cluster: Arc<M3dbCluster>, ctx: Arc<ClusterContext>) -> Result<Action> {
    info!(msg = "finalizing cluster deletion");
    let admin = ctx.admin_client(&cluster).await?;

    // There is no whole-placement delete on the admin API (see spec.md §4.1's endpoint table);
    // tearing a placement down means removing every instance it still has, tolerating a 404 on
    // a retry after a previous pass already removed it.
    if let Some(placement) = admin.get_placement().await? {
        for instance in &placement.instances {
            match admin.remove_instance(&instance.instance.id).await {
                Ok(_) => {}
                Err(m3dbop_admin_client::Error::Api { class, .. })
                    if class == m3dbop_admin_client::StatusClass::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
    }

    for ns in &cluster.spec.namespaces {
        admin.delete_namespace(&ns.name).await?;
    }

    ctx.forget(&cluster).await;
    Ok(Action::await_change())
}

/// Static structural validation (spec.md §7). A rejected spec writes an `Invalid` condition and
/// stops mutating until the generation changes, rather than retrying with backoff.
fn validate_spec(cluster: &M3dbCluster) -> std::result::Result<(), String> {
    let spec = &cluster.spec;

    if !(1..=3).contains(&spec.replication_factor) {
        return Err(format!(
            "replicationFactor must be in 1..=3, got {}",
            spec.replication_factor
        ));
    }
    if spec.isolation_groups.is_empty() {
        return Err("isolationGroups must be non-empty".to_string());
    }
    if (spec.replication_factor as usize) > spec.isolation_groups.len() {
        return Err(format!(
            "replicationFactor ({}) must not exceed the number of isolation groups ({})",
            spec.replication_factor,
            spec.isolation_groups.len()
        ));
    }
    if spec.num_shards == 0 || spec.num_shards > 4096 || !spec.num_shards.is_power_of_two() {
        return Err(format!(
            "numShards must be a power of two in 1..=4096, got {}",
            spec.num_shards
        ));
    }
    if spec.pod_identity_config.sources.is_empty() {
        return Err("podIdentityConfig.sources must be non-empty".to_string());
    }
    if spec.etcd_endpoints.is_empty() {
        return Err("etcdEndpoints must be non-empty".to_string());
    }

    let mut seen = HashSet::new();
    for ns in &spec.namespaces {
        if !seen.insert(ns.name.as_str()) {
            return Err(format!("duplicate namespace name {:?}", ns.name));
        }
        if let Err(e) = namespace::resolve_options(ns) {
            return Err(e.to_string());
        }
    }

    Ok(())
}

async fn gather(cluster: &M3dbCluster, ctx: &ClusterContext) -> Result<Observed> {
    let admin = ctx.admin_client(cluster).await?;
    let namespace = cluster.namespace_or_default();

    let placement = admin.get_placement().await?;
    let namespaces = admin.get_namespaces().await?;

    let pods_api: Api<Pod> = Api::namespaced(ctx.base.client.clone(), &namespace);
    let label_selector = format!("app.kubernetes.io/name=m3db,cluster={}", cluster.name_any());
    let pods = pods_api
        .list(&ListParams::default().labels(&label_selector))
        .await?;

    let nodes_api: Api<Node> = Api::all(ctx.base.client.clone());
    let needs_node_binding = cluster
        .spec
        .pod_identity_config
        .sources
        .iter()
        .any(|s| s.requires_node_binding());

    let total_instances = cluster
        .spec
        .isolation_groups
        .iter()
        .map(|g| g.num_instances)
        .sum::<u32>() as i32;

    let mut ready_instances = 0;
    let mut resolved_pods = Vec::new();

    for pod in &pods.items {
        if is_pod_ready(pod) {
            ready_instances += 1;
        } else {
            continue;
        }

        let (Some(group), Some(ordinal)) = (pod_group(pod), pod_ordinal(pod)) else {
            continue;
        };

        let node = if needs_node_binding {
            match pod.spec.as_ref().and_then(|s| s.node_name.clone()) {
                Some(node_name) => nodes_api.get_opt(&node_name).await?,
                None => None,
            }
        } else {
            None
        };

        let identity = match resolve_pod_identity(pod, &cluster.spec.pod_identity_config.sources, node.as_ref()) {
            Ok(identity) => identity,
            Err(Error::PodNotReady(reason)) => {
                debug!(msg = "pod identity not ready", pod = pod.name_any(), %reason);
                continue;
            }
            Err(e) => return Err(e),
        };

        resolved_pods.push(ResolvedPod {
            group,
            ordinal,
            instance_id: identity.instance_id()?,
            fqdn: format!(
                "{}.{}.{namespace}.svc",
                pod.name_any(),
                cluster.headless_service_name()
            ),
        });
    }

    Ok(Observed {
        placement,
        resolved_pods,
        ready_instances,
        total_instances,
        namespaces,
    })
}

fn is_pod_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conditions| conditions.iter().any(|c| c.type_ == "Ready" && c.status == "True"))
}

fn pod_group(pod: &Pod) -> Option<String> {
    pod.labels().get("isolation-group").cloned()
}

fn pod_ordinal(pod: &Pod) -> Option<u32> {
    let name = pod.metadata.name.as_deref()?;
    name.rsplit_once('-').and_then(|(_, ordinal)| ordinal.parse().ok())
}

async fn reconcile_child_resources(cluster: &M3dbCluster, ctx: &ClusterContext) -> Result<()> {
    let client = ctx.base.client.clone();
    let metrics = &ctx.base.metrics;

    cluster
        .kube_patch(client.clone(), metrics, cluster.config_map(), CLUSTER_OPERATOR_NAME)
        .await?;
    cluster
        .kube_patch(client.clone(), metrics, cluster.headless_service(), CLUSTER_OPERATOR_NAME)
        .await?;
    cluster
        .kube_patch(client.clone(), metrics, cluster.client_service(), CLUSTER_OPERATOR_NAME)
        .await?;
    cluster
        .kube_patch(
            client.clone(),
            metrics,
            cluster.pod_disruption_budget(),
            CLUSTER_OPERATOR_NAME,
        )
        .await?;
    Ok(())
}

/// Creation and scale-up are applied immediately; image/resource drift waits for an absent or
/// stable placement, and scale-down is deferred entirely to [`reconcile_placement`].
async fn reconcile_statefulsets(
    cluster: &M3dbCluster,
    ctx: &ClusterContext,
    observed: &Observed,
) -> Result<PhaseOutcome> {
    let client = ctx.base.client.clone();
    let namespace = cluster.namespace_or_default();
    let metrics = &ctx.base.metrics;
    let sts_api: Api<StatefulSet> = Api::namespaced(client.clone(), &namespace);
    let placement_settled = observed.placement.as_ref().map_or(true, Placement::is_stable);

    for group in &cluster.spec.isolation_groups {
        let desired = cluster.statefulset_for_group(group);
        let existing = sts_api.get_opt(&desired.name_any()).await?;

        let Some(existing) = existing else {
            cluster
                .kube_patch(client.clone(), metrics, desired, CLUSTER_OPERATOR_NAME)
                .await?;
            return Ok(PhaseOutcome::MutationApplied);
        };

        let existing_replicas = existing.spec.as_ref().and_then(|s| s.replicas).unwrap_or(0);
        let desired_replicas = group.num_instances as i32;

        if existing_replicas < desired_replicas {
            cluster
                .kube_patch(client.clone(), metrics, desired, CLUSTER_OPERATOR_NAME)
                .await?;
            return Ok(PhaseOutcome::MutationApplied);
        }

        if existing_replicas == desired_replicas && placement_settled && !container_spec_matches(&existing, &desired)
        {
            cluster
                .kube_patch(client.clone(), metrics, desired, CLUSTER_OPERATOR_NAME)
                .await?;
            return Ok(PhaseOutcome::MutationApplied);
        }
    }

    Ok(PhaseOutcome::NoActionNeeded)
}

fn container_spec_matches(existing: &StatefulSet, desired: &StatefulSet) -> bool {
    let container = |sts: &StatefulSet| -> Option<(String, Option<ResourceRequirements>)> {
        sts.spec
            .as_ref()?
            .template
            .spec
            .as_ref()?
            .containers
            .iter()
            .find(|c| c.name == CONTAINER_NAME)
            .map(|c| (c.image.clone().unwrap_or_default(), c.resources.clone()))
    };
    container(existing) == container(desired)
}

/// Placement Computer integration (spec.md §4.3, §4.5 phases 5-7): bootstrap, then add missing
/// instances, then the three-sub-step scale-down (weight to zero, remove, shrink StatefulSet).
async fn reconcile_placement(cluster: &M3dbCluster, ctx: &ClusterContext, observed: &Observed) -> Result<PhaseOutcome> {
    let admin = ctx.admin_client(cluster).await?;
    let groups = &cluster.spec.isolation_groups;

    let Some(placement) = observed.placement.as_ref() else {
        let every_group_has_a_bootstrap_pod = groups
            .iter()
            .all(|g| observed.resolved_pods.iter().any(|p| p.group == g.name && p.ordinal == 0));
        if !every_group_has_a_bootstrap_pod {
            return Ok(PhaseOutcome::Requeue(POLL_INTERVAL));
        }
        let instances = placement::initial_placement_instances(groups, &observed.resolved_pods, PORT_NODE as u32);
        admin
            .init_placement(instances, cluster.spec.num_shards, cluster.spec.replication_factor as u32)
            .await?;
        return Ok(PhaseOutcome::MutationApplied);
    };

    let add = placement::add_set(groups, &observed.resolved_pods, placement, PORT_NODE as u32);
    if !add.is_empty() {
        admin.add_instances(add).await?;
        return Ok(PhaseOutcome::MutationApplied);
    }

    let now = Utc::now();
    record_orphans(cluster, ctx, groups, observed, placement, now).await;
    let orphan_since = ctx.orphan_since(cluster).await;

    if let Some(candidate) = placement::remove_candidate(
        groups,
        &observed.resolved_pods,
        placement,
        &orphan_since,
        now,
        REMOVE_GRACE_PERIOD,
    ) {
        if !placement::can_remove(placement, &candidate.instance_id, cluster.spec.replication_factor) {
            return Ok(PhaseOutcome::Requeue(POLL_INTERVAL));
        }
        let current_weight = placement
            .instances
            .iter()
            .find(|i| i.instance.id == candidate.instance_id)
            .map(|i| i.instance.weight)
            .unwrap_or(0);
        if current_weight != 0 {
            admin.set_weight(&candidate.instance_id, 0).await?;
        } else {
            admin.remove_instance(&candidate.instance_id).await?;
        }
        return Ok(PhaseOutcome::MutationApplied);
    }

    shrink_overscaled_statefulset(cluster, ctx, groups).await
}

async fn record_orphans(
    cluster: &M3dbCluster,
    ctx: &ClusterContext,
    groups: &[crate::crd::IsolationGroupSpec],
    observed: &Observed,
    placement: &Placement,
    now: chrono::DateTime<Utc>,
) {
    let live_ids: HashSet<&str> = observed.resolved_pods.iter().map(|p| p.instance_id.as_str()).collect();
    let expected_ids: HashSet<&str> = placement::expected_instance_set(groups, &observed.resolved_pods)
        .into_iter()
        .map(|p| p.instance_id.as_str())
        .collect();
    let stale: Vec<String> = placement
        .instances
        .iter()
        .map(|i| i.instance.id.clone())
        .filter(|id| !expected_ids.contains(id.as_str()) && !live_ids.contains(id.as_str()))
        .collect();
    ctx.reconcile_orphans(cluster, &stale, now).await;
}

/// Sub-step 3 of scale-down: once an over-target instance has left the placement, shrink the
/// StatefulSet one replica at a time so the pod it belonged to is actually removed.
async fn shrink_overscaled_statefulset(
    cluster: &M3dbCluster,
    ctx: &ClusterContext,
    groups: &[crate::crd::IsolationGroupSpec],
) -> Result<PhaseOutcome> {
    let client = ctx.base.client.clone();
    let namespace = cluster.namespace_or_default();
    let sts_api: Api<StatefulSet> = Api::namespaced(client.clone(), &namespace);

    for group in groups {
        let name = cluster.group_resource_name(&group.name);
        let Some(existing) = sts_api.get_opt(&name).await? else {
            continue;
        };
        let existing_replicas = existing.spec.as_ref().and_then(|s| s.replicas).unwrap_or(0);
        let target = group.num_instances as i32;
        if existing_replicas > target {
            let mut desired = cluster.statefulset_for_group(group);
            if let Some(spec) = desired.spec.as_mut() {
                spec.replicas = Some(existing_replicas - 1);
            }
            cluster
                .kube_patch(client.clone(), &ctx.base.metrics, desired, CLUSTER_OPERATOR_NAME)
                .await?;
            return Ok(PhaseOutcome::MutationApplied);
        }
    }

    Ok(PhaseOutcome::NoActionNeeded)
}

async fn apply_namespace_action(
    ctx: &ClusterContext,
    cluster: &M3dbCluster,
    action: Option<NamespaceAction>,
) -> Result<PhaseOutcome> {
    let Some(action) = action else {
        return Ok(PhaseOutcome::NoActionNeeded);
    };
    let admin = ctx.admin_client(cluster).await?;
    match action {
        NamespaceAction::Create(spec) => admin.create_namespace(&spec).await?,
        NamespaceAction::Delete(name) => admin.delete_namespace(&name).await?,
    }
    Ok(PhaseOutcome::MutationApplied)
}
