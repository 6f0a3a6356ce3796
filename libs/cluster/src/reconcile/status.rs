//! Status Reconciler: merge observed facts into `status`, patching the subresource only when the
//! computed value differs from what's already there.
use crate::crd::{M3dbCluster, M3dbClusterStatus, condition};
use crate::error::{Error, Result};

use m3dbop_admin_client::model::Placement;

use std::sync::Arc;

use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};
use kube::ResourceExt;
use kube::api::{Api, Patch, PatchParams};
use tracing::{debug, trace};

const OPERATOR_NAME: &str = "m3dbclusters.m3db.io";

/// Facts the reconciler has already gathered this pass; the Status Reconciler only folds them
/// into conditions, it never re-derives them from the cluster or from I/O itself.
pub struct StatusInputs<'a> {
    pub placement: Option<&'a Placement>,
    pub ready_instances: i32,
    pub total_instances: i32,
    pub all_pods_ready: bool,
    pub namespaces_satisfied: bool,
    pub namespace_mismatches: &'a [String],
}

#[allow(async_fn_in_trait)]
pub trait StatusExt {
    async fn update_status(
        &self,
        client: kube::Client,
        inputs: &StatusInputs<'_>,
    ) -> Result<M3dbClusterStatus>;
}

impl StatusExt for M3dbCluster {
    async fn update_status(
        &self,
        client: kube::Client,
        inputs: &StatusInputs<'_>,
    ) -> Result<M3dbClusterStatus> {
        let previous = self.status.clone().unwrap_or_default();
        let computed = generate_status(&previous, inputs, self.metadata.generation);

        if computed == previous {
            trace!(msg = "status unchanged, skipping patch");
            return Ok(computed);
        }

        let namespace = self.namespace_or_default();
        let name = self.name_any();
        let patch = Patch::Apply(M3dbCluster {
            status: Some(computed.clone()),
            ..M3dbCluster::new(&name, Default::default())
        });
        debug!(msg = "updating M3dbCluster status", phase = %computed.phase);
        trace!(msg = format!("status patch {patch:?}"));
        let api = Api::<M3dbCluster>::namespaced(client, &namespace);
        api.patch_status(&name, &PatchParams::apply(OPERATOR_NAME).force(), &patch)
            .await
            .map_err(|e| {
                Error::KubeError(
                    format!("failed to patch M3dbCluster/status {namespace}/{name}"),
                    Box::new(e),
                )
            })?;
        Ok(computed)
    }
}

fn generate_status(
    previous: &M3dbClusterStatus,
    inputs: &StatusInputs<'_>,
    generation: Option<i64>,
) -> M3dbClusterStatus {
    let conditions = generate_conditions(&previous.conditions, inputs, generation);
    let phase = derive_phase(&conditions);

    M3dbClusterStatus {
        conditions,
        observed_generation: generation,
        ready_instances: inputs.ready_instances,
        total_instances: inputs.total_instances,
        phase,
    }
}

fn generate_conditions(
    previous: &[Condition],
    inputs: &StatusInputs<'_>,
    generation: Option<i64>,
) -> Vec<Condition> {
    let placement_initialized = set_condition(
        previous,
        condition::PLACEMENT_INITIALIZED,
        inputs.placement.is_some(),
        "PlacementExists",
        "NoPlacement",
        "Placement has been initialized.",
        "No placement exists yet.",
        generation,
    );

    let pods_bootstrapping = set_condition(
        previous,
        condition::PODS_BOOTSTRAPPING,
        !inputs.all_pods_ready,
        "PodsNotReady",
        "AllPodsReady",
        "Some pods have not finished bootstrapping.",
        "All pods report bootstrapped.",
        generation,
    );

    let placement_stable = inputs.placement.is_some_and(Placement::is_stable);
    let available = set_condition(
        previous,
        condition::AVAILABLE,
        placement_stable && inputs.all_pods_ready && inputs.namespaces_satisfied,
        "ClusterReady",
        "ClusterNotReady",
        "Placement is stable, all pods are ready and all namespaces are present.",
        "Waiting for a stable placement, ready pods or namespace convergence.",
        generation,
    );

    let mut conditions = vec![placement_initialized, pods_bootstrapping, available];

    if !inputs.namespace_mismatches.is_empty() {
        let message = format!(
            "namespace(s) {:?} differ from their desired options; namespaces are immutable after creation",
            inputs.namespace_mismatches
        );
        conditions.push(set_condition(
            previous,
            condition::NAMESPACE_IMMUTABLE,
            true,
            "NamespaceMismatch",
            "NamespacesConsistent",
            &message,
            "All namespaces match their desired options.",
            generation,
        ));
    }

    conditions
}

/// A statically-rejected spec writes an `Invalid` condition and the reconciler stops mutating
/// until the generation changes, rather than retrying with backoff.
pub async fn mark_invalid(cluster: &M3dbCluster, client: kube::Client, message: &str) -> Result<()> {
    let previous = cluster.status.clone().unwrap_or_default();
    let generation = cluster.metadata.generation;

    let existing = previous.conditions.iter().find(|c| c.type_ == condition::INVALID);
    let last_transition_time = match existing {
        Some(c) if c.status == condition::STATUS_TRUE => c.last_transition_time.clone(),
        _ => Time(Utc::now()),
    };
    let invalid = Condition {
        type_: condition::INVALID.to_string(),
        status: condition::STATUS_TRUE.to_string(),
        reason: "ValidationFailed".to_string(),
        message: message.to_string(),
        last_transition_time,
        observed_generation: generation,
    };
    let mut conditions: Vec<Condition> = previous
        .conditions
        .iter()
        .filter(|c| c.type_ != condition::INVALID)
        .cloned()
        .collect();
    conditions.push(invalid);

    let computed = M3dbClusterStatus {
        conditions,
        observed_generation: generation,
        ready_instances: previous.ready_instances,
        total_instances: previous.total_instances,
        phase: "Invalid".to_string(),
    };
    if computed == previous {
        return Ok(());
    }

    let namespace = cluster.namespace_or_default();
    let name = cluster.name_any();
    let patch = Patch::Apply(M3dbCluster {
        status: Some(computed),
        ..M3dbCluster::new(&name, Default::default())
    });
    let api = Api::<M3dbCluster>::namespaced(client, &namespace);
    api.patch_status(&name, &PatchParams::apply(OPERATOR_NAME).force(), &patch)
        .await
        .map_err(|e| {
            Error::KubeError(
                format!("failed to patch M3dbCluster/status {namespace}/{name} (Invalid)"),
                Box::new(e),
            )
        })?;
    Ok(())
}

/// Build a single condition, preserving `last_transition_time` from the previous condition of the
/// same type when the status string hasn't changed: conditions transition only through defined
/// reasons, never flip back and forth within a pass.
#[allow(clippy::too_many_arguments)]
fn set_condition(
    previous: &[Condition],
    type_: &str,
    is_true: bool,
    reason_true: &str,
    reason_false: &str,
    message_true: &str,
    message_false: &str,
    generation: Option<i64>,
) -> Condition {
    let status = if is_true { "True" } else { "False" };
    let existing = previous.iter().find(|c| c.type_ == type_);
    let last_transition_time = match existing {
        Some(c) if c.status == status => c.last_transition_time.clone(),
        _ => Time(Utc::now()),
    };

    Condition {
        type_: type_.to_string(),
        status: status.to_string(),
        reason: if is_true { reason_true } else { reason_false }.to_string(),
        message: if is_true { message_true } else { message_false }.to_string(),
        last_transition_time,
        observed_generation: generation,
    }
}

fn derive_phase(conditions: &[Condition]) -> String {
    let is_true = |t: &str| conditions.iter().any(|c| c.type_ == t && c.status == "True");
    if is_true(condition::AVAILABLE) {
        "Available".to_string()
    } else if is_true(condition::PLACEMENT_INITIALIZED) {
        "Bootstrapping".to_string()
    } else {
        "Pending".to_string()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn inputs(placement: Option<&Placement>) -> StatusInputs<'_> {
        StatusInputs {
            placement,
            ready_instances: 3,
            total_instances: 3,
            all_pods_ready: true,
            namespaces_satisfied: true,
            namespace_mismatches: &[],
        }
    }

    fn stable_placement() -> Placement {
        use m3dbop_admin_client::model::{InstanceState, PlacementInstance, PlacementInstanceView, PlacementShard};
        Placement {
            instances: vec![PlacementInstanceView {
                instance: PlacementInstance {
                    id: "a0".to_string(),
                    isolation_group: "g1".to_string(),
                    zone: "embedded".to_string(),
                    endpoint: "a0:9000".to_string(),
                    weight: 100,
                    hostname: "a0".to_string(),
                    port: 9000,
                    shard_set_id: None,
                },
                shards: vec![PlacementShard { id: 0, state: InstanceState::Available }],
            }],
            replica_factor: 1,
            num_shards: 1,
            is_sharded: true,
            version: 1,
        }
    }

    #[test]
    fn test_phase_is_pending_without_placement() {
        let status = generate_status(&M3dbClusterStatus::default(), &inputs(None), Some(1));
        assert_eq!(status.phase, "Pending");
    }

    #[test]
    fn test_phase_is_available_when_stable_and_ready() {
        let placement = stable_placement();
        let status = generate_status(&M3dbClusterStatus::default(), &inputs(Some(&placement)), Some(1));
        assert_eq!(status.phase, "Available");
    }

    #[test]
    fn test_last_transition_time_preserved_when_status_unchanged() {
        let placement = stable_placement();
        let first = generate_status(&M3dbClusterStatus::default(), &inputs(Some(&placement)), Some(1));
        let second = generate_status(&first, &inputs(Some(&placement)), Some(1));
        for (a, b) in first.conditions.iter().zip(second.conditions.iter()) {
            assert_eq!(a.last_transition_time, b.last_transition_time);
        }
    }
}
