//! Child-Resource Projector: cluster-wide `PodDisruptionBudget`.
//!
//! A single budget spans every isolation group so that voluntary disruptions (node drains,
//! cluster-autoscaler evictions) never take down more than one replica at a time regardless of
//! which group it lands in.
use crate::crd::{M3dbCluster, cluster_labels};

use k8s_openapi::api::policy::v1::{PodDisruptionBudget, PodDisruptionBudgetSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;
use kube::api::ObjectMeta;

pub trait PodDisruptionBudgetExt {
    fn pod_disruption_budget(&self) -> PodDisruptionBudget;
}

impl PodDisruptionBudgetExt for M3dbCluster {
    fn pod_disruption_budget(&self) -> PodDisruptionBudget {
        let labels = cluster_labels(&self.name_any());
        PodDisruptionBudget {
            metadata: ObjectMeta {
                name: Some(self.pdb_name()),
                namespace: Some(self.namespace_or_default()),
                labels: Some(labels.clone()),
                owner_references: self.controller_owner_ref(&()).map(|oref| vec![oref]),
                ..ObjectMeta::default()
            },
            spec: Some(PodDisruptionBudgetSpec {
                max_unavailable: Some(IntOrString::Int(1)),
                selector: Some(LabelSelector {
                    match_labels: Some(labels),
                    match_expressions: None,
                }),
                ..PodDisruptionBudgetSpec::default()
            }),
            ..PodDisruptionBudget::default()
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::crd::M3dbClusterSpec;

    #[test]
    fn test_pdb_allows_single_unavailable_replica() {
        let mut c = M3dbCluster::new("prod", M3dbClusterSpec::default());
        c.meta_mut().namespace = Some("default".to_string());
        let pdb = c.pod_disruption_budget();
        assert_eq!(
            pdb.spec.unwrap().max_unavailable,
            Some(IntOrString::Int(1))
        );
    }
}
