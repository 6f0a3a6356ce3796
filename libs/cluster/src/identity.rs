//! Pod-Identity Resolver.
//!
//! Produces a stable logical identity for a database pod from pod metadata and the configured
//! source set. Placement entries reference this identity, not the pod name, so identities must
//! be deterministic for fixed inputs and must not silently change across reconciler restarts.
use crate::crd::PodIdentitySource;
use crate::error::{Error, Result};

use k8s_openapi::api::core::v1::{Node, Pod};
use m3dbop_k8s_util::identity::stable_hash;

use serde::Serialize;

/// Canonical, field-order-fixed encoding of a pod's identity sources. Field order here is the
/// contract: it must never change, or every existing placement instance id would change with it.
#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
pub struct PodIdentity {
    pub pod_name: Option<String>,
    pub pod_uid: Option<String>,
    pub node_name: Option<String>,
    pub node_external_id: Option<String>,
    pub node_provider_id: Option<String>,
}

impl PodIdentity {
    /// Instance id: a hex SHA-256 of the canonical JSON encoding, truncated to 16 characters
    /// (64 bits) for readability in `kubectl`/logs while remaining effectively collision-free at
    /// cluster scale.
    pub fn instance_id(&self) -> Result<String> {
        let full = stable_hash(self).map_err(|e| {
            Error::Internal(format!("failed to hash pod identity: {e}"))
        })?;
        Ok(full[..16].to_string())
    }
}

/// Resolve a pod's identity given the configured source set and, when a node-bound source is
/// configured, the node it is bound to.
///
/// Returns `Err(Error::PodNotReady)` when a node-bound source is configured but the pod has no
/// `spec.nodeName` yet, or the referenced node could not be supplied by the caller — the
/// reconciler's contract is to requeue rather than bootstrap with an incomplete identity.
pub fn resolve_pod_identity(
    pod: &Pod,
    sources: &[PodIdentitySource],
    node: Option<&Node>,
) -> Result<PodIdentity> {
    if sources.is_empty() {
        return Err(Error::Validation(
            "pod_identity_config.sources must be non-empty".to_string(),
        ));
    }

    let pod_name = pod.metadata.name.clone();
    let pod_uid = pod.metadata.uid.clone();
    let bound_node_name = pod.spec.as_ref().and_then(|s| s.node_name.clone());

    let mut identity = PodIdentity {
        pod_name: None,
        pod_uid: None,
        node_name: None,
        node_external_id: None,
        node_provider_id: None,
    };

    for source in sources {
        match source {
            PodIdentitySource::PodName => {
                identity.pod_name = Some(pod_name.clone().ok_or_else(|| {
                    Error::PodNotReady("pod has no name".to_string())
                })?);
            }
            PodIdentitySource::PodUid => {
                identity.pod_uid = Some(pod_uid.clone().ok_or_else(|| {
                    Error::PodNotReady("pod has no uid".to_string())
                })?);
            }
            PodIdentitySource::NodeName => {
                identity.node_name = Some(bound_node_name.clone().ok_or_else(|| {
                    Error::PodNotReady(format!(
                        "pod {} is not yet bound to a node",
                        pod_name.as_deref().unwrap_or("<unnamed>")
                    ))
                })?);
            }
            PodIdentitySource::NodeExternalId => {
                let node = node.ok_or_else(|| {
                    Error::PodNotReady(format!(
                        "pod {} is not yet bound to a node",
                        pod_name.as_deref().unwrap_or("<unnamed>")
                    ))
                })?;
                identity.node_external_id = Some(
                    node.spec
                        .as_ref()
                        .and_then(|s| s.external_id.clone())
                        .ok_or_else(|| {
                            Error::PodNotReady("bound node has no externalID".to_string())
                        })?,
                );
            }
            PodIdentitySource::NodeProviderId => {
                let node = node.ok_or_else(|| {
                    Error::PodNotReady(format!(
                        "pod {} is not yet bound to a node",
                        pod_name.as_deref().unwrap_or("<unnamed>")
                    ))
                })?;
                identity.node_provider_id = Some(
                    node.spec
                        .as_ref()
                        .and_then(|s| s.provider_id.clone())
                        .ok_or_else(|| {
                            Error::PodNotReady("bound node has no providerID".to_string())
                        })?,
                );
            }
        }
    }

    Ok(identity)
}

#[cfg(test)]
mod test {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn pod(name: &str, uid: &str, node_name: Option<&str>) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                uid: Some(uid.to_string()),
                ..Default::default()
            },
            spec: Some(k8s_openapi::api::core::v1::PodSpec {
                node_name: node_name.map(str::to_string),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_identity_is_deterministic() {
        let p = pod("g1-0", "abc-uid", None);
        let sources = [PodIdentitySource::PodName];
        let id1 = resolve_pod_identity(&p, &sources, None).unwrap();
        let id2 = resolve_pod_identity(&p, &sources, None).unwrap();
        assert_eq!(id1.instance_id().unwrap(), id2.instance_id().unwrap());
    }

    #[test]
    fn test_identity_differs_on_pod_uid_change() {
        let p1 = pod("g1-0", "uid-1", None);
        let p2 = pod("g1-0", "uid-2", None);
        let sources = [PodIdentitySource::PodUid];
        let id1 = resolve_pod_identity(&p1, &sources, None).unwrap();
        let id2 = resolve_pod_identity(&p2, &sources, None).unwrap();
        assert_ne!(id1.instance_id().unwrap(), id2.instance_id().unwrap());
    }

    #[test]
    fn test_node_bound_source_not_ready_without_node_name() {
        let p = pod("g1-0", "abc-uid", None);
        let sources = [PodIdentitySource::NodeName];
        let err = resolve_pod_identity(&p, &sources, None).unwrap_err();
        assert!(matches!(err, Error::PodNotReady(_)));
    }

    #[test]
    fn test_node_bound_source_ready_once_scheduled() {
        let p = pod("g1-0", "abc-uid", Some("node-a"));
        let sources = [PodIdentitySource::NodeName];
        let identity = resolve_pod_identity(&p, &sources, None).unwrap();
        assert_eq!(identity.node_name.as_deref(), Some("node-a"));
    }

    #[test]
    fn test_empty_sources_rejected() {
        let p = pod("g1-0", "abc-uid", None);
        let err = resolve_pod_identity(&p, &[], None).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }
}
