use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{PersistentVolumeClaim, ResourceRequirements};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::CustomResource;
#[cfg(feature = "schemars")]
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Finalizer installed on every `M3dbCluster` before any child object is created, and removed
/// only after the placement and all namespaces it owns have been deleted (see phase 1 of
/// `reconcile::reconcile_cluster`).
pub const CLUSTER_FINALIZER: &str = "operator.m3db.io/finalizer";

/// The desired state of an M3DB cluster. More info:
/// https://github.com/kubernetes/community/blob/master/contributors/devel/sig-architecture/api-conventions.md#spec-and-status
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[cfg_attr(feature = "schemars", derive(JsonSchema))]
#[kube(
    group = "m3db.io",
    version = "v1alpha1",
    kind = "M3dbCluster",
    plural = "m3dbclusters",
    singular = "m3dbcluster",
    shortname = "m3db",
    namespaced,
    status = "M3dbClusterStatus",
    doc = r#"The `M3dbCluster` custom resource definition (CRD) defines a desired M3DB
    cluster to run in a Kubernetes cluster. Each isolation group is deployed as its own
    `StatefulSet`; the operator drives the M3DB coordinator's placement and namespace APIs
    toward the topology this spec describes."#,
    printcolumn = r#"{"name":"Image","type":"string","jsonPath":".spec.image"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Ready","type":"integer","jsonPath":".status.readyInstances"}"#,
    printcolumn = r#"{"name":"Total","type":"integer","jsonPath":".status.totalInstances"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#,
    derive = "Default"
)]
#[serde(rename_all = "camelCase")]
pub struct M3dbClusterSpec {
    /// Container image for the `m3dbnode` process. More info:
    /// https://kubernetes.io/docs/concepts/containers/images
    #[serde(default = "default_image")]
    pub image: String,

    /// Replication factor. The number of copies of each shard the placement keeps, each in a
    /// distinct isolation group. Immutable once the placement has been initialized.
    #[schemars(range(min = 1, max = 3))]
    pub replication_factor: u8,

    /// Total shard count. Must be a power of two in 1..=4096. Immutable once the placement has
    /// been initialized.
    #[schemars(range(min = 1, max = 4096))]
    pub num_shards: u32,

    /// Rack-like failure domains. Instances placed in group `g` carry `g` as their rack tag; the
    /// placement distributes each shard's replicas across distinct groups. Order is significant:
    /// ties between groups that could each receive an added instance are broken by declaration
    /// order.
    #[serde(default)]
    pub isolation_groups: Vec<IsolationGroupSpec>,

    /// Ordered, non-empty source set used to derive a stable instance identity for each pod. See
    /// `m3dbop_cluster::identity`.
    pub pod_identity_config: PodIdentityConfig,

    /// Database-level namespaces to create (and, by omission, to delete). Names must be unique
    /// within a cluster. A namespace already created with different options is never mutated in
    /// place; this surfaces as a `NamespaceImmutable` condition instead.
    #[serde(default)]
    pub namespaces: Vec<NamespaceSpec>,

    /// Resource requests/limits applied to the `m3dbnode` container.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,

    /// Persistent volume claim template for the `m3dbnode` data directory. When unset, each pod
    /// gets an `emptyDir` instead (data does not survive pod rescheduling onto a new node, only
    /// suitable for development/test clusters).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume_claim_template: Option<PersistentVolumeClaim>,

    /// External etcd endpoints used by the coordinator for cluster/topology consensus.
    #[serde(default)]
    pub etcd_endpoints: Vec<String>,

    /// Logical environment name. When set, the operator namespaces placement/namespace state
    /// within a shared etcd by attaching it as a header on every Admin API request.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub environment_name: Option<String>,
}

fn default_image() -> String {
    "m3db/m3dbnode:latest".to_string()
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[cfg_attr(feature = "schemars", derive(JsonSchema))]
#[serde(rename_all = "camelCase")]
pub struct IsolationGroupSpec {
    /// Name of the isolation group. Used verbatim as the rack tag and as a suffix of the
    /// generated `StatefulSet` name (`<cluster>-<group>`).
    pub name: String,

    /// Target instance (pod) count for this group.
    pub num_instances: u32,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "schemars", derive(JsonSchema))]
#[serde(rename_all = "camelCase")]
pub struct PodIdentityConfig {
    /// Ordered, non-empty subset of {PodName, PodUID, NodeName, NodeExternalID, NodeProviderID}
    /// hashed together to produce each pod's instance id.
    #[serde(default)]
    pub sources: Vec<PodIdentitySource>,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Eq, PartialEq, Hash)]
#[cfg_attr(feature = "schemars", derive(JsonSchema))]
#[serde(rename_all = "PascalCase")]
pub enum PodIdentitySource {
    PodName,
    PodUid,
    NodeName,
    NodeExternalId,
    NodeProviderId,
}

impl Default for PodIdentitySource {
    fn default() -> Self {
        PodIdentitySource::PodName
    }
}

impl PodIdentitySource {
    /// Whether resolving this source requires the pod to already be bound to a node.
    pub fn requires_node_binding(self) -> bool {
        matches!(
            self,
            PodIdentitySource::NodeName
                | PodIdentitySource::NodeExternalId
                | PodIdentitySource::NodeProviderId
        )
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[cfg_attr(feature = "schemars", derive(JsonSchema))]
#[serde(rename_all = "camelCase")]
pub struct NamespaceSpec {
    /// Namespace name, unique within the cluster.
    pub name: String,

    /// A coordinator-known retention preset identifier (e.g. `"default"`, `"10s:2d"`). Exactly
    /// one of `preset`/`options` must be set; validated in the reconciler's Validation phase
    /// rather than via CRD schema (cannot express "exactly one of" with `schemars` across both
    /// fields).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preset: Option<String>,

    /// Explicit retention/index options.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<NamespaceOptionsSpec>,
}

impl NamespaceSpec {
    pub fn retention(&self) -> Option<NamespaceRetention<'_>> {
        match (&self.preset, &self.options) {
            (Some(p), None) => Some(NamespaceRetention::Preset(p)),
            (None, Some(o)) => Some(NamespaceRetention::Options(o)),
            _ => None,
        }
    }
}

/// Borrowed view of exactly one of `NamespaceSpec`'s two retention representations.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum NamespaceRetention<'a> {
    Preset(&'a str),
    Options(&'a NamespaceOptionsSpec),
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[cfg_attr(feature = "schemars", derive(JsonSchema))]
#[serde(rename_all = "camelCase")]
pub struct NamespaceOptionsSpec {
    /// Kubernetes-style duration string, e.g. `"48h"`.
    pub retention_period: String,
    /// Kubernetes-style duration string, e.g. `"2h"`.
    pub block_size: String,
    /// Kubernetes-style duration string, e.g. `"2h"`.
    pub index_block_size: String,
    /// Kubernetes-style duration string, e.g. `"10m"`.
    pub buffer_past: String,
    /// Kubernetes-style duration string, e.g. `"20m"`.
    pub buffer_future: String,
    /// Whether the namespace is write-indexed.
    #[serde(default)]
    pub write_index_enabled: bool,
}

/// Most recent observed status of the cluster. Read-only. More info:
/// https://github.com/kubernetes/community/blob/master/contributors/devel/sig-architecture/api-conventions.md#spec-and-status
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[cfg_attr(feature = "schemars", derive(JsonSchema))]
#[serde(rename_all = "camelCase")]
pub struct M3dbClusterStatus {
    #[serde(default)]
    pub conditions: Vec<Condition>,

    /// `spec.metadata.generation` this status was computed from.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Ready pod count summed across all isolation-group `StatefulSet`s.
    pub ready_instances: i32,

    /// Expected pod count summed across all isolation groups.
    pub total_instances: i32,

    /// Short, human-readable summary for `kubectl get`.
    #[serde(default)]
    pub phase: String,
}

pub mod condition {
    pub const PLACEMENT_INITIALIZED: &str = "PlacementInitialized";
    pub const PODS_BOOTSTRAPPING: &str = "PodsBootstrapping";
    pub const AVAILABLE: &str = "Available";
    pub const NAMESPACE_IMMUTABLE: &str = "NamespaceImmutable";
    pub const INVALID: &str = "Invalid";

    pub const STATUS_TRUE: &str = "True";
    pub const STATUS_FALSE: &str = "False";
    pub const STATUS_UNKNOWN: &str = "Unknown";
}

/// Common labels attached to every child object of a cluster.
pub fn cluster_labels(cluster_name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app.kubernetes.io/managed-by".to_string(), "m3dbop".to_string()),
        ("app.kubernetes.io/name".to_string(), "m3db".to_string()),
        ("cluster".to_string(), cluster_name.to_string()),
    ])
}

/// Labels for one isolation group's child objects: cluster labels plus `component` and
/// `isolation-group`.
pub fn isolation_group_labels(cluster_name: &str, group: &str) -> BTreeMap<String, String> {
    let mut labels = cluster_labels(cluster_name);
    labels.insert("component".to_string(), "m3dbnode".to_string());
    labels.insert("isolation-group".to_string(), group.to_string());
    labels
}

impl M3dbCluster {
    /// `StatefulSet`/child-object name for the given isolation group: `<cluster>-<group>`.
    pub fn group_resource_name(&self, group: &str) -> String {
        format!("{}-{group}", self.name_any())
    }

    /// Name of the peer-discovery headless service.
    pub fn headless_service_name(&self) -> String {
        format!("{}-dbnode", self.name_any())
    }

    /// Name of the client-facing service (ready pods only).
    pub fn client_service_name(&self) -> String {
        format!("{}-coordinator", self.name_any())
    }

    /// Name of the rendered configuration `ConfigMap`.
    pub fn config_map_name(&self) -> String {
        format!("{}-config", self.name_any())
    }

    /// Name of the pod-disruption budget.
    pub fn pdb_name(&self) -> String {
        format!("{}-pdb", self.name_any())
    }

    pub fn namespace_or_default(&self) -> String {
        // safe unwrap: M3dbCluster is namespaced scoped
        self.namespace().unwrap()
    }
}

use kube::ResourceExt;

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_group_resource_name() {
        let mut c = M3dbCluster::new("prod", M3dbClusterSpec::default());
        c.meta_mut().namespace = Some("default".into());
        assert_eq!(c.group_resource_name("g1"), "prod-g1");
        assert_eq!(c.headless_service_name(), "prod-dbnode");
        assert_eq!(c.client_service_name(), "prod-coordinator");
    }

    #[test]
    fn test_namespace_retention_preset_round_trips() {
        let json = serde_json::json!({"name": "metrics", "preset": "10s:2d"});
        let ns: NamespaceSpec = serde_json::from_value(json).unwrap();
        assert_eq!(ns.retention(), Some(NamespaceRetention::Preset("10s:2d")));
    }
}
