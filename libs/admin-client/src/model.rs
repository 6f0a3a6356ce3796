use serde::{Deserialize, Serialize};

/// One instance (M3DB calls these "placement instances") as seen by the admin API.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlacementInstance {
    pub id: String,
    #[serde(rename = "isolationGroup")]
    pub isolation_group: String,
    pub zone: String,
    pub endpoint: String,
    pub weight: u32,
    pub hostname: String,
    pub port: u32,
    #[serde(default, rename = "shardSetId")]
    pub shard_set_id: Option<u32>,
}

/// Per-instance lifecycle state as reported inside a placement snapshot.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "UPPERCASE")]
pub enum InstanceState {
    Initializing,
    Available,
    Leaving,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlacementShard {
    pub id: u32,
    pub state: InstanceState,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlacementInstanceView {
    #[serde(flatten)]
    pub instance: PlacementInstance,
    pub shards: Vec<PlacementShard>,
}

/// A full placement snapshot as returned by `GetPlacement`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Placement {
    pub instances: Vec<PlacementInstanceView>,
    #[serde(rename = "replicaFactor")]
    pub replica_factor: u32,
    #[serde(rename = "numShards")]
    pub num_shards: u32,
    #[serde(rename = "isSharded")]
    pub is_sharded: bool,
    pub version: u32,
}

impl Placement {
    /// An instance is stable when no shard anywhere in the placement is `Initializing` or
    /// `Leaving`, the precondition the Placement Computer checks before proposing any mutation.
    pub fn is_stable(&self) -> bool {
        self.instances
            .iter()
            .all(|i| i.shards.iter().all(|s| s.state == InstanceState::Available))
    }

    pub fn instance_ids(&self) -> impl Iterator<Item = &str> {
        self.instances.iter().map(|i| i.instance.id.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct InitPlacementRequest {
    pub instances: Vec<PlacementInstance>,
    #[serde(rename = "numShards")]
    pub num_shards: u32,
    #[serde(rename = "replicationFactor")]
    pub replication_factor: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct AddInstancesRequest {
    pub instances: Vec<PlacementInstance>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SetWeightRequest {
    pub weight: u32,
}

/// Retention/index options for a namespace, mirroring the CRD's `NamespaceOptionsSpec`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NamespaceOptions {
    #[serde(rename = "retentionOptions")]
    pub retention: RetentionOptions,
    #[serde(rename = "indexOptions")]
    pub index: IndexOptions,
    #[serde(rename = "writesToCommitLog", default = "default_true")]
    pub writes_to_commit_log: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetentionOptions {
    #[serde(rename = "retentionPeriodNanos")]
    pub retention_period_nanos: i64,
    #[serde(rename = "blockSizeNanos")]
    pub block_size_nanos: i64,
    #[serde(rename = "bufferPastNanos")]
    pub buffer_past_nanos: i64,
    #[serde(rename = "bufferFutureNanos")]
    pub buffer_future_nanos: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IndexOptions {
    pub enabled: bool,
    #[serde(rename = "blockSizeNanos")]
    pub block_size_nanos: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NamespaceSpec {
    pub name: String,
    pub options: NamespaceOptions,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NamespaceListResponse {
    pub registry: NamespaceRegistry,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NamespaceRegistry {
    pub namespaces: std::collections::BTreeMap<String, NamespaceOptions>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ApiErrorBody {
    pub error: String,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct NodeBootstrappedResponse {
    #[serde(default)]
    pub bootstrapped: bool,
}
