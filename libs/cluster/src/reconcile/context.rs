//! Cluster-specific context: wraps the generic controller `Context<M3dbCluster>` with an
//! `AdminClient` cache (one client per cluster key, per SPEC_FULL.md §4.1) and the orphan-instance
//! bookkeeping the Placement Computer's `remove_candidate` needs but holds no state for itself.
use crate::crd::M3dbCluster;
use crate::error::{Error, Result};

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use kube::runtime::reflector::ObjectRef;
use m3dbop_admin_client::AdminClient;
use m3dbop_operator::controller::context::{BackoffContext, Context as BaseContext};
use m3dbop_operator::metrics::ControllerMetrics;
use tokio::sync::RwLock;
use tokio::time::Duration;

const COORDINATOR_PORT: u32 = 7201;

pub struct ClusterContext {
    pub base: BaseContext<M3dbCluster>,
    admin_clients: RwLock<HashMap<ObjectRef<M3dbCluster>, Arc<AdminClient>>>,
    orphan_since: RwLock<HashMap<ObjectRef<M3dbCluster>, HashMap<String, DateTime<Utc>>>>,
}

impl ClusterContext {
    pub fn new(base: BaseContext<M3dbCluster>) -> Self {
        Self {
            base,
            admin_clients: RwLock::default(),
            orphan_since: RwLock::default(),
        }
    }

    /// Admin client for this cluster, cached by object key. Rebuilt on first use after the
    /// process starts or after the cached entry is invalidated on finalization.
    pub async fn admin_client(&self, cluster: &M3dbCluster) -> Result<Arc<AdminClient>> {
        let key = ObjectRef::from(cluster);
        if let Some(client) = self.admin_clients.read().await.get(&key) {
            return Ok(client.clone());
        }
        let base_url = format!(
            "http://{}:{COORDINATOR_PORT}",
            cluster.client_service_name()
        );
        let client = Arc::new(AdminClient::new(
            &base_url,
            cluster.spec.environment_name.clone(),
        )?);
        self.admin_clients
            .write()
            .await
            .insert(key, client.clone());
        Ok(client)
    }

    /// Drop the cached admin client for a cluster that has finished finalizing.
    pub async fn forget(&self, cluster: &M3dbCluster) {
        let key = ObjectRef::from(cluster);
        self.admin_clients.write().await.remove(&key);
        self.orphan_since.write().await.remove(&key);
    }

    /// First-observed time of a placement instance id that no longer matches any live pod. The
    /// Placement Computer is pure and holds nothing across passes; this is where that state
    /// actually lives.
    pub async fn orphan_since(&self, cluster: &M3dbCluster) -> HashMap<String, DateTime<Utc>> {
        let key = ObjectRef::from(cluster);
        self.orphan_since
            .read()
            .await
            .get(&key)
            .cloned()
            .unwrap_or_default()
    }

    /// Record `instance_id` as orphaned now if it isn't already tracked, and drop tracking for
    /// any id not present in `still_orphaned` (it either got cleaned up or became live again).
    pub async fn reconcile_orphans(
        &self,
        cluster: &M3dbCluster,
        still_orphaned: &[String],
        now: DateTime<Utc>,
    ) {
        let key = ObjectRef::from(cluster);
        let mut guard = self.orphan_since.write().await;
        let entry = guard.entry(key).or_default();
        entry.retain(|id, _| still_orphaned.contains(id));
        for id in still_orphaned {
            entry.entry(id.clone()).or_insert(now);
        }
    }
}

/// `backoff_reconciler!` calls straight through `ctx`, so the cluster-specific wrapper has to
/// forward to the backoff bookkeeping it wraps rather than exposing `base` to the macro.
impl BackoffContext<M3dbCluster> for ClusterContext {
    fn metrics(&self) -> &Arc<ControllerMetrics> {
        BackoffContext::metrics(&self.base)
    }

    async fn get_backoff(&self, obj_ref: ObjectRef<M3dbCluster>) -> Duration {
        self.base.get_backoff(obj_ref).await
    }

    async fn reset_backoff(&self, obj_ref: ObjectRef<M3dbCluster>) {
        self.base.reset_backoff(obj_ref).await
    }
}

impl From<kube::Error> for Error {
    fn from(e: kube::Error) -> Self {
        Error::KubeError("kubernetes API call failed".to_string(), Box::new(e))
    }
}
