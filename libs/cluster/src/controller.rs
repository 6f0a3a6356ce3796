//! Controller-shell wiring for `M3dbCluster` (spec.md §4.5): a primary watch over the CRD plus
//! shared-stream watches over every child kind the Projector writes, so an out-of-band edit to a
//! `StatefulSet`/`Service`/`ConfigMap`/`PodDisruptionBudget`/`Pod` triggers a reconcile without a
//! second apiserver connection per watched kind.
use crate::crd::M3dbCluster;
use crate::reconcile::context::ClusterContext;
use crate::reconcile::reconcile_cluster;

use crate::error::Error;

use m3dbop_k8s_util::types::short_type_name;
use m3dbop_operator::backoff_reconciler;
use m3dbop_operator::controller::{ControllerId, State, check_api_queryable, create_subscriber};
use m3dbop_operator::metrics;

use std::fmt::Debug;
use std::sync::Arc;

use futures::channel::mpsc;
use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{ConfigMap, Pod, Service};
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use kube::Resource;
use kube::client::Client;
use kube::runtime::reflector::store::Writer;
use kube::runtime::reflector::{self, Lookup};
use kube::runtime::{WatchStreamExt, controller, watcher};
use kube::runtime::controller::Controller;
use kube::api::{Api, ResourceExt};
use serde::de::DeserializeOwned;
use tokio::time::Duration;
use tracing::{debug, error, info, trace};

pub const CONTROLLER_ID: ControllerId = "m3dbcluster";

const SUBSCRIBE_BUFFER_SIZE: usize = 256;
const RELOAD_BUFFER_SIZE: usize = 16;

/// Never reached: `backoff_reconciler!` turns every `Err` from [`reconcile_cluster`] into an
/// `Ok(Action::requeue(..))` before `kube::runtime::Controller` sees it.
fn error_policy(_obj: Arc<M3dbCluster>, _error: &Error, _ctx: Arc<ClusterContext>) -> controller::Action {
    unreachable!("handled in backoff_reconciler macro")
}

fn create_watch<K>(
    api: Api<K>,
    writer: Writer<K>,
    reload_tx: mpsc::Sender<()>,
    ctx: Arc<ClusterContext>,
) -> BoxFuture<'static, ()>
where
    K: Resource + Lookup + Clone + DeserializeOwned + Send + Sync + Debug + 'static,
    <K as Lookup>::DynamicType: Default + Eq + std::hash::Hash + Clone + Send + Sync,
    <K as Resource>::DynamicType: Default + Eq + std::hash::Hash + Clone,
{
    let resource_name = short_type_name::<K>().unwrap_or("Unknown");

    watcher(
        api,
        watcher::Config::default().labels("app.kubernetes.io/managed-by=m3db-operator"),
    )
    .default_backoff()
    .reflect_shared(writer)
    .for_each(move |res| {
        let mut reload_tx_clone = reload_tx.clone();
        let ctx = ctx.clone();
        async move {
            match res {
                Ok(event) => {
                    trace!(msg = "watched event", ?event);
                    match event {
                        watcher::Event::Delete(d) => {
                            debug!(
                                msg = format!("delete event for {resource_name} trigger reconcile"),
                                namespace = ResourceExt::namespace(&d).unwrap(),
                                name = d.name_any()
                            );
                            // No dispatch-on-delete support for shared-stream owns yet:
                            // https://github.com/kube-rs/kube/issues/1590
                            let _ignore_errors = reload_tx_clone
                                .try_send(())
                                .map_err(|e| error!(msg = "failed to trigger reconcile on delete", %e));
                            ctx.base
                                .metrics
                                .triggered_inc(metrics::Action::Delete, resource_name);
                        }
                        watcher::Event::Apply(d) => {
                            debug!(
                                msg = format!("apply event for {resource_name} trigger reconcile"),
                                namespace = ResourceExt::namespace(&d).unwrap(),
                                name = d.name_any()
                            );
                            ctx.base
                                .metrics
                                .triggered_inc(metrics::Action::Apply, resource_name);
                        }
                        _ => {}
                    }
                }
                Err(e) => {
                    error!(msg = format!("unexpected error when watching {resource_name}"), %e);
                    ctx.base.metrics.watch_operations_failed_inc();
                }
            }
        }
    })
    .boxed()
}

/// Initialize the `M3dbCluster` controller and start consuming its reconcile stream.
pub async fn run(state: State, client: Client) {
    let cluster = check_api_queryable::<M3dbCluster>(client.clone()).await;
    let statefulset = check_api_queryable::<StatefulSet>(client.clone()).await;
    let service = check_api_queryable::<Service>(client.clone()).await;
    let configmap = check_api_queryable::<ConfigMap>(client.clone()).await;
    let pdb = check_api_queryable::<PodDisruptionBudget>(client.clone()).await;
    let pod = check_api_queryable::<Pod>(client.clone()).await;

    let statefulset_r = create_subscriber::<StatefulSet>(SUBSCRIBE_BUFFER_SIZE);
    let service_r = create_subscriber::<Service>(SUBSCRIBE_BUFFER_SIZE);
    let configmap_r = create_subscriber::<ConfigMap>(SUBSCRIBE_BUFFER_SIZE);
    let pdb_r = create_subscriber::<PodDisruptionBudget>(SUBSCRIBE_BUFFER_SIZE);
    let pod_r = create_subscriber::<Pod>(SUBSCRIBE_BUFFER_SIZE);

    let (reload_tx, reload_rx) = mpsc::channel(RELOAD_BUFFER_SIZE);

    let base = state.to_context::<M3dbCluster>(client.clone(), CONTROLLER_ID);
    let ctx = Arc::new(ClusterContext::new(base));

    let statefulset_watch = create_watch(statefulset, statefulset_r.writer, reload_tx.clone(), ctx.clone());
    let service_watch = create_watch(service, service_r.writer, reload_tx.clone(), ctx.clone());
    let configmap_watch = create_watch(configmap, configmap_r.writer, reload_tx.clone(), ctx.clone());
    let pdb_watch = create_watch(pdb, pdb_r.writer, reload_tx.clone(), ctx.clone());
    let pod_watch = create_watch(pod, pod_r.writer, reload_tx, ctx.clone());

    info!(msg = "starting m3dbcluster controller");
    let cluster_controller = Controller::new(cluster, watcher::Config::default().any_semantic())
        .with_config(controller::Config::default().debounce(Duration::from_millis(500)))
        .owns_shared_stream(statefulset_r.subscriber)
        .owns_shared_stream(service_r.subscriber)
        .owns_shared_stream(configmap_r.subscriber)
        .owns_shared_stream(pdb_r.subscriber)
        .owns_shared_stream(pod_r.subscriber)
        .reconcile_all_on(reload_rx.map(|_| ()))
        .shutdown_on_signal()
        .run(backoff_reconciler!(reconcile_cluster), error_policy, ctx.clone())
        .filter_map(|x| async move { std::result::Result::ok(x) })
        .for_each(|_| futures::future::ready(()));

    ctx.base.metrics.ready_set(1);
    tokio::select! {
        _ = cluster_controller => {},
        _ = statefulset_watch => {},
        _ = service_watch => {},
        _ = configmap_watch => {},
        _ = pdb_watch => {},
        _ = pod_watch => {},
    }
}
