pub mod context;

use self::context::Context;

use crate::error::{Error, Result};
use crate::metrics::Metrics;

use m3dbop_k8s_util::events::Recorder;
use m3dbop_k8s_util::types::short_type_name;

use std::fmt::Debug;
use std::sync::Arc;

use kube::api::{Api, ListParams};
use kube::client::Client;
use kube::runtime::controller::Action;
use kube::runtime::reflector::store::Writer;
use kube::runtime::reflector::{self, Lookup, ReflectHandle, Store};
use kube::Resource;
use opentelemetry::metrics::Meter;
use serde::de::DeserializeOwned;
use tokio::time::Duration;
use tracing::error;

pub type ControllerId = &'static str;
pub const DEFAULT_RECONCILE_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// State shared between the controllers and the web server.
///
/// Resource-specific caches (reflector stores, upstream client pools) do not live here: this
/// crate has no knowledge of any particular CRD, only of the reconciliation framework around it.
/// Each managed-resource crate wraps `State` with its own stores instead.
#[derive(Clone)]
pub struct State {
    metrics: Arc<Metrics>,
}

/// Shared state for a resource stream: a reflector store plus a subscriber handle that lets
/// `owns_shared_stream` observe the same watch without opening a second connection.
pub struct ResourceReflector<K>
where
    K: Resource + Lookup + Clone + 'static,
    <K as Lookup>::DynamicType: Eq + std::hash::Hash + Clone,
{
    pub store: Store<K>,
    pub writer: Writer<K>,
    pub subscriber: ReflectHandle<K>,
}

impl State {
    pub fn new(meter: &Meter, controller_names: &[&'static str]) -> Self {
        Self {
            metrics: Arc::new(Metrics::new(meter, controller_names)),
        }
    }

    /// Prometheus-format metrics for the `/metrics` endpoint. See
    /// [`crate::prometheus_exporter`] for why this is a placeholder rather than a scrape of the
    /// OTel meter's own series.
    pub fn metrics(&self) -> Result<String> {
        crate::prometheus_exporter::format_prometheus_metrics("m3db-operator")
            .map_err(|e| Error::FormattingError("failed to encode metrics".to_string(), e))
    }


    /// Create a Controller Context wired to this State's metrics for `controller_id`.
    pub fn to_context<K>(&self, client: Client, controller_id: ControllerId) -> Context<K>
    where
        K: Resource + Lookup + Clone + 'static,
        <K as Lookup>::DynamicType: Default + Eq + std::hash::Hash + Clone,
    {
        Context::new(
            controller_id,
            client.clone(),
            self.metrics
                .controllers
                .get(controller_id)
                .expect("all controller ids have to be registered")
                .clone(),
            Recorder::new(client, controller_id.into()),
        )
    }
}

pub async fn check_api_queryable<K>(client: Client) -> Api<K>
where
    K: Resource + Clone + DeserializeOwned + Debug,
    <K as Resource>::DynamicType: Default,
{
    let api = Api::<K>::all(client.clone());
    if let Err(e) = api.list(&ListParams::default().limit(1)).await {
        error!(
            "{} is not queryable; {e:?}. Check controller permissions",
            short_type_name::<K>().unwrap_or("Unknown resource"),
        );
        std::process::exit(1);
    }
    api
}

pub fn create_subscriber<K>(buffer_size: usize) -> ResourceReflector<K>
where
    K: Resource + Lookup + Clone + 'static,
    <K as Lookup>::DynamicType: Default + Eq + std::hash::Hash + Clone,
{
    let (store, writer) = reflector::store_shared(buffer_size);
    let subscriber = writer
        .subscribe()
        .expect("subscribers can only be created from shared stores");

    ResourceReflector {
        store,
        writer,
        subscriber,
    }
}

pub fn error_policy<K>(_obj: Arc<K>, _error: &Error, _ctx: Arc<Context<K>>) -> Action
where
    K: Resource + Lookup + Clone + 'static,
    <K as Lookup>::DynamicType: Default + Eq + std::hash::Hash + Clone,
{
    unreachable!("Handle in backoff_reconciler macro")
}

#[macro_export]
macro_rules! backoff_reconciler {
    ($inner_reconciler:ident) => {
        |obj, ctx| async move {
            use $crate::controller::context::BackoffContext;
            match $inner_reconciler(obj.clone(), ctx.clone()).await {
                Ok(action) => {
                    ctx.reset_backoff(kube::runtime::reflector::ObjectRef::from(obj.as_ref()))
                        .await;
                    Ok(action)
                }
                Err(error) => {
                    // safe unwrap: all resources in the operator are namespace scoped resources
                    let namespace = kube::ResourceExt::namespace(obj.as_ref()).unwrap();
                    let name = kube::ResourceExt::name_any(obj.as_ref());
                    tracing::error!(msg = "failed reconciliation", %namespace, %name, %error);
                    ctx.metrics().reconcile_failure_inc();
                    let backoff_duration = ctx
                        .get_backoff(kube::runtime::reflector::ObjectRef::from(obj.as_ref()))
                        .await;
                    tracing::trace!(
                        msg = format!("backoff duration: {backoff_duration:?}"),
                        %namespace,
                        %name,
                    );
                    Ok(kube::runtime::controller::Action::requeue(backoff_duration))
                }
            }
        }
    };
}
