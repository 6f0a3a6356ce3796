use m3dbop_cluster::controller as cluster_controller;
use m3dbop_k8s_util::client::new_client_with_metrics;
use m3dbop_operator::controller::State as OperatorState;
use m3dbop_operator::telemetry;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::{Router, get};
use clap::{Parser, crate_authors, crate_description, crate_version};
use kube::Config;
use kube_leader_election::{LeaseLock, LeaseLockParams, LeaseLockResult};
use tokio::net::TcpListener;
use tokio::signal::unix::{SignalKind, signal};
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

async fn metrics(State(state): State<OperatorState>) -> impl IntoResponse {
    match state.metrics() {
        Ok(metrics) => (
            StatusCode::OK,
            [(
                "content-type",
                "application/openmetrics-text; version=1.0.0; charset=utf-8",
            )],
            metrics,
        )
            .into_response(),
        Err(e) => {
            tracing::error!("Failed to get metrics: {:?}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn health() -> impl IntoResponse {
    Json("healthy")
}

#[derive(Parser, Debug)]
#[command(
    name="m3db-operator",
    about = crate_description!(),
    version = crate_version!(),
    author = crate_authors!("\n"),
)]
struct Args {
    /// Listen on given port
    #[arg(short, long, default_value_t = 8080, env)]
    port: u16,

    /// Set logging filter directive for `tracing_subscriber::filter::EnvFilter`. Example: "info,kube=debug,m3dbop=debug"
    #[arg(long, default_value = "info", env)]
    log_filter: String,

    /// Set log format
    #[arg(long, value_enum, default_value_t = telemetry::LogFormat::Text, env)]
    log_format: telemetry::LogFormat,

    /// URL for the OpenTelemetry tracing endpoint.
    ///
    /// This optional argument specifies the URL to which traces will be sent using
    /// OpenTelemetry. If not provided, tracing will be disabled.
    #[arg(short, long, env = "OPENTELEMETRY_ENDPOINT_URL")]
    tracing_url: Option<String>,

    /// Sampling ratio for tracing.
    ///
    /// Specifies the ratio of traces to sample. A value of `1.0` will sample all traces,
    /// while a lower value will sample fewer traces. The default is `0.1`, meaning 10%
    /// of traces are sampled.
    #[arg(short, long, default_value_t = 0.1, env)]
    sample_ratio: f64,

    /// Name of the `coordination.k8s.io/v1` Lease this replica contends for before it is allowed
    /// to consume the reconcile stream (spec.md §4.7).
    #[arg(long, default_value = "m3db-operator-lock", env)]
    lease_name: String,

    /// Namespace the leader-election Lease lives in.
    #[arg(long, default_value = "default", env = "NAMESPACE")]
    lease_namespace: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Args = Args::parse();

    telemetry::init(
        &args.log_filter,
        args.log_format,
        args.tracing_url.as_deref(),
        args.sample_ratio,
    )
    .await?;

    let provider = opentelemetry_sdk::metrics::SdkMeterProvider::builder().build();
    opentelemetry::global::set_meter_provider(provider.clone());
    let meter = opentelemetry::global::meter("m3db-operator");

    let config = Config::infer().await?;
    let client = new_client_with_metrics(config, &meter).await?;

    let controllers = [cluster_controller::CONTROLLER_ID];
    let state = OperatorState::new(&meter, &controllers);

    // Unique identity per replica (Downward API POD_NAME is ideal, HOSTNAME as a fallback when
    // not running under Kubernetes).
    let holder_id = std::env::var("POD_NAME")
        .or_else(|_| std::env::var("HOSTNAME"))
        .unwrap_or_else(|_| format!("m3db-operator-{}", uuid::Uuid::new_v4()));
    let leadership = LeaseLock::new(
        client.clone(),
        &args.lease_namespace,
        LeaseLockParams {
            holder_id,
            lease_name: args.lease_name.clone(),
            lease_ttl: Duration::from_secs(15),
        },
    );

    let shutdown = CancellationToken::new();
    let shutdown_signal_token = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        shutdown_signal_token.cancel();
    });

    let app = Router::new()
        .route("/metrics", get(metrics))
        .route("/health", get(health))
        .with_state(state.clone());
    let listener = TcpListener::bind(format!("0.0.0.0:{}", args.port)).await?;
    let server = axum::serve(listener, app).with_graceful_shutdown(shutdown.clone().cancelled_owned());

    // Only the leader consumes the reconcile queue (spec.md §4.7): renew or acquire the lease on
    // every tick, starting the controller task on acquisition and aborting it on loss.
    let renew_every = Duration::from_secs(5);
    let leader_loop = async {
        let mut controller_task: Option<tokio::task::JoinHandle<()>> = None;
        let mut tick = tokio::time::interval(renew_every);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    if let Some(task) = controller_task.take() {
                        task.abort();
                        let _ = task.await;
                    }
                    break;
                }
                _ = tick.tick() => {}
            }

            let lease = match leadership.try_acquire_or_renew().await {
                Ok(lease) => lease,
                Err(e) => {
                    error!(msg = "leader election renew/acquire failed", %e);
                    if let Some(task) = controller_task.take() {
                        task.abort();
                        warn!(msg = "aborted controller due to leader election error");
                    }
                    continue;
                }
            };

            if matches!(lease, LeaseLockResult::Acquired(_)) {
                if controller_task.is_none() {
                    info!(msg = "acquired leadership; starting controller");
                    let state = state.clone();
                    let client = client.clone();
                    controller_task = Some(tokio::spawn(async move {
                        cluster_controller::run(state, client).await;
                    }));
                }
            } else if let Some(task) = controller_task.take() {
                warn!(msg = "lost leadership; stopping controller");
                task.abort();
            }
        }
    };

    tokio::try_join!(
        async { server.await.map_err(anyhow::Error::from) },
        async {
            leader_loop.await;
            Ok(())
        },
    )?;

    Ok(())
}

async fn shutdown_signal() {
    let mut sigterm =
        signal(SignalKind::terminate()).expect("failed to install SIGTERM signal handler");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {},
        _ = sigterm.recv() => {},
    }
}
