use std::future::{ready, Future};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::routing::get;
use axum::Router;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::bdd::BddEngine;
use crate::config::Config;
use crate::directory::StreamDirectory;
use crate::health::HealthRegistry;
use crate::scheduler::{ProbeDeps, QueueScheduler};
use crate::schema_registry::{self, RestSchemaRegistry};
use crate::service::ProbeHandle;
use crate::storage::S3StorageClient;
use crate::vault::{CredentialBroker, CredentialsMapping, HttpVaultClient};

/// Validates configuration, boots the shared clients, publishes the codec,
/// spawns the scheduler and returns the DSL handle plus the operational
/// router. Any error here is fatal; the process has nothing useful to do
/// without its dependencies.
pub async fn bootstrap(
    config: Config,
    engine: Arc<dyn BddEngine>,
) -> anyhow::Result<(ProbeHandle, Router)> {
    config.validate()?;

    let registry_api = Arc::new(RestSchemaRegistry::new(&config.schema_registry_url)?);
    schema_registry::initialize(registry_api)
        .context("failed to publish the schema registry codec")?;

    let storage = Arc::new(S3StorageClient::new(&config.storage).await);

    let mapping_raw = tokio::fs::read_to_string(&config.vault.vault_mapping_path)
        .await
        .with_context(|| {
            format!(
                "failed to read credentials mapping at {}",
                config.vault.vault_mapping_path
            )
        })?;
    let mapping = CredentialsMapping::from_yaml(&mapping_raw)?;
    let vault = Arc::new(HttpVaultClient::new(&config.vault)?);
    let protocol = config
        .kafka
        .security_protocol()
        .map_err(anyhow::Error::msg)?;
    let broker = Arc::new(CredentialBroker::new(vault, mapping, protocol));

    let directory = Arc::new(StreamDirectory::new());
    let liveness = HealthRegistry::new("liveness");
    let scheduler_liveness = liveness.register("scheduler", Duration::from_secs(30)).await;

    let export_prometheus = config.export_prometheus;
    let deps = Arc::new(ProbeDeps {
        config: Arc::new(config),
        storage,
        broker,
        engine,
        directory: directory.clone(),
    });
    let scheduler = QueueScheduler::spawn(deps, Some(scheduler_liveness));
    let handle = ProbeHandle::new(scheduler, directory);

    Ok((handle, router(liveness, export_prometheus)))
}

async fn index() -> &'static str {
    "probe"
}

pub fn router(liveness: HealthRegistry, metrics: bool) -> Router {
    let router = Router::new()
        .route("/", get(index))
        .route(
            "/_liveness",
            get(move || ready(liveness.get_status())),
        )
        .layer(TraceLayer::new_for_http());

    // Don't install metrics unless asked to: a global recorder misbehaves
    // when the probe is embedded as a library in tests
    if metrics {
        let recorder_handle = setup_metrics_recorder();
        router.route("/metrics", get(move || ready(recorder_handle.render())))
    } else {
        router
    }
}

fn setup_metrics_recorder() -> PrometheusHandle {
    PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install prometheus recorder")
}

/// Runs the probe until `shutdown` resolves. The DSL handle stays alive
/// for the whole serve window so the scheduler loop never loses its last
/// sender mid-flight.
pub async fn serve<F>(
    config: Config,
    engine: Arc<dyn BddEngine>,
    listener: tokio::net::TcpListener,
    shutdown: F,
) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let (handle, app) = bootstrap(config, engine).await?;

    info!("listening on {:?}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    drop(handle);
    Ok(())
}
