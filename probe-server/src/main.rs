use std::sync::Arc;

use envconfig::Envconfig;
use probe::bdd::DryRunEngine;
use probe::config::Config;
use tokio::signal;
use tracing_subscriber::EnvFilter;

async fn shutdown() {
    let mut term = signal::unix::signal(signal::unix::SignalKind::terminate())
        .expect("failed to register SIGTERM handler");

    let mut interrupt = signal::unix::signal(signal::unix::SignalKind::interrupt())
        .expect("failed to register SIGINT handler");

    tokio::select! {
        _ = term.recv() => {},
        _ = interrupt.recv() => {},
    };

    tracing::info!("shutting down gracefully...");
}

async fn run(config: Config) {
    let listener = tokio::net::TcpListener::bind(config.address)
        .await
        .expect("failed to bind listener");

    // Deployments inject a real Gherkin engine; the built-in dry-run engine
    // keeps the binary self-contained for smoke environments
    probe::server::serve(config, Arc::new(DryRunEngine), listener, shutdown())
        .await
        .expect("probe server failed");
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = Config::init_from_env().expect("invalid configuration:");

    // The blocking pool caps how many storage/vault calls may park a thread
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .max_blocking_threads(config.io_blocking_pool_size)
        .build()
        .expect("failed to build tokio runtime");
    runtime.block_on(run(config));
}
