//! Service entry point: load configuration, start sinks and pollers, run
//! the dispatch tick until a shutdown signal arrives.

use std::path::PathBuf;

use acqsrv::{
    config::AppConfig, dispatch::Dispatcher, poller::Poller, shutdown, sink, Sink, SERVICE_NAME,
    SERVICE_VERSION,
};
use anyhow::bail;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = SERVICE_NAME, version = SERVICE_VERSION, about)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, default_value = "config/acqsrv.yaml")]
    config: PathBuf,
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();

    let args = Args::parse();
    let config = AppConfig::load(&args.config)?;

    let (shutdown_tx, shutdown_rx) = shutdown::channel();

    // a sink that fails to build is skipped; only an empty set is fatal
    let mut sinks: Vec<Box<dyn Sink>> = Vec::new();
    for (idx, section) in config.sinks.iter().enumerate() {
        match sink::create_sink(section, shutdown_rx.clone()) {
            Ok(sink) => sinks.push(sink),
            Err(e) => error!("failed to create sink #{idx}, skipping it: {e}"),
        }
    }
    if sinks.is_empty() {
        bail!("no active sink");
    }

    let mut pollers = Vec::new();
    for (idx, section) in config.pollers.iter().enumerate() {
        let spawned = section
            .to_poller_config()
            .and_then(|poller_config| Poller::spawn(poller_config, shutdown_rx.clone()));
        match spawned {
            Ok(poller) => pollers.push(poller),
            Err(e) => error!("failed to create poller #{idx}, skipping it: {e}"),
        }
    }
    if pollers.is_empty() {
        bail!("no active poller");
    }

    info!(
        "started {SERVICE_NAME} v{SERVICE_VERSION} with {} pollers and {} sinks",
        pollers.len(),
        sinks.len()
    );

    let dispatcher = Dispatcher::new(pollers, sinks, config.dispatch_interval);
    let dispatcher_handle = tokio::spawn(dispatcher.run(shutdown_rx));

    shutdown::wait_for_signal().await;
    info!("shutdown signal received");

    let _ = shutdown_tx.send(true);
    let _ = dispatcher_handle.await;

    Ok(())
}
