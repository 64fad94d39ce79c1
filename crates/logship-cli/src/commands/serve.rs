//! Serve command: run the collection daemon.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use logship_core::supervisor::IngestSource;
use logship_core::{Config, HealthCheck, RelayMetrics, Supervisor};
use tracing::info;

use crate::server::{start_server, ServerState};
use crate::sources::TcpSource;

/// Run the daemon until a termination signal or a fatal store error.
pub async fn run(config: Config, config_path: PathBuf, test_mode: bool) -> Result<()> {
    let metrics = Arc::new(RelayMetrics::new());
    let health = Arc::new(HealthCheck::new());

    if test_mode {
        info!("Test mode: messages will be printed to stdout, no broker is used");
    }

    let sources: Vec<Arc<dyn IngestSource>> = vec![Arc::new(TcpSource::new(metrics.clone()))];

    let metrics_address = config.metrics.address.clone();
    let metrics_prefix = config.metrics.prefix.clone();

    let supervisor = Supervisor::start(
        config,
        Some(config_path),
        test_mode,
        sources,
        metrics.clone(),
        health.clone(),
    )?;

    let server_state = Arc::new(ServerState {
        health,
        metrics,
        metrics_prefix,
    });
    start_server(server_state, &metrics_address, supervisor.shutdown_token()).await;

    supervisor.run().await?;
    Ok(())
}
