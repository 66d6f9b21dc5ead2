use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::{
    app::App,
    config::Config,
    database::setup_database,
    environment::Environment,
    error::SchedulerError,
    jobs::{job_registry::JobRegistry, job_supervisor::job_supervisor},
    store::SeaOrmStore,
};

/// Runs this node's scheduler until Ctrl-C, then waits for in-flight
/// executions to be released before returning.
pub async fn handle_serve_command(
    environment: Environment,
    config: Config,
    job_registry: JobRegistry,
) -> Result<(), SchedulerError> {
    let db = setup_database(&config.database).await?;
    info!("✅ Database is ready!");

    let app = App::new(config, environment, Arc::new(SeaOrmStore::new(db)));
    let shutdown = CancellationToken::new();

    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("🛑 Shutdown requested, releasing in-flight executions");
                signal_shutdown.cancel();
            }
            Err(e) => error!("❌ Failed to listen for shutdown signal: {}", e),
        }
    });

    job_supervisor(app, job_registry, shutdown).await
}
