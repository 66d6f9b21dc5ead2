use std::sync::Arc;

use crate::{
    config::Config,
    database::setup_database,
    error::SchedulerError,
    jobs::{archiver::HistoryArchiver, now},
    store::SeaOrmStore,
};

/// Runs a single archival pass with the configured retention.
pub async fn handle_archive_command(config: &Config) -> Result<(), SchedulerError> {
    let db = setup_database(&config.database).await?;
    let archiver = HistoryArchiver::new(
        Arc::new(SeaOrmStore::new(db)),
        config.scheduler.archive.clone(),
    );

    let archived = archiver.archive(now()).await?;
    println!("🗄️ Archived {archived} execution(s)");
    Ok(())
}
