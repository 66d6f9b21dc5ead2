use chrono::{Duration, NaiveDateTime};
use std::sync::Arc;
use tracing::{debug, info};

use crate::{
    config::ArchiveConfig,
    error::SchedulerError,
    store::{ArchiveCriteria, JobStore},
};

/// Moves old terminal executions out of the hot table.
#[derive(Clone, Debug)]
pub struct HistoryArchiver {
    store: Arc<dyn JobStore>,
    config: ArchiveConfig,
}

fn seconds(value: u64) -> Duration {
    Duration::seconds(i64::try_from(value).unwrap_or(i64::MAX / 1000))
}

impl HistoryArchiver {
    #[must_use]
    pub fn new(store: Arc<dyn JobStore>, config: ArchiveConfig) -> Self {
        Self { store, config }
    }

    #[must_use]
    pub const fn config(&self) -> &ArchiveConfig {
        &self.config
    }

    /// Archives every eligible execution in batches and returns how many moved.
    pub async fn archive(&self, now: NaiveDateTime) -> Result<u64, SchedulerError> {
        let criteria = ArchiveCriteria {
            completed_before: now - seconds(self.config.retention_seconds),
            lock_expired_before: now - seconds(self.config.lease_margin_seconds),
            batch_size: self.config.batch_size.max(1),
        };

        let mut total = 0;
        loop {
            let moved = self.store.archive_executions(&criteria, now).await?;
            let batch = moved.len() as u64;
            total += batch;

            if batch > 0 {
                debug!("🗄️ Archived batch of {batch} executions");
            }
            if batch < criteria.batch_size {
                break;
            }
        }

        if total > 0 {
            info!("🗄️ Archived {total} executions completed before {}", criteria.completed_before);
        }

        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        database::models::execution_status::ExecutionStatus,
        store::MemoryStore,
        tests::setup_test::{pending_execution, test_definition, timestamp},
    };

    const DAY: i64 = 86_400;

    fn config(batch_size: u64) -> ArchiveConfig {
        ArchiveConfig {
            interval_seconds: 60,
            retention_seconds: 7 * 86_400,
            lease_margin_seconds: 3600,
            batch_size,
        }
    }

    #[tokio::test]
    async fn test_only_old_terminal_rows_are_archived() {
        let store = Arc::new(MemoryStore::new());
        let definition = store
            .insert_definition(test_definition("cleanup"))
            .await
            .unwrap();

        let mut old_completed = pending_execution(&definition, timestamp(0));
        old_completed.status = ExecutionStatus::Completed;
        old_completed.completed_at = Some(timestamp(DAY));
        let mut recent_failed = pending_execution(&definition, timestamp(0));
        recent_failed.status = ExecutionStatus::Failed;
        recent_failed.completed_at = Some(timestamp(9 * DAY));
        let mut old_pending = pending_execution(&definition, timestamp(0));
        old_pending.completed_at = Some(timestamp(DAY));
        let mut fresh_lease = pending_execution(&definition, timestamp(0));
        fresh_lease.status = ExecutionStatus::Cancelled;
        fresh_lease.completed_at = Some(timestamp(DAY));
        fresh_lease.lock_expires_at = Some(timestamp(10 * DAY));

        let old_completed_id = old_completed.id;
        let old_completed_row = old_completed.clone();
        for execution in [old_completed, recent_failed, old_pending, fresh_lease] {
            store.insert_execution_if_absent(execution).await.unwrap();
        }

        let archived = HistoryArchiver::new(store.clone(), config(100))
            .archive(timestamp(10 * DAY))
            .await
            .unwrap();
        assert_eq!(archived, 1);
        assert_eq!(store.execution_count(), 3);

        let history = store
            .history_for_definition(definition.id, 10)
            .await
            .unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].id, old_completed_id);
        assert_eq!(history[0].job_key, "cleanup");
        assert_eq!(history[0].archived_at, timestamp(10 * DAY));
        assert_eq!(history[0].to_execution(), old_completed_row);
    }

    #[tokio::test]
    async fn test_archive_runs_until_a_short_batch() {
        let store = Arc::new(MemoryStore::new());
        let definition = store
            .insert_definition(test_definition("cleanup"))
            .await
            .unwrap();

        for offset in 0..7 {
            let mut execution = pending_execution(&definition, timestamp(offset));
            execution.status = ExecutionStatus::Completed;
            execution.completed_at = Some(timestamp(offset));
            store.insert_execution_if_absent(execution).await.unwrap();
        }

        let archiver = HistoryArchiver::new(store.clone(), config(3));
        assert_eq!(archiver.archive(timestamp(10 * DAY)).await.unwrap(), 7);
        assert_eq!(store.execution_count(), 0);
        assert_eq!(store.history_count(), 7);

        // A second pass finds nothing left
        assert_eq!(archiver.archive(timestamp(11 * DAY)).await.unwrap(), 0);
    }
}
