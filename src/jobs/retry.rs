use chrono::{Duration, NaiveDateTime};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    config::RetryConfig,
    database::models::execution_status::ExecutionStatus,
    error::SchedulerError,
    store::{JobDefinition, JobExecution, JobStore},
};

/// Spawns the next attempt of a failed execution.
#[derive(Clone, Debug)]
pub struct RetryCoordinator {
    store: Arc<dyn JobStore>,
    config: RetryConfig,
}

impl RetryCoordinator {
    #[must_use]
    pub fn new(store: Arc<dyn JobStore>, config: RetryConfig) -> Self {
        Self { store, config }
    }

    /// Delay before retry number `retry_count` (1 for the first retry),
    /// without jitter: `base * multiplier^(retry_count - 1)`, capped.
    #[must_use]
    pub fn base_delay(&self, retry_count: i32) -> Duration {
        let exponent = retry_count.saturating_sub(1).max(0);
        #[allow(clippy::cast_precision_loss)]
        let base = self.config.base_delay_seconds as f64;
        #[allow(clippy::cast_precision_loss)]
        let max = self.config.max_delay_seconds as f64;

        let seconds = (base * self.config.multiplier.powi(exponent)).min(max);
        millis(seconds)
    }

    /// `base_delay` plus up to `jitter_ratio` of it at random.
    #[must_use]
    pub fn backoff(&self, retry_count: i32) -> Duration {
        let delay = self.base_delay(retry_count);
        #[allow(clippy::cast_precision_loss)]
        let jitter_seconds =
            delay.num_milliseconds() as f64 / 1000.0 * self.config.jitter_ratio * fastrand::f64();
        delay + millis(jitter_seconds)
    }

    /// Inserts the retry of `failed` when its chain still allows one.
    ///
    /// The new row is keyed by the failed execution, so a chain stays linear
    /// even if this is called twice for the same failure.
    pub async fn on_failure(
        &self,
        failed: &JobExecution,
        definition: &JobDefinition,
        now: NaiveDateTime,
    ) -> Result<Option<JobExecution>, SchedulerError> {
        if !failed.status.is_retryable_failure()
            || !failed.can_retry
            || failed.retry_count >= definition.max_retries
        {
            debug!(
                "Execution {} of '{}' is terminal after {} retries",
                failed.id, definition.job_key, failed.retry_count
            );
            return Ok(None);
        }

        let retry_count = failed.retry_count + 1;
        let delay = self.backoff(retry_count);

        let retry = JobExecution {
            id: Uuid::new_v4(),
            status: ExecutionStatus::Pending,
            scheduled_at: now + delay,
            enqueued_at: now,
            target_instance: failed.target_instance.clone(),
            schedule_key: Some(format!("retry:{}", failed.id)),
            is_retry: true,
            retry_of_execution_id: Some(failed.id),
            retry_count,
            can_retry: retry_count < definition.max_retries,
            ..JobExecution::pending(definition, failed.execution_number, now + delay, now)
        };

        let inserted = self.store.insert_execution_if_absent(retry).await?;
        match &inserted {
            Some(retry) => warn!(
                "⚠️ Retrying '{}' execution {} as {} (retry {}/{}) in {}s",
                definition.job_key,
                failed.id,
                retry.id,
                retry_count,
                definition.max_retries,
                delay.num_seconds()
            ),
            None => debug!("Retry of execution {} already exists", failed.id),
        }

        Ok(inserted)
    }
}

#[allow(clippy::cast_possible_truncation)]
fn millis(seconds: f64) -> Duration {
    Duration::milliseconds((seconds * 1000.0).round() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        store::{Completion, ExecutionGuard, ExecutionPatch, MemoryStore},
        tests::setup_test::{pending_execution, test_definition, timestamp},
    };

    fn config(jitter_ratio: f64) -> RetryConfig {
        RetryConfig {
            base_delay_seconds: 60,
            multiplier: 5.0,
            max_delay_seconds: 3600,
            jitter_ratio,
        }
    }

    #[test]
    fn test_backoff_grows_exponentially_and_is_capped() {
        let retry = RetryCoordinator::new(Arc::new(MemoryStore::new()), config(0.0));

        assert_eq!(retry.base_delay(1), Duration::seconds(60));
        assert_eq!(retry.base_delay(2), Duration::seconds(300));
        assert_eq!(retry.base_delay(3), Duration::seconds(1500));
        assert_eq!(retry.base_delay(4), Duration::seconds(3600));
        assert_eq!(retry.backoff(2), Duration::seconds(300));
    }

    #[test]
    fn test_jitter_stays_within_ratio() {
        let retry = RetryCoordinator::new(Arc::new(MemoryStore::new()), config(0.5));

        for _ in 0..100 {
            let delay = retry.backoff(1);
            assert!(delay >= Duration::seconds(60));
            assert!(delay <= Duration::seconds(90));
        }
    }

    async fn fail(store: &MemoryStore, execution: &JobExecution, at: NaiveDateTime) -> JobExecution {
        let updated = store
            .conditional_update(
                execution.id,
                &[ExecutionGuard::Status(execution.status)],
                &ExecutionPatch::finish(ExecutionStatus::Failed, Completion::at(at)),
            )
            .await
            .unwrap();
        assert!(updated);
        store.get_execution(execution.id).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_retry_chain_is_bounded_by_max_retries() {
        let store = Arc::new(MemoryStore::new());
        let retry = RetryCoordinator::new(store.clone(), config(0.0));
        let definition = store
            .insert_definition(JobDefinition {
                max_retries: 3,
                ..test_definition("cleanup")
            })
            .await
            .unwrap();

        let mut current = store
            .insert_execution_if_absent(pending_execution(&definition, timestamp(0)))
            .await
            .unwrap()
            .unwrap();
        let mut now = timestamp(1);

        loop {
            let failed = fail(&store, &current, now).await;
            match retry.on_failure(&failed, &definition, now).await.unwrap() {
                Some(next) => {
                    assert_eq!(next.retry_of_execution_id, Some(failed.id));
                    assert_eq!(next.retry_count, failed.retry_count + 1);
                    assert_eq!(next.execution_number, failed.execution_number);
                    assert!(next.is_retry);
                    assert!(next.scheduled_at > now);
                    now = next.scheduled_at;
                    current = next;
                }
                None => break,
            }
        }

        let chain = store.executions_for_definition(definition.id).await.unwrap();
        assert_eq!(chain.len(), 4);
        assert!(chain.iter().all(|execution| execution.status == ExecutionStatus::Failed));
        let last = chain.iter().max_by_key(|execution| execution.retry_count).unwrap();
        assert_eq!(last.retry_count, 3);
        assert!(!last.can_retry);
    }

    #[tokio::test]
    async fn test_retry_is_spawned_once_per_failure() {
        let store = Arc::new(MemoryStore::new());
        let retry = RetryCoordinator::new(store.clone(), config(0.0));
        let definition = store
            .insert_definition(test_definition("cleanup"))
            .await
            .unwrap();
        let execution = store
            .insert_execution_if_absent(pending_execution(&definition, timestamp(0)))
            .await
            .unwrap()
            .unwrap();
        let failed = fail(&store, &execution, timestamp(1)).await;

        assert!(retry
            .on_failure(&failed, &definition, timestamp(1))
            .await
            .unwrap()
            .is_some());
        assert!(retry
            .on_failure(&failed, &definition, timestamp(2))
            .await
            .unwrap()
            .is_none());
        assert_eq!(store.execution_count(), 2);
    }

    #[tokio::test]
    async fn test_non_retryable_failures_end_the_chain() {
        let store = Arc::new(MemoryStore::new());
        let retry = RetryCoordinator::new(store.clone(), config(0.0));
        let definition = store
            .insert_definition(test_definition("cleanup"))
            .await
            .unwrap();
        let mut failed = pending_execution(&definition, timestamp(0));
        failed.status = ExecutionStatus::Failed;
        failed.can_retry = false;

        assert!(retry
            .on_failure(&failed, &definition, timestamp(1))
            .await
            .unwrap()
            .is_none());

        failed.can_retry = true;
        failed.status = ExecutionStatus::Cancelled;
        assert!(retry
            .on_failure(&failed, &definition, timestamp(1))
            .await
            .unwrap()
            .is_none());
    }
}
