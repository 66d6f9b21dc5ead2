use std::{collections::VecDeque, time::Duration};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    config::WorkerPoolConfig,
    error::SchedulerError,
    jobs::{
        claims::{ClaimManager, WorkerIdentity},
        heartbeat::HeartbeatHandle,
        now,
        runner::ExecutionRunner,
    },
    store::JobExecution,
};

/// Claimed executions of a batch that have not started yet.
type Waiting = VecDeque<(JobExecution, HeartbeatHandle)>;

/// Claims and runs executions until `shutdown` is cancelled.
///
/// Returns an error when the store fails so the supervisor can restart the
/// worker after a pause.
pub async fn worker(
    identity: &WorkerIdentity,
    pool: &WorkerPoolConfig,
    claims: &ClaimManager,
    runner: &ExecutionRunner,
    shutdown: &CancellationToken,
) -> Result<(), SchedulerError> {
    let poll_interval = Duration::from_millis(pool.poll_interval_ms);

    loop {
        if shutdown.is_cancelled() {
            return Ok(());
        }

        let claimed = claims
            .try_claim(identity, &pool.jobs, pool.batch_size, now())
            .await?;

        if claimed.is_empty() {
            tokio::select! {
                () = shutdown.cancelled() => return Ok(()),
                () = sleep(poll_interval) => continue,
            }
        }

        let mut waiting: Waiting = claimed
            .into_iter()
            .map(|execution| {
                let hold = runner.hold(&execution, identity.id());
                (execution, hold)
            })
            .collect();

        let mut jobs_processed = 0;
        while let Some((execution, hold)) = waiting.pop_front() {
            if shutdown.is_cancelled() {
                waiting.push_front((execution, hold));
                return release_waiting(identity, runner, waiting).await;
            }

            hold.stop().await;
            match runner.run(execution).await {
                Ok(report) => debug!(
                    "Worker '{identity}' finished execution {}: {:?}",
                    report.execution_id, report.outcome
                ),
                Err(e) => {
                    if let Err(release_error) = release_waiting(identity, runner, waiting).await {
                        warn!(
                            "Worker '{identity}' could not release its unstarted executions: {release_error}"
                        );
                    }
                    return Err(e);
                }
            }
            jobs_processed += 1;
        }

        debug!("Worker '{identity}' processed {jobs_processed} execution(s)");
    }
}

/// Stops the heartbeats of unstarted executions and hands them back to the
/// pending pool.
async fn release_waiting(
    identity: &WorkerIdentity,
    runner: &ExecutionRunner,
    waiting: Waiting,
) -> Result<(), SchedulerError> {
    let mut executions = Vec::with_capacity(waiting.len());
    for (execution, hold) in waiting {
        hold.stop().await;
        executions.push(execution);
    }

    let mut released = 0;
    for execution in &executions {
        if runner.release(execution, identity.id()).await? {
            released += 1;
        }
    }

    if released > 0 {
        info!("↩️ Worker '{identity}' released {released} unstarted execution(s)");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        database::models::{execution_status::ExecutionStatus, schedule_type::ScheduleType},
        jobs::catalog::NewJobDefinition,
        store::JobStore as _,
        tests::setup_test::{invocations, setup_test, TestScheduler},
    };
    use serde_json::json;
    use tokio::task::JoinHandle;
    use uuid::Uuid;

    /// Triggers a high-priority `slow` run and an `echo` run, so one batch of
    /// two claims the slow one first.
    async fn trigger_slow_then_echo(test: &TestScheduler, millis: u64) -> (Uuid, Uuid) {
        test.catalog
            .create(
                test.tenant_id,
                NewJobDefinition {
                    priority: 10,
                    parameters: json!({ "millis": millis }),
                    ..NewJobDefinition::new("sluggish", "slow", ScheduleType::Manual)
                },
                now(),
            )
            .await
            .unwrap();
        test.catalog
            .create(
                test.tenant_id,
                NewJobDefinition::new("echo", "echo", ScheduleType::Manual),
                now(),
            )
            .await
            .unwrap();

        let mut ids = Vec::new();
        for job_key in ["sluggish", "echo"] {
            let execution = test
                .catalog
                .trigger(test.tenant_id, job_key, now())
                .await
                .unwrap()
                .unwrap();
            ids.push(execution.id);
        }
        (ids[0], ids[1])
    }

    fn spawn_batch_worker(test: &TestScheduler) -> JoinHandle<Result<(), SchedulerError>> {
        let pool = WorkerPoolConfig {
            batch_size: 2,
            poll_interval_ms: 10,
            ..WorkerPoolConfig::default()
        };
        let identity = test.worker.clone();
        let claims = test.claims.clone();
        let runner = test.runner.clone();
        let shutdown = test.shutdown.clone();
        tokio::spawn(async move { worker(&identity, &pool, &claims, &runner, &shutdown).await })
    }

    async fn wait_for_status(test: &TestScheduler, id: Uuid, status: ExecutionStatus) {
        for _ in 0..300 {
            let stored = test.store.get_execution(id).await.unwrap().unwrap();
            if stored.status == status {
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
        panic!("execution {id} never reached {status:?}");
    }

    #[tokio::test]
    async fn test_waiting_batch_rows_keep_their_lease() {
        let test = setup_test().await;
        let (slow, echo) = trigger_slow_then_echo(&test, 600).await;
        let handle = spawn_batch_worker(&test);

        wait_for_status(&test, slow, ExecutionStatus::Running).await;
        let before = test.store.get_execution(echo).await.unwrap().unwrap();
        assert_eq!(before.status, ExecutionStatus::Claimed);
        assert_eq!(before.claimed_by.as_deref(), Some(test.worker.id()));

        sleep(Duration::from_millis(150)).await;
        let after = test.store.get_execution(echo).await.unwrap().unwrap();
        assert_eq!(after.status, ExecutionStatus::Claimed);
        assert!(after.heartbeat_at > before.heartbeat_at);
        assert!(after.lock_expires_at > before.lock_expires_at);

        wait_for_status(&test, echo, ExecutionStatus::Completed).await;
        test.shutdown.cancel();
        handle.await.unwrap().unwrap();
        assert_eq!(invocations(echo), 1);
    }

    #[tokio::test]
    async fn test_shutdown_releases_unstarted_batch_rows() {
        let test = setup_test().await;
        let (slow, echo) = trigger_slow_then_echo(&test, 10_000).await;
        let handle = spawn_batch_worker(&test);

        wait_for_status(&test, slow, ExecutionStatus::Running).await;
        test.shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        for id in [slow, echo] {
            let stored = test.store.get_execution(id).await.unwrap().unwrap();
            assert_eq!(stored.status, ExecutionStatus::Pending);
            assert_eq!(stored.claimed_by, None);
            assert_eq!(stored.lock_expires_at, None);
        }
        assert_eq!(invocations(echo), 0);
    }

    #[tokio::test]
    async fn test_worker_drains_pending_executions_and_stops_on_shutdown() {
        let test = setup_test().await;
        test.catalog
            .create(
                test.tenant_id,
                NewJobDefinition::new("echo", "echo", ScheduleType::Manual),
                now(),
            )
            .await
            .unwrap();
        let first = test
            .catalog
            .trigger(test.tenant_id, "echo", now())
            .await
            .unwrap()
            .unwrap();
        let second = test
            .catalog
            .trigger(test.tenant_id, "echo", now())
            .await
            .unwrap()
            .unwrap();

        let pool = WorkerPoolConfig {
            poll_interval_ms: 10,
            ..WorkerPoolConfig::default()
        };
        let identity = test.worker.clone();
        let claims = test.claims.clone();
        let runner = test.runner.clone();
        let shutdown = test.shutdown.clone();
        let handle = tokio::spawn(async move {
            worker(&identity, &pool, &claims, &runner, &shutdown).await
        });

        for _ in 0..200 {
            let mut completed = 0;
            for id in [first.id, second.id] {
                let stored = test.store.get_execution(id).await.unwrap().unwrap();
                if stored.status == ExecutionStatus::Completed {
                    completed += 1;
                }
            }
            if completed == 2 {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }

        test.shutdown.cancel();
        handle.await.unwrap().unwrap();

        for id in [first.id, second.id] {
            let stored = test.store.get_execution(id).await.unwrap().unwrap();
            assert_eq!(stored.status, ExecutionStatus::Completed);
        }
    }
}
