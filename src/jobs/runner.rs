//! Runs one claimed execution to a terminal state.

use std::{any::Any, sync::Arc, time::Instant as StdInstant};
use tokio::time::{sleep, sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    app::App,
    database::models::execution_status::ExecutionStatus,
    error::SchedulerError,
    jobs::{
        heartbeat::{HeartbeatHandle, HeartbeatKeeper},
        job_registry::JobRegistry,
        job_result::JobResult,
        job_supervisor::RestartBackoff,
        now,
        retry::RetryCoordinator,
        JobContext, JobError,
    },
    store::{Completion, ExecutionGuard, ExecutionPatch, JobDefinition, JobExecution},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Failed,
    TimedOut,
    /// The lease moved elsewhere before the run could be recorded.
    ClaimLost,
    /// The node shut down and handed the execution back to the pending pool.
    Released,
}

#[derive(Debug)]
pub struct RunReport {
    pub execution_id: Uuid,
    pub outcome: RunOutcome,
    /// Why the run did not complete.
    pub error: Option<SchedulerError>,
    /// Retry spawned for a failed run.
    pub retry: Option<JobExecution>,
}

impl RunReport {
    const fn new(execution_id: Uuid, outcome: RunOutcome) -> Self {
        Self {
            execution_id,
            outcome,
            error: None,
            retry: None,
        }
    }

    const fn claim_lost(execution_id: Uuid) -> Self {
        Self {
            execution_id,
            outcome: RunOutcome::ClaimLost,
            error: Some(SchedulerError::ClaimLost { execution_id }),
            retry: None,
        }
    }
}

enum Interruption {
    Finished(JobResult),
    LeaseLost,
    Shutdown,
}

#[derive(Clone, Debug)]
pub struct ExecutionRunner {
    app: App,
    registry: Arc<JobRegistry>,
    heartbeat: HeartbeatKeeper,
    retry: RetryCoordinator,
    shutdown: CancellationToken,
}

impl ExecutionRunner {
    #[must_use]
    pub const fn new(
        app: App,
        registry: Arc<JobRegistry>,
        heartbeat: HeartbeatKeeper,
        retry: RetryCoordinator,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            app,
            registry,
            heartbeat,
            retry,
            shutdown,
        }
    }

    /// Runs an execution claimed by this node.
    ///
    /// Every write is guarded on the lease still belonging to the claiming
    /// worker; once it is gone nothing more is recorded for the row.
    pub async fn run(&self, execution: JobExecution) -> Result<RunReport, SchedulerError> {
        let Some(worker_id) = execution.claimed_by.clone() else {
            return Ok(RunReport::claim_lost(execution.id));
        };
        let ownership = ExecutionGuard::owned_by(&worker_id);
        let store = &self.app.store;

        let Some(definition) = store.get_definition(execution.job_definition_id).await? else {
            error!(
                "❌ Execution {} references missing job definition {}",
                execution.id, execution.job_definition_id
            );
            let result = JobResult::Failed(JobError::FailPermanently(format!(
                "Job definition {} no longer exists",
                execution.job_definition_id
            )));
            let completion = failure_completion(&result, now(), 0);
            let patch = ExecutionPatch::finish(ExecutionStatus::Failed, completion);
            if !store
                .conditional_update(execution.id, &ownership, &patch)
                .await?
            {
                return Ok(RunReport::claim_lost(execution.id));
            }
            return Ok(RunReport::new(execution.id, RunOutcome::Failed));
        };

        let start = ExecutionPatch::start(&worker_id, now());
        if !store
            .conditional_update(execution.id, &ownership, &start)
            .await?
        {
            warn!(
                "Worker '{worker_id}' lost execution {} before it started",
                execution.id
            );
            return Ok(RunReport::claim_lost(execution.id));
        }

        let lease_lost = CancellationToken::new();
        let heartbeat = self
            .heartbeat
            .spawn(execution.id, worker_id.clone(), lease_lost.clone());

        let started = StdInstant::now();
        let interruption = self
            .invoke_handler(&execution, &definition, &lease_lost)
            .await;
        heartbeat.stop().await;

        let finished_at = now();
        #[allow(clippy::cast_possible_truncation)]
        let duration_ms = started.elapsed().as_millis() as i64;

        let result = match interruption {
            Interruption::Finished(result) => result,
            Interruption::LeaseLost => {
                warn!(
                    "💔 Abandoned execution {} of '{}' after losing its lease",
                    execution.id, definition.job_key
                );
                return Ok(RunReport::claim_lost(execution.id));
            }
            Interruption::Shutdown => {
                let released = store
                    .conditional_update(execution.id, &ownership, &ExecutionPatch::release())
                    .await?;
                if !released {
                    return Ok(RunReport::claim_lost(execution.id));
                }
                info!(
                    "↩️ Released execution {} of '{}' on shutdown",
                    execution.id, definition.job_key
                );
                return Ok(RunReport::new(execution.id, RunOutcome::Released));
            }
        };

        let status = ExecutionStatus::from(&result);
        let completion = match &result {
            JobResult::Completed(output) => Completion {
                duration_ms: Some(duration_ms),
                result_data: Some(output.clone()).filter(|output| !output.is_null()),
                ..Completion::at(finished_at)
            },
            failure => failure_completion(failure, finished_at, duration_ms),
        };

        let patch = ExecutionPatch::finish(status, completion);
        if !store
            .conditional_update(execution.id, &ownership, &patch)
            .await?
        {
            warn!(
                "Worker '{worker_id}' lost execution {} before recording its result",
                execution.id
            );
            return Ok(RunReport::claim_lost(execution.id));
        }

        let mut finished = execution;
        start.apply(&mut finished);
        patch.apply(&mut finished);

        match &result {
            JobResult::Completed(_) => {
                info!(
                    "✅ Worker '{worker_id}' completed '{}' execution {} in {duration_ms}ms",
                    definition.job_key, finished.id
                );
                Ok(RunReport::new(finished.id, RunOutcome::Completed))
            }
            failure => {
                let retry = self.spawn_retry(&finished, &definition).await?;
                if retry.is_none() {
                    error!(
                        "❌ Worker '{worker_id}' failed '{}' execution {} in {duration_ms}ms: {failure}",
                        definition.job_key, finished.id
                    );
                }

                let (outcome, error) = match failure {
                    JobResult::TimedOut => (
                        RunOutcome::TimedOut,
                        SchedulerError::Timeout(definition.timeout_seconds),
                    ),
                    other => (
                        RunOutcome::Failed,
                        SchedulerError::HandlerFailure(other.to_string()),
                    ),
                };

                Ok(RunReport {
                    execution_id: finished.id,
                    outcome,
                    error: Some(error),
                    retry,
                })
            }
        }
    }

    /// Keeps the lease of a claimed execution alive while it waits behind
    /// others of the same batch. Stop the handle before running it.
    #[must_use]
    pub fn hold(&self, execution: &JobExecution, worker_id: &str) -> HeartbeatHandle {
        self.heartbeat
            .spawn(execution.id, worker_id.to_string(), CancellationToken::new())
    }

    /// Hands a claimed but unstarted execution back to the pending pool.
    /// Returns `false` when the lease already belongs to someone else.
    pub async fn release(
        &self,
        execution: &JobExecution,
        worker_id: &str,
    ) -> Result<bool, SchedulerError> {
        let released = self
            .app
            .store
            .conditional_update(
                execution.id,
                &ExecutionGuard::owned_by(worker_id),
                &ExecutionPatch::release(),
            )
            .await?;
        if released {
            debug!("↩️ Worker '{worker_id}' released unstarted execution {}", execution.id);
        }
        Ok(released)
    }

    /// Inserts the retry of a failed row, waiting out store outages.
    ///
    /// The failed row is already terminal, so giving up here would end its
    /// chain. Only shutdown stops the attempts.
    async fn spawn_retry(
        &self,
        finished: &JobExecution,
        definition: &JobDefinition,
    ) -> Result<Option<JobExecution>, SchedulerError> {
        let mut backoff = RestartBackoff::default();

        loop {
            let error = match self.retry.on_failure(finished, definition, now()).await {
                Err(error @ SchedulerError::StoreUnavailable(_)) => error,
                result => return result,
            };

            let delay = backoff.next_delay();
            warn!(
                "⚠️ Could not enqueue retry of execution {} (attempt {}), trying again in {:?}: {}",
                finished.id,
                backoff.failures(),
                delay,
                error
            );

            tokio::select! {
                () = self.shutdown.cancelled() => return Err(error),
                () = sleep(delay) => {}
            }
        }
    }

    async fn invoke_handler(
        &self,
        execution: &JobExecution,
        definition: &JobDefinition,
        lease_lost: &CancellationToken,
    ) -> Interruption {
        let deadline = Instant::now() + definition.timeout();
        let handler_token = CancellationToken::new();

        let context = JobContext::new(
            self.app.clone(),
            execution.tenant_id,
            execution.id,
            definition.id,
            definition.job_key.clone(),
            execution.execution_number,
            execution.retry_count,
            handler_token.clone(),
            deadline,
        );

        let registry = self.registry.clone();
        let job_type = execution.job_type.clone();
        let arguments = definition.parameters.clone();

        debug!(
            "▶️ Running '{}' ({job_type}) execution {}",
            definition.job_key, execution.id
        );
        let mut task =
            tokio::spawn(async move { registry.execute(context, &job_type, arguments).await });

        let interruption = tokio::select! {
            joined = &mut task => match joined {
                Ok(result) => Interruption::Finished(result),
                Err(e) if e.is_panic() => {
                    Interruption::Finished(JobResult::Panicked(panic_message(e.into_panic())))
                }
                Err(e) => Interruption::Finished(JobResult::Failed(JobError::unexpected(e))),
            },
            () = sleep_until(deadline) => Interruption::Finished(JobResult::TimedOut),
            () = lease_lost.cancelled() => Interruption::LeaseLost,
            () = self.shutdown.cancelled() => Interruption::Shutdown,
        };

        if !task.is_finished() {
            handler_token.cancel();
            task.abort();
        }

        interruption
    }
}

fn failure_completion(
    result: &JobResult,
    completed_at: chrono::NaiveDateTime,
    duration_ms: i64,
) -> Completion {
    let (error_message, error_type, stack_trace) = match result {
        JobResult::Failed(e) => (
            e.to_string(),
            e.error_type().to_string(),
            e.stack_trace().map(str::to_string),
        ),
        JobResult::Panicked(message) => (message.clone(), "panic".to_string(), None),
        JobResult::TimedOut => ("Job execution timed out".to_string(), "timeout".to_string(), None),
        JobResult::Completed(_) => (String::new(), String::new(), None),
    };

    Completion {
        duration_ms: Some(duration_ms),
        error_message: Some(error_message),
        error_type: Some(error_type),
        stack_trace,
        can_retry: (!result.can_retry()).then_some(false),
        ..Completion::at(completed_at)
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|message| (*message).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "handler panicked".to_string())
}
