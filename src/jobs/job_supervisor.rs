use std::{collections::HashSet, sync::Arc, time::Duration};
use tokio::{task::JoinSet, time::sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::{
    app::App,
    config::{WorkerPoolConfig, WorkersConfig},
    error::SchedulerError,
    jobs::{
        archiver::HistoryArchiver,
        claims::{ClaimManager, WorkerIdentity},
        heartbeat::HeartbeatKeeper,
        now,
        retry::RetryCoordinator,
        runner::ExecutionRunner,
        scanner::DueJobScanner,
        worker::worker,
    },
};

use super::job_registry::JobRegistry;

const INITIAL_RESTART_DELAY: Duration = Duration::from_secs(1);
const MAX_RESTART_DELAY: Duration = Duration::from_secs(60);

/// Capped exponential delay with jitter between restarts of a failing loop.
#[derive(Debug, Default)]
pub(crate) struct RestartBackoff {
    failures: u32,
}

impl RestartBackoff {
    pub(crate) fn next_delay(&mut self) -> Duration {
        let delay = INITIAL_RESTART_DELAY
            .saturating_mul(2u32.saturating_pow(self.failures))
            .min(MAX_RESTART_DELAY);
        self.failures = self.failures.saturating_add(1);
        delay.mul_f64(1.0 + fastrand::f64() * 0.2)
    }

    pub(crate) const fn reset(&mut self) {
        self.failures = 0;
    }

    pub(crate) const fn failures(&self) -> u32 {
        self.failures
    }
}

/// Verify that every registered job type is served by at least one worker pool.
///
/// A pool with an empty `jobs` list serves every type.
fn verify_job_types_have_workers(
    workers_config: &WorkersConfig,
    job_registry: &JobRegistry,
) -> Result<(), SchedulerError> {
    if workers_config
        .pools
        .values()
        .any(|pool| pool.jobs.is_empty())
    {
        return Ok(());
    }

    let covered_job_types: HashSet<&str> = workers_config
        .pools
        .values()
        .flat_map(|pool| pool.jobs.iter().map(String::as_str))
        .collect();

    for job_type in job_registry.job_names() {
        if !covered_job_types.contains(*job_type) {
            return Err(SchedulerError::Config(format!(
                "No worker pool configured to handle job type '{job_type}'. Please add a worker pool for this job type."
            )));
        }
    }

    Ok(())
}

/// Runs this node's scanner, worker pools and archiver until `shutdown` is
/// cancelled, then waits for in-flight executions to be released.
pub async fn job_supervisor(
    app: App,
    job_registry: JobRegistry,
    shutdown: CancellationToken,
) -> Result<(), SchedulerError> {
    let scheduler_config = app.config.scheduler.clone();
    scheduler_config.validate()?;
    verify_job_types_have_workers(&scheduler_config.workers, &job_registry)?;

    let store = app.store.clone();
    let lease = scheduler_config.lease.lease_duration();

    let scanner = DueJobScanner::new(
        store.clone(),
        scheduler_config.node_id.clone(),
        scheduler_config.scanner.clone(),
    );
    let claims = ClaimManager::new(store.clone(), lease);
    let runner = ExecutionRunner::new(
        app.clone(),
        Arc::new(job_registry),
        HeartbeatKeeper::new(
            store.clone(),
            lease,
            scheduler_config.lease.heartbeat_interval(),
        ),
        RetryCoordinator::new(store.clone(), scheduler_config.retry.clone()),
        shutdown.clone(),
    );
    let archiver = HistoryArchiver::new(store, scheduler_config.archive.clone());

    info!(
        "🚀 Starting job supervisor on node '{}'",
        scheduler_config.node_id
    );

    let mut tasks = JoinSet::new();

    tasks.spawn(run_scanner_loop(scanner, shutdown.clone()));
    start_worker_pools(
        &mut tasks,
        &scheduler_config.node_id,
        &scheduler_config.workers,
        &claims,
        &runner,
        &shutdown,
    );
    tasks.spawn(run_archiver_loop(archiver, shutdown.clone()));

    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            error!("💥 Supervised task ended abnormally: {e}");
        }
    }

    info!("👋 Job supervisor stopped");
    Ok(())
}

/// Start all worker pools based on configuration
fn start_worker_pools(
    tasks: &mut JoinSet<()>,
    node_id: &str,
    config: &WorkersConfig,
    claims: &ClaimManager,
    runner: &ExecutionRunner,
    shutdown: &CancellationToken,
) {
    for (pool_name, pool_config) in &config.pools {
        info!(
            "⚡ Pool '{}': {} workers for jobs {:?}",
            pool_name, pool_config.count, pool_config.jobs
        );

        for index in 0..pool_config.count {
            let identity = WorkerIdentity::new(node_id, pool_name, index);
            tasks.spawn(run_worker_with_restart(
                identity,
                pool_config.clone(),
                claims.clone(),
                runner.clone(),
                shutdown.clone(),
            ));
        }
    }
}

/// Run a worker with automatic restart on store failures
async fn run_worker_with_restart(
    identity: WorkerIdentity,
    pool_config: WorkerPoolConfig,
    claims: ClaimManager,
    runner: ExecutionRunner,
    shutdown: CancellationToken,
) {
    let mut backoff = RestartBackoff::default();

    loop {
        debug!(
            "Starting worker '{}' for job types: {:?} (restart #{})",
            identity,
            pool_config.jobs,
            backoff.failures()
        );

        match worker(&identity, &pool_config, &claims, &runner, &shutdown).await {
            Ok(()) => break,
            Err(e) => {
                let delay = backoff.next_delay();
                error!(
                    "💥 Worker '{}' crashed (restart #{}) - error: {}, restarting in {:?}",
                    identity,
                    backoff.failures(),
                    e,
                    delay
                );

                tokio::select! {
                    () = shutdown.cancelled() => break,
                    () = sleep(delay) => {}
                }
            }
        }
    }
}

async fn run_scanner_loop(scanner: DueJobScanner, shutdown: CancellationToken) {
    info!("📅 Starting due-job scanner");
    let mut backoff = RestartBackoff::default();

    loop {
        let delay = match scanner.scan(now()).await {
            Ok(_) => {
                backoff.reset();
                scanner.config().interval()
            }
            Err(e) => {
                let delay = backoff.next_delay();
                error!("❌ Scan for due jobs failed, retrying in {:?}: {}", delay, e);
                delay
            }
        };

        tokio::select! {
            () = shutdown.cancelled() => break,
            () = sleep(delay) => {}
        }
    }
}

async fn run_archiver_loop(archiver: HistoryArchiver, shutdown: CancellationToken) {
    info!("🧹 Starting history archiver");
    let interval = Duration::from_secs(archiver.config().interval_seconds);
    let mut backoff = RestartBackoff::default();

    loop {
        let delay = match archiver.archive(now()).await {
            Ok(_) => {
                backoff.reset();
                interval
            }
            Err(e) => {
                let delay = backoff.next_delay();
                error!("🧹 Failed to archive executions, retrying in {:?}: {}", delay, e);
                delay
            }
        };

        tokio::select! {
            () = shutdown.cancelled() => break,
            () = sleep(delay) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        database::models::{execution_status::ExecutionStatus, schedule_type::ScheduleType},
        jobs::catalog::NewJobDefinition,
        store::JobStore as _,
        tests::setup_test::{setup_test, test_job_registry},
    };
    use std::collections::HashMap;

    #[test]
    fn test_restart_backoff_is_capped() {
        let mut backoff = RestartBackoff::default();
        let first = backoff.next_delay();
        assert!(first >= INITIAL_RESTART_DELAY);
        assert!(first <= INITIAL_RESTART_DELAY.mul_f64(1.2));

        for _ in 0..20 {
            assert!(backoff.next_delay() <= MAX_RESTART_DELAY.mul_f64(1.2));
        }

        backoff.reset();
        assert_eq!(backoff.failures(), 0);
    }

    #[test]
    fn test_every_job_type_needs_a_pool() {
        let registry = test_job_registry();
        let narrow = WorkersConfig {
            pools: HashMap::from([(
                "emails".to_string(),
                WorkerPoolConfig {
                    jobs: vec!["echo".to_string()],
                    ..WorkerPoolConfig::default()
                },
            )]),
        };
        assert!(matches!(
            verify_job_types_have_workers(&narrow, &registry),
            Err(SchedulerError::Config(_))
        ));

        assert!(verify_job_types_have_workers(&WorkersConfig::default(), &registry).is_ok());
    }

    #[tokio::test]
    async fn test_supervisor_runs_due_jobs_and_shuts_down() {
        let test = setup_test().await;
        let definition = test
            .catalog
            .create(
                test.tenant_id,
                NewJobDefinition {
                    start_at: Some(now()),
                    ..NewJobDefinition::new("greet", "echo", ScheduleType::Once)
                },
                now(),
            )
            .await
            .unwrap();

        let shutdown = CancellationToken::new();
        let supervisor = tokio::spawn(job_supervisor(
            test.app.clone(),
            test_job_registry(),
            shutdown.clone(),
        ));

        let mut completed = false;
        for _ in 0..300 {
            let executions = test
                .store
                .executions_for_definition(definition.id)
                .await
                .unwrap();
            if executions
                .iter()
                .any(|execution| execution.status == ExecutionStatus::Completed)
            {
                completed = true;
                break;
            }
            sleep(Duration::from_millis(20)).await;
        }

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(10), supervisor)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(completed);
    }
}
