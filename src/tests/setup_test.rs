use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, LazyLock, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use sea_orm::ConnectOptions;
use sea_orm_migration::MigratorTrait;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::{
    app::App,
    config::{
        ArchiveConfig, Config, DatabaseConfig, LeaseConfig, RetryConfig, ScannerConfig,
        SchedulerConfig, TracingConfig, WorkerPoolConfig, WorkersConfig,
    },
    database::{
        migrations::Migrator,
        models::{execution_scope::ExecutionScope, schedule_type::ScheduleType},
    },
    environment::Environment,
    jobs::{
        archiver::HistoryArchiver,
        catalog::JobCatalog,
        claims::{ClaimManager, WorkerIdentity},
        heartbeat::HeartbeatKeeper,
        job_registry::JobRegistry,
        now,
        retry::RetryCoordinator,
        runner::ExecutionRunner,
        scanner::DueJobScanner,
        Job, JobContext, JobError,
    },
    store::{
        ArchiveCriteria, ClaimFilter, ExecutionGuard, ExecutionPatch, JobDefinition,
        JobExecution, JobExecutionHistory, JobStore, MemoryStore, ScheduleAdvance, SeaOrmStore,
        StoreError, StoreResult,
    },
};

static TRACING_INITIALIZED: std::sync::Once = std::sync::Once::new();

/// Handler invocations per execution id, recorded by the test jobs below.
static INVOCATIONS: LazyLock<Mutex<HashMap<Uuid, u32>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

pub const TEST_TENANT: Uuid = Uuid::from_u128(0x7e57_0000_0000_4000_8000_0000_0000_0001);
pub const TEST_NODE: &str = "node-a";

/// Initialize tracing for tests
fn init_tracing() {
    TRACING_INITIALIZED.call_once(|| {
        use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

        tracing_subscriber::registry()
            .with(EnvFilter::from_default_env())
            .with(tracing_subscriber::fmt::layer().with_test_writer())
            .init();
    });
}

/// `secs` seconds after 2026-01-01 00:00:00.
pub fn timestamp(secs: i64) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2026, 1, 1)
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .expect("valid base timestamp")
        + chrono::Duration::seconds(secs)
}

/// An enabled, cluster-scoped `echo` definition that recurs every minute and
/// is due at `timestamp(0)`. Every call gets a fresh id.
pub fn test_definition(job_key: &str) -> JobDefinition {
    JobDefinition {
        id: Uuid::new_v4(),
        tenant_id: TEST_TENANT,
        job_key: job_key.to_string(),
        job_name: job_key.to_string(),
        job_type: "echo".to_string(),
        parameters: json!({}),
        schedule_type: ScheduleType::Recurring,
        cron_expression: None,
        interval_seconds: Some(60),
        start_at: None,
        priority: 0,
        execution_scope: ExecutionScope::Cluster,
        max_retries: 3,
        timeout_seconds: 30,
        max_concurrent_executions: 0,
        is_enabled: true,
        next_run_at: Some(timestamp(0)),
        last_execution_id: None,
        execution_count: 0,
        created_at: timestamp(0),
        updated_at: timestamp(0),
    }
}

/// First-attempt pending execution of `definition` without a schedule key.
pub fn pending_execution(definition: &JobDefinition, scheduled_at: NaiveDateTime) -> JobExecution {
    JobExecution::pending(definition, 1, scheduled_at, scheduled_at)
}

/// Configuration tuned for fast loops against an in-memory store.
pub fn test_config() -> Config {
    Config {
        tracing: TracingConfig::default(),
        database: DatabaseConfig {
            url: "sqlite::memory:".to_string(),
            pool_size: 1,
            run_migrations: true,
        },
        scheduler: SchedulerConfig {
            node_id: TEST_NODE.to_string(),
            scanner: ScannerConfig {
                interval_ms: 20,
                ..ScannerConfig::default()
            },
            lease: LeaseConfig {
                lease_seconds: 30,
                heartbeat_seconds: 10,
            },
            retry: RetryConfig {
                jitter_ratio: 0.0,
                ..RetryConfig::default()
            },
            archive: ArchiveConfig::default(),
            workers: WorkersConfig {
                pools: HashMap::from([(
                    "default".to_string(),
                    WorkerPoolConfig {
                        count: 2,
                        poll_interval_ms: 20,
                        ..WorkerPoolConfig::default()
                    },
                )]),
            },
        },
    }
}

pub fn test_app(store: Arc<dyn JobStore>) -> App {
    App::new(test_config(), Environment::Test, store)
}

/// Number of times a test job ran for `execution_id`.
pub fn invocations(execution_id: Uuid) -> u32 {
    INVOCATIONS
        .lock()
        .map(|invocations| invocations.get(&execution_id).copied().unwrap_or(0))
        .unwrap_or(0)
}

fn record_invocation(context: &JobContext) {
    if let Ok(mut invocations) = INVOCATIONS.lock() {
        *invocations.entry(context.execution_id).or_default() += 1;
    }
}

pub struct EchoJob;

impl Job for EchoJob {
    type Arguments = Value;

    async fn execute(context: &JobContext, arguments: Value) -> Result<Value, JobError> {
        record_invocation(context);
        Ok(arguments)
    }

    fn name() -> &'static str {
        "echo"
    }
}

pub struct FailJob;

impl Job for FailJob {
    type Arguments = Value;

    async fn execute(context: &JobContext, _arguments: Value) -> Result<Value, JobError> {
        record_invocation(context);
        Err(JobError::TryAgainLater("upstream unavailable".to_string()))
    }

    fn name() -> &'static str {
        "fail"
    }
}

pub struct FailPermanentlyJob;

impl Job for FailPermanentlyJob {
    type Arguments = Value;

    async fn execute(context: &JobContext, _arguments: Value) -> Result<Value, JobError> {
        record_invocation(context);
        Err(JobError::FailPermanently("bad input".to_string()))
    }

    fn name() -> &'static str {
        "fail_permanently"
    }
}

pub struct PanicJob;

impl Job for PanicJob {
    type Arguments = Value;

    async fn execute(context: &JobContext, _arguments: Value) -> Result<Value, JobError> {
        record_invocation(context);
        panic!("test job panicked");
    }

    fn name() -> &'static str {
        "panic"
    }
}

#[derive(Debug, Deserialize)]
pub struct SlowJobArguments {
    pub millis: u64,
}

/// Sleeps for `millis`, stopping early when the execution is cancelled.
pub struct SlowJob;

impl Job for SlowJob {
    type Arguments = SlowJobArguments;

    async fn execute(
        context: &JobContext,
        arguments: SlowJobArguments,
    ) -> Result<Value, JobError> {
        record_invocation(context);
        tokio::select! {
            () = context.cancelled() => Err(JobError::TryAgainLater("cancelled".to_string())),
            () = tokio::time::sleep(Duration::from_millis(arguments.millis)) => {
                Ok(json!({"slept_ms": arguments.millis}))
            }
        }
    }

    fn name() -> &'static str {
        "slow"
    }
}

pub fn test_job_registry() -> JobRegistry {
    let mut registry = JobRegistry::new();
    registry.register_job::<EchoJob>();
    registry.register_job::<FailJob>();
    registry.register_job::<FailPermanentlyJob>();
    registry.register_job::<PanicJob>();
    registry.register_job::<SlowJob>();
    registry
}

/// One node's worth of scheduler components wired to a private in-memory store.
pub struct TestScheduler {
    pub app: App,
    pub store: Arc<MemoryStore>,
    pub catalog: JobCatalog,
    pub scanner: DueJobScanner,
    pub claims: ClaimManager,
    pub runner: ExecutionRunner,
    pub retry: RetryCoordinator,
    pub archiver: HistoryArchiver,
    pub shutdown: CancellationToken,
    pub tenant_id: Uuid,
    pub worker: WorkerIdentity,
}

impl TestScheduler {
    /// Claims up to `batch_size` executions of any type for `self.worker`.
    pub async fn claim(&self, batch_size: u64) -> Vec<JobExecution> {
        self.claims
            .try_claim(&self.worker, &[], batch_size, now())
            .await
            .expect("claim should succeed against the memory store")
    }
}

/// Sets up a scheduler node backed by a fresh in-memory store.
///
/// Heartbeats run every 20ms so lease loss is noticed quickly.
pub async fn setup_test() -> TestScheduler {
    init_tracing();

    debug!("Setting up test scheduler");

    let store = Arc::new(MemoryStore::new());
    let app = test_app(store.clone());
    let scheduler_config = app.config.scheduler.clone();
    let lease = scheduler_config.lease.lease_duration();

    let retry = RetryCoordinator::new(store.clone(), scheduler_config.retry.clone());
    let shutdown = CancellationToken::new();
    let runner = test_runner(app.clone(), shutdown.clone());

    TestScheduler {
        catalog: JobCatalog::new(store.clone()),
        scanner: DueJobScanner::new(
            store.clone(),
            scheduler_config.node_id.clone(),
            scheduler_config.scanner.clone(),
        ),
        claims: ClaimManager::new(store.clone(), lease),
        archiver: HistoryArchiver::new(store.clone(), scheduler_config.archive.clone()),
        runner,
        retry,
        shutdown,
        tenant_id: TEST_TENANT,
        worker: WorkerIdentity::new(&scheduler_config.node_id, "default", 0),
        store,
        app,
    }
}

/// Runner over `app.store` with the test job registry and 20ms heartbeats.
pub fn test_runner(app: App, shutdown: CancellationToken) -> ExecutionRunner {
    let scheduler_config = &app.config.scheduler;
    let lease = scheduler_config.lease.lease_duration();
    let retry = RetryCoordinator::new(app.store.clone(), scheduler_config.retry.clone());
    let heartbeat = HeartbeatKeeper::new(app.store.clone(), lease, Duration::from_millis(20));

    ExecutionRunner::new(
        app,
        Arc::new(test_job_registry()),
        heartbeat,
        retry,
        shutdown,
    )
}

/// A [`MemoryStore`] whose execution inserts fail while armed.
#[derive(Debug, Default)]
pub struct FlakyStore {
    pub inner: MemoryStore,
    failing_inserts: AtomicU32,
    failed_inserts: AtomicU32,
}

impl FlakyStore {
    /// Makes the next `count` execution inserts fail as if the database were down.
    pub fn fail_inserts(&self, count: u32) {
        self.failing_inserts.store(count, Ordering::SeqCst);
    }

    /// Inserts rejected so far.
    pub fn failed_inserts(&self) -> u32 {
        self.failed_inserts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl JobStore for FlakyStore {
    async fn insert_definition(&self, definition: JobDefinition) -> StoreResult<JobDefinition> {
        self.inner.insert_definition(definition).await
    }

    async fn save_definition(&self, definition: JobDefinition) -> StoreResult<JobDefinition> {
        self.inner.save_definition(definition).await
    }

    async fn get_definition(&self, id: Uuid) -> StoreResult<Option<JobDefinition>> {
        self.inner.get_definition(id).await
    }

    async fn find_definition(
        &self,
        tenant_id: Uuid,
        job_key: &str,
    ) -> StoreResult<Option<JobDefinition>> {
        self.inner.find_definition(tenant_id, job_key).await
    }

    async fn list_definitions(&self, tenant_id: Uuid) -> StoreResult<Vec<JobDefinition>> {
        self.inner.list_definitions(tenant_id).await
    }

    async fn due_definitions(
        &self,
        now: NaiveDateTime,
        limit: u64,
    ) -> StoreResult<Vec<JobDefinition>> {
        self.inner.due_definitions(now, limit).await
    }

    async fn advance_schedule(&self, advance: &ScheduleAdvance) -> StoreResult<bool> {
        self.inner.advance_schedule(advance).await
    }

    async fn insert_execution_if_absent(
        &self,
        execution: JobExecution,
    ) -> StoreResult<Option<JobExecution>> {
        let armed = self
            .failing_inserts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if armed {
            self.failed_inserts.fetch_add(1, Ordering::SeqCst);
            return Err(StoreError::Unavailable("connection refused".to_string()));
        }
        self.inner.insert_execution_if_absent(execution).await
    }

    async fn get_execution(&self, id: Uuid) -> StoreResult<Option<JobExecution>> {
        self.inner.get_execution(id).await
    }

    async fn count_active_executions(
        &self,
        definition_id: Uuid,
        target_instance: Option<&str>,
    ) -> StoreResult<u64> {
        self.inner
            .count_active_executions(definition_id, target_instance)
            .await
    }

    async fn claim_candidates(&self, filter: &ClaimFilter) -> StoreResult<Vec<JobExecution>> {
        self.inner.claim_candidates(filter).await
    }

    async fn conditional_update(
        &self,
        id: Uuid,
        guards: &[ExecutionGuard],
        patch: &ExecutionPatch,
    ) -> StoreResult<bool> {
        self.inner.conditional_update(id, guards, patch).await
    }

    async fn executions_for_definition(
        &self,
        definition_id: Uuid,
    ) -> StoreResult<Vec<JobExecution>> {
        self.inner.executions_for_definition(definition_id).await
    }

    async fn archive_executions(
        &self,
        criteria: &ArchiveCriteria,
        archived_at: NaiveDateTime,
    ) -> StoreResult<Vec<Uuid>> {
        self.inner.archive_executions(criteria, archived_at).await
    }

    async fn history_for_definition(
        &self,
        definition_id: Uuid,
        limit: u64,
    ) -> StoreResult<Vec<JobExecutionHistory>> {
        self.inner.history_for_definition(definition_id, limit).await
    }
}

/// A migrated in-memory SQLite database behind the `SeaORM` store.
///
/// A single connection keeps every query on the same in-memory database.
pub async fn setup_sqlite_store() -> SeaOrmStore {
    init_tracing();

    let mut options = ConnectOptions::new("sqlite::memory:".to_string());
    options.sqlx_logging(false);
    options.max_connections(1);
    options.min_connections(1);

    let db = sea_orm::Database::connect(options)
        .await
        .expect("Failed to connect to the database");
    Migrator::up(&db, None)
        .await
        .expect("Database migrations failed");

    SeaOrmStore::new(db)
}
