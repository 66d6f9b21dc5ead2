//! Persistence contract shared by every scheduler component.
//!
//! Nodes coordinate only through this interface. Every mutation of a leased
//! execution goes through [`JobStore::conditional_update`], which applies a
//! patch only while the row still matches the caller's view of it.

pub mod memory;
pub mod sea_orm_store;

use async_trait::async_trait;
use chrono::NaiveDateTime;
use thiserror::Error;
use uuid::Uuid;

use crate::database::models::{
    execution_status::ExecutionStatus, job_definition, job_execution, job_execution_history,
};

pub use memory::MemoryStore;
pub use sea_orm_store::SeaOrmStore;

pub type JobDefinition = job_definition::Model;
pub type JobExecution = job_execution::Model;
pub type JobExecutionHistory = job_execution_history::Model;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Duplicate key: {0}")]
    DuplicateKey(String),
    #[error("Database error: {0}")]
    Database(#[from] sea_orm::DbErr),
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// A predicate on the current values of an execution row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionGuard {
    Status(ExecutionStatus),
    StatusIn(Vec<ExecutionStatus>),
    ClaimedBy(Option<String>),
    LockExpiresAt(Option<NaiveDateTime>),
}

impl ExecutionGuard {
    #[must_use]
    pub fn matches(&self, row: &JobExecution) -> bool {
        match self {
            Self::Status(status) => row.status == *status,
            Self::StatusIn(statuses) => statuses.contains(&row.status),
            Self::ClaimedBy(claimed_by) => row.claimed_by == *claimed_by,
            Self::LockExpiresAt(lock_expires_at) => row.lock_expires_at == *lock_expires_at,
        }
    }

    /// The whole lease tuple as it was read. Used when claiming, so that two
    /// workers holding the same stale snapshot cannot both win.
    #[must_use]
    pub fn lease_snapshot(row: &JobExecution) -> Vec<Self> {
        vec![
            Self::Status(row.status),
            Self::ClaimedBy(row.claimed_by.clone()),
            Self::LockExpiresAt(row.lock_expires_at),
        ]
    }

    /// The row is still leased by `worker`.
    #[must_use]
    pub fn owned_by(worker: &str) -> Vec<Self> {
        vec![
            Self::StatusIn(ExecutionStatus::LEASED.to_vec()),
            Self::ClaimedBy(Some(worker.to_string())),
        ]
    }
}

/// Change to the lease columns of an execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseChange {
    /// Take the lease: sets `claimed_by`, `claimed_at`, `heartbeat_at` and `lock_expires_at`.
    Acquire {
        claimed_by: String,
        claimed_at: NaiveDateTime,
        lock_expires_at: NaiveDateTime,
    },
    /// Extend the lease: sets `heartbeat_at` and `lock_expires_at`.
    Renew {
        heartbeat_at: NaiveDateTime,
        lock_expires_at: NaiveDateTime,
    },
    /// Drop the lease: clears `claimed_by` and `lock_expires_at`.
    Clear,
}

/// Start-of-run bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunStart {
    pub started_at: NaiveDateTime,
    pub executed_by: String,
}

/// Outcome columns written by a terminal transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub completed_at: NaiveDateTime,
    pub duration_ms: Option<i64>,
    pub result_data: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub error_type: Option<String>,
    pub stack_trace: Option<String>,
    /// `Some(false)` marks a failure that must not be retried.
    pub can_retry: Option<bool>,
}

impl Completion {
    #[must_use]
    pub const fn at(completed_at: NaiveDateTime) -> Self {
        Self {
            completed_at,
            duration_ms: None,
            result_data: None,
            error_message: None,
            error_type: None,
            stack_trace: None,
            can_retry: None,
        }
    }
}

/// The columns a conditional update writes. Unset parts leave the row as is.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExecutionPatch {
    pub status: Option<ExecutionStatus>,
    pub lease: Option<LeaseChange>,
    pub start: Option<RunStart>,
    pub completion: Option<Completion>,
}

impl ExecutionPatch {
    #[must_use]
    pub fn claim(worker: &str, now: NaiveDateTime, lease: chrono::Duration) -> Self {
        Self {
            status: Some(ExecutionStatus::Claimed),
            lease: Some(LeaseChange::Acquire {
                claimed_by: worker.to_string(),
                claimed_at: now,
                lock_expires_at: now + lease,
            }),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn heartbeat(now: NaiveDateTime, lease: chrono::Duration) -> Self {
        Self {
            lease: Some(LeaseChange::Renew {
                heartbeat_at: now,
                lock_expires_at: now + lease,
            }),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn start(worker: &str, now: NaiveDateTime) -> Self {
        Self {
            status: Some(ExecutionStatus::Running),
            start: Some(RunStart {
                started_at: now,
                executed_by: worker.to_string(),
            }),
            ..Self::default()
        }
    }

    /// Terminal transition; always drops the lease.
    #[must_use]
    pub fn finish(status: ExecutionStatus, completion: Completion) -> Self {
        Self {
            status: Some(status),
            lease: Some(LeaseChange::Clear),
            completion: Some(completion),
            ..Self::default()
        }
    }

    /// Hands a claimed execution back to the pending pool.
    #[must_use]
    pub fn release() -> Self {
        Self {
            status: Some(ExecutionStatus::Pending),
            lease: Some(LeaseChange::Clear),
            ..Self::default()
        }
    }

    /// Applies the patch to an in-memory row, mirroring what the SQL update does.
    pub fn apply(&self, row: &mut JobExecution) {
        if let Some(status) = self.status {
            row.status = status;
        }

        match &self.lease {
            Some(LeaseChange::Acquire {
                claimed_by,
                claimed_at,
                lock_expires_at,
            }) => {
                row.claimed_by = Some(claimed_by.clone());
                row.claimed_at = Some(*claimed_at);
                row.heartbeat_at = Some(*claimed_at);
                row.lock_expires_at = Some(*lock_expires_at);
            }
            Some(LeaseChange::Renew {
                heartbeat_at,
                lock_expires_at,
            }) => {
                row.heartbeat_at = Some(*heartbeat_at);
                row.lock_expires_at = Some(*lock_expires_at);
            }
            Some(LeaseChange::Clear) => {
                row.claimed_by = None;
                row.lock_expires_at = None;
            }
            None => {}
        }

        if let Some(start) = &self.start {
            row.started_at = Some(start.started_at);
            row.executed_by = Some(start.executed_by.clone());
        }

        if let Some(completion) = &self.completion {
            row.completed_at = Some(completion.completed_at);
            row.duration_ms = completion.duration_ms;
            row.result_data.clone_from(&completion.result_data);
            row.error_message.clone_from(&completion.error_message);
            row.error_type.clone_from(&completion.error_type);
            row.stack_trace.clone_from(&completion.stack_trace);
            if let Some(can_retry) = completion.can_retry {
                row.can_retry = can_retry;
            }
        }
    }
}

/// Compare-and-swap of a definition's schedule after a tick was enqueued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleAdvance {
    pub definition_id: Uuid,
    /// The `next_run_at` value the scanner acted on.
    pub expected_next_run_at: Option<NaiveDateTime>,
    pub next_run_at: Option<NaiveDateTime>,
    pub execution_count: i64,
    pub last_execution_id: Option<Uuid>,
    pub updated_at: NaiveDateTime,
}

/// Which executions a worker may claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimFilter {
    /// Node of the claiming worker; instance-scoped rows of other nodes are skipped.
    pub instance_id: String,
    /// Job types served by the worker; empty serves all.
    pub job_types: Vec<String>,
    pub now: NaiveDateTime,
    pub limit: u64,
}

impl ClaimFilter {
    #[must_use]
    pub fn admits(&self, row: &JobExecution) -> bool {
        row.is_claimable(self.now)
            && row
                .target_instance
                .as_deref()
                .is_none_or(|target| target == self.instance_id)
            && (self.job_types.is_empty() || self.job_types.contains(&row.job_type))
    }
}

/// Which terminal executions the archiver may move.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveCriteria {
    pub completed_before: NaiveDateTime,
    pub lock_expired_before: NaiveDateTime,
    pub batch_size: u64,
}

impl ArchiveCriteria {
    #[must_use]
    pub fn admits(&self, row: &JobExecution) -> bool {
        row.status.is_terminal()
            && row
                .completed_at
                .is_some_and(|completed_at| completed_at <= self.completed_before)
            && row
                .lock_expires_at
                .is_none_or(|lock_expires_at| lock_expires_at < self.lock_expired_before)
    }
}

#[async_trait]
pub trait JobStore: Send + Sync + std::fmt::Debug {
    /// Inserts a new definition; `(tenant_id, job_key)` clashes yield `DuplicateKey`.
    async fn insert_definition(&self, definition: JobDefinition) -> StoreResult<JobDefinition>;

    /// Overwrites an existing definition.
    async fn save_definition(&self, definition: JobDefinition) -> StoreResult<JobDefinition>;

    async fn get_definition(&self, id: Uuid) -> StoreResult<Option<JobDefinition>>;

    async fn find_definition(
        &self,
        tenant_id: Uuid,
        job_key: &str,
    ) -> StoreResult<Option<JobDefinition>>;

    async fn list_definitions(&self, tenant_id: Uuid) -> StoreResult<Vec<JobDefinition>>;

    /// Enabled, non-manual definitions with `next_run_at <= now`, earliest first.
    async fn due_definitions(
        &self,
        now: NaiveDateTime,
        limit: u64,
    ) -> StoreResult<Vec<JobDefinition>>;

    /// Applies `advance` only if `next_run_at` still equals the expected value.
    async fn advance_schedule(&self, advance: &ScheduleAdvance) -> StoreResult<bool>;

    /// Inserts the execution unless its `schedule_key` is taken. Returns the
    /// inserted row, or `None` when another writer got there first.
    async fn insert_execution_if_absent(
        &self,
        execution: JobExecution,
    ) -> StoreResult<Option<JobExecution>>;

    async fn get_execution(&self, id: Uuid) -> StoreResult<Option<JobExecution>>;

    /// Pending, claimed and running rows of a definition, optionally only those
    /// targeted at one node.
    async fn count_active_executions(
        &self,
        definition_id: Uuid,
        target_instance: Option<&str>,
    ) -> StoreResult<u64>;

    /// Claimable rows ordered by `priority desc, scheduled_at asc`.
    async fn claim_candidates(&self, filter: &ClaimFilter) -> StoreResult<Vec<JobExecution>>;

    /// Applies `patch` if every guard holds. Returns whether a row changed.
    async fn conditional_update(
        &self,
        id: Uuid,
        guards: &[ExecutionGuard],
        patch: &ExecutionPatch,
    ) -> StoreResult<bool>;

    /// Hot rows of a definition, oldest first.
    async fn executions_for_definition(
        &self,
        definition_id: Uuid,
    ) -> StoreResult<Vec<JobExecution>>;

    /// Moves one batch of matching rows into history atomically and returns their ids.
    async fn archive_executions(
        &self,
        criteria: &ArchiveCriteria,
        archived_at: NaiveDateTime,
    ) -> StoreResult<Vec<Uuid>>;

    /// Archived rows of a definition, most recently completed first.
    async fn history_for_definition(
        &self,
        definition_id: Uuid,
        limit: u64,
    ) -> StoreResult<Vec<JobExecutionHistory>>;
}
