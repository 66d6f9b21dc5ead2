use thiserror::Error;
use uuid::Uuid;

use crate::store::StoreError;

/// Errors surfaced by the scheduler's public operations.
///
/// Handler failures and timeouts are recorded on the execution row and do not
/// reach catalog callers; they appear here so the runner can report outcomes
/// with a single type.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("A job definition with key '{job_key}' already exists for this tenant")]
    DuplicateDefinition { job_key: String },

    #[error("Job definition '{job_key}' not found")]
    DefinitionNotFound { job_key: String },

    #[error("Job execution {0} not found")]
    ExecutionNotFound(Uuid),

    #[error("Invalid job definition: {0}")]
    InvalidDefinition(#[from] validator::ValidationErrors),

    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),

    #[error("Lease on execution {execution_id} was lost")]
    ClaimLost { execution_id: Uuid },

    #[error("Handler failed: {0}")]
    HandlerFailure(String),

    #[error("Execution exceeded its {0}s timeout")]
    Timeout(i32),

    #[error("Store unavailable: {0}")]
    StoreUnavailable(#[source] StoreError),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<StoreError> for SchedulerError {
    fn from(error: StoreError) -> Self {
        Self::StoreUnavailable(error)
    }
}

impl From<sea_orm::DbErr> for SchedulerError {
    fn from(error: sea_orm::DbErr) -> Self {
        Self::StoreUnavailable(StoreError::Database(error))
    }
}
