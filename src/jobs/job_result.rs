use std::fmt::{Display, Formatter, Result};

use crate::database::models::execution_status::ExecutionStatus;
use crate::jobs::JobError;

/// What came out of one handler invocation.
#[derive(Debug)]
pub enum JobResult {
    Completed(serde_json::Value),
    Failed(JobError),
    Panicked(String),
    TimedOut,
}

impl JobResult {
    /// Whether a failed attempt may be followed by a retry.
    #[must_use]
    pub const fn can_retry(&self) -> bool {
        match self {
            Self::Completed(_) => false,
            Self::Failed(e) => e.can_retry(),
            Self::Panicked(_) | Self::TimedOut => true,
        }
    }
}

impl Display for JobResult {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        match self {
            Self::Completed(_) => write!(f, "completed"),
            Self::Failed(e) => write!(f, "error: {e}"),
            Self::Panicked(message) => write!(f, "panicked: {message}"),
            Self::TimedOut => write!(f, "timed out"),
        }
    }
}

impl From<&JobResult> for ExecutionStatus {
    fn from(result: &JobResult) -> Self {
        match result {
            JobResult::Completed(_) => Self::Completed,
            JobResult::Failed(_) | JobResult::Panicked(_) => Self::Failed,
            JobResult::TimedOut => Self::TimedOut,
        }
    }
}
