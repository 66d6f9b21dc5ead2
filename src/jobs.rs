pub mod archiver;
pub mod catalog;
pub mod claims;
pub mod heartbeat;
pub mod job_registry;
pub mod job_result;
pub mod job_supervisor;
pub mod retry;
pub mod runner;
pub mod scanner;
pub mod schedule;
mod worker;

use crate::app::App;
use chrono::{NaiveDateTime, SubsecRound as _, Utc};
use serde::de::DeserializeOwned;
use std::{backtrace::Backtrace, fmt::Display, future::Future, time::Duration};
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum JobError {
    #[error("{0}")]
    FailPermanently(String),
    #[error("{0}")]
    TryAgainLater(String),
    #[error("{message}")]
    Unexpected { message: String, stack_trace: String },
}

impl JobError {
    /// Wraps an unexpected error together with the stack it was raised from.
    pub fn unexpected(error: impl Display) -> Self {
        Self::Unexpected {
            message: error.to_string(),
            stack_trace: Backtrace::force_capture().to_string(),
        }
    }

    #[must_use]
    pub const fn can_retry(&self) -> bool {
        !matches!(self, Self::FailPermanently(_))
    }

    /// Short classification stored in `error_type`.
    #[must_use]
    pub const fn error_type(&self) -> &'static str {
        match self {
            Self::FailPermanently(_) => "permanent",
            Self::TryAgainLater(_) => "transient",
            Self::Unexpected { .. } => "unexpected",
        }
    }

    #[must_use]
    pub fn stack_trace(&self) -> Option<&str> {
        match self {
            Self::Unexpected { stack_trace, .. } => Some(stack_trace),
            Self::FailPermanently(_) | Self::TryAgainLater(_) => None,
        }
    }
}

/// Everything a handler knows about the execution it is running.
#[derive(Clone, Debug)]
pub struct JobContext {
    pub app: App,
    pub tenant_id: Uuid,
    pub execution_id: Uuid,
    pub job_definition_id: Uuid,
    pub job_key: String,
    pub execution_number: i64,
    /// Zero for the first attempt, then the retry count of the chain.
    pub attempt: i32,
    cancellation: CancellationToken,
    deadline: Instant,
}

impl JobContext {
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub const fn new(
        app: App,
        tenant_id: Uuid,
        execution_id: Uuid,
        job_definition_id: Uuid,
        job_key: String,
        execution_number: i64,
        attempt: i32,
        cancellation: CancellationToken,
        deadline: Instant,
    ) -> Self {
        Self {
            app,
            tenant_id,
            execution_id,
            job_definition_id,
            job_key,
            execution_number,
            attempt,
            cancellation,
            deadline,
        }
    }

    /// Set once the lease is lost, the execution is cancelled or the node shuts down.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Resolves when the handler should stop working.
    pub async fn cancelled(&self) {
        self.cancellation.cancelled().await;
    }

    #[must_use]
    pub const fn deadline(&self) -> Instant {
        self.deadline
    }

    #[must_use]
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }
}

pub trait Job: Send + Sync {
    type Arguments: DeserializeOwned + Send + Sync;

    fn execute(
        context: &JobContext,
        arguments: Self::Arguments,
    ) -> impl Future<Output = Result<serde_json::Value, JobError>> + Send;

    fn name() -> &'static str;
}

/// Current UTC time at the precision the database keeps.
#[must_use]
pub fn now() -> NaiveDateTime {
    Utc::now().naive_utc().trunc_subsecs(6)
}
