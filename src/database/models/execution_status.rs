use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};

/// Lifecycle state of a single job execution attempt.
///
/// # State Transitions
///
/// - `Pending` → `Claimed` → `Running` → `Completed` / `Failed` / `TimedOut`
/// - `Claimed` / `Running` → `Claimed` when a lease expires and another worker reclaims it
/// - `Claimed` / `Running` → `Pending` when the owning node shuts down gracefully
/// - `Pending` / `Claimed` / `Running` → `Cancelled` on external request
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    DeriveActiveEnum,
    Serialize,
    Deserialize,
    EnumIter,
    EnumString,
    Display,
    Default,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ExecutionStatus {
    /// Waiting for a worker to claim it once `scheduled_at` has passed.
    #[sea_orm(string_value = "pending")]
    #[default]
    Pending,

    /// A worker holds the lease but has not started the handler yet.
    #[sea_orm(string_value = "claimed")]
    Claimed,

    /// The handler is executing under a live lease.
    #[sea_orm(string_value = "running")]
    Running,

    #[sea_orm(string_value = "completed")]
    Completed,

    #[sea_orm(string_value = "failed")]
    Failed,

    #[sea_orm(string_value = "cancelled")]
    Cancelled,

    #[sea_orm(string_value = "timed_out")]
    TimedOut,
}

impl ExecutionStatus {
    /// Statuses that count against a definition's concurrency cap.
    pub const ACTIVE: [Self; 3] = [Self::Pending, Self::Claimed, Self::Running];

    /// Statuses that hold a lease.
    pub const LEASED: [Self; 2] = [Self::Claimed, Self::Running];

    /// Final statuses; rows in these states are eligible for archival.
    pub const TERMINAL: [Self; 4] = [
        Self::Completed,
        Self::Failed,
        Self::Cancelled,
        Self::TimedOut,
    ];

    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::TimedOut
        )
    }

    pub const fn is_leased(&self) -> bool {
        matches!(self, Self::Claimed | Self::Running)
    }

    pub const fn is_active(&self) -> bool {
        matches!(self, Self::Pending | Self::Claimed | Self::Running)
    }

    /// Failed attempts that may feed the retry coordinator.
    pub const fn is_retryable_failure(&self) -> bool {
        matches!(self, Self::Failed | Self::TimedOut)
    }
}
