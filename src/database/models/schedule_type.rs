use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};

/// How a job definition decides when it is due.
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
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ScheduleType {
    /// Fires a single time at `start_at` (or as soon as created).
    #[sea_orm(string_value = "once")]
    Once,

    /// Fires every `interval_seconds`.
    #[sea_orm(string_value = "recurring")]
    Recurring,

    /// Fires on each occurrence of `cron_expression`.
    #[sea_orm(string_value = "cron")]
    Cron,

    /// Fires a single time, `interval_seconds` after creation.
    #[sea_orm(string_value = "delayed")]
    Delayed,

    /// Never fires on its own; runs only when triggered through the catalog.
    #[sea_orm(string_value = "manual")]
    Manual,
}

impl ScheduleType {
    pub const fn uses_interval(&self) -> bool {
        matches!(self, Self::Recurring | Self::Delayed)
    }

    pub const fn uses_cron(&self) -> bool {
        matches!(self, Self::Cron)
    }

    /// Schedules that stop firing after their first enqueue.
    pub const fn is_one_shot(&self) -> bool {
        matches!(self, Self::Once | Self::Delayed)
    }
}
