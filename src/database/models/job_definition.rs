//! `SeaORM` Entity for job definitions

use crate::database::models::{execution_scope::ExecutionScope, schedule_type::ScheduleType};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "job_definition")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub job_key: String,
    pub job_name: String,
    pub job_type: String,
    #[sea_orm(column_type = "JsonBinary")]
    pub parameters: Json,
    pub schedule_type: ScheduleType,
    pub cron_expression: Option<String>,
    pub interval_seconds: Option<i64>,
    pub start_at: Option<DateTime>,
    pub priority: i32,
    pub execution_scope: ExecutionScope,
    pub max_retries: i32,
    pub timeout_seconds: i32,
    pub max_concurrent_executions: i32,
    pub is_enabled: bool,
    pub next_run_at: Option<DateTime>,
    pub last_execution_id: Option<Uuid>,
    pub execution_count: i64,
    pub created_at: DateTime,
    pub updated_at: DateTime,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::job_execution::Entity")]
    JobExecution,
}

impl Related<super::job_execution::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::JobExecution.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    /// Whether the scanner should enqueue this definition at `now`.
    #[must_use]
    pub fn is_due(&self, now: DateTime) -> bool {
        self.is_enabled
            && self.schedule_type != ScheduleType::Manual
            && self.next_run_at.is_some_and(|next_run_at| next_run_at <= now)
    }

    /// Concurrency cap, `None` when unlimited.
    #[must_use]
    pub fn concurrency_cap(&self) -> Option<u64> {
        u64::try_from(self.max_concurrent_executions)
            .ok()
            .filter(|cap| *cap > 0)
    }

    /// Execution timeout as a std duration.
    #[must_use]
    pub fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(u64::try_from(self.timeout_seconds).unwrap_or(0))
    }
}
