//! `SeaORM` Entity for job execution attempts

use crate::database::models::execution_status::ExecutionStatus;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "job_execution")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub job_definition_id: Uuid,
    pub job_type: String,
    pub priority: i32,
    pub execution_number: i64,
    pub scheduled_at: DateTime,
    pub enqueued_at: DateTime,
    pub status: ExecutionStatus,
    pub target_instance: Option<String>,
    #[sea_orm(unique)]
    pub schedule_key: Option<String>,
    pub claimed_by: Option<String>,
    pub claimed_at: Option<DateTime>,
    pub lock_expires_at: Option<DateTime>,
    pub heartbeat_at: Option<DateTime>,
    pub executed_by: Option<String>,
    pub started_at: Option<DateTime>,
    pub completed_at: Option<DateTime>,
    pub duration_ms: Option<i64>,
    #[sea_orm(column_type = "JsonBinary", nullable)]
    pub result_data: Option<Json>,
    pub error_message: Option<String>,
    pub error_type: Option<String>,
    pub stack_trace: Option<String>,
    pub is_retry: bool,
    pub retry_of_execution_id: Option<Uuid>,
    pub retry_count: i32,
    pub can_retry: bool,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::job_definition::Entity",
        from = "Column::JobDefinitionId",
        to = "super::job_definition::Column::Id"
    )]
    JobDefinition,
}

impl Related<super::job_definition::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::JobDefinition.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    /// A fresh, unleased first attempt for `definition`.
    #[must_use]
    pub fn pending(
        definition: &super::job_definition::Model,
        execution_number: i64,
        scheduled_at: DateTime,
        enqueued_at: DateTime,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id: definition.tenant_id,
            job_definition_id: definition.id,
            job_type: definition.job_type.clone(),
            priority: definition.priority,
            execution_number,
            scheduled_at,
            enqueued_at,
            status: ExecutionStatus::Pending,
            target_instance: None,
            schedule_key: None,
            claimed_by: None,
            claimed_at: None,
            lock_expires_at: None,
            heartbeat_at: None,
            executed_by: None,
            started_at: None,
            completed_at: None,
            duration_ms: None,
            result_data: None,
            error_message: None,
            error_type: None,
            stack_trace: None,
            is_retry: false,
            retry_of_execution_id: None,
            retry_count: 0,
            can_retry: definition.max_retries > 0,
        }
    }

    /// Whether `worker` currently holds the lease on this row.
    #[must_use]
    pub fn is_claimed_by(&self, worker: &str) -> bool {
        self.status.is_leased() && self.claimed_by.as_deref() == Some(worker)
    }

    /// A leased row whose lease ran out without a heartbeat.
    #[must_use]
    pub fn is_orphaned(&self, now: DateTime) -> bool {
        self.status.is_leased()
            && self
                .lock_expires_at
                .is_none_or(|lock_expires_at| lock_expires_at < now)
    }

    /// Whether a claim attempt at `now` may take this row.
    #[must_use]
    pub fn is_claimable(&self, now: DateTime) -> bool {
        (self.status == ExecutionStatus::Pending && self.scheduled_at <= now)
            || self.is_orphaned(now)
    }

    /// Calculate execution duration from the recorded timestamps
    #[must_use]
    pub fn execution_duration(&self) -> Option<chrono::Duration> {
        Some(self.completed_at?.signed_duration_since(self.started_at?))
    }
}
