//! `SeaORM` Entity for archived executions
//!
//! Rows are denormalized copies of terminal `job_execution` rows. There is no
//! foreign key to `job_definition`, so history outlives definition changes.

use crate::database::models::{
    execution_status::ExecutionStatus, job_definition, job_execution,
};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "job_execution_history")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub job_definition_id: Uuid,
    pub job_key: String,
    pub job_name: String,
    pub job_type: String,
    pub priority: i32,
    pub execution_number: i64,
    pub scheduled_at: DateTime,
    pub enqueued_at: DateTime,
    pub status: ExecutionStatus,
    pub target_instance: Option<String>,
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
    pub archived_at: DateTime,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    /// Projects a terminal execution into its archived form.
    ///
    /// `definition` is `None` when the definition row is gone; the job key and
    /// name then fall back to the job type.
    #[must_use]
    pub fn archive(
        execution: job_execution::Model,
        definition: Option<&job_definition::Model>,
        archived_at: DateTime,
    ) -> Self {
        let (job_key, job_name) = definition.map_or_else(
            || (execution.job_type.clone(), execution.job_type.clone()),
            |definition| (definition.job_key.clone(), definition.job_name.clone()),
        );

        Self {
            id: execution.id,
            tenant_id: execution.tenant_id,
            job_definition_id: execution.job_definition_id,
            job_key,
            job_name,
            job_type: execution.job_type,
            priority: execution.priority,
            execution_number: execution.execution_number,
            scheduled_at: execution.scheduled_at,
            enqueued_at: execution.enqueued_at,
            status: execution.status,
            target_instance: execution.target_instance,
            schedule_key: execution.schedule_key,
            claimed_by: execution.claimed_by,
            claimed_at: execution.claimed_at,
            lock_expires_at: execution.lock_expires_at,
            heartbeat_at: execution.heartbeat_at,
            executed_by: execution.executed_by,
            started_at: execution.started_at,
            completed_at: execution.completed_at,
            duration_ms: execution.duration_ms,
            result_data: execution.result_data,
            error_message: execution.error_message,
            error_type: execution.error_type,
            stack_trace: execution.stack_trace,
            is_retry: execution.is_retry,
            retry_of_execution_id: execution.retry_of_execution_id,
            retry_count: execution.retry_count,
            can_retry: execution.can_retry,
            archived_at,
        }
    }

    /// The execution row this history entry was archived from.
    #[must_use]
    pub fn to_execution(&self) -> job_execution::Model {
        job_execution::Model {
            id: self.id,
            tenant_id: self.tenant_id,
            job_definition_id: self.job_definition_id,
            job_type: self.job_type.clone(),
            priority: self.priority,
            execution_number: self.execution_number,
            scheduled_at: self.scheduled_at,
            enqueued_at: self.enqueued_at,
            status: self.status,
            target_instance: self.target_instance.clone(),
            schedule_key: self.schedule_key.clone(),
            claimed_by: self.claimed_by.clone(),
            claimed_at: self.claimed_at,
            lock_expires_at: self.lock_expires_at,
            heartbeat_at: self.heartbeat_at,
            executed_by: self.executed_by.clone(),
            started_at: self.started_at,
            completed_at: self.completed_at,
            duration_ms: self.duration_ms,
            result_data: self.result_data.clone(),
            error_message: self.error_message.clone(),
            error_type: self.error_type.clone(),
            stack_trace: self.stack_trace.clone(),
            is_retry: self.is_retry,
            retry_of_execution_id: self.retry_of_execution_id,
            retry_count: self.retry_count,
            can_retry: self.can_retry,
        }
    }
}
