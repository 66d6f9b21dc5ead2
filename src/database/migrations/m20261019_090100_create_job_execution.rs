use sea_orm_migration::{
    prelude::*,
    schema::{
        big_integer, big_integer_null, boolean, integer, json_binary_null, string_len,
        string_len_null, string_null, text_null, timestamp, timestamp_null, uuid, uuid_null,
    },
};

use super::m20261019_090000_create_job_definition::JobDefinition;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(JobExecution::Table)
                    .if_not_exists()
                    .col(uuid(JobExecution::Id).primary_key())
                    .col(uuid(JobExecution::TenantId))
                    .col(uuid(JobExecution::JobDefinitionId))
                    .col(string_len(JobExecution::JobType, 128))
                    .col(integer(JobExecution::Priority).default(0))
                    .col(big_integer(JobExecution::ExecutionNumber))
                    .col(timestamp(JobExecution::ScheduledAt))
                    .col(timestamp(JobExecution::EnqueuedAt))
                    .col(string_len(JobExecution::Status, 16))
                    .col(string_len_null(JobExecution::TargetInstance, 255))
                    .col(string_len_null(JobExecution::ScheduleKey, 255))
                    .col(string_len_null(JobExecution::ClaimedBy, 255))
                    .col(timestamp_null(JobExecution::ClaimedAt))
                    .col(timestamp_null(JobExecution::LockExpiresAt))
                    .col(timestamp_null(JobExecution::HeartbeatAt))
                    .col(string_len_null(JobExecution::ExecutedBy, 255))
                    .col(timestamp_null(JobExecution::StartedAt))
                    .col(timestamp_null(JobExecution::CompletedAt))
                    .col(big_integer_null(JobExecution::DurationMs))
                    .col(json_binary_null(JobExecution::ResultData))
                    .col(string_null(JobExecution::ErrorMessage))
                    .col(string_len_null(JobExecution::ErrorType, 128))
                    .col(text_null(JobExecution::StackTrace))
                    .col(boolean(JobExecution::IsRetry).default(false))
                    .col(uuid_null(JobExecution::RetryOfExecutionId))
                    .col(integer(JobExecution::RetryCount).default(0))
                    .col(boolean(JobExecution::CanRetry).default(true))
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk-job_execution-job_definition_id")
                            .from(JobExecution::Table, JobExecution::JobDefinitionId)
                            .to(JobDefinition::Table, JobDefinition::Id)
                            .on_delete(ForeignKeyAction::Restrict)
                            .on_update(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        // Scanner rows and retry rows carry a key; NULLs never collide
        manager
            .create_index(
                Index::create()
                    .name("idx-job_execution-schedule_key")
                    .table(JobExecution::Table)
                    .col(JobExecution::ScheduleKey)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx-job_execution-job_definition_id-status")
                    .table(JobExecution::Table)
                    .col(JobExecution::JobDefinitionId)
                    .col(JobExecution::Status)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx-job_execution-status-priority-scheduled_at")
                    .table(JobExecution::Table)
                    .col(JobExecution::Status)
                    .col(JobExecution::Priority)
                    .col(JobExecution::ScheduledAt)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx-job_execution-status-completed_at")
                    .table(JobExecution::Table)
                    .col(JobExecution::Status)
                    .col(JobExecution::CompletedAt)
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(JobExecution::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum JobExecution {
    Table,
    Id,
    TenantId,
    JobDefinitionId,
    JobType,
    Priority,
    ExecutionNumber,
    ScheduledAt,
    EnqueuedAt,
    Status,
    TargetInstance,
    ScheduleKey,
    ClaimedBy,
    ClaimedAt,
    LockExpiresAt,
    HeartbeatAt,
    ExecutedBy,
    StartedAt,
    CompletedAt,
    DurationMs,
    ResultData,
    ErrorMessage,
    ErrorType,
    StackTrace,
    IsRetry,
    RetryOfExecutionId,
    RetryCount,
    CanRetry,
}
