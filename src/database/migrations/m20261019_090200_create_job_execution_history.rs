use sea_orm_migration::{
    prelude::*,
    schema::{
        big_integer, big_integer_null, boolean, integer, json_binary_null, string, string_len,
        string_len_null, string_null, text_null, timestamp, timestamp_null, uuid, uuid_null,
    },
};

#[derive(DeriveMigrationName)]
pub struct Migration;

/// History is append-only and queried by time range. Production deployments
/// on Postgres partition it by month on `completed_at`; the portable schema
/// here keeps the matching index.
#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(JobExecutionHistory::Table)
                    .if_not_exists()
                    .col(uuid(JobExecutionHistory::Id).primary_key())
                    .col(uuid(JobExecutionHistory::TenantId))
                    .col(uuid(JobExecutionHistory::JobDefinitionId))
                    .col(string_len(JobExecutionHistory::JobKey, 128))
                    .col(string(JobExecutionHistory::JobName))
                    .col(string_len(JobExecutionHistory::JobType, 128))
                    .col(integer(JobExecutionHistory::Priority))
                    .col(big_integer(JobExecutionHistory::ExecutionNumber))
                    .col(timestamp(JobExecutionHistory::ScheduledAt))
                    .col(timestamp(JobExecutionHistory::EnqueuedAt))
                    .col(string_len(JobExecutionHistory::Status, 16))
                    .col(string_len_null(JobExecutionHistory::TargetInstance, 255))
                    .col(string_len_null(JobExecutionHistory::ScheduleKey, 255))
                    .col(string_len_null(JobExecutionHistory::ClaimedBy, 255))
                    .col(timestamp_null(JobExecutionHistory::ClaimedAt))
                    .col(timestamp_null(JobExecutionHistory::LockExpiresAt))
                    .col(timestamp_null(JobExecutionHistory::HeartbeatAt))
                    .col(string_len_null(JobExecutionHistory::ExecutedBy, 255))
                    .col(timestamp_null(JobExecutionHistory::StartedAt))
                    .col(timestamp_null(JobExecutionHistory::CompletedAt))
                    .col(big_integer_null(JobExecutionHistory::DurationMs))
                    .col(json_binary_null(JobExecutionHistory::ResultData))
                    .col(string_null(JobExecutionHistory::ErrorMessage))
                    .col(string_len_null(JobExecutionHistory::ErrorType, 128))
                    .col(text_null(JobExecutionHistory::StackTrace))
                    .col(boolean(JobExecutionHistory::IsRetry))
                    .col(uuid_null(JobExecutionHistory::RetryOfExecutionId))
                    .col(integer(JobExecutionHistory::RetryCount))
                    .col(boolean(JobExecutionHistory::CanRetry))
                    .col(timestamp(JobExecutionHistory::ArchivedAt))
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx-job_execution_history-job_definition_id")
                    .table(JobExecutionHistory::Table)
                    .col(JobExecutionHistory::JobDefinitionId)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx-job_execution_history-completed_at")
                    .table(JobExecutionHistory::Table)
                    .col(JobExecutionHistory::CompletedAt)
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(JobExecutionHistory::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum JobExecutionHistory {
    Table,
    Id,
    TenantId,
    JobDefinitionId,
    JobKey,
    JobName,
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
    ArchivedAt,
}
