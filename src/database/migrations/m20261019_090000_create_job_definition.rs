use sea_orm_migration::{
    prelude::*,
    schema::{
        big_integer, big_integer_null, boolean, integer, json_binary, string, string_len,
        string_len_null, timestamp, timestamp_null, uuid, uuid_null,
    },
};

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(JobDefinition::Table)
                    .if_not_exists()
                    .col(uuid(JobDefinition::Id).primary_key())
                    .col(uuid(JobDefinition::TenantId))
                    .col(string_len(JobDefinition::JobKey, 128))
                    .col(string(JobDefinition::JobName))
                    .col(string_len(JobDefinition::JobType, 128))
                    .col(json_binary(JobDefinition::Parameters))
                    .col(string_len(JobDefinition::ScheduleType, 16))
                    .col(string_len_null(JobDefinition::CronExpression, 128))
                    .col(big_integer_null(JobDefinition::IntervalSeconds))
                    .col(timestamp_null(JobDefinition::StartAt))
                    .col(integer(JobDefinition::Priority).default(0))
                    .col(string_len(JobDefinition::ExecutionScope, 16))
                    .col(integer(JobDefinition::MaxRetries).default(0))
                    .col(integer(JobDefinition::TimeoutSeconds))
                    .col(integer(JobDefinition::MaxConcurrentExecutions).default(0))
                    .col(boolean(JobDefinition::IsEnabled).default(true))
                    .col(timestamp_null(JobDefinition::NextRunAt))
                    .col(uuid_null(JobDefinition::LastExecutionId))
                    .col(big_integer(JobDefinition::ExecutionCount).default(0))
                    .col(timestamp(JobDefinition::CreatedAt))
                    .col(timestamp(JobDefinition::UpdatedAt))
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx-job_definition-tenant_id-job_key")
                    .table(JobDefinition::Table)
                    .col(JobDefinition::TenantId)
                    .col(JobDefinition::JobKey)
                    .unique()
                    .to_owned(),
            )
            .await?;

        // The scanner polls enabled definitions by their next due time
        manager
            .create_index(
                Index::create()
                    .name("idx-job_definition-is_enabled-next_run_at")
                    .table(JobDefinition::Table)
                    .col(JobDefinition::IsEnabled)
                    .col(JobDefinition::NextRunAt)
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(JobDefinition::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
pub(super) enum JobDefinition {
    Table,
    Id,
    TenantId,
    JobKey,
    JobName,
    JobType,
    Parameters,
    ScheduleType,
    CronExpression,
    IntervalSeconds,
    StartAt,
    Priority,
    ExecutionScope,
    MaxRetries,
    TimeoutSeconds,
    MaxConcurrentExecutions,
    IsEnabled,
    NextRunAt,
    LastExecutionId,
    ExecutionCount,
    CreatedAt,
    UpdatedAt,
}
