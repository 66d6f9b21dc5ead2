use async_trait::async_trait;
use chrono::NaiveDateTime;
use sea_orm::{
    sea_query::Expr, ActiveEnum, ActiveModelTrait, ColumnTrait, Condition, DatabaseConnection,
    DbErr, EntityTrait, IntoActiveModel, PaginatorTrait, QueryFilter, QueryOrder, QuerySelect,
    SqlErr, TransactionTrait,
};
use tracing::debug;
use uuid::Uuid;

use super::{
    ArchiveCriteria, ClaimFilter, ExecutionGuard, ExecutionPatch, JobDefinition, JobExecution,
    JobExecutionHistory, JobStore, LeaseChange, ScheduleAdvance, StoreError, StoreResult,
};
use crate::database::models::{
    execution_status::ExecutionStatus,
    job_definition::{self, Entity as JobDefinitionEntity},
    job_execution::{self, Entity as JobExecutionEntity},
    job_execution_history::{self, Entity as JobExecutionHistoryEntity},
    schedule_type::ScheduleType,
};

/// [`JobStore`] backed by a relational database through `SeaORM`.
///
/// Conditional updates compile to a single `UPDATE ... WHERE id = ? AND <guards>`
/// statement, so the database row lock is the only synchronization between nodes.
#[derive(Clone, Debug)]
pub struct SeaOrmStore {
    db: DatabaseConnection,
}

impl SeaOrmStore {
    #[must_use]
    pub const fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    #[must_use]
    pub const fn connection(&self) -> &DatabaseConnection {
        &self.db
    }
}

fn is_unique_violation(error: &DbErr) -> bool {
    matches!(error.sql_err(), Some(SqlErr::UniqueConstraintViolation(_)))
}

fn guard_condition(guards: &[ExecutionGuard]) -> Condition {
    guards
        .iter()
        .fold(Condition::all(), |condition, guard| match guard {
            ExecutionGuard::Status(status) => {
                condition.add(job_execution::Column::Status.eq(*status))
            }
            ExecutionGuard::StatusIn(statuses) => {
                condition.add(job_execution::Column::Status.is_in(statuses.iter().copied()))
            }
            ExecutionGuard::ClaimedBy(Some(worker)) => {
                condition.add(job_execution::Column::ClaimedBy.eq(worker.as_str()))
            }
            ExecutionGuard::ClaimedBy(None) => {
                condition.add(job_execution::Column::ClaimedBy.is_null())
            }
            ExecutionGuard::LockExpiresAt(Some(lock_expires_at)) => {
                condition.add(job_execution::Column::LockExpiresAt.eq(*lock_expires_at))
            }
            ExecutionGuard::LockExpiresAt(None) => {
                condition.add(job_execution::Column::LockExpiresAt.is_null())
            }
        })
}

fn patch_columns(patch: &ExecutionPatch) -> Vec<(job_execution::Column, sea_orm::sea_query::SimpleExpr)> {
    use job_execution::Column;

    let mut columns = Vec::new();

    if let Some(status) = patch.status {
        columns.push((Column::Status, Expr::value(status.into_value())));
    }

    match &patch.lease {
        Some(LeaseChange::Acquire {
            claimed_by,
            claimed_at,
            lock_expires_at,
        }) => {
            columns.push((Column::ClaimedBy, Expr::value(Some(claimed_by.clone()))));
            columns.push((Column::ClaimedAt, Expr::value(Some(*claimed_at))));
            columns.push((Column::HeartbeatAt, Expr::value(Some(*claimed_at))));
            columns.push((Column::LockExpiresAt, Expr::value(Some(*lock_expires_at))));
        }
        Some(LeaseChange::Renew {
            heartbeat_at,
            lock_expires_at,
        }) => {
            columns.push((Column::HeartbeatAt, Expr::value(Some(*heartbeat_at))));
            columns.push((Column::LockExpiresAt, Expr::value(Some(*lock_expires_at))));
        }
        Some(LeaseChange::Clear) => {
            columns.push((Column::ClaimedBy, Expr::value(Option::<String>::None)));
            columns.push((
                Column::LockExpiresAt,
                Expr::value(Option::<NaiveDateTime>::None),
            ));
        }
        None => {}
    }

    if let Some(start) = &patch.start {
        columns.push((Column::StartedAt, Expr::value(Some(start.started_at))));
        columns.push((
            Column::ExecutedBy,
            Expr::value(Some(start.executed_by.clone())),
        ));
    }

    if let Some(completion) = &patch.completion {
        columns.push((Column::CompletedAt, Expr::value(Some(completion.completed_at))));
        columns.push((Column::DurationMs, Expr::value(completion.duration_ms)));
        columns.push((Column::ResultData, Expr::value(completion.result_data.clone())));
        columns.push((
            Column::ErrorMessage,
            Expr::value(completion.error_message.clone()),
        ));
        columns.push((Column::ErrorType, Expr::value(completion.error_type.clone())));
        columns.push((Column::StackTrace, Expr::value(completion.stack_trace.clone())));
        if let Some(can_retry) = completion.can_retry {
            columns.push((Column::CanRetry, Expr::value(can_retry)));
        }
    }

    columns
}

#[async_trait]
impl JobStore for SeaOrmStore {
    async fn insert_definition(&self, definition: JobDefinition) -> StoreResult<JobDefinition> {
        let job_key = definition.job_key.clone();

        definition
            .into_active_model()
            .insert(&self.db)
            .await
            .map_err(|error| {
                if is_unique_violation(&error) {
                    StoreError::DuplicateKey(job_key)
                } else {
                    StoreError::Database(error)
                }
            })
    }

    async fn save_definition(&self, definition: JobDefinition) -> StoreResult<JobDefinition> {
        // Marks every column as changed so the whole row is written
        let mut active_model = definition.into_active_model();
        active_model = active_model.reset_all();
        Ok(active_model.update(&self.db).await?)
    }

    async fn get_definition(&self, id: Uuid) -> StoreResult<Option<JobDefinition>> {
        Ok(JobDefinitionEntity::find_by_id(id).one(&self.db).await?)
    }

    async fn find_definition(
        &self,
        tenant_id: Uuid,
        job_key: &str,
    ) -> StoreResult<Option<JobDefinition>> {
        Ok(JobDefinitionEntity::find()
            .filter(job_definition::Column::TenantId.eq(tenant_id))
            .filter(job_definition::Column::JobKey.eq(job_key))
            .one(&self.db)
            .await?)
    }

    async fn list_definitions(&self, tenant_id: Uuid) -> StoreResult<Vec<JobDefinition>> {
        Ok(JobDefinitionEntity::find()
            .filter(job_definition::Column::TenantId.eq(tenant_id))
            .order_by_asc(job_definition::Column::JobKey)
            .all(&self.db)
            .await?)
    }

    async fn due_definitions(
        &self,
        now: NaiveDateTime,
        limit: u64,
    ) -> StoreResult<Vec<JobDefinition>> {
        Ok(JobDefinitionEntity::find()
            .filter(job_definition::Column::IsEnabled.eq(true))
            .filter(job_definition::Column::ScheduleType.ne(ScheduleType::Manual))
            .filter(job_definition::Column::NextRunAt.is_not_null())
            .filter(job_definition::Column::NextRunAt.lte(now))
            .order_by_asc(job_definition::Column::NextRunAt)
            .order_by_desc(job_definition::Column::Priority)
            .limit(limit)
            .all(&self.db)
            .await?)
    }

    async fn advance_schedule(&self, advance: &ScheduleAdvance) -> StoreResult<bool> {
        let expected = match advance.expected_next_run_at {
            Some(next_run_at) => job_definition::Column::NextRunAt.eq(next_run_at),
            None => job_definition::Column::NextRunAt.is_null(),
        };

        let result = JobDefinitionEntity::update_many()
            .col_expr(
                job_definition::Column::NextRunAt,
                Expr::value(advance.next_run_at),
            )
            .col_expr(
                job_definition::Column::ExecutionCount,
                Expr::value(advance.execution_count),
            )
            .col_expr(
                job_definition::Column::LastExecutionId,
                Expr::value(advance.last_execution_id),
            )
            .col_expr(
                job_definition::Column::UpdatedAt,
                Expr::value(advance.updated_at),
            )
            .filter(job_definition::Column::Id.eq(advance.definition_id))
            .filter(expected)
            .exec(&self.db)
            .await?;

        Ok(result.rows_affected == 1)
    }

    async fn insert_execution_if_absent(
        &self,
        execution: JobExecution,
    ) -> StoreResult<Option<JobExecution>> {
        match execution.clone().into_active_model().insert(&self.db).await {
            Ok(inserted) => Ok(Some(inserted)),
            Err(error) if is_unique_violation(&error) && execution.schedule_key.is_some() => {
                debug!(
                    "Execution with schedule key {:?} already exists",
                    execution.schedule_key
                );
                Ok(None)
            }
            Err(error) => Err(StoreError::Database(error)),
        }
    }

    async fn get_execution(&self, id: Uuid) -> StoreResult<Option<JobExecution>> {
        Ok(JobExecutionEntity::find_by_id(id).one(&self.db).await?)
    }

    async fn count_active_executions(
        &self,
        definition_id: Uuid,
        target_instance: Option<&str>,
    ) -> StoreResult<u64> {
        let mut query = JobExecutionEntity::find()
            .filter(job_execution::Column::JobDefinitionId.eq(definition_id))
            .filter(job_execution::Column::Status.is_in(ExecutionStatus::ACTIVE));

        if let Some(target_instance) = target_instance {
            query = query.filter(job_execution::Column::TargetInstance.eq(target_instance));
        }

        Ok(query.count(&self.db).await?)
    }

    async fn claim_candidates(&self, filter: &ClaimFilter) -> StoreResult<Vec<JobExecution>> {
        let pending = Condition::all()
            .add(job_execution::Column::Status.eq(ExecutionStatus::Pending))
            .add(job_execution::Column::ScheduledAt.lte(filter.now));
        let orphaned = Condition::all()
            .add(job_execution::Column::Status.is_in(ExecutionStatus::LEASED))
            .add(
                Condition::any()
                    .add(job_execution::Column::LockExpiresAt.is_null())
                    .add(job_execution::Column::LockExpiresAt.lt(filter.now)),
            );

        let mut query = JobExecutionEntity::find()
            .filter(Condition::any().add(pending).add(orphaned))
            .filter(
                Condition::any()
                    .add(job_execution::Column::TargetInstance.is_null())
                    .add(job_execution::Column::TargetInstance.eq(filter.instance_id.as_str())),
            );

        if !filter.job_types.is_empty() {
            query = query.filter(job_execution::Column::JobType.is_in(filter.job_types.iter()));
        }

        Ok(query
            .order_by_desc(job_execution::Column::Priority)
            .order_by_asc(job_execution::Column::ScheduledAt)
            .order_by_asc(job_execution::Column::Id)
            .limit(filter.limit)
            .all(&self.db)
            .await?)
    }

    async fn conditional_update(
        &self,
        id: Uuid,
        guards: &[ExecutionGuard],
        patch: &ExecutionPatch,
    ) -> StoreResult<bool> {
        let columns = patch_columns(patch);
        if columns.is_empty() {
            return Ok(false);
        }

        let update = columns.into_iter().fold(
            JobExecutionEntity::update_many(),
            |update, (column, value)| update.col_expr(column, value),
        );

        let result = update
            .filter(job_execution::Column::Id.eq(id))
            .filter(guard_condition(guards))
            .exec(&self.db)
            .await?;

        Ok(result.rows_affected == 1)
    }

    async fn executions_for_definition(
        &self,
        definition_id: Uuid,
    ) -> StoreResult<Vec<JobExecution>> {
        Ok(JobExecutionEntity::find()
            .filter(job_execution::Column::JobDefinitionId.eq(definition_id))
            .order_by_asc(job_execution::Column::EnqueuedAt)
            .order_by_asc(job_execution::Column::RetryCount)
            .all(&self.db)
            .await?)
    }

    async fn archive_executions(
        &self,
        criteria: &ArchiveCriteria,
        archived_at: NaiveDateTime,
    ) -> StoreResult<Vec<Uuid>> {
        let txn = self.db.begin().await?;

        let rows = JobExecutionEntity::find()
            .filter(job_execution::Column::Status.is_in(ExecutionStatus::TERMINAL))
            .filter(job_execution::Column::CompletedAt.lte(criteria.completed_before))
            .filter(
                Condition::any()
                    .add(job_execution::Column::LockExpiresAt.is_null())
                    .add(job_execution::Column::LockExpiresAt.lt(criteria.lock_expired_before)),
            )
            .order_by_asc(job_execution::Column::CompletedAt)
            .limit(criteria.batch_size)
            .all(&txn)
            .await?;

        if rows.is_empty() {
            txn.commit().await?;
            return Ok(Vec::new());
        }

        let definition_ids: Vec<Uuid> = rows.iter().map(|row| row.job_definition_id).collect();
        let definitions = JobDefinitionEntity::find()
            .filter(job_definition::Column::Id.is_in(definition_ids))
            .all(&txn)
            .await?;

        let ids: Vec<Uuid> = rows.iter().map(|row| row.id).collect();
        let archived = rows.into_iter().map(|row| {
            let definition = definitions
                .iter()
                .find(|definition| definition.id == row.job_definition_id);
            JobExecutionHistory::archive(row, definition, archived_at).into_active_model()
        });

        JobExecutionHistoryEntity::insert_many(archived)
            .exec(&txn)
            .await?;

        let deleted = JobExecutionEntity::delete_many()
            .filter(job_execution::Column::Id.is_in(ids.clone()))
            .exec(&txn)
            .await?;

        if deleted.rows_affected != ids.len() as u64 {
            // Another archiver moved some of these rows concurrently
            txn.rollback().await?;
            return Err(StoreError::Unavailable(format!(
                "archive batch raced: expected to delete {} rows, deleted {}",
                ids.len(),
                deleted.rows_affected
            )));
        }

        txn.commit().await?;
        Ok(ids)
    }

    async fn history_for_definition(
        &self,
        definition_id: Uuid,
        limit: u64,
    ) -> StoreResult<Vec<JobExecutionHistory>> {
        Ok(JobExecutionHistoryEntity::find()
            .filter(job_execution_history::Column::JobDefinitionId.eq(definition_id))
            .order_by_desc(job_execution_history::Column::CompletedAt)
            .limit(limit)
            .all(&self.db)
            .await?)
    }
}
