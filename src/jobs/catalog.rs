//! Administrative operations on job definitions.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::{
    collections::HashSet,
    sync::{Arc, LazyLock},
};
use tracing::{debug, info, warn};
use uuid::Uuid;
use validator::Validate;

use crate::{
    database::models::{
        execution_scope::ExecutionScope, execution_status::ExecutionStatus,
        schedule_type::ScheduleType,
    },
    error::SchedulerError,
    jobs::schedule,
    store::{
        Completion, ExecutionGuard, ExecutionPatch, JobDefinition, JobExecution,
        JobExecutionHistory, JobStore, ScheduleAdvance, StoreError,
    },
};

static JOB_KEY: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.:-]*$").expect("job key pattern is valid")
});

/// Attempts at cancelling an execution whose row keeps changing underneath.
const CANCEL_ATTEMPTS: usize = 5;

/// Upper bound used when every archived run of a definition is requested.
const ALL_RUNS: u64 = i64::MAX as u64;

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct NewJobDefinition {
    #[validate(length(min = 1, max = 100), regex(path = *JOB_KEY))]
    pub job_key: String,
    #[validate(length(min = 1, max = 200))]
    pub job_name: String,
    #[validate(length(min = 1, max = 100))]
    pub job_type: String,
    #[serde(default)]
    pub parameters: serde_json::Value,
    pub schedule_type: ScheduleType,
    pub cron_expression: Option<String>,
    #[validate(range(min = 1))]
    pub interval_seconds: Option<i64>,
    pub start_at: Option<NaiveDateTime>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub execution_scope: ExecutionScope,
    #[serde(default = "default_max_retries")]
    #[validate(range(min = 0, max = 100))]
    pub max_retries: i32,
    #[serde(default = "default_timeout_seconds")]
    #[validate(range(min = 1))]
    pub timeout_seconds: i32,
    #[serde(default)]
    #[validate(range(min = 0))]
    pub max_concurrent_executions: i32,
    #[serde(default = "default_enabled")]
    pub is_enabled: bool,
}

impl NewJobDefinition {
    /// A definition with default policy; adjust fields with struct update syntax.
    #[must_use]
    pub fn new(job_key: &str, job_type: &str, schedule_type: ScheduleType) -> Self {
        Self {
            job_key: job_key.to_string(),
            job_name: job_key.to_string(),
            job_type: job_type.to_string(),
            parameters: serde_json::Value::Null,
            schedule_type,
            cron_expression: None,
            interval_seconds: None,
            start_at: None,
            priority: 0,
            execution_scope: ExecutionScope::default(),
            max_retries: default_max_retries(),
            timeout_seconds: default_timeout_seconds(),
            max_concurrent_executions: 0,
            is_enabled: default_enabled(),
        }
    }
}

/// Partial update of a definition. `job_key` cannot be changed.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct JobDefinitionUpdate {
    #[validate(length(min = 1, max = 200))]
    pub job_name: Option<String>,
    #[validate(length(min = 1, max = 100))]
    pub job_type: Option<String>,
    pub parameters: Option<serde_json::Value>,
    pub schedule_type: Option<ScheduleType>,
    pub cron_expression: Option<String>,
    #[validate(range(min = 1))]
    pub interval_seconds: Option<i64>,
    pub start_at: Option<NaiveDateTime>,
    pub priority: Option<i32>,
    pub execution_scope: Option<ExecutionScope>,
    #[validate(range(min = 0, max = 100))]
    pub max_retries: Option<i32>,
    #[validate(range(min = 1))]
    pub timeout_seconds: Option<i32>,
    #[validate(range(min = 0))]
    pub max_concurrent_executions: Option<i32>,
}

impl JobDefinitionUpdate {
    const fn changes_schedule(&self) -> bool {
        self.schedule_type.is_some()
            || self.cron_expression.is_some()
            || self.interval_seconds.is_some()
            || self.start_at.is_some()
    }

    fn apply(self, definition: &mut JobDefinition) {
        if let Some(job_name) = self.job_name {
            definition.job_name = job_name;
        }
        if let Some(job_type) = self.job_type {
            definition.job_type = job_type;
        }
        if let Some(parameters) = self.parameters {
            definition.parameters = parameters;
        }
        if let Some(schedule_type) = self.schedule_type {
            definition.schedule_type = schedule_type;
            // Fields left over from the previous type; explicit ones still get validated.
            if !schedule_type.uses_cron() && self.cron_expression.is_none() {
                definition.cron_expression = None;
            }
            if !schedule_type.uses_interval() && self.interval_seconds.is_none() {
                definition.interval_seconds = None;
            }
        }
        if self.cron_expression.is_some() {
            definition.cron_expression = self.cron_expression;
        }
        if self.interval_seconds.is_some() {
            definition.interval_seconds = self.interval_seconds;
        }
        if self.start_at.is_some() {
            definition.start_at = self.start_at;
        }
        if let Some(priority) = self.priority {
            definition.priority = priority;
        }
        if let Some(execution_scope) = self.execution_scope {
            definition.execution_scope = execution_scope;
        }
        if let Some(max_retries) = self.max_retries {
            definition.max_retries = max_retries;
        }
        if let Some(timeout_seconds) = self.timeout_seconds {
            definition.timeout_seconds = timeout_seconds;
        }
        if let Some(max_concurrent_executions) = self.max_concurrent_executions {
            definition.max_concurrent_executions = max_concurrent_executions;
        }
    }
}

const fn default_max_retries() -> i32 {
    3
}

const fn default_timeout_seconds() -> i32 {
    300
}

const fn default_enabled() -> bool {
    true
}

/// Tenant-scoped administration of job definitions and their runs.
#[derive(Clone, Debug)]
pub struct JobCatalog {
    store: Arc<dyn JobStore>,
}

impl JobCatalog {
    #[must_use]
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }

    pub async fn create(
        &self,
        tenant_id: Uuid,
        new_definition: NewJobDefinition,
        now: NaiveDateTime,
    ) -> Result<JobDefinition, SchedulerError> {
        new_definition.validate()?;
        schedule::validate_schedule(
            new_definition.schedule_type,
            new_definition.cron_expression.as_deref(),
            new_definition.interval_seconds,
        )?;

        let mut definition = JobDefinition {
            id: Uuid::new_v4(),
            tenant_id,
            job_key: new_definition.job_key,
            job_name: new_definition.job_name,
            job_type: new_definition.job_type,
            parameters: new_definition.parameters,
            schedule_type: new_definition.schedule_type,
            cron_expression: new_definition.cron_expression,
            interval_seconds: new_definition.interval_seconds,
            start_at: new_definition.start_at,
            priority: new_definition.priority,
            execution_scope: new_definition.execution_scope,
            max_retries: new_definition.max_retries,
            timeout_seconds: new_definition.timeout_seconds,
            max_concurrent_executions: new_definition.max_concurrent_executions,
            is_enabled: new_definition.is_enabled,
            next_run_at: None,
            last_execution_id: None,
            execution_count: 0,
            created_at: now,
            updated_at: now,
        };
        definition.next_run_at = schedule::initial_next_run(&definition, now)?;

        let definition = self
            .store
            .insert_definition(definition)
            .await
            .map_err(|error| match error {
                StoreError::DuplicateKey(job_key) => {
                    SchedulerError::DuplicateDefinition { job_key }
                }
                error => SchedulerError::from(error),
            })?;

        info!(
            "📋 Created job definition '{}' ({}) next run at {:?}",
            definition.job_key, definition.schedule_type, definition.next_run_at
        );

        Ok(definition)
    }

    pub async fn get(&self, tenant_id: Uuid, job_key: &str) -> Result<JobDefinition, SchedulerError> {
        self.store
            .find_definition(tenant_id, job_key)
            .await?
            .ok_or_else(|| SchedulerError::DefinitionNotFound {
                job_key: job_key.to_string(),
            })
    }

    pub async fn list(&self, tenant_id: Uuid) -> Result<Vec<JobDefinition>, SchedulerError> {
        Ok(self.store.list_definitions(tenant_id).await?)
    }

    pub async fn enable(
        &self,
        tenant_id: Uuid,
        job_key: &str,
        now: NaiveDateTime,
    ) -> Result<JobDefinition, SchedulerError> {
        let mut definition = self.get(tenant_id, job_key).await?;
        if definition.is_enabled {
            return Ok(definition);
        }

        definition.is_enabled = true;
        if schedule::is_stale(&definition, now) {
            definition.next_run_at = schedule::initial_next_run(&definition, now)?;
            debug!(
                "Recomputed stale next run of '{}' to {:?}",
                definition.job_key, definition.next_run_at
            );
        }
        definition.updated_at = now;

        let definition = self.store.save_definition(definition).await?;
        info!("▶️ Enabled job definition '{}'", definition.job_key);
        Ok(definition)
    }

    pub async fn disable(
        &self,
        tenant_id: Uuid,
        job_key: &str,
        now: NaiveDateTime,
    ) -> Result<JobDefinition, SchedulerError> {
        let mut definition = self.get(tenant_id, job_key).await?;
        if !definition.is_enabled {
            return Ok(definition);
        }

        definition.is_enabled = false;
        definition.updated_at = now;

        let definition = self.store.save_definition(definition).await?;
        info!("⏸️ Disabled job definition '{}'", definition.job_key);
        Ok(definition)
    }

    pub async fn update(
        &self,
        tenant_id: Uuid,
        job_key: &str,
        update: JobDefinitionUpdate,
        now: NaiveDateTime,
    ) -> Result<JobDefinition, SchedulerError> {
        update.validate()?;
        let mut definition = self.get(tenant_id, job_key).await?;

        let reschedule = update.changes_schedule();
        update.apply(&mut definition);

        if reschedule {
            schedule::validate_schedule(
                definition.schedule_type,
                definition.cron_expression.as_deref(),
                definition.interval_seconds,
            )?;
            definition.next_run_at = schedule::initial_next_run(&definition, now)?;
            debug!(
                "Schedule of '{}' changed, next run at {:?}",
                definition.job_key, definition.next_run_at
            );
        }
        definition.updated_at = now;

        Ok(self.store.save_definition(definition).await?)
    }

    /// Enqueues a run right away. This is how `manual` definitions run.
    ///
    /// Returns `None` when the definition is already at its concurrency cap.
    pub async fn trigger(
        &self,
        tenant_id: Uuid,
        job_key: &str,
        now: NaiveDateTime,
    ) -> Result<Option<JobExecution>, SchedulerError> {
        let definition = self.get(tenant_id, job_key).await?;

        if let Some(cap) = definition.concurrency_cap() {
            let active = self
                .store
                .count_active_executions(definition.id, None)
                .await?;
            if active >= cap {
                warn!(
                    "Not triggering '{}': {active} active executions reached the cap of {cap}",
                    definition.job_key
                );
                return Ok(None);
            }
        }

        let execution_number = definition.execution_count + 1;
        let execution = JobExecution::pending(&definition, execution_number, now, now);

        let Some(execution) = self.store.insert_execution_if_absent(execution).await? else {
            return Ok(None);
        };

        let advanced = self
            .store
            .advance_schedule(&ScheduleAdvance {
                definition_id: definition.id,
                expected_next_run_at: definition.next_run_at,
                next_run_at: definition.next_run_at,
                execution_count: execution_number,
                last_execution_id: Some(execution.id),
                updated_at: now,
            })
            .await?;
        if !advanced {
            debug!(
                "Schedule of '{}' moved while triggering, execution count not bumped",
                definition.job_key
            );
        }

        info!(
            "👆 Triggered '{}' as execution {}",
            definition.job_key, execution.id
        );
        Ok(Some(execution))
    }

    /// Cancels a pending or in-flight execution. A running handler observes the
    /// cancellation as a lost lease. Returns `false` if the execution had
    /// already finished.
    pub async fn cancel_execution(
        &self,
        tenant_id: Uuid,
        execution_id: Uuid,
        now: NaiveDateTime,
    ) -> Result<bool, SchedulerError> {
        for _ in 0..CANCEL_ATTEMPTS {
            let execution = self
                .store
                .get_execution(execution_id)
                .await?
                .filter(|execution| execution.tenant_id == tenant_id)
                .ok_or(SchedulerError::ExecutionNotFound(execution_id))?;

            if execution.status.is_terminal() {
                return Ok(false);
            }

            let completion = Completion {
                error_message: Some("Cancelled by operator".to_string()),
                error_type: Some("cancelled".to_string()),
                can_retry: Some(false),
                ..Completion::at(now)
            };
            let guards = [
                ExecutionGuard::Status(execution.status),
                ExecutionGuard::ClaimedBy(execution.claimed_by.clone()),
            ];
            let patch = ExecutionPatch::finish(ExecutionStatus::Cancelled, completion);

            if self
                .store
                .conditional_update(execution_id, &guards, &patch)
                .await?
            {
                info!("🛑 Cancelled execution {execution_id}");
                return Ok(true);
            }
        }

        Err(SchedulerError::ClaimLost { execution_id })
    }

    /// Executions of a definition still in the hot table.
    pub async fn executions(
        &self,
        tenant_id: Uuid,
        job_key: &str,
    ) -> Result<Vec<JobExecution>, SchedulerError> {
        let definition = self.get(tenant_id, job_key).await?;
        Ok(self.store.executions_for_definition(definition.id).await?)
    }

    /// Archived executions of a definition, most recently completed first.
    pub async fn history(
        &self,
        tenant_id: Uuid,
        job_key: &str,
        limit: u64,
    ) -> Result<Vec<JobExecutionHistory>, SchedulerError> {
        let definition = self.get(tenant_id, job_key).await?;
        Ok(self
            .store
            .history_for_definition(definition.id, limit)
            .await?)
    }

    /// Hot and archived executions of a definition, each run listed once,
    /// ordered by enqueue time.
    pub async fn runs(
        &self,
        tenant_id: Uuid,
        job_key: &str,
    ) -> Result<Vec<JobExecution>, SchedulerError> {
        let definition = self.get(tenant_id, job_key).await?;

        let hot = self.store.executions_for_definition(definition.id).await?;
        let archived = self
            .store
            .history_for_definition(definition.id, ALL_RUNS)
            .await?;

        let hot_ids: HashSet<Uuid> = hot.iter().map(|execution| execution.id).collect();
        let mut runs: Vec<JobExecution> = archived
            .iter()
            .filter(|history| !hot_ids.contains(&history.id))
            .map(JobExecutionHistory::to_execution)
            .chain(hot)
            .collect();
        runs.sort_by_key(|run| (run.enqueued_at, run.retry_count, run.id));

        Ok(runs)
    }
}
