//! Turns due definitions into pending executions.
//!
//! Every node runs the scanner. Duplicate work is harmless: each tick maps to
//! one `schedule_key` per scope, so only the first insert lands, and the
//! schedule only moves forward through a compare-and-swap on `next_run_at`.

use chrono::{Duration, NaiveDateTime};
use std::sync::Arc;
use tracing::{debug, error, info};

use crate::{
    config::ScannerConfig,
    database::models::execution_scope::ExecutionScope,
    error::SchedulerError,
    jobs::schedule,
    store::{JobDefinition, JobExecution, JobStore, ScheduleAdvance},
};

/// Schedule key suffix for cluster-scoped ticks.
const CLUSTER_SCOPE: &str = "cluster";

/// Tally of one scan pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ScanReport {
    pub due: usize,
    pub enqueued: usize,
    pub duplicates: usize,
    pub capped: usize,
    pub advanced: usize,
}

#[derive(Clone, Debug)]
pub struct DueJobScanner {
    store: Arc<dyn JobStore>,
    node_id: String,
    config: ScannerConfig,
}

impl DueJobScanner {
    #[must_use]
    pub fn new(store: Arc<dyn JobStore>, node_id: impl Into<String>, config: ScannerConfig) -> Self {
        Self {
            store,
            node_id: node_id.into(),
            config,
        }
    }

    #[must_use]
    pub const fn config(&self) -> &ScannerConfig {
        &self.config
    }

    pub async fn scan(&self, now: NaiveDateTime) -> Result<ScanReport, SchedulerError> {
        let due = self
            .store
            .due_definitions(now, self.config.batch_size)
            .await?;

        let mut report = ScanReport {
            due: due.len(),
            ..ScanReport::default()
        };

        for definition in &due {
            match self.enqueue_tick(definition, now, &mut report).await {
                Ok(()) => {}
                Err(SchedulerError::InvalidSchedule(reason)) => {
                    error!(
                        "❌ Cannot schedule job definition '{}': {}",
                        definition.job_key, reason
                    );
                }
                Err(e) => return Err(e),
            }
        }

        if report.enqueued > 0 {
            debug!(
                "🔍 Scan at {now}: {} due, {} enqueued, {} duplicates, {} capped",
                report.due, report.enqueued, report.duplicates, report.capped
            );
        }

        Ok(report)
    }

    async fn enqueue_tick(
        &self,
        definition: &JobDefinition,
        now: NaiveDateTime,
        report: &mut ScanReport,
    ) -> Result<(), SchedulerError> {
        let Some(due_at) = definition.next_run_at else {
            return Ok(());
        };

        let instance_scoped = definition.execution_scope == ExecutionScope::Instance;
        let target_instance = instance_scoped.then_some(self.node_id.as_str());

        if let Some(cap) = definition.concurrency_cap() {
            let active = self
                .store
                .count_active_executions(definition.id, target_instance)
                .await?;
            if active >= cap {
                debug!(
                    "Skipping tick of '{}': {active} active executions reached the cap of {cap}",
                    definition.job_key
                );
                report.capped += 1;
                return Ok(());
            }
        }

        let execution_number = definition.execution_count + 1;
        let mut execution = JobExecution::pending(definition, execution_number, due_at, now);
        execution.target_instance = target_instance.map(str::to_string);
        execution.schedule_key = Some(schedule_key(
            definition,
            due_at,
            target_instance.unwrap_or(CLUSTER_SCOPE),
        ));

        let inserted = self.store.insert_execution_if_absent(execution).await?;
        let last_execution_id = match &inserted {
            Some(execution) => {
                report.enqueued += 1;
                info!(
                    "📥 Enqueued '{}' #{} for {} as execution {}",
                    definition.job_key, execution_number, due_at, execution.id
                );
                Some(execution.id)
            }
            None => {
                report.duplicates += 1;
                definition.last_execution_id
            }
        };

        // Hold instance-scoped ticks open so that every live node enqueues its own row
        let fanout = Duration::seconds(
            i64::try_from(self.config.instance_fanout_seconds).unwrap_or(i64::MAX / 1000),
        );
        if instance_scoped && now - due_at < fanout {
            return Ok(());
        }

        let next_run_at = schedule::next_run_after_tick(definition, due_at, now)?;
        let advanced = self
            .store
            .advance_schedule(&ScheduleAdvance {
                definition_id: definition.id,
                expected_next_run_at: Some(due_at),
                next_run_at,
                execution_count: execution_number,
                last_execution_id,
                updated_at: now,
            })
            .await?;

        if advanced {
            report.advanced += 1;
            debug!(
                "Advanced '{}' next run to {:?}",
                definition.job_key, next_run_at
            );
        }

        Ok(())
    }
}

/// Uniquely names one tick of a definition in one scope.
fn schedule_key(definition: &JobDefinition, due_at: NaiveDateTime, scope: &str) -> String {
    format!(
        "{}:{}:{}",
        definition.id,
        due_at.format("%Y-%m-%dT%H:%M:%S%.6f"),
        scope
    )
}
