//! In-memory store with the same conditional-update semantics as the SQL store.
//!
//! A single mutex serializes all operations, which gives every call the
//! atomicity a database row update or transaction would. Useful for tests and
//! for single-process deployments that do not need durability.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use async_trait::async_trait;
use chrono::NaiveDateTime;
use uuid::Uuid;

use super::{
    ArchiveCriteria, ClaimFilter, ExecutionGuard, ExecutionPatch, JobDefinition, JobExecution,
    JobExecutionHistory, JobStore, ScheduleAdvance, StoreError, StoreResult,
};

#[derive(Debug, Default)]
struct MemoryState {
    definitions: HashMap<Uuid, JobDefinition>,
    executions: HashMap<Uuid, JobExecution>,
    history: HashMap<Uuid, JobExecutionHistory>,
}

#[derive(Clone, Debug, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        // A panic while holding the lock cannot leave a half-applied update
        // behind, every mutation is a single assignment or insert.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of rows in the hot execution table.
    pub fn execution_count(&self) -> usize {
        self.state().executions.len()
    }

    /// Number of rows in the history table.
    pub fn history_count(&self) -> usize {
        self.state().history.len()
    }
}

fn take_limit<T>(rows: Vec<T>, limit: u64) -> Vec<T> {
    rows.into_iter()
        .take(usize::try_from(limit).unwrap_or(usize::MAX))
        .collect()
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn insert_definition(&self, definition: JobDefinition) -> StoreResult<JobDefinition> {
        let mut state = self.state();

        let key_taken = state.definitions.values().any(|existing| {
            existing.tenant_id == definition.tenant_id && existing.job_key == definition.job_key
        });
        if key_taken || state.definitions.contains_key(&definition.id) {
            return Err(StoreError::DuplicateKey(definition.job_key));
        }

        state.definitions.insert(definition.id, definition.clone());
        Ok(definition)
    }

    async fn save_definition(&self, definition: JobDefinition) -> StoreResult<JobDefinition> {
        let mut state = self.state();

        let Some(existing) = state.definitions.get_mut(&definition.id) else {
            return Err(StoreError::Unavailable(format!(
                "job definition {} does not exist",
                definition.id
            )));
        };
        *existing = definition.clone();
        Ok(definition)
    }

    async fn get_definition(&self, id: Uuid) -> StoreResult<Option<JobDefinition>> {
        Ok(self.state().definitions.get(&id).cloned())
    }

    async fn find_definition(
        &self,
        tenant_id: Uuid,
        job_key: &str,
    ) -> StoreResult<Option<JobDefinition>> {
        Ok(self
            .state()
            .definitions
            .values()
            .find(|definition| definition.tenant_id == tenant_id && definition.job_key == job_key)
            .cloned())
    }

    async fn list_definitions(&self, tenant_id: Uuid) -> StoreResult<Vec<JobDefinition>> {
        let mut definitions: Vec<JobDefinition> = self
            .state()
            .definitions
            .values()
            .filter(|definition| definition.tenant_id == tenant_id)
            .cloned()
            .collect();
        definitions.sort_by(|a, b| a.job_key.cmp(&b.job_key));
        Ok(definitions)
    }

    async fn due_definitions(
        &self,
        now: NaiveDateTime,
        limit: u64,
    ) -> StoreResult<Vec<JobDefinition>> {
        let mut due: Vec<JobDefinition> = self
            .state()
            .definitions
            .values()
            .filter(|definition| definition.is_due(now))
            .cloned()
            .collect();
        due.sort_by(|a, b| {
            a.next_run_at
                .cmp(&b.next_run_at)
                .then_with(|| b.priority.cmp(&a.priority))
        });
        Ok(take_limit(due, limit))
    }

    async fn advance_schedule(&self, advance: &ScheduleAdvance) -> StoreResult<bool> {
        let mut state = self.state();

        let Some(definition) = state.definitions.get_mut(&advance.definition_id) else {
            return Ok(false);
        };
        if definition.next_run_at != advance.expected_next_run_at {
            return Ok(false);
        }

        definition.next_run_at = advance.next_run_at;
        definition.execution_count = advance.execution_count;
        definition.last_execution_id = advance.last_execution_id;
        definition.updated_at = advance.updated_at;
        Ok(true)
    }

    async fn insert_execution_if_absent(
        &self,
        execution: JobExecution,
    ) -> StoreResult<Option<JobExecution>> {
        let mut state = self.state();

        if state.executions.contains_key(&execution.id) {
            return Err(StoreError::DuplicateKey(execution.id.to_string()));
        }
        if let Some(schedule_key) = &execution.schedule_key {
            let taken = state.executions.values().any(|existing| {
                existing.schedule_key.as_deref() == Some(schedule_key.as_str())
            });
            if taken {
                return Ok(None);
            }
        }

        state.executions.insert(execution.id, execution.clone());
        Ok(Some(execution))
    }

    async fn get_execution(&self, id: Uuid) -> StoreResult<Option<JobExecution>> {
        Ok(self.state().executions.get(&id).cloned())
    }

    async fn count_active_executions(
        &self,
        definition_id: Uuid,
        target_instance: Option<&str>,
    ) -> StoreResult<u64> {
        let count = self
            .state()
            .executions
            .values()
            .filter(|execution| {
                execution.job_definition_id == definition_id
                    && execution.status.is_active()
                    && target_instance
                        .is_none_or(|target| execution.target_instance.as_deref() == Some(target))
            })
            .count();
        Ok(count as u64)
    }

    async fn claim_candidates(&self, filter: &ClaimFilter) -> StoreResult<Vec<JobExecution>> {
        let mut candidates: Vec<JobExecution> = self
            .state()
            .executions
            .values()
            .filter(|execution| filter.admits(execution))
            .cloned()
            .collect();
        candidates.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.scheduled_at.cmp(&b.scheduled_at))
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(take_limit(candidates, filter.limit))
    }

    async fn conditional_update(
        &self,
        id: Uuid,
        guards: &[ExecutionGuard],
        patch: &ExecutionPatch,
    ) -> StoreResult<bool> {
        let mut state = self.state();

        let Some(execution) = state.executions.get_mut(&id) else {
            return Ok(false);
        };
        if !guards.iter().all(|guard| guard.matches(execution)) {
            return Ok(false);
        }

        patch.apply(execution);
        Ok(true)
    }

    async fn executions_for_definition(
        &self,
        definition_id: Uuid,
    ) -> StoreResult<Vec<JobExecution>> {
        let mut executions: Vec<JobExecution> = self
            .state()
            .executions
            .values()
            .filter(|execution| execution.job_definition_id == definition_id)
            .cloned()
            .collect();
        executions.sort_by(|a, b| {
            a.enqueued_at
                .cmp(&b.enqueued_at)
                .then_with(|| a.retry_count.cmp(&b.retry_count))
        });
        Ok(executions)
    }

    async fn archive_executions(
        &self,
        criteria: &ArchiveCriteria,
        archived_at: NaiveDateTime,
    ) -> StoreResult<Vec<Uuid>> {
        let mut state = self.state();

        let mut selected: Vec<&JobExecution> = state
            .executions
            .values()
            .filter(|execution| criteria.admits(execution))
            .collect();
        selected.sort_by_key(|execution| execution.completed_at);
        let ids: Vec<Uuid> = take_limit(selected, criteria.batch_size)
            .into_iter()
            .map(|execution| execution.id)
            .collect();

        for id in &ids {
            if let Some(execution) = state.executions.remove(id) {
                let definition = state.definitions.get(&execution.job_definition_id);
                let archived = JobExecutionHistory::archive(execution, definition, archived_at);
                state.history.insert(archived.id, archived);
            }
        }

        Ok(ids)
    }

    async fn history_for_definition(
        &self,
        definition_id: Uuid,
        limit: u64,
    ) -> StoreResult<Vec<JobExecutionHistory>> {
        let mut history: Vec<JobExecutionHistory> = self
            .state()
            .history
            .values()
            .filter(|entry| entry.job_definition_id == definition_id)
            .cloned()
            .collect();
        history.sort_by(|a, b| b.completed_at.cmp(&a.completed_at));
        Ok(take_limit(history, limit))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        database::models::execution_status::ExecutionStatus,
        tests::setup_test::{pending_execution, test_definition, timestamp},
    };

    #[tokio::test]
    async fn test_insert_execution_if_absent_respects_schedule_key() {
        let store = MemoryStore::new();
        let definition = store
            .insert_definition(test_definition("cleanup"))
            .await
            .unwrap();

        let mut first = pending_execution(&definition, timestamp(0));
        first.schedule_key = Some("tick-1".to_string());
        let mut second = pending_execution(&definition, timestamp(0));
        second.schedule_key = Some("tick-1".to_string());

        assert!(store.insert_execution_if_absent(first).await.unwrap().is_some());
        assert!(store.insert_execution_if_absent(second).await.unwrap().is_none());
        assert_eq!(store.execution_count(), 1);
    }

    #[tokio::test]
    async fn test_rows_without_schedule_key_never_collide() {
        let store = MemoryStore::new();
        let definition = store
            .insert_definition(test_definition("cleanup"))
            .await
            .unwrap();

        for _ in 0..3 {
            let execution = pending_execution(&definition, timestamp(0));
            assert!(store.insert_execution_if_absent(execution).await.unwrap().is_some());
        }
        assert_eq!(store.execution_count(), 3);
    }

    #[tokio::test]
    async fn test_duplicate_definition_key_is_rejected_per_tenant() {
        let store = MemoryStore::new();
        store
            .insert_definition(test_definition("cleanup"))
            .await
            .unwrap();

        let clash = store.insert_definition(test_definition("cleanup")).await;
        assert!(matches!(clash, Err(StoreError::DuplicateKey(_))));

        let mut other_tenant = test_definition("cleanup");
        other_tenant.tenant_id = Uuid::new_v4();
        assert!(store.insert_definition(other_tenant).await.is_ok());
    }

    #[tokio::test]
    async fn test_conditional_update_checks_every_guard() {
        let store = MemoryStore::new();
        let definition = store
            .insert_definition(test_definition("cleanup"))
            .await
            .unwrap();
        let execution = store
            .insert_execution_if_absent(pending_execution(&definition, timestamp(0)))
            .await
            .unwrap()
            .unwrap();

        let lease = chrono::Duration::seconds(30);
        let claim = ExecutionPatch::claim("node-a/w-0", timestamp(1), lease);
        let snapshot = ExecutionGuard::lease_snapshot(&execution);

        assert!(store
            .conditional_update(execution.id, &snapshot, &claim)
            .await
            .unwrap());
        // The same stale snapshot no longer matches
        assert!(!store
            .conditional_update(execution.id, &snapshot, &claim)
            .await
            .unwrap());

        let stored = store.get_execution(execution.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ExecutionStatus::Claimed);
        assert_eq!(stored.claimed_by.as_deref(), Some("node-a/w-0"));
        assert_eq!(stored.lock_expires_at, Some(timestamp(31)));
        assert_eq!(stored.heartbeat_at, Some(timestamp(1)));
    }

    #[tokio::test]
    async fn test_advance_schedule_is_compare_and_swap() {
        let store = MemoryStore::new();
        let definition = store
            .insert_definition(test_definition("cleanup"))
            .await
            .unwrap();

        let advance = ScheduleAdvance {
            definition_id: definition.id,
            expected_next_run_at: definition.next_run_at,
            next_run_at: Some(timestamp(60)),
            execution_count: 1,
            last_execution_id: None,
            updated_at: timestamp(0),
        };

        assert!(store.advance_schedule(&advance).await.unwrap());
        assert!(!store.advance_schedule(&advance).await.unwrap());

        let stored = store.get_definition(definition.id).await.unwrap().unwrap();
        assert_eq!(stored.next_run_at, Some(timestamp(60)));
        assert_eq!(stored.execution_count, 1);
    }
}
