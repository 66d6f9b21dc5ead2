use chrono::NaiveDateTime;
use std::{fmt, sync::Arc};
use tracing::{debug, warn};

use crate::{
    error::SchedulerError,
    store::{ClaimFilter, ExecutionGuard, ExecutionPatch, JobExecution, JobStore},
};

/// Candidates read per claimed slot; extra rows absorb lost races.
const CANDIDATE_FACTOR: u64 = 4;

/// Identity of one worker slot: `<node id>/<pool>-<index>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkerIdentity {
    node_id: String,
    id: String,
}

impl WorkerIdentity {
    #[must_use]
    pub fn new(node_id: &str, pool: &str, index: u32) -> Self {
        Self {
            node_id: node_id.to_string(),
            id: format!("{node_id}/{pool}-{index}"),
        }
    }

    #[must_use]
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl fmt::Display for WorkerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.id)
    }
}

/// Hands out leases on claimable executions.
#[derive(Clone, Debug)]
pub struct ClaimManager {
    store: Arc<dyn JobStore>,
    lease: chrono::Duration,
}

impl ClaimManager {
    #[must_use]
    pub fn new(store: Arc<dyn JobStore>, lease: chrono::Duration) -> Self {
        Self { store, lease }
    }

    /// Claims up to `batch_size` executions for `worker`.
    ///
    /// Each claim is a compare-and-swap on the lease tuple as it was read, so
    /// of several workers racing for the same row exactly one wins. The
    /// returned rows reflect the lease just taken.
    pub async fn try_claim(
        &self,
        worker: &WorkerIdentity,
        job_types: &[String],
        batch_size: u64,
        now: NaiveDateTime,
    ) -> Result<Vec<JobExecution>, SchedulerError> {
        let filter = ClaimFilter {
            instance_id: worker.node_id().to_string(),
            job_types: job_types.to_vec(),
            now,
            limit: batch_size.saturating_mul(CANDIDATE_FACTOR),
        };
        let candidates = self.store.claim_candidates(&filter).await?;

        let wanted = usize::try_from(batch_size).unwrap_or(usize::MAX);
        let patch = ExecutionPatch::claim(worker.id(), now, self.lease);
        let mut claimed = Vec::new();

        for mut candidate in candidates {
            if claimed.len() >= wanted {
                break;
            }

            let guards = ExecutionGuard::lease_snapshot(&candidate);
            if !self
                .store
                .conditional_update(candidate.id, &guards, &patch)
                .await?
            {
                debug!(
                    "Worker '{worker}' lost the race for execution {}",
                    candidate.id
                );
                continue;
            }

            if candidate.is_orphaned(now) {
                warn!(
                    "♻️ Worker '{worker}' reclaimed orphaned execution {} from '{}' (lease expired at {:?})",
                    candidate.id,
                    candidate.claimed_by.as_deref().unwrap_or("unknown"),
                    candidate.lock_expires_at
                );
            } else {
                debug!("🔧 Worker '{worker}' claimed execution {}", candidate.id);
            }

            patch.apply(&mut candidate);
            claimed.push(candidate);
        }

        Ok(claimed)
    }
}
