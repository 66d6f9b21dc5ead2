use std::{sync::Arc, time::Duration};
use tokio::{
    task::JoinHandle,
    time::{interval_at, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::{
    jobs::now,
    store::{ExecutionGuard, ExecutionPatch, JobStore},
};

/// Keeps the lease of running executions alive.
#[derive(Clone, Debug)]
pub struct HeartbeatKeeper {
    store: Arc<dyn JobStore>,
    lease: chrono::Duration,
    interval: Duration,
}

/// A running heartbeat loop for one execution.
#[derive(Debug)]
pub struct HeartbeatHandle {
    stop: CancellationToken,
    task: JoinHandle<()>,
}

impl HeartbeatHandle {
    /// Stops the loop and waits for it to exit.
    pub async fn stop(self) {
        self.stop.cancel();
        if let Err(e) = self.task.await {
            error!("💓 Heartbeat task ended abnormally: {e}");
        }
    }
}

impl HeartbeatKeeper {
    #[must_use]
    pub fn new(store: Arc<dyn JobStore>, lease: chrono::Duration, interval: Duration) -> Self {
        Self {
            store,
            lease,
            interval,
        }
    }

    /// Extends the lease once. Returns `false` when the lease is gone, either
    /// because the row no longer belongs to `worker_id` or because the store
    /// could not confirm it.
    pub async fn beat(&self, execution_id: Uuid, worker_id: &str) -> bool {
        let guards = ExecutionGuard::owned_by(worker_id);
        let patch = ExecutionPatch::heartbeat(now(), self.lease);

        match self
            .store
            .conditional_update(execution_id, &guards, &patch)
            .await
        {
            Ok(true) => {
                debug!("💓 Renewed lease on execution {execution_id}");
                true
            }
            Ok(false) => {
                warn!("💔 Worker '{worker_id}' lost the lease on execution {execution_id}");
                false
            }
            Err(e) => {
                error!(
                    "💔 Heartbeat for execution {execution_id} failed, giving up the lease: {e}"
                );
                false
            }
        }
    }

    /// Spawns the heartbeat loop. `lease_lost` is cancelled when a heartbeat fails.
    #[must_use]
    pub fn spawn(
        &self,
        execution_id: Uuid,
        worker_id: String,
        lease_lost: CancellationToken,
    ) -> HeartbeatHandle {
        let stop = CancellationToken::new();
        let keeper = self.clone();
        let stop_signal = stop.clone();

        let task = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + keeper.interval, keeper.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    () = stop_signal.cancelled() => break,
                    () = lease_lost.cancelled() => break,
                    _ = ticker.tick() => {
                        if !keeper.beat(execution_id, &worker_id).await {
                            lease_lost.cancel();
                            break;
                        }
                    }
                }
            }
        });

        HeartbeatHandle { stop, task }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        store::MemoryStore,
        tests::setup_test::{pending_execution, test_definition},
    };

    async fn claimed_execution(store: &MemoryStore, worker_id: &str) -> Uuid {
        let definition = store
            .insert_definition(test_definition("cleanup"))
            .await
            .unwrap();
        let execution = store
            .insert_execution_if_absent(pending_execution(&definition, now()))
            .await
            .unwrap()
            .unwrap();
        let claimed = store
            .conditional_update(
                execution.id,
                &ExecutionGuard::lease_snapshot(&execution),
                &ExecutionPatch::claim(worker_id, now(), chrono::Duration::seconds(30)),
            )
            .await
            .unwrap();
        assert!(claimed);
        execution.id
    }

    fn keeper(store: &Arc<MemoryStore>) -> HeartbeatKeeper {
        HeartbeatKeeper::new(
            store.clone(),
            chrono::Duration::seconds(30),
            Duration::from_millis(10),
        )
    }

    #[tokio::test]
    async fn test_beat_extends_lease_of_owner_only() {
        let store = Arc::new(MemoryStore::new());
        let execution_id = claimed_execution(&store, "node-a/default-0").await;
        let keeper = keeper(&store);

        assert!(keeper.beat(execution_id, "node-a/default-0").await);
        assert!(!keeper.beat(execution_id, "node-b/default-0").await);

        let stored = store.get_execution(execution_id).await.unwrap().unwrap();
        assert!(stored.heartbeat_at.is_some());
        assert!(stored.lock_expires_at > stored.heartbeat_at);
    }

    #[tokio::test]
    async fn test_lost_lease_cancels_token() {
        let store = Arc::new(MemoryStore::new());
        let execution_id = claimed_execution(&store, "node-a/default-0").await;

        let lease_lost = CancellationToken::new();
        let handle = keeper(&store).spawn(
            execution_id,
            "node-b/default-0".to_string(),
            lease_lost.clone(),
        );

        tokio::time::timeout(Duration::from_secs(5), lease_lost.cancelled())
            .await
            .unwrap();
        handle.stop().await;
    }

    #[tokio::test]
    async fn test_stop_leaves_token_untouched() {
        let store = Arc::new(MemoryStore::new());
        let execution_id = claimed_execution(&store, "node-a/default-0").await;

        let lease_lost = CancellationToken::new();
        let handle = keeper(&store).spawn(
            execution_id,
            "node-a/default-0".to_string(),
            lease_lost.clone(),
        );
        tokio::time::sleep(Duration::from_millis(35)).await;
        handle.stop().await;

        assert!(!lease_lost.is_cancelled());
    }
}
