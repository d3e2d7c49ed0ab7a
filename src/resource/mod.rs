//! Named, capacity-bounded resources.
//!
//! Each resource key behaves as a counting semaphore with a strict FIFO queue
//! of waiters. Live permits are persisted through the store; a queued waiter
//! is suspended on a durable wait keyed `resource:{key}:{holder}` and woken
//! through the correlator once a permit is handed to it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::correlator::{NotifyOutcome, ResumeResult, WaitNotifyCorrelator, WaitPurpose};
use crate::db::ExecutionStore;
use crate::error::EngineResult;
use crate::types::{NodeExecutionId, ResourceKey, ResumeKey, RunId};

/// A live permit: `holder_id` may proceed while holding `resource_key`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourcePermit {
    pub resource_key: ResourceKey,
    pub holder_id: NodeExecutionId,
    pub run_id: RunId,
    pub acquired_at: DateTime<Utc>,
}

/// Result of [`ResourceConstraintManager::acquire`]. A full resource is not an
/// error: the caller is queued and will be resumed with `PermitGranted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    Granted,
    Queued,
}

#[derive(Debug, Clone)]
struct Waiter {
    holder_id: NodeExecutionId,
    run_id: RunId,
}

#[derive(Debug)]
struct ResourceState {
    capacity: u32,
    holders: BTreeSet<NodeExecutionId>,
    waiters: VecDeque<Waiter>,
}

impl ResourceState {
    fn has_room(&self) -> bool {
        self.holders.len() < self.capacity as usize
    }

    fn is_queued(&self, holder: &NodeExecutionId) -> bool {
        self.waiters.iter().any(|w| &w.holder_id == holder)
    }
}

pub struct ResourceConstraintManager {
    store: Arc<dyn ExecutionStore>,
    correlator: Arc<WaitNotifyCorrelator>,
    states: Mutex<HashMap<ResourceKey, Arc<Mutex<ResourceState>>>>,
}

impl ResourceConstraintManager {
    pub fn new(store: Arc<dyn ExecutionStore>, correlator: Arc<WaitNotifyCorrelator>) -> Self {
        Self {
            store,
            correlator,
            states: Mutex::new(HashMap::new()),
        }
    }

    /// State for a key, rebuilt from persisted permits on first use.
    async fn state(&self, key: &ResourceKey, capacity: u32) -> EngineResult<Arc<Mutex<ResourceState>>> {
        let mut states = self.states.lock().await;
        if let Some(state) = states.get(key) {
            let state = state.clone();
            drop(states);
            let mut guard = state.lock().await;
            if guard.capacity != capacity {
                warn!(
                    resource = %key,
                    old = guard.capacity,
                    new = capacity,
                    "Resource capacity changed"
                );
                guard.capacity = capacity;
            }
            drop(guard);
            return Ok(state);
        }

        let holders = self
            .store
            .list_permits(key)
            .await?
            .into_iter()
            .map(|p| p.holder_id)
            .collect();
        let state = Arc::new(Mutex::new(ResourceState {
            capacity,
            holders,
            waiters: VecDeque::new(),
        }));
        states.insert(key.clone(), state.clone());
        Ok(state)
    }

    async fn existing_state(&self, key: &ResourceKey) -> Option<Arc<Mutex<ResourceState>>> {
        self.states.lock().await.get(key).cloned()
    }

    /// Take a permit if one is free and nobody is queued ahead; otherwise
    /// queue behind existing waiters and register the wake-up wait.
    pub async fn acquire(
        &self,
        key: &ResourceKey,
        capacity: u32,
        holder_id: &NodeExecutionId,
        run_id: &RunId,
        deadline: Option<DateTime<Utc>>,
    ) -> EngineResult<AcquireOutcome> {
        let state = self.state(key, capacity).await?;
        let mut state = state.lock().await;

        if state.holders.contains(holder_id) {
            return Ok(AcquireOutcome::Granted);
        }
        if state.is_queued(holder_id) {
            return Ok(AcquireOutcome::Queued);
        }

        if state.has_room() && state.waiters.is_empty() {
            self.grant(key, holder_id, run_id).await?;
            state.holders.insert(holder_id.clone());
            info!(
                resource = %key,
                holder = %holder_id,
                live = state.holders.len(),
                capacity = state.capacity,
                "Permit granted"
            );
            return Ok(AcquireOutcome::Granted);
        }

        self.correlator
            .register(
                ResumeKey::for_resource(key, holder_id),
                holder_id.clone(),
                run_id.clone(),
                WaitPurpose::ResourcePermit,
                deadline,
            )
            .await?;
        state.waiters.push_back(Waiter {
            holder_id: holder_id.clone(),
            run_id: run_id.clone(),
        });
        info!(
            resource = %key,
            holder = %holder_id,
            position = state.waiters.len(),
            "Resource full, waiter queued"
        );
        Ok(AcquireOutcome::Queued)
    }

    /// Put a waiter whose durable wait survived a restart back in line.
    pub async fn restore_waiter(
        &self,
        key: &ResourceKey,
        capacity: u32,
        holder_id: &NodeExecutionId,
        run_id: &RunId,
    ) -> EngineResult<()> {
        let state = self.state(key, capacity).await?;
        let mut state = state.lock().await;
        if !state.holders.contains(holder_id) && !state.is_queued(holder_id) {
            state.waiters.push_back(Waiter {
                holder_id: holder_id.clone(),
                run_id: run_id.clone(),
            });
        }
        drop(state);
        self.dispatch_grants(key).await
    }

    /// Drop the holder's permit and hand freed capacity to the head of the queue.
    pub async fn release(&self, key: &ResourceKey, holder_id: &NodeExecutionId) -> EngineResult<bool> {
        let removed = match self.existing_state(key).await {
            Some(state) => {
                let mut state = state.lock().await;
                state.holders.remove(holder_id)
            }
            None => false,
        };
        let deleted = self.store.delete_permit(key, holder_id).await?;

        if removed || deleted {
            info!(resource = %key, holder = %holder_id, "Permit released");
        }
        self.dispatch_grants(key).await?;
        Ok(removed || deleted)
    }

    /// Remove a holder from the queue, or release its permit if it was
    /// granted one in the meantime.
    pub async fn cancel_waiter(&self, key: &ResourceKey, holder_id: &NodeExecutionId) -> EngineResult<()> {
        if let Some(state) = self.existing_state(key).await {
            let mut state = state.lock().await;
            state.waiters.retain(|w| &w.holder_id != holder_id);
        }
        self.correlator
            .cancel(&ResumeKey::for_resource(key, holder_id))
            .await?;
        self.release(key, holder_id).await?;
        Ok(())
    }

    /// Release every permit a holder owns.
    pub async fn release_all_for_holder(&self, holder_id: &NodeExecutionId) -> EngineResult<usize> {
        let permits = self.store.list_permits_for_holder(holder_id).await?;
        let count = permits.len();
        for permit in permits {
            self.release(&permit.resource_key, holder_id).await?;
        }
        Ok(count)
    }

    pub async fn live_permits(&self, key: &ResourceKey) -> usize {
        match self.existing_state(key).await {
            Some(state) => state.lock().await.holders.len(),
            None => 0,
        }
    }

    pub async fn queue_len(&self, key: &ResourceKey) -> usize {
        match self.existing_state(key).await {
            Some(state) => state.lock().await.waiters.len(),
            None => 0,
        }
    }

    async fn grant(&self, key: &ResourceKey, holder_id: &NodeExecutionId, run_id: &RunId) -> EngineResult<()> {
        self.store
            .save_permit(&ResourcePermit {
                resource_key: key.clone(),
                holder_id: holder_id.clone(),
                run_id: run_id.clone(),
                acquired_at: Utc::now(),
            })
            .await
    }

    /// Hand free permits to waiters in FIFO order. Waiters are notified
    /// outside the state lock; one that is no longer waiting gives its permit
    /// straight back.
    async fn dispatch_grants(&self, key: &ResourceKey) -> EngineResult<()> {
        let Some(state) = self.existing_state(key).await else {
            return Ok(());
        };

        loop {
            let granted = {
                let mut state = state.lock().await;
                let mut granted = Vec::new();
                while state.has_room() {
                    let Some(waiter) = state.waiters.pop_front() else {
                        break;
                    };
                    self.grant(key, &waiter.holder_id, &waiter.run_id).await?;
                    state.holders.insert(waiter.holder_id.clone());
                    granted.push(waiter);
                }
                granted
            };
            if granted.is_empty() {
                return Ok(());
            }

            let mut revoked = false;
            for waiter in granted {
                let wake = ResumeKey::for_resource(key, &waiter.holder_id);
                match self.correlator.notify(&wake, ResumeResult::PermitGranted).await? {
                    NotifyOutcome::Delivered => {
                        info!(resource = %key, holder = %waiter.holder_id, "Permit granted to queued waiter");
                    }
                    NotifyOutcome::NotWaiting => {
                        debug!(resource = %key, holder = %waiter.holder_id, "Waiter gone, revoking permit");
                        state.lock().await.holders.remove(&waiter.holder_id);
                        self.store.delete_permit(key, &waiter.holder_id).await?;
                        revoked = true;
                    }
                }
            }
            if !revoked {
                return Ok(());
            }
        }
    }
}
