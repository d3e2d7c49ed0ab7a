//! Wait/notify correlation.
//!
//! A suspended node registers a [`WaitInstance`] under a resume key. Whoever
//! produces the result later calls [`WaitNotifyCorrelator::notify`] with that
//! key; the correlator deletes the wait and hands the result to the bound
//! [`ResumeHandler`]. Deadlines are enforced by [`WaitNotifyCorrelator::sweep_expired`],
//! which delivers [`ResumeResult::Timeout`] through the same path.
//!
//! The wait record in the store is the only source of truth: the handler is
//! chosen from the durable record (`waiter_id` + `purpose`), never from an
//! in-memory continuation, so resumption works across restarts. Deleting the
//! record under the per-key lock before invoking the handler gives the
//! exactly-once guarantee between `notify` and `expire`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::{Arc, OnceLock, Weak};
use tracing::{debug, info, warn};

use crate::adviser::InterventionDecision;
use crate::db::ExecutionStore;
use crate::error::{EngineError, EngineResult};
use crate::model::FailureInfo;
use crate::types::{NodeExecutionId, ResumeKey, RunId};
use crate::utils::KeyedLocks;

/// Why a node is waiting; tells the handler how to interpret the result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitPurpose {
    AsyncResponse,
    TaskChain,
    ChildBranch,
    ResourcePermit,
    Intervention,
}

/// Durable correlation record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaitInstance {
    pub resume_key: ResumeKey,
    pub waiter_id: NodeExecutionId,
    pub run_id: RunId,
    pub purpose: WaitPurpose,
    pub created_at: DateTime<Utc>,
    pub deadline: Option<DateTime<Utc>>,
}

impl WaitInstance {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.deadline.is_some_and(|d| d <= now)
    }
}

/// How a child branch ended, as reported to its parent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchOutcome {
    pub child_id: NodeExecutionId,
    pub succeeded: bool,
    pub failure: Option<FailureInfo>,
}

/// Result delivered to a suspended node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResumeResult {
    /// Successful asynchronous result.
    Response { payload: Value },
    /// The remote side reported a failure.
    Failure { message: String },
    /// A resource permit was granted to this waiter.
    PermitGranted,
    /// A child branch finished.
    BranchFinished(BranchOutcome),
    /// An operator resolved an intervention.
    Decision { decision: InterventionDecision },
    /// The wait's deadline passed.
    Timeout,
}

impl ResumeResult {
    pub fn response(payload: Value) -> Self {
        Self::Response { payload }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self::Failure {
            message: message.into(),
        }
    }
}

/// Whether a notify reached a waiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotifyOutcome {
    Delivered,
    /// Nobody was waiting: a late or duplicate delivery.
    NotWaiting,
}

/// Receives resumptions. The engine implements this.
#[async_trait]
pub trait ResumeHandler: Send + Sync {
    async fn resume(&self, wait: WaitInstance, result: ResumeResult);
}

pub struct WaitNotifyCorrelator {
    store: Arc<dyn ExecutionStore>,
    locks: KeyedLocks,
    handler: OnceLock<Weak<dyn ResumeHandler>>,
}

impl WaitNotifyCorrelator {
    pub fn new(store: Arc<dyn ExecutionStore>) -> Self {
        Self {
            store,
            locks: KeyedLocks::new(),
            handler: OnceLock::new(),
        }
    }

    /// Bind the handler resumptions are delivered to. Only the first call wins.
    pub fn bind(&self, handler: Weak<dyn ResumeHandler>) -> bool {
        self.handler.set(handler).is_ok()
    }

    fn handler(&self) -> EngineResult<Arc<dyn ResumeHandler>> {
        self.handler
            .get()
            .and_then(Weak::upgrade)
            .ok_or_else(|| EngineError::internal("no resume handler bound to the correlator"))
    }

    /// Register a wait. Fails with `DuplicateKey` if the key is taken.
    pub async fn register(
        &self,
        resume_key: ResumeKey,
        waiter_id: NodeExecutionId,
        run_id: RunId,
        purpose: WaitPurpose,
        deadline: Option<DateTime<Utc>>,
    ) -> EngineResult<WaitInstance> {
        let _guard = self.locks.lock(resume_key.as_str()).await;

        if self.store.load_wait(&resume_key).await?.is_some() {
            return Err(EngineError::DuplicateKey(resume_key.into_inner()));
        }

        let wait = WaitInstance {
            resume_key,
            waiter_id,
            run_id,
            purpose,
            created_at: Utc::now(),
            deadline,
        };
        self.store.insert_wait(&wait).await?;

        debug!(
            resume_key = %wait.resume_key,
            waiter = %wait.waiter_id,
            purpose = ?wait.purpose,
            "Registered wait"
        );
        Ok(wait)
    }

    /// Deliver a result. Idempotent: a second delivery for the same key is a
    /// logged no-op.
    pub async fn notify(
        &self,
        resume_key: &ResumeKey,
        result: ResumeResult,
    ) -> EngineResult<NotifyOutcome> {
        self.deliver(resume_key, result, "notify").await
    }

    /// Deliver a synthetic timeout for a wait whose deadline passed.
    pub async fn expire(&self, resume_key: &ResumeKey) -> EngineResult<NotifyOutcome> {
        self.deliver(resume_key, ResumeResult::Timeout, "expire").await
    }

    async fn deliver(
        &self,
        resume_key: &ResumeKey,
        result: ResumeResult,
        source: &'static str,
    ) -> EngineResult<NotifyOutcome> {
        let handler = self.handler()?;
        let _guard = self.locks.lock(resume_key.as_str()).await;

        let Some(wait) = self.store.take_wait(resume_key).await? else {
            info!(resume_key = %resume_key, source, "Late or duplicate delivery ignored");
            return Ok(NotifyOutcome::NotWaiting);
        };

        debug!(
            resume_key = %resume_key,
            waiter = %wait.waiter_id,
            source,
            "Resuming waiter"
        );
        handler.resume(wait, result).await;
        Ok(NotifyOutcome::Delivered)
    }

    /// Drop a wait without resuming anyone.
    pub async fn cancel(&self, resume_key: &ResumeKey) -> EngineResult<bool> {
        let _guard = self.locks.lock(resume_key.as_str()).await;
        Ok(self.store.take_wait(resume_key).await?.is_some())
    }

    /// Drop every wait owned by a node execution. Returns how many were removed.
    pub async fn cancel_for_waiter(&self, waiter_id: &NodeExecutionId) -> EngineResult<usize> {
        let waits = self.store.list_waits_for_waiter(waiter_id).await?;
        let mut removed = 0;
        for wait in waits {
            if self.cancel(&wait.resume_key).await? {
                removed += 1;
            }
        }
        if removed > 0 {
            debug!(waiter = %waiter_id, removed, "Cancelled pending waits");
        }
        Ok(removed)
    }

    /// Expire every wait whose deadline is at or before `now`.
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> EngineResult<usize> {
        let expired = self.store.list_expired_waits(now).await?;
        let mut fired = 0;
        for wait in expired {
            match self.expire(&wait.resume_key).await {
                Ok(NotifyOutcome::Delivered) => fired += 1,
                Ok(NotifyOutcome::NotWaiting) => {}
                Err(e) => warn!(resume_key = %wait.resume_key, error = %e, "Failed to expire wait"),
            }
        }
        Ok(fired)
    }

    pub async fn is_waiting(&self, resume_key: &ResumeKey) -> EngineResult<bool> {
        Ok(self.store.load_wait(resume_key).await?.is_some())
    }

    pub async fn pending_for_run(&self, run_id: &RunId) -> EngineResult<Vec<WaitInstance>> {
        self.store.list_waits_for_run(run_id).await
    }
}
