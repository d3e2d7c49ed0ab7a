//! Capability-routed task dispatch.
//!
//! Tasks are queued on behalf of a node, picked up by workers whose declared
//! capabilities cover the task's tags, and resolved exactly once as
//! `Completed`, `Expired` or `Aborted`. Completion and expiry are forwarded to
//! the correlator under the task id, which is also the resume key the owning
//! node waits on.

mod worker;

pub use worker::{EchoTaskHandler, LocalWorker, TaskHandler};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, RwLock, broadcast};
use tracing::{debug, info, warn};

use crate::correlator::{NotifyOutcome, ResumeResult, WaitNotifyCorrelator};
use crate::db::ExecutionStore;
use crate::error::{EngineError, EngineResult};
use crate::types::{NodeExecutionId, ResumeKey, TaskId, WorkerId};
use crate::utils::deadline_after;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Acquired,
    Completed,
    Expired,
    Aborted,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Expired | Self::Aborted)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Acquired => "acquired",
            Self::Completed => "completed",
            Self::Expired => "expired",
            Self::Aborted => "aborted",
        }
    }
}

/// What a worker reports back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TaskResult {
    Success { output: Value },
    Failure { message: String },
}

impl TaskResult {
    pub fn success(output: Value) -> Self {
        Self::Success { output }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self::Failure {
            message: message.into(),
        }
    }
}

impl From<TaskResult> for ResumeResult {
    fn from(result: TaskResult) -> Self {
        match result {
            TaskResult::Success { output } => ResumeResult::response(output),
            TaskResult::Failure { message } => ResumeResult::failure(message),
        }
    }
}

/// A unit of remote work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub capabilities: BTreeSet<String>,
    pub payload: Value,
    pub affinity: Option<WorkerId>,
    /// Node execution the task was queued for, if any.
    pub owner: Option<NodeExecutionId>,
    pub status: TaskStatus,
    pub acquired_by: Option<WorkerId>,
    pub result: Option<TaskResult>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Parameters for [`TaskDispatcher::queue`].
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TaskRequest {
    /// Caller-chosen id; generated when absent.
    #[serde(default)]
    pub task_id: Option<TaskId>,
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub affinity: Option<WorkerId>,
    /// Time to live; the dispatcher default applies when absent.
    #[serde(default)]
    pub ttl_ms: Option<u64>,
    #[serde(default)]
    pub owner: Option<NodeExecutionId>,
}

impl TaskRequest {
    pub fn new<I, S>(capabilities: I, payload: Value) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            capabilities: capabilities.into_iter().map(Into::into).collect(),
            payload,
            ..Default::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<TaskId>) -> Self {
        self.task_id = Some(id.into());
        self
    }

    pub fn with_ttl_ms(mut self, ttl_ms: u64) -> Self {
        self.ttl_ms = Some(ttl_ms);
        self
    }

    pub fn with_affinity(mut self, worker: impl Into<WorkerId>) -> Self {
        self.affinity = Some(worker.into());
        self
    }

    pub fn owned_by(mut self, owner: NodeExecutionId) -> Self {
        self.owner = Some(owner);
        self
    }
}

/// A worker and the capability tags it serves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerDescriptor {
    pub id: WorkerId,
    pub capabilities: BTreeSet<String>,
}

impl WorkerDescriptor {
    pub fn new<I, S>(id: impl Into<WorkerId>, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            id: id.into(),
            capabilities: capabilities.into_iter().map(Into::into).collect(),
        }
    }

    /// Task tags must be a subset of the worker's, and affinity must match.
    pub fn can_run(&self, task: &Task) -> bool {
        task.capabilities.is_subset(&self.capabilities)
            && task.affinity.as_ref().is_none_or(|a| a == &self.id)
    }
}

enum Transition {
    Applied(Task),
    Rejected(Task),
}

pub struct TaskDispatcher {
    store: Arc<dyn ExecutionStore>,
    correlator: Arc<WaitNotifyCorrelator>,
    workers: RwLock<HashMap<WorkerId, WorkerDescriptor>>,
    queued: Notify,
    aborts: broadcast::Sender<TaskId>,
    default_ttl_ms: u64,
}

impl TaskDispatcher {
    pub fn new(
        store: Arc<dyn ExecutionStore>,
        correlator: Arc<WaitNotifyCorrelator>,
        default_ttl_ms: u64,
    ) -> Self {
        let (aborts, _) = broadcast::channel(256);
        Self {
            store,
            correlator,
            workers: RwLock::new(HashMap::new()),
            queued: Notify::new(),
            aborts,
            default_ttl_ms,
        }
    }

    /// Create a task in `Queued` and wake pollers.
    pub async fn queue(&self, request: TaskRequest) -> EngineResult<TaskId> {
        let now = Utc::now();
        let id = request.task_id.unwrap_or_else(TaskId::generate);
        let ttl_ms = request.ttl_ms.unwrap_or(self.default_ttl_ms);

        let task = Task {
            id: id.clone(),
            capabilities: request.capabilities,
            payload: request.payload,
            affinity: request.affinity,
            owner: request.owner,
            status: TaskStatus::Queued,
            acquired_by: None,
            result: None,
            created_at: now,
            expires_at: deadline_after(now, ttl_ms),
            updated_at: now,
        };
        match self.store.insert_task(&task).await {
            Ok(()) => {}
            Err(EngineError::DuplicateKey(key)) => self.requeue_finished(&task, key).await?,
            Err(e) => return Err(e),
        }

        if self.eligible_workers(&task).await.is_empty() {
            debug!(task_id = %id, "Queued task has no eligible worker registered yet");
        }
        info!(task_id = %id, capabilities = ?task.capabilities, ttl_ms, "Task queued");
        self.queued.notify_waiters();
        Ok(id)
    }

    /// A caller-chosen id may be reused once its previous task finished, so a
    /// retried node can queue under the same resume key again. A live task
    /// keeps the id.
    async fn requeue_finished(&self, task: &Task, key: String) -> EngineResult<()> {
        let Some(previous) = self.store.load_task(&task.id).await? else {
            return Err(EngineError::DuplicateKey(key));
        };
        if !previous.status.is_terminal()
            || !self.store.update_task_if(task, previous.status).await?
        {
            return Err(EngineError::DuplicateKey(key));
        }
        debug!(
            task_id = %task.id,
            previous = previous.status.as_str(),
            "Finished task id queued again"
        );
        Ok(())
    }

    /// First acquire wins; a loser gets `AlreadyAcquired`.
    pub async fn acquire(&self, task_id: &TaskId, worker_id: &WorkerId) -> EngineResult<Task> {
        let worker = worker_id.clone();
        let outcome = self
            .transition(task_id, &[TaskStatus::Queued], move |task| {
                task.status = TaskStatus::Acquired;
                task.acquired_by = Some(worker.clone());
            })
            .await?;

        match outcome {
            Transition::Applied(task) => {
                debug!(task_id = %task_id, worker = %worker_id, "Task acquired");
                Ok(task)
            }
            Transition::Rejected(task) if task.status == TaskStatus::Acquired => {
                Err(EngineError::AlreadyAcquired {
                    task_id: task_id.to_string(),
                    worker_id: worker_id.to_string(),
                })
            }
            Transition::Rejected(task) => Err(EngineError::InvalidTransition(format!(
                "task {} is {}",
                task_id,
                task.status.as_str()
            ))),
        }
    }

    /// Mark the task completed and forward the result to its waiter.
    pub async fn complete(
        &self,
        task_id: &TaskId,
        result: TaskResult,
    ) -> EngineResult<NotifyOutcome> {
        let stored = result.clone();
        let outcome = self
            .transition(
                task_id,
                &[TaskStatus::Queued, TaskStatus::Acquired],
                move |task| {
                    task.status = TaskStatus::Completed;
                    task.result = Some(stored.clone());
                },
            )
            .await?;

        match outcome {
            Transition::Applied(_) => {
                info!(task_id = %task_id, "Task completed");
                self.correlator
                    .notify(&ResumeKey::for_task(task_id), result.into())
                    .await
            }
            Transition::Rejected(task) => {
                info!(
                    task_id = %task_id,
                    status = task.status.as_str(),
                    "Completion for a finished task ignored"
                );
                Ok(NotifyOutcome::NotWaiting)
            }
        }
    }

    /// Mark the task expired and deliver a timeout to its waiter.
    pub async fn expire_task(&self, task_id: &TaskId) -> EngineResult<bool> {
        let outcome = self
            .transition(
                task_id,
                &[TaskStatus::Queued, TaskStatus::Acquired],
                |task| task.status = TaskStatus::Expired,
            )
            .await?;

        match outcome {
            Transition::Applied(_) => {
                warn!(task_id = %task_id, "Task expired before completion");
                self.correlator.expire(&ResumeKey::for_task(task_id)).await?;
                Ok(true)
            }
            Transition::Rejected(_) => Ok(false),
        }
    }

    /// Cancel a task that has not finished. Workers are signalled best-effort.
    pub async fn abort(&self, task_id: &TaskId) -> EngineResult<bool> {
        let outcome = self
            .transition(
                task_id,
                &[TaskStatus::Queued, TaskStatus::Acquired],
                |task| task.status = TaskStatus::Aborted,
            )
            .await?;

        match outcome {
            Transition::Applied(_) => {
                info!(task_id = %task_id, "Task aborted");
                // No subscribers is fine.
                let _ = self.aborts.send(task_id.clone());
                Ok(true)
            }
            Transition::Rejected(_) => Ok(false),
        }
    }

    /// Abort every unfinished task queued on behalf of a node execution.
    pub async fn abort_for_owner(&self, owner: &NodeExecutionId) -> EngineResult<usize> {
        let mut aborted = 0;
        for status in [TaskStatus::Queued, TaskStatus::Acquired] {
            for task in self.store.list_tasks(status).await? {
                if task.owner.as_ref() == Some(owner) && self.abort(&task.id).await? {
                    aborted += 1;
                }
            }
        }
        Ok(aborted)
    }

    /// Expire every live task whose TTL ran out.
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> EngineResult<usize> {
        let mut expired = 0;
        for task in self.store.list_expired_tasks(now).await? {
            if self.expire_task(&task.id).await? {
                expired += 1;
            }
        }
        Ok(expired)
    }

    pub async fn get(&self, task_id: &TaskId) -> EngineResult<Option<Task>> {
        self.store.load_task(task_id).await
    }

    pub async fn register_worker(&self, worker: WorkerDescriptor) {
        info!(worker = %worker.id, capabilities = ?worker.capabilities, "Worker registered");
        self.workers.write().await.insert(worker.id.clone(), worker);
        self.queued.notify_waiters();
    }

    pub async fn deregister_worker(&self, worker_id: &WorkerId) -> bool {
        self.workers.write().await.remove(worker_id).is_some()
    }

    pub async fn eligible_workers(&self, task: &Task) -> Vec<WorkerId> {
        let workers = self.workers.read().await;
        let mut ids: Vec<WorkerId> = workers
            .values()
            .filter(|w| w.can_run(task))
            .map(|w| w.id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Acquire the oldest queued task this worker can run, if any.
    pub async fn next_for_worker(&self, worker_id: &WorkerId) -> EngineResult<Option<Task>> {
        let worker = self
            .workers
            .read()
            .await
            .get(worker_id)
            .cloned()
            .ok_or_else(|| EngineError::not_found(format!("worker {}", worker_id)))?;

        for task in self.store.list_tasks(TaskStatus::Queued).await? {
            if !worker.can_run(&task) {
                continue;
            }
            match self.acquire(&task.id, worker_id).await {
                Ok(task) => return Ok(Some(task)),
                Err(e) if e.is_expected() => continue,
                Err(EngineError::InvalidTransition(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }

    /// Long-poll: wait up to `wait` for an eligible task.
    pub async fn poll(&self, worker_id: &WorkerId, wait: Duration) -> EngineResult<Option<Task>> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let notified = self.queued.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(task) = self.next_for_worker(worker_id).await? {
                return Ok(Some(task));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    /// Abort signals, for workers that can stop in-flight work.
    pub fn subscribe_aborts(&self) -> broadcast::Receiver<TaskId> {
        self.aborts.subscribe()
    }

    /// Compare-and-set loop over the stored status.
    async fn transition<F>(
        &self,
        task_id: &TaskId,
        allowed: &[TaskStatus],
        apply: F,
    ) -> EngineResult<Transition>
    where
        F: Fn(&mut Task),
    {
        loop {
            let task = self
                .store
                .load_task(task_id)
                .await?
                .ok_or_else(|| EngineError::not_found(format!("task {}", task_id)))?;

            if !allowed.contains(&task.status) {
                return Ok(Transition::Rejected(task));
            }

            let mut next = task.clone();
            apply(&mut next);
            next.updated_at = Utc::now();

            if self.store.update_task_if(&next, task.status).await? {
                return Ok(Transition::Applied(next));
            }
            debug!(task_id = %task_id, "Lost status race, reloading task");
        }
    }
}
