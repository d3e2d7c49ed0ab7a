//! In-process workers that pull tasks from the dispatcher.

use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{Task, TaskDispatcher, TaskResult, WorkerDescriptor};
use crate::types::WorkerId;

/// Executes the payload of one task.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, task: &Task) -> TaskResult;
}

/// Completes every task with its own payload.
pub struct EchoTaskHandler;

#[async_trait]
impl TaskHandler for EchoTaskHandler {
    async fn handle(&self, task: &Task) -> TaskResult {
        TaskResult::success(serde_json::json!({
            "task_id": task.id,
            "payload": task.payload,
        }))
    }
}

/// A worker loop: long-poll, handle, complete.
pub struct LocalWorker {
    id: WorkerId,
    capabilities: BTreeSet<String>,
    dispatcher: Arc<TaskDispatcher>,
    handler: Arc<dyn TaskHandler>,
    poll_interval: Duration,
}

impl LocalWorker {
    pub fn new<I, S>(
        id: impl Into<WorkerId>,
        capabilities: I,
        dispatcher: Arc<TaskDispatcher>,
        handler: Arc<dyn TaskHandler>,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            id: id.into(),
            capabilities: capabilities.into_iter().map(Into::into).collect(),
            dispatcher,
            handler,
            poll_interval: Duration::from_millis(500),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn id(&self) -> &WorkerId {
        &self.id
    }

    /// Register with the dispatcher and run until `shutdown` turns true.
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            self.dispatcher
                .register_worker(WorkerDescriptor {
                    id: self.id.clone(),
                    capabilities: self.capabilities.clone(),
                })
                .await;
            info!(worker = %self.id, "Worker started");

            loop {
                if *shutdown.borrow() {
                    break;
                }
                let polled = tokio::select! {
                    _ = shutdown.changed() => break,
                    polled = self.dispatcher.poll(&self.id, self.poll_interval) => polled,
                };

                let task = match polled {
                    Ok(Some(task)) => task,
                    Ok(None) => continue,
                    Err(e) => {
                        warn!(worker = %self.id, error = %e, "Poll failed");
                        tokio::time::sleep(self.poll_interval).await;
                        continue;
                    }
                };

                debug!(worker = %self.id, task_id = %task.id, "Handling task");
                let result = self.handler.handle(&task).await;
                if let Err(e) = self.dispatcher.complete(&task.id, result).await {
                    warn!(worker = %self.id, task_id = %task.id, error = %e, "Completion failed");
                }
            }

            self.dispatcher.deregister_worker(&self.id).await;
            info!(worker = %self.id, "Worker stopped");
        })
    }
}
