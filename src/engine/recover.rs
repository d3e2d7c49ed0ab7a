use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::runner::Next;
use super::{Engine, RunHandle};
use crate::correlator::WaitPurpose;
use crate::error::{EngineError, EngineResult};
use crate::model::{NodeExecution, Status};
use crate::types::{NodeExecutionId, ResumeKey, RunId};

/// What one sweep fired.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub waits_expired: usize,
    pub tasks_expired: usize,
}

impl Engine {
    /// Expire overdue tasks and waits. Tasks go first: an expired task
    /// delivers its timeout through its own wait.
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> EngineResult<SweepReport> {
        let tasks_expired = self.dispatcher.sweep_expired(now).await?;
        let waits_expired = self.correlator.sweep_expired(now).await?;
        Ok(SweepReport {
            waits_expired,
            tasks_expired,
        })
    }

    /// Periodic sweep; stops once the engine is dropped. A zero interval is
    /// treated as one millisecond.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let engine = Arc::downgrade(self);
        let interval = interval.max(Duration::from_millis(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let Some(engine) = engine.upgrade() else {
                    break;
                };
                match engine.sweep_expired(Utc::now()).await {
                    Ok(report) if report.waits_expired + report.tasks_expired > 0 => {
                        info!(
                            waits = report.waits_expired,
                            tasks = report.tasks_expired,
                            "Expired overdue work"
                        );
                    }
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "Sweep failed"),
                }
            }
            debug!("Sweeper stopped");
        })
    }

    /// Pick a run back up from the store after a restart.
    ///
    /// Suspended nodes keep waiting on their durable waits. Queued resource
    /// waiters are put back in line in the order they originally queued.
    /// A node that was mid-step when the process died, or whose delivered
    /// result was lost with the process, cannot be resumed and fails as an
    /// engine error, which its advisers may retry. A node that finished but
    /// was never advised is advised again.
    pub async fn recover(&self, run_id: &RunId) -> EngineResult<RunHandle> {
        let handle = self.watch_run(run_id).await?;
        if handle.outcome().is_some() {
            return Ok(handle);
        }
        let context = self.context(run_id).await?;
        let executions = self.store.list_node_executions(run_id).await?;

        let mut resource_waits: Vec<_> = self
            .correlator
            .pending_for_run(run_id)
            .await?
            .into_iter()
            .filter(|w| w.purpose == WaitPurpose::ResourcePermit)
            .collect();
        resource_waits.sort_by(|a, b| a.created_at.cmp(&b.created_at));

        let mut requeued = Vec::new();
        for wait in &resource_waits {
            let Some(ne) = executions.iter().find(|ne| ne.id == wait.waiter_id) else {
                continue;
            };
            let (Some(key), Some(node)) = (&ne.awaiting_permit, context.plan.node(&ne.plan_node_id)) else {
                continue;
            };
            let capacity = node
                .resource_constraint
                .as_ref()
                .map(|c| c.capacity)
                .unwrap_or(1);
            self.resources.restore_waiter(key, capacity, &ne.id, run_id).await?;
            requeued.push(ne.id.clone());
        }

        let mut interrupted = 0;
        let mut rescheduled = 0;
        let mut readvised = 0;
        for ne in &executions {
            match ne.status {
                Status::Running if ne.pending_keys.is_empty() => {
                    self.spawn_interrupted(ne.id.clone(), "node was running when the engine stopped");
                    interrupted += 1;
                }
                // A waiter whose wait is gone asks for its permit again.
                Status::Queued | Status::Suspended if !requeued.contains(&ne.id) => {
                    self.spawn_begin(ne.id.clone(), None);
                    rescheduled += 1;
                }
                Status::Running | Status::AsyncWaiting | Status::InterventionWaiting => {
                    if self.lost_resumption(ne).await? {
                        self.spawn_interrupted(ne.id.clone(), "a result was consumed but never applied");
                        interrupted += 1;
                    }
                }
                status if status.is_terminal() => {
                    if self.never_advanced(ne, &executions).await? {
                        self.spawn_advise(ne.clone());
                        readvised += 1;
                    }
                }
                _ => {}
            }
        }

        info!(
            run_id = %run_id,
            requeued = requeued.len(),
            interrupted,
            rescheduled,
            readvised,
            "Run recovered"
        );
        Ok(handle)
    }

    /// Recover every run the store still has as running.
    pub async fn recover_unfinished(&self) -> EngineResult<Vec<RunId>> {
        let run_ids = self.store.list_unfinished_runs().await?;
        for run_id in &run_ids {
            self.recover(run_id).await?;
        }
        Ok(run_ids)
    }

    /// Whether a wait the node is suspended on was taken without the node
    /// moving on.
    async fn lost_resumption(&self, ne: &NodeExecution) -> EngineResult<bool> {
        let keys: Vec<ResumeKey> = match ne.status {
            Status::InterventionWaiting => vec![ResumeKey::for_intervention(&ne.id)],
            _ => ne.pending_keys.iter().cloned().collect(),
        };
        for key in &keys {
            if !self.correlator.is_waiting(key).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Whether a finished node's branch is stuck on it: no successor was
    /// launched and the branch was never closed.
    async fn never_advanced(&self, ne: &NodeExecution, executions: &[NodeExecution]) -> EngineResult<bool> {
        if ne.status == Status::Aborted {
            return Ok(false);
        }
        let context = self.context(&ne.run_id).await?;
        let Some(node) = context.plan.node(&ne.plan_node_id) else {
            return Ok(false);
        };
        if let Some(next) = &node.next_node_id {
            let launched = executions.iter().any(|other| {
                &other.plan_node_id == next && other.parent_id == ne.parent_id && other.branch_key == ne.branch_key
            });
            if launched {
                return Ok(false);
            }
        }
        match &ne.branch_key {
            // The root branch closes by finishing the run, which has not happened.
            None => Ok(true),
            Some(key) => self.correlator.is_waiting(key).await,
        }
    }

    fn spawn_interrupted(&self, id: NodeExecutionId, reason: &'static str) {
        let Some(engine) = self.arc() else {
            return;
        };
        tokio::spawn(async move {
            let next = engine.fail_internal(&id, EngineError::internal(reason)).await;
            engine.drive(next).await;
        });
    }

    fn spawn_advise(&self, ne: NodeExecution) {
        let Some(engine) = self.arc() else {
            return;
        };
        debug!(node_execution_id = %ne.id, status = %ne.status, "Advising node again after restart");
        tokio::spawn(async move {
            engine.drive(Next::Advise(ne)).await;
        });
    }
}
