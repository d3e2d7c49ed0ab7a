use chrono::Utc;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, error, info};

use super::Engine;
use super::runner::{Launch, Next};
use crate::adviser::Advise;
use crate::correlator::{BranchOutcome, NotifyOutcome, ResumeResult, WaitPurpose};
use crate::error::{EngineError, EngineResult};
use crate::model::{FailureInfo, FailureKind, NodeExecution, RunStatus, Status};
use crate::types::{NodeExecutionId, ResumeKey};
use crate::utils::deadline_after;

impl Engine {
    /// Carry out whatever the node lock holder decided.
    pub(super) async fn drive(&self, next: Next) {
        let (id, result) = match next {
            Next::Idle => return,
            Next::Advise(ne) => (ne.id.clone(), self.consult(ne).await),
            Next::Apply(ne, advise) => (ne.id.clone(), self.apply(ne, advise).await),
        };
        if let Err(e) = result {
            error!(node_execution_id = %id, error = %e, "Failed to act on node result");
        }
    }

    /// Evaluate the adviser chain exactly once for a terminal status.
    async fn consult(&self, ne: NodeExecution) -> EngineResult<()> {
        let context = self.context(&ne.run_id).await?;
        let node = context.plan.require_node(&ne.plan_node_id)?;

        let advise = match self.advisers.evaluate(node, ne.status, ne.failure.as_ref()) {
            Ok(advise) => advise,
            Err(e) => {
                error!(
                    node_execution_id = %ne.id,
                    error = %e,
                    "Adviser evaluation failed, failing the run"
                );
                let failure = FailureInfo::internal(format!("adviser evaluation failed: {}", e))
                    .at(&ne.plan_node_id, &ne.id);
                self.halt_run(&ne.run_id, RunStatus::Failed, failure).await?;
                return Err(e);
            }
        };
        debug!(
            node_execution_id = %ne.id,
            status = %ne.status,
            advise = advise.name(),
            "Adviser decided"
        );
        self.apply(ne, advise).await
    }

    pub(super) async fn apply(&self, ne: NodeExecution, advise: Advise) -> EngineResult<()> {
        let advise = match advise {
            Advise::Retry {
                max_retries,
                on_exhausted,
                ..
            } if ne.retry_count >= max_retries => {
                info!(
                    node_execution_id = %ne.id,
                    retries = ne.retry_count,
                    "Retries exhausted"
                );
                on_exhausted.into_advise()
            }
            other => other,
        };

        match advise {
            Advise::Proceed if ne.status == Status::Failed => {
                let ne = self.update_node(&ne.id, |n| n.failure_ignored = true).await?;
                self.advance(ne).await
            }
            Advise::Proceed => self.advance(ne).await,
            Advise::Ignore => {
                info!(node_execution_id = %ne.id, "Failure ignored");
                let ne = self.update_node(&ne.id, |n| n.failure_ignored = true).await?;
                self.advance(ne).await
            }
            Advise::MarkSuccess => {
                info!(node_execution_id = %ne.id, "Node marked successful");
                let ne = self
                    .update_node(&ne.id, |n| n.override_status(Status::Succeeded))
                    .await?;
                self.advance(ne).await
            }
            Advise::Retry {
                wait_before_retry_ms,
                ..
            } => self.retry(ne, wait_before_retry_ms).await,
            Advise::Abort => {
                let failure = ne.failure.clone().unwrap_or_else(|| {
                    FailureInfo::new(FailureKind::Aborted, "aborted by adviser").at(&ne.plan_node_id, &ne.id)
                });
                self.halt_run(&ne.run_id, RunStatus::Aborted, failure).await
            }
            Advise::Intervene { timeout_ms, .. } => self.park_for_intervention(ne, timeout_ms).await,
            Advise::EndBranch => self.end_branch(&ne, false).await,
        }
    }

    async fn update_node<F>(&self, id: &NodeExecutionId, apply: F) -> EngineResult<NodeExecution>
    where
        F: FnOnce(&mut NodeExecution),
    {
        let _guard = self.node_locks.lock(id.as_str()).await;
        let mut ne = self
            .store
            .load_node_execution(id)
            .await?
            .ok_or_else(|| EngineError::not_found(format!("node execution {}", id)))?;
        apply(&mut ne);
        ne.updated_at = Utc::now();
        self.store.save_node_execution(&ne).await?;
        Ok(ne)
    }

    async fn retry(&self, ne: NodeExecution, wait_before_retry_ms: u64) -> EngineResult<()> {
        {
            let _guard = self.node_locks.lock(ne.id.as_str()).await;
            let Some(mut current) = self.store.load_node_execution(&ne.id).await? else {
                return Ok(());
            };
            if current.status != Status::Failed || current.retry_count != ne.retry_count {
                debug!(node_execution_id = %ne.id, status = %current.status, "Stale retry dropped");
                return Ok(());
            }
            current.begin_retry();
            current.ambiance = current.ambiance.with_attempt(current.retry_count);
            self.store.save_node_execution(&current).await?;
            info!(
                node_execution_id = %current.id,
                attempt = current.retry_count,
                wait_ms = wait_before_retry_ms,
                "Node retrying"
            );
        }

        let delay = (wait_before_retry_ms > 0).then(|| Duration::from_millis(wait_before_retry_ms));
        self.spawn_begin(ne.id, delay);
        Ok(())
    }

    async fn park_for_intervention(&self, ne: NodeExecution, timeout_ms: Option<u64>) -> EngineResult<()> {
        let _guard = self.node_locks.lock(ne.id.as_str()).await;
        let Some(mut current) = self.store.load_node_execution(&ne.id).await? else {
            return Ok(());
        };
        if current.status != Status::Failed {
            return Ok(());
        }

        let deadline = timeout_ms.map(|ms| deadline_after(Utc::now(), ms));
        self.correlator
            .register(
                ResumeKey::for_intervention(&current.id),
                current.id.clone(),
                current.run_id.clone(),
                WaitPurpose::Intervention,
                deadline,
            )
            .await?;
        current.override_status(Status::InterventionWaiting);
        self.store.save_node_execution(&current).await?;
        info!(
            node_execution_id = %current.id,
            node = %current.plan_node_id,
            timeout_ms = ?timeout_ms,
            "Node waiting for intervention"
        );
        Ok(())
    }

    /// Launch the next node of the branch, or close the branch.
    async fn advance(&self, ne: NodeExecution) -> EngineResult<()> {
        let context = self.context(&ne.run_id).await?;
        let node = context.plan.require_node(&ne.plan_node_id)?;

        match &node.next_node_id {
            Some(next) => {
                self.launch(Launch {
                    id: NodeExecutionId::generate(),
                    plan_node_id: next.clone(),
                    base: ne.ambiance.clone(),
                    nested: false,
                    parent_id: ne.parent_id.clone(),
                    branch_key: ne.branch_key.clone(),
                    inputs: Value::Null,
                })
                .await
            }
            None => self.end_branch(&ne, ne.counts_as_success()).await,
        }
    }

    /// Report the branch result to the parent, or finish the run when this is
    /// the root branch.
    async fn end_branch(&self, ne: &NodeExecution, succeeded: bool) -> EngineResult<()> {
        match &ne.branch_key {
            Some(key) => {
                let outcome = BranchOutcome {
                    child_id: ne.id.clone(),
                    succeeded,
                    failure: if succeeded { None } else { ne.failure.clone() },
                };
                match self
                    .correlator
                    .notify(key, ResumeResult::BranchFinished(outcome))
                    .await?
                {
                    NotifyOutcome::Delivered => {
                        debug!(node_execution_id = %ne.id, branch = %key, succeeded, "Branch closed");
                    }
                    NotifyOutcome::NotWaiting => {
                        info!(node_execution_id = %ne.id, branch = %key, "Parent no longer waiting on branch");
                    }
                }
                Ok(())
            }
            None if succeeded => self.finish_run(&ne.run_id, RunStatus::Succeeded, None).await,
            None => {
                let failure = ne.failure.clone().unwrap_or_else(|| {
                    FailureInfo::new(FailureKind::StepExecution, "node failed").at(&ne.plan_node_id, &ne.id)
                });
                self.finish_run(&ne.run_id, RunStatus::Failed, Some(failure)).await
            }
        }
    }
}
