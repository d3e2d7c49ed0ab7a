use chrono::Utc;
use std::sync::atomic::Ordering;
use tracing::{debug, info, warn};

use super::Engine;
use crate::error::{EngineError, EngineResult};
use crate::model::{FailureInfo, FailureKind, NodeExecution, RunOutcome, RunStatus, Status};
use crate::types::{NodeExecutionId, ResumeKey, RunId};

impl Engine {
    /// Abort a run: every in-flight node ends `ABORTED`, and no permit, wait
    /// or live task of the run survives.
    pub async fn abort_run(&self, run_id: &RunId, reason: &str) -> EngineResult<()> {
        let failure = FailureInfo::new(FailureKind::Aborted, reason);
        self.halt_run(run_id, RunStatus::Aborted, failure).await
    }

    /// Stop every in-flight node of the run and finish it with `status`.
    pub(super) async fn halt_run(
        &self,
        run_id: &RunId,
        status: RunStatus,
        failure: FailureInfo,
    ) -> EngineResult<()> {
        let record = self
            .store
            .load_run(run_id)
            .await?
            .ok_or_else(|| EngineError::not_found(format!("run {}", run_id)))?;
        if record.status.is_finished() {
            debug!(run_id = %run_id, status = ?record.status, "Run already finished, nothing to halt");
            return Ok(());
        }

        let context = self.context(run_id).await?;
        if context.aborting.swap(true, Ordering::SeqCst) {
            debug!(run_id = %run_id, "Run is already halting");
            return Ok(());
        }
        warn!(run_id = %run_id, ?status, reason = %failure.message, "Halting run");

        let reason = format!("run halted: {}", failure.message);
        let executions = self.store.list_node_executions(run_id).await?;
        let mut aborted = 0;
        for ne in executions.iter().filter(|ne| ne.status.is_in_flight()) {
            let _guard = self.node_locks.lock(ne.id.as_str()).await;
            let Some(mut current) = self.store.load_node_execution(&ne.id).await? else {
                continue;
            };
            if current.status.is_terminal() {
                continue;
            }
            self.mark_aborted(&mut current, &reason).await?;
            aborted += 1;
        }

        // Anything granted or registered while the first pass ran.
        for ne in &executions {
            self.resources.release_all_for_holder(&ne.id).await?;
            self.dispatcher.abort_for_owner(&ne.id).await?;
        }
        for wait in self.correlator.pending_for_run(run_id).await? {
            self.correlator.cancel(&wait.resume_key).await?;
        }

        info!(run_id = %run_id, aborted, "Run halted");
        self.finish_run(run_id, status, Some(failure)).await
    }

    /// Abort every in-flight node of a child branch, nested branches included.
    pub(super) async fn abort_branch(&self, run_id: &RunId, key: &ResumeKey, reason: &str) -> EngineResult<usize> {
        let executions = self.store.list_node_executions(run_id).await?;
        let mut doomed: Vec<NodeExecutionId> = executions
            .iter()
            .filter(|ne| ne.branch_key.as_ref() == Some(key))
            .map(|ne| ne.id.clone())
            .collect();
        let mut next = 0;
        while next < doomed.len() {
            let parent = doomed[next].clone();
            doomed.extend(
                executions
                    .iter()
                    .filter(|ne| ne.parent_id.as_ref() == Some(&parent))
                    .map(|ne| ne.id.clone()),
            );
            next += 1;
        }

        let mut aborted = 0;
        for id in &doomed {
            let _guard = self.node_locks.lock(id.as_str()).await;
            let Some(mut current) = self.store.load_node_execution(id).await? else {
                continue;
            };
            if current.status.is_terminal() {
                continue;
            }
            self.mark_aborted(&mut current, reason).await?;
            aborted += 1;
        }
        info!(run_id = %run_id, branch = %key, aborted, "Branch aborted");
        Ok(aborted)
    }

    pub(super) fn spawn_abort_branch(&self, run_id: RunId, key: ResumeKey, reason: String) {
        let Some(engine) = self.arc() else {
            return;
        };
        tokio::spawn(async move {
            if let Err(e) = engine.abort_branch(&run_id, &key, &reason).await {
                warn!(run_id = %run_id, branch = %key, error = %e, "Could not abort branch");
            }
        });
    }

    /// Give back everything the node holds and end it `ABORTED`. Caller holds
    /// the node lock.
    pub(super) async fn mark_aborted(&self, ne: &mut NodeExecution, reason: &str) -> EngineResult<()> {
        self.correlator.cancel_for_waiter(&ne.id).await?;
        if let Some(key) = ne.awaiting_permit.take() {
            self.resources.cancel_waiter(&key, &ne.id).await?;
        }
        self.dispatcher.abort_for_owner(&ne.id).await?;
        ne.held_permit = None;
        self.resources.release_all_for_holder(&ne.id).await?;

        ne.pending_keys.clear();
        ne.failure = Some(FailureInfo::new(FailureKind::Aborted, reason).at(&ne.plan_node_id, &ne.id));
        ne.override_status(Status::Aborted);
        self.store.save_node_execution(ne).await?;
        info!(node_execution_id = %ne.id, node = %ne.plan_node_id, "Node aborted");
        Ok(())
    }

    /// Record the run's final status once and publish it to watchers.
    pub(super) async fn finish_run(
        &self,
        run_id: &RunId,
        status: RunStatus,
        failure: Option<FailureInfo>,
    ) -> EngineResult<()> {
        let _guard = self.run_locks.lock(run_id.as_str()).await;
        let mut record = self
            .store
            .load_run(run_id)
            .await?
            .ok_or_else(|| EngineError::not_found(format!("run {}", run_id)))?;
        if record.status.is_finished() {
            debug!(run_id = %run_id, status = ?record.status, "Run already finished");
            return Ok(());
        }

        record.status = status;
        record.failure = failure;
        record.finished_at = Some(Utc::now());
        self.store.save_run(&record).await?;
        info!(run_id = %run_id, ?status, "Run finished");

        // Contexts are only built under the run lock, so a run missing here
        // has no watchers to tell.
        if let Some(context) = self.runs.write().await.remove(run_id) {
            context.aborting.store(true, Ordering::SeqCst);
            context.outcome.send_replace(Some(RunOutcome::from(&record)));
            debug!(run_id = %run_id, "Run context released");
        }
        Ok(())
    }
}
