use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;

use super::ExecutionStore;
use crate::correlator::WaitInstance;
use crate::dispatcher::{Task, TaskStatus};
use crate::error::{EngineError, EngineResult};
use crate::model::{NodeExecution, RunRecord};
use crate::plan::Plan;
use crate::resource::ResourcePermit;
use crate::types::{NodeExecutionId, ResourceKey, ResumeKey, RunId, TaskId};

/// In-process store backed by maps. Used by tests and embedded runs.
#[derive(Default)]
pub struct MemoryStore {
    plans: RwLock<HashMap<RunId, Plan>>,
    runs: RwLock<HashMap<RunId, RunRecord>>,
    executions: RwLock<HashMap<NodeExecutionId, NodeExecution>>,
    waits: RwLock<HashMap<ResumeKey, WaitInstance>>,
    tasks: RwLock<HashMap<TaskId, Task>>,
    permits: RwLock<HashMap<(ResourceKey, NodeExecutionId), ResourcePermit>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ExecutionStore for MemoryStore {
    async fn save_plan(&self, run_id: &RunId, plan: &Plan) -> EngineResult<()> {
        self.plans.write().await.insert(run_id.clone(), plan.clone());
        Ok(())
    }

    async fn load_plan(&self, run_id: &RunId) -> EngineResult<Option<Plan>> {
        Ok(self.plans.read().await.get(run_id).cloned())
    }

    async fn save_run(&self, run: &RunRecord) -> EngineResult<()> {
        self.runs.write().await.insert(run.run_id.clone(), run.clone());
        Ok(())
    }

    async fn load_run(&self, run_id: &RunId) -> EngineResult<Option<RunRecord>> {
        Ok(self.runs.read().await.get(run_id).cloned())
    }

    async fn list_unfinished_runs(&self) -> EngineResult<Vec<RunId>> {
        let mut out: Vec<RunRecord> = self
            .runs
            .read()
            .await
            .values()
            .filter(|r| !r.status.is_finished())
            .cloned()
            .collect();
        out.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        Ok(out.into_iter().map(|r| r.run_id).collect())
    }

    async fn save_node_execution(&self, execution: &NodeExecution) -> EngineResult<()> {
        self.executions
            .write()
            .await
            .insert(execution.id.clone(), execution.clone());
        Ok(())
    }

    async fn load_node_execution(
        &self,
        id: &NodeExecutionId,
    ) -> EngineResult<Option<NodeExecution>> {
        Ok(self.executions.read().await.get(id).cloned())
    }

    async fn list_node_executions(&self, run_id: &RunId) -> EngineResult<Vec<NodeExecution>> {
        let mut out: Vec<NodeExecution> = self
            .executions
            .read()
            .await
            .values()
            .filter(|e| &e.run_id == run_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(out)
    }

    async fn insert_wait(&self, wait: &WaitInstance) -> EngineResult<()> {
        let mut waits = self.waits.write().await;
        if waits.contains_key(&wait.resume_key) {
            return Err(EngineError::DuplicateKey(wait.resume_key.to_string()));
        }
        waits.insert(wait.resume_key.clone(), wait.clone());
        Ok(())
    }

    async fn take_wait(&self, key: &ResumeKey) -> EngineResult<Option<WaitInstance>> {
        Ok(self.waits.write().await.remove(key))
    }

    async fn load_wait(&self, key: &ResumeKey) -> EngineResult<Option<WaitInstance>> {
        Ok(self.waits.read().await.get(key).cloned())
    }

    async fn list_waits_for_waiter(
        &self,
        waiter_id: &NodeExecutionId,
    ) -> EngineResult<Vec<WaitInstance>> {
        Ok(self
            .waits
            .read()
            .await
            .values()
            .filter(|w| &w.waiter_id == waiter_id)
            .cloned()
            .collect())
    }

    async fn list_waits_for_run(&self, run_id: &RunId) -> EngineResult<Vec<WaitInstance>> {
        Ok(self
            .waits
            .read()
            .await
            .values()
            .filter(|w| &w.run_id == run_id)
            .cloned()
            .collect())
    }

    async fn list_expired_waits(&self, now: DateTime<Utc>) -> EngineResult<Vec<WaitInstance>> {
        let mut out: Vec<WaitInstance> = self
            .waits
            .read()
            .await
            .values()
            .filter(|w| w.is_expired(now))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.deadline.cmp(&b.deadline));
        Ok(out)
    }

    async fn insert_task(&self, task: &Task) -> EngineResult<()> {
        let mut tasks = self.tasks.write().await;
        if tasks.contains_key(&task.id) {
            return Err(EngineError::DuplicateKey(task.id.to_string()));
        }
        tasks.insert(task.id.clone(), task.clone());
        Ok(())
    }

    async fn load_task(&self, id: &TaskId) -> EngineResult<Option<Task>> {
        Ok(self.tasks.read().await.get(id).cloned())
    }

    async fn update_task_if(&self, task: &Task, expected: TaskStatus) -> EngineResult<bool> {
        let mut tasks = self.tasks.write().await;
        match tasks.get_mut(&task.id) {
            Some(stored) if stored.status == expected => {
                *stored = task.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_tasks(&self, status: TaskStatus) -> EngineResult<Vec<Task>> {
        let mut out: Vec<Task> = self
            .tasks
            .read()
            .await
            .values()
            .filter(|t| t.status == status)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(out)
    }

    async fn list_expired_tasks(&self, now: DateTime<Utc>) -> EngineResult<Vec<Task>> {
        let mut out: Vec<Task> = self
            .tasks
            .read()
            .await
            .values()
            .filter(|t| !t.status.is_terminal() && t.expires_at <= now)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.expires_at.cmp(&b.expires_at));
        Ok(out)
    }

    async fn save_permit(&self, permit: &ResourcePermit) -> EngineResult<()> {
        self.permits.write().await.insert(
            (permit.resource_key.clone(), permit.holder_id.clone()),
            permit.clone(),
        );
        Ok(())
    }

    async fn delete_permit(
        &self,
        resource_key: &ResourceKey,
        holder_id: &NodeExecutionId,
    ) -> EngineResult<bool> {
        Ok(self
            .permits
            .write()
            .await
            .remove(&(resource_key.clone(), holder_id.clone()))
            .is_some())
    }

    async fn list_permits(&self, resource_key: &ResourceKey) -> EngineResult<Vec<ResourcePermit>> {
        let mut out: Vec<ResourcePermit> = self
            .permits
            .read()
            .await
            .values()
            .filter(|p| &p.resource_key == resource_key)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.acquired_at.cmp(&b.acquired_at));
        Ok(out)
    }

    async fn list_permits_for_holder(
        &self,
        holder_id: &NodeExecutionId,
    ) -> EngineResult<Vec<ResourcePermit>> {
        Ok(self
            .permits
            .read()
            .await
            .values()
            .filter(|p| &p.holder_id == holder_id)
            .cloned()
            .collect())
    }
}
