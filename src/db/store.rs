use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::correlator::WaitInstance;
use crate::dispatcher::{Task, TaskStatus};
use crate::error::EngineResult;
use crate::model::{NodeExecution, RunRecord};
use crate::plan::Plan;
use crate::resource::ResourcePermit;
use crate::types::{NodeExecutionId, ResourceKey, ResumeKey, RunId, TaskId};

/// Persistence collaborator for everything the engine must survive a restart
/// with.
///
/// Implementations must give read-after-write consistency for a single
/// record. `insert_wait`, `take_wait`, `insert_task` and `update_task_if` must
/// be atomic with respect to each other for the same key.
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    async fn save_plan(&self, run_id: &RunId, plan: &Plan) -> EngineResult<()>;
    async fn load_plan(&self, run_id: &RunId) -> EngineResult<Option<Plan>>;

    async fn save_run(&self, run: &RunRecord) -> EngineResult<()>;
    async fn load_run(&self, run_id: &RunId) -> EngineResult<Option<RunRecord>>;
    /// Runs not yet `SUCCEEDED`, `FAILED` or `ABORTED`, oldest first.
    async fn list_unfinished_runs(&self) -> EngineResult<Vec<RunId>>;

    async fn save_node_execution(&self, execution: &NodeExecution) -> EngineResult<()>;
    async fn load_node_execution(
        &self,
        id: &NodeExecutionId,
    ) -> EngineResult<Option<NodeExecution>>;
    /// All node executions of a run, oldest first.
    async fn list_node_executions(&self, run_id: &RunId) -> EngineResult<Vec<NodeExecution>>;

    /// Fails with `DuplicateKey` if a wait with the same key exists.
    async fn insert_wait(&self, wait: &WaitInstance) -> EngineResult<()>;
    /// Delete the wait and return it; `None` if it was already gone.
    async fn take_wait(&self, key: &ResumeKey) -> EngineResult<Option<WaitInstance>>;
    async fn load_wait(&self, key: &ResumeKey) -> EngineResult<Option<WaitInstance>>;
    async fn list_waits_for_waiter(
        &self,
        waiter_id: &NodeExecutionId,
    ) -> EngineResult<Vec<WaitInstance>>;
    async fn list_waits_for_run(&self, run_id: &RunId) -> EngineResult<Vec<WaitInstance>>;
    /// Waits whose deadline is at or before `now`.
    async fn list_expired_waits(&self, now: DateTime<Utc>) -> EngineResult<Vec<WaitInstance>>;

    /// Fails with `DuplicateKey` if the task id is taken.
    async fn insert_task(&self, task: &Task) -> EngineResult<()>;
    async fn load_task(&self, id: &TaskId) -> EngineResult<Option<Task>>;
    /// Overwrite the task only if its stored status is still `expected`.
    async fn update_task_if(&self, task: &Task, expected: TaskStatus) -> EngineResult<bool>;
    /// Tasks in `status`, oldest first.
    async fn list_tasks(&self, status: TaskStatus) -> EngineResult<Vec<Task>>;
    /// Unfinished tasks whose TTL ran out at or before `now`.
    async fn list_expired_tasks(&self, now: DateTime<Utc>) -> EngineResult<Vec<Task>>;

    async fn save_permit(&self, permit: &ResourcePermit) -> EngineResult<()>;
    /// Returns whether a permit was removed.
    async fn delete_permit(
        &self,
        resource_key: &ResourceKey,
        holder_id: &NodeExecutionId,
    ) -> EngineResult<bool>;
    async fn list_permits(&self, resource_key: &ResourceKey) -> EngineResult<Vec<ResourcePermit>>;
    async fn list_permits_for_holder(
        &self,
        holder_id: &NodeExecutionId,
    ) -> EngineResult<Vec<ResourcePermit>>;
}
