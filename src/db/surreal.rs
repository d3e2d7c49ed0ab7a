use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use super::ExecutionStore;
use super::connection::Db;
use super::schema::{
    BodyRow, NODE_EXECUTION_TABLE, PERMIT_TABLE, PLAN_TABLE, RUN_TABLE, TASK_TABLE, WAIT_TABLE,
};
use crate::correlator::WaitInstance;
use crate::dispatcher::{Task, TaskStatus};
use crate::error::{EngineError, EngineResult};
use crate::model::{NodeExecution, RunRecord};
use crate::plan::Plan;
use crate::resource::ResourcePermit;
use crate::types::{NodeExecutionId, ResourceKey, ResumeKey, RunId, TaskId};
use crate::utils::epoch_millis;

/// SurrealDB-backed store. Each record lives at `type::thing(table, id)`.
pub struct SurrealStore {
    db: Db,
}

impl SurrealStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    async fn upsert_body<T: Serialize>(&self, table: &str, id: &str, value: &T) -> EngineResult<()> {
        let body = serde_json::to_string(value)?;
        self.db
            .query("UPSERT type::thing($tb, $id) SET body = $body")
            .bind(("tb", table.to_string()))
            .bind(("id", id.to_string()))
            .bind(("body", body))
            .await?
            .check()?;
        Ok(())
    }

    async fn load_body<T: DeserializeOwned>(&self, table: &str, id: &str) -> EngineResult<Option<T>> {
        let mut res = self
            .db
            .query("SELECT body FROM type::thing($tb, $id)")
            .bind(("tb", table.to_string()))
            .bind(("id", id.to_string()))
            .await?;
        let rows: Vec<BodyRow> = res.take(0)?;
        rows.first()
            .map(|r| r.decode())
            .transpose()
            .map_err(EngineError::from)
    }

    fn decode_all<T: DeserializeOwned>(rows: Vec<BodyRow>) -> EngineResult<Vec<T>> {
        rows.iter()
            .map(|r| r.decode().map_err(EngineError::from))
            .collect()
    }

    /// CREATE fails when the record exists; surface that as a key collision.
    async fn create_unique(&self, query: &str, id: &str, bindings: CreateBindings) -> EngineResult<()> {
        let res = self
            .db
            .query(query)
            .bind(("id", id.to_string()))
            .bind(("body", bindings.body))
            .bind(("a", bindings.a))
            .bind(("b", bindings.b))
            .bind(("n1", bindings.n1))
            .bind(("n2", bindings.n2))
            .await?;
        match res.check() {
            Ok(_) => Ok(()),
            Err(e) if e.to_string().contains("already exists") => {
                Err(EngineError::DuplicateKey(id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Positional parameters for [`SurrealStore::create_unique`].
struct CreateBindings {
    body: String,
    a: String,
    b: String,
    n1: i64,
    n2: i64,
}

#[async_trait]
impl ExecutionStore for SurrealStore {
    async fn save_plan(&self, run_id: &RunId, plan: &Plan) -> EngineResult<()> {
        self.upsert_body(PLAN_TABLE, run_id.as_str(), plan).await
    }

    async fn load_plan(&self, run_id: &RunId) -> EngineResult<Option<Plan>> {
        self.load_body(PLAN_TABLE, run_id.as_str()).await
    }

    async fn save_run(&self, run: &RunRecord) -> EngineResult<()> {
        let body = serde_json::to_string(run)?;
        self.db
            .query("UPSERT type::thing($tb, $id) SET body = $body, finished = $finished")
            .bind(("tb", RUN_TABLE))
            .bind(("id", run.run_id.to_string()))
            .bind(("body", body))
            .bind(("finished", run.status.is_finished()))
            .await?
            .check()?;
        Ok(())
    }

    async fn load_run(&self, run_id: &RunId) -> EngineResult<Option<RunRecord>> {
        self.load_body(RUN_TABLE, run_id.as_str()).await
    }

    async fn list_unfinished_runs(&self) -> EngineResult<Vec<RunId>> {
        let mut res = self
            .db
            .query("SELECT body FROM type::table($tb) WHERE finished = false")
            .bind(("tb", RUN_TABLE))
            .await?;
        let mut out: Vec<RunRecord> = Self::decode_all(res.take(0)?)?;
        out.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        Ok(out.into_iter().map(|r| r.run_id).collect())
    }

    async fn save_node_execution(&self, execution: &NodeExecution) -> EngineResult<()> {
        let body = serde_json::to_string(execution)?;
        self.db
            .query("UPSERT type::thing($tb, $id) SET body = $body, run_id = $run_id")
            .bind(("tb", NODE_EXECUTION_TABLE))
            .bind(("id", execution.id.to_string()))
            .bind(("body", body))
            .bind(("run_id", execution.run_id.to_string()))
            .await?
            .check()?;
        Ok(())
    }

    async fn load_node_execution(
        &self,
        id: &NodeExecutionId,
    ) -> EngineResult<Option<NodeExecution>> {
        self.load_body(NODE_EXECUTION_TABLE, id.as_str()).await
    }

    async fn list_node_executions(&self, run_id: &RunId) -> EngineResult<Vec<NodeExecution>> {
        let mut res = self
            .db
            .query("SELECT body FROM type::table($tb) WHERE run_id = $run_id")
            .bind(("tb", NODE_EXECUTION_TABLE))
            .bind(("run_id", run_id.to_string()))
            .await?;
        let mut out: Vec<NodeExecution> = Self::decode_all(res.take(0)?)?;
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(out)
    }

    async fn insert_wait(&self, wait: &WaitInstance) -> EngineResult<()> {
        let bindings = CreateBindings {
            body: serde_json::to_string(wait)?,
            a: wait.waiter_id.to_string(),
            b: wait.run_id.to_string(),
            n1: epoch_millis(wait.deadline),
            n2: 0,
        };
        self.create_unique(
            "CREATE type::thing('wait', $id) SET body = $body, waiter_id = $a, run_id = $b, deadline_ms = $n1",
            wait.resume_key.as_str(),
            bindings,
        )
        .await
    }

    async fn take_wait(&self, key: &ResumeKey) -> EngineResult<Option<WaitInstance>> {
        let mut res = self
            .db
            .query("DELETE type::thing($tb, $id) RETURN BEFORE")
            .bind(("tb", WAIT_TABLE))
            .bind(("id", key.to_string()))
            .await?;
        let rows: Vec<BodyRow> = res.take(0)?;
        Ok(Self::decode_all(rows)?.into_iter().next())
    }

    async fn load_wait(&self, key: &ResumeKey) -> EngineResult<Option<WaitInstance>> {
        self.load_body(WAIT_TABLE, key.as_str()).await
    }

    async fn list_waits_for_waiter(
        &self,
        waiter_id: &NodeExecutionId,
    ) -> EngineResult<Vec<WaitInstance>> {
        let mut res = self
            .db
            .query("SELECT body FROM type::table($tb) WHERE waiter_id = $waiter")
            .bind(("tb", WAIT_TABLE))
            .bind(("waiter", waiter_id.to_string()))
            .await?;
        Self::decode_all(res.take(0)?)
    }

    async fn list_waits_for_run(&self, run_id: &RunId) -> EngineResult<Vec<WaitInstance>> {
        let mut res = self
            .db
            .query("SELECT body FROM type::table($tb) WHERE run_id = $run_id")
            .bind(("tb", WAIT_TABLE))
            .bind(("run_id", run_id.to_string()))
            .await?;
        Self::decode_all(res.take(0)?)
    }

    async fn list_expired_waits(&self, now: DateTime<Utc>) -> EngineResult<Vec<WaitInstance>> {
        let mut res = self
            .db
            .query("SELECT body FROM type::table($tb) WHERE deadline_ms <= $now")
            .bind(("tb", WAIT_TABLE))
            .bind(("now", now.timestamp_millis()))
            .await?;
        let mut out: Vec<WaitInstance> = Self::decode_all(res.take(0)?)?;
        out.sort_by(|a, b| a.deadline.cmp(&b.deadline));
        Ok(out)
    }

    async fn insert_task(&self, task: &Task) -> EngineResult<()> {
        let bindings = CreateBindings {
            body: serde_json::to_string(task)?,
            a: task.status.as_str().to_string(),
            b: String::new(),
            n1: task.created_at.timestamp_millis(),
            n2: task.expires_at.timestamp_millis(),
        };
        self.create_unique(
            "CREATE type::thing('task', $id) SET body = $body, status = $a, created_ms = $n1, expires_ms = $n2",
            task.id.as_str(),
            bindings,
        )
        .await
    }

    async fn load_task(&self, id: &TaskId) -> EngineResult<Option<Task>> {
        self.load_body(TASK_TABLE, id.as_str()).await
    }

    async fn update_task_if(&self, task: &Task, expected: TaskStatus) -> EngineResult<bool> {
        let body = serde_json::to_string(task)?;
        let mut res = self
            .db
            .query(
                "UPDATE type::thing($tb, $id) SET body = $body, status = $status, \
                 created_ms = $created, expires_ms = $expires \
                 WHERE status = $expected RETURN AFTER",
            )
            .bind(("tb", TASK_TABLE))
            .bind(("id", task.id.to_string()))
            .bind(("body", body))
            .bind(("status", task.status.as_str()))
            .bind(("created", task.created_at.timestamp_millis()))
            .bind(("expires", task.expires_at.timestamp_millis()))
            .bind(("expected", expected.as_str()))
            .await?;
        let rows: Vec<BodyRow> = res.take(0)?;
        if rows.is_empty() {
            debug!(task_id = %task.id, expected = expected.as_str(), "Task status compare-and-set missed");
        }
        Ok(!rows.is_empty())
    }

    async fn list_tasks(&self, status: TaskStatus) -> EngineResult<Vec<Task>> {
        let mut res = self
            .db
            .query("SELECT body FROM type::table($tb) WHERE status = $status")
            .bind(("tb", TASK_TABLE))
            .bind(("status", status.as_str()))
            .await?;
        let mut out: Vec<Task> = Self::decode_all(res.take(0)?)?;
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(out)
    }

    async fn list_expired_tasks(&self, now: DateTime<Utc>) -> EngineResult<Vec<Task>> {
        let mut res = self
            .db
            .query(
                "SELECT body FROM type::table($tb) \
                 WHERE expires_ms <= $now AND status IN ['queued', 'acquired']",
            )
            .bind(("tb", TASK_TABLE))
            .bind(("now", now.timestamp_millis()))
            .await?;
        let mut out: Vec<Task> = Self::decode_all(res.take(0)?)?;
        out.sort_by(|a, b| a.expires_at.cmp(&b.expires_at));
        Ok(out)
    }

    async fn save_permit(&self, permit: &ResourcePermit) -> EngineResult<()> {
        let body = serde_json::to_string(permit)?;
        self.db
            .query(
                "UPSERT type::thing($tb, [$key, $holder]) \
                 SET body = $body, resource_key = $key, holder_id = $holder",
            )
            .bind(("tb", PERMIT_TABLE))
            .bind(("key", permit.resource_key.to_string()))
            .bind(("holder", permit.holder_id.to_string()))
            .bind(("body", body))
            .await?
            .check()?;
        Ok(())
    }

    async fn delete_permit(
        &self,
        resource_key: &ResourceKey,
        holder_id: &NodeExecutionId,
    ) -> EngineResult<bool> {
        let mut res = self
            .db
            .query("DELETE type::thing($tb, [$key, $holder]) RETURN BEFORE")
            .bind(("tb", PERMIT_TABLE))
            .bind(("key", resource_key.to_string()))
            .bind(("holder", holder_id.to_string()))
            .await?;
        let rows: Vec<BodyRow> = res.take(0)?;
        Ok(!rows.is_empty())
    }

    async fn list_permits(&self, resource_key: &ResourceKey) -> EngineResult<Vec<ResourcePermit>> {
        let mut res = self
            .db
            .query("SELECT body FROM type::table($tb) WHERE resource_key = $key")
            .bind(("tb", PERMIT_TABLE))
            .bind(("key", resource_key.to_string()))
            .await?;
        let mut out: Vec<ResourcePermit> = Self::decode_all(res.take(0)?)?;
        out.sort_by(|a, b| a.acquired_at.cmp(&b.acquired_at));
        Ok(out)
    }

    async fn list_permits_for_holder(
        &self,
        holder_id: &NodeExecutionId,
    ) -> EngineResult<Vec<ResourcePermit>> {
        let mut res = self
            .db
            .query("SELECT body FROM type::table($tb) WHERE holder_id = $holder")
            .bind(("tb", PERMIT_TABLE))
            .bind(("holder", holder_id.to_string()))
            .await?;
        Self::decode_all(res.take(0)?)
    }
}
