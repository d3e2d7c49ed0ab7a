use async_trait::async_trait;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::{StepContext, StepError, StepExecutor};
use crate::dispatcher::{TaskDispatcher, TaskRequest};
use crate::types::{ResumeKey, TaskId, WorkerId};

fn params<T: DeserializeOwned + Default>(raw: &Value) -> Result<T, StepError> {
    if raw.is_null() {
        return Ok(T::default());
    }
    Ok(serde_json::from_value(raw.clone())?)
}

/// Returns its parameters and inputs as the outcome.
pub struct EchoStep;

#[async_trait]
impl StepExecutor for EchoStep {
    async fn execute(&self, ctx: &StepContext) -> Result<Value, StepError> {
        Ok(json!({
            "node": ctx.plan_node_id,
            "parameters": ctx.parameters,
            "inputs": ctx.inputs,
        }))
    }
}

#[derive(Debug, Default, Deserialize)]
struct FailParams {
    #[serde(default)]
    message: Option<String>,
    /// Succeed from this attempt on; fail forever when absent.
    #[serde(default)]
    fail_times: Option<u32>,
}

/// Fails, optionally only for the first `fail_times` attempts.
pub struct FailStep;

#[async_trait]
impl StepExecutor for FailStep {
    async fn execute(&self, ctx: &StepContext) -> Result<Value, StepError> {
        let p: FailParams = params(&ctx.parameters)?;
        match p.fail_times {
            Some(n) if ctx.attempt >= n => Ok(json!({ "recovered_on_attempt": ctx.attempt })),
            _ => Err(StepError::new(
                p.message.unwrap_or_else(|| "step failed".to_string()),
            )),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct SleepParams {
    #[serde(default)]
    ms: u64,
}

pub struct SleepStep;

#[async_trait]
impl StepExecutor for SleepStep {
    async fn execute(&self, ctx: &StepContext) -> Result<Value, StepError> {
        let p: SleepParams = params(&ctx.parameters)?;
        tokio::time::sleep(Duration::from_millis(p.ms)).await;
        Ok(json!({ "slept_ms": p.ms }))
    }
}

#[derive(Debug, Default, Deserialize)]
struct RemoteParams {
    #[serde(default)]
    capabilities: Vec<String>,
    #[serde(default)]
    payload: Value,
    #[serde(default)]
    affinity: Option<String>,
    #[serde(default)]
    ttl_ms: Option<u64>,
}

/// Queues one task per resume key; the task id is the key, so completing the
/// task resumes the node.
pub struct RemoteStep {
    dispatcher: Arc<TaskDispatcher>,
}

impl RemoteStep {
    pub fn new(dispatcher: Arc<TaskDispatcher>) -> Self {
        Self { dispatcher }
    }
}

#[async_trait]
impl StepExecutor for RemoteStep {
    async fn execute(&self, ctx: &StepContext) -> Result<Value, StepError> {
        Err(StepError::new(format!(
            "step {} is remote and needs async facilitation",
            ctx.plan_node_id
        )))
    }

    async fn start_async(&self, ctx: &StepContext, keys: &[ResumeKey]) -> Result<(), StepError> {
        let p: RemoteParams = params(&ctx.parameters)?;
        for key in keys {
            let request = TaskRequest {
                task_id: Some(TaskId::new(key.as_str())),
                capabilities: p.capabilities.iter().cloned().collect(),
                payload: p.payload.clone(),
                affinity: p.affinity.clone().map(WorkerId::new),
                ttl_ms: p.ttl_ms,
                owner: Some(ctx.node_execution_id.clone()),
            };
            let task_id = self.dispatcher.queue(request).await?;
            debug!(node_execution_id = %ctx.node_execution_id, task_id = %task_id, "Remote step queued task");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correlator::WaitNotifyCorrelator;
    use crate::db::{ExecutionStore, MemoryStore};
    use crate::dispatcher::TaskStatus;
    use crate::plan::Ambiance;
    use crate::types::{NodeExecutionId, PlanNodeId, RunId};

    fn ctx(parameters: Value, attempt: u32) -> StepContext {
        StepContext {
            node_execution_id: NodeExecutionId::new("ne-1"),
            plan_node_id: PlanNodeId::new("build"),
            step_type: "test".to_string(),
            parameters,
            inputs: Value::Null,
            ambiance: Ambiance::new(RunId::new("run-1"), Default::default()),
            attempt,
        }
    }

    #[tokio::test]
    async fn test_echo_returns_parameters() {
        let out = EchoStep.execute(&ctx(json!({"a": 1}), 0)).await.unwrap();
        assert_eq!(out["parameters"], json!({"a": 1}));
    }

    #[tokio::test]
    async fn test_fail_step_recovers_after_n_attempts() {
        let params = json!({"message": "flaky", "fail_times": 2});
        assert_eq!(
            FailStep.execute(&ctx(params.clone(), 0)).await.unwrap_err().message,
            "flaky"
        );
        assert!(FailStep.execute(&ctx(params.clone(), 1)).await.is_err());
        assert!(FailStep.execute(&ctx(params, 2)).await.is_ok());
        assert!(FailStep.execute(&ctx(Value::Null, 9)).await.is_err());
    }

    #[tokio::test]
    async fn test_remote_step_queues_task_per_key() {
        let store: Arc<dyn ExecutionStore> = Arc::new(MemoryStore::new());
        let correlator = Arc::new(WaitNotifyCorrelator::new(store.clone()));
        let dispatcher = Arc::new(TaskDispatcher::new(store, correlator, 60_000));
        let step = RemoteStep::new(dispatcher.clone());

        step.start_async(
            &ctx(json!({"capabilities": ["docker"], "payload": {"image": "alpine"}}), 0),
            &[ResumeKey::new("task-42")],
        )
        .await
        .unwrap();

        let task = dispatcher.get(&TaskId::new("task-42")).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Queued);
        assert!(task.capabilities.contains("docker"));
        assert_eq!(task.owner, Some(NodeExecutionId::new("ne-1")));
    }
}
