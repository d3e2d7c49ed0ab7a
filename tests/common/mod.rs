#![allow(dead_code)]

use async_trait::async_trait;
use pipeline_engine::steps::{StepContext, StepError, StepExecutor};
use pipeline_engine::dispatcher::{Task, TaskStatus};
use pipeline_engine::types::{RunId, TaskId};
use pipeline_engine::{Engine, ExecutionStore, MemoryStore, NodeExecution};
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

pub fn store() -> Arc<dyn ExecutionStore> {
    Arc::new(MemoryStore::new())
}

pub fn engine() -> Arc<Engine> {
    Engine::builder(store()).build()
}

/// Poll the run's node executions until `done` holds.
pub async fn wait_until<F>(engine: &Engine, run_id: &RunId, done: F) -> Vec<NodeExecution>
where
    F: Fn(&[NodeExecution]) -> bool,
{
    for _ in 0..500 {
        let nodes = engine.node_executions(run_id).await.unwrap();
        if done(&nodes) {
            return nodes;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("run {} never reached the expected state", run_id);
}

/// Poll the dispatcher until the task has been queued.
pub async fn wait_for_task(engine: &Engine, task_id: &TaskId) -> Task {
    for _ in 0..500 {
        if let Some(task) = engine.dispatcher().get(task_id).await.unwrap() {
            return task;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("task {} was never queued", task_id);
}

/// Poll the dispatcher until the task is in `status`.
pub async fn wait_for_task_status(engine: &Engine, task_id: &TaskId, status: TaskStatus) -> Task {
    for _ in 0..500 {
        if let Some(task) = engine.dispatcher().get(task_id).await.unwrap() {
            if task.status == status {
                return task;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("task {} never reached {:?}", task_id, status);
}

pub fn node<'a>(nodes: &'a [NodeExecution], plan_node_id: &str) -> &'a NodeExecution {
    nodes
        .iter()
        .find(|n| n.plan_node_id.as_str() == plan_node_id)
        .unwrap_or_else(|| panic!("no execution of {}", plan_node_id))
}

pub fn has_status(nodes: &[NodeExecution], plan_node_id: &str, status: pipeline_engine::Status) -> bool {
    nodes
        .iter()
        .any(|n| n.plan_node_id.as_str() == plan_node_id && n.status == status)
}

/// Tracks how many executions run at the same time.
#[derive(Default)]
pub struct ConcurrencyGauge {
    current: AtomicUsize,
    pub peak: AtomicUsize,
    pub calls: AtomicUsize,
}

#[async_trait]
impl StepExecutor for ConcurrencyGauge {
    async fn execute(&self, ctx: &StepContext) -> Result<Value, StepError> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        self.current.fetch_sub(1, Ordering::SeqCst);
        Ok(json!({ "node": ctx.plan_node_id }))
    }
}
