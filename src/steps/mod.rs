//! Step executors: the business logic behind a plan node's `step_type`.
//!
//! The engine never looks inside a step. It hands the executor a
//! [`StepContext`] and gets back an outcome payload or a [`StepError`].

mod builtin;

pub use builtin::{EchoStep, FailStep, RemoteStep, SleepStep};

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::dispatcher::TaskDispatcher;
use crate::error::EngineError;
use crate::plan::Ambiance;
use crate::types::{NodeExecutionId, PlanNodeId, ResumeKey};

/// Everything a step gets to see about the node it runs for.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub node_execution_id: NodeExecutionId,
    pub plan_node_id: PlanNodeId,
    pub step_type: String,
    pub parameters: Value,
    /// Inputs handed down by a parent fan-out.
    pub inputs: Value,
    pub ambiance: Ambiance,
    pub attempt: u32,
}

/// A step reported failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepError {
    pub message: String,
}

impl StepError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for StepError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for StepError {}

impl From<EngineError> for StepError {
    fn from(err: EngineError) -> Self {
        Self::new(err.to_string())
    }
}

impl From<serde_json::Error> for StepError {
    fn from(err: serde_json::Error) -> Self {
        Self::new(format!("invalid step parameters: {}", err))
    }
}

#[async_trait]
pub trait StepExecutor: Send + Sync {
    /// Run the step in-process. Used for `Sync` facilitation.
    async fn execute(&self, ctx: &StepContext) -> Result<Value, StepError>;

    /// Kick off asynchronous work whose results will be delivered under
    /// `keys`. Used for `Async` facilitation; the default starts nothing and
    /// leaves delivery to an outside party.
    async fn start_async(&self, _ctx: &StepContext, _keys: &[ResumeKey]) -> Result<(), StepError> {
        Ok(())
    }
}

/// Step type name to executor.
#[derive(Clone, Default)]
pub struct StepRegistry {
    executors: HashMap<String, Arc<dyn StepExecutor>>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with `echo`, `fail`, `sleep` and `remote`.
    pub fn with_builtins(dispatcher: Arc<TaskDispatcher>) -> Self {
        Self::new()
            .register("echo", Arc::new(EchoStep))
            .register("fail", Arc::new(FailStep))
            .register("sleep", Arc::new(SleepStep))
            .register("remote", Arc::new(RemoteStep::new(dispatcher)))
    }

    pub fn register(mut self, step_type: impl Into<String>, executor: Arc<dyn StepExecutor>) -> Self {
        self.executors.insert(step_type.into(), executor);
        self
    }

    pub fn get(&self, step_type: &str) -> Option<Arc<dyn StepExecutor>> {
        self.executors.get(step_type).cloned()
    }

    pub fn list_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.executors.keys().cloned().collect();
        names.sort();
        names
    }
}
