//! Facilitators decide how a node executes.
//!
//! A facilitator is a pure function of the plan node and its ambiance. It
//! describes the execution as an [`ExecutableResponse`]; queueing tasks,
//! registering waits and spawning children is left to the engine so the
//! decision can be replayed.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use crate::dispatcher::TaskRequest;
use crate::error::{EngineError, EngineResult};
use crate::plan::{Ambiance, ChildrenPolicy, FacilitationKind, FacilitatorConfig, PlanNode, TaskSpec};
use crate::types::{NodeExecutionId, PlanNodeId, ResumeKey, TaskId, WorkerId};

/// One child to fan out to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildSpec {
    pub plan_node_id: PlanNodeId,
    pub required: bool,
    pub inputs: Value,
}

/// The facilitator's verdict for one attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutableResponse {
    Sync,
    Async {
        keys: Vec<ResumeKey>,
    },
    Children {
        children: Vec<ChildSpec>,
        policy: ChildrenPolicy,
    },
    TaskChain {
        next: TaskRequest,
    },
}

pub trait Facilitator: Send + Sync {
    fn facilitate(&self, node: &PlanNode, ambiance: &Ambiance) -> EngineResult<ExecutableResponse>;

    /// The task that follows `completed` finished tasks of a chain, or `None`
    /// when the chain is done. Only task-chain facilitators override this.
    fn next_task(
        &self,
        _node: &PlanNode,
        _ambiance: &Ambiance,
        _completed: usize,
    ) -> EngineResult<Option<TaskRequest>> {
        Ok(None)
    }
}

fn current_execution(ambiance: &Ambiance) -> EngineResult<&NodeExecutionId> {
    ambiance
        .node_execution_id()
        .ok_or_else(|| EngineError::internal("ambiance has no current level"))
}

fn mismatch(node: &PlanNode, expected: FacilitationKind) -> EngineError {
    EngineError::internal(format!(
        "node {} is configured for {:?} facilitation, not {:?}",
        node.id,
        node.facilitator.kind(),
        expected
    ))
}

pub struct SyncFacilitator;

impl Facilitator for SyncFacilitator {
    fn facilitate(&self, _node: &PlanNode, _ambiance: &Ambiance) -> EngineResult<ExecutableResponse> {
        Ok(ExecutableResponse::Sync)
    }
}

/// Uses the declared keys, or `{node_execution_id}/{attempt}` when none are
/// declared.
pub struct AsyncFacilitator;

impl AsyncFacilitator {
    pub fn default_key(ambiance: &Ambiance) -> EngineResult<ResumeKey> {
        let id = current_execution(ambiance)?;
        Ok(ResumeKey::new(format!("{}/{}", id, ambiance.attempt())))
    }
}

impl Facilitator for AsyncFacilitator {
    fn facilitate(&self, node: &PlanNode, ambiance: &Ambiance) -> EngineResult<ExecutableResponse> {
        let FacilitatorConfig::Async { keys } = &node.facilitator else {
            return Err(mismatch(node, FacilitationKind::Async));
        };
        let keys = if keys.is_empty() {
            vec![Self::default_key(ambiance)?]
        } else {
            keys.iter().map(|k| ResumeKey::new(k.as_str())).collect()
        };
        Ok(ExecutableResponse::Async { keys })
    }
}

pub struct ChildrenFacilitator;

impl Facilitator for ChildrenFacilitator {
    fn facilitate(&self, node: &PlanNode, _ambiance: &Ambiance) -> EngineResult<ExecutableResponse> {
        let FacilitatorConfig::Children { children, policy } = &node.facilitator else {
            return Err(mismatch(node, FacilitationKind::Children));
        };
        Ok(ExecutableResponse::Children {
            children: children
                .iter()
                .map(|c| ChildSpec {
                    plan_node_id: c.node_id.clone(),
                    required: c.required,
                    inputs: c.inputs.clone(),
                })
                .collect(),
            policy: *policy,
        })
    }
}

/// Task ids are derived from the node execution, the attempt and the chain
/// position, so replaying a decision yields the same ids.
pub struct TaskChainFacilitator;

impl TaskChainFacilitator {
    fn request(
        spec: &TaskSpec,
        ambiance: &Ambiance,
        index: usize,
    ) -> EngineResult<TaskRequest> {
        let owner = current_execution(ambiance)?;
        Ok(TaskRequest {
            task_id: Some(TaskId::new(format!("{}-{}-{}", owner, ambiance.attempt(), index))),
            capabilities: spec.capabilities.iter().cloned().collect(),
            payload: spec.payload.clone(),
            affinity: spec.affinity.clone().map(WorkerId::new),
            ttl_ms: spec.ttl_ms,
            owner: Some(owner.clone()),
        })
    }
}

impl Facilitator for TaskChainFacilitator {
    fn facilitate(&self, node: &PlanNode, ambiance: &Ambiance) -> EngineResult<ExecutableResponse> {
        let next = self
            .next_task(node, ambiance, 0)?
            .ok_or_else(|| EngineError::internal(format!("node {} has an empty task chain", node.id)))?;
        Ok(ExecutableResponse::TaskChain { next })
    }

    fn next_task(
        &self,
        node: &PlanNode,
        ambiance: &Ambiance,
        completed: usize,
    ) -> EngineResult<Option<TaskRequest>> {
        let FacilitatorConfig::TaskChain { tasks } = &node.facilitator else {
            return Err(mismatch(node, FacilitationKind::TaskChain));
        };
        tasks
            .get(completed)
            .map(|spec| Self::request(spec, ambiance, completed))
            .transpose()
    }
}

/// Facilitation kind to facilitator.
#[derive(Clone, Default)]
pub struct FacilitatorRegistry {
    facilitators: HashMap<FacilitationKind, Arc<dyn Facilitator>>,
}

impl FacilitatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtins() -> Self {
        Self::new()
            .register(FacilitationKind::Sync, Arc::new(SyncFacilitator))
            .register(FacilitationKind::Async, Arc::new(AsyncFacilitator))
            .register(FacilitationKind::Children, Arc::new(ChildrenFacilitator))
            .register(FacilitationKind::TaskChain, Arc::new(TaskChainFacilitator))
    }

    pub fn register(mut self, kind: FacilitationKind, facilitator: Arc<dyn Facilitator>) -> Self {
        self.facilitators.insert(kind, facilitator);
        self
    }

    pub fn get(&self, kind: FacilitationKind) -> Option<Arc<dyn Facilitator>> {
        self.facilitators.get(&kind).cloned()
    }
}
