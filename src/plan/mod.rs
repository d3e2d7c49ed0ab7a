//! The immutable plan graph for one pipeline run.
//!
//! A [`Plan`] is a map of [`PlanNode`]s plus a start node. Nodes are chained
//! in plan order through `next_node_id` and nested through the child lists of
//! `Children` facilitation. Plans are loaded from JSON and validated before a
//! run starts; the engine only ever reads them.

mod ambiance;
mod validate;

pub use ambiance::{ACCOUNT_KEY, Ambiance, Level, ORG_KEY, PROJECT_KEY};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;

use crate::error::{EngineError, EngineResult};
use crate::model::FailureKind;
use crate::types::PlanNodeId;

/// One step or stage in the plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanNode {
    pub id: PlanNodeId,
    #[serde(default)]
    pub name: Option<String>,
    /// Looked up in the step registry for `Sync` and `Async` facilitation.
    pub step_type: String,
    /// Serialized step parameters; opaque to the engine.
    #[serde(default)]
    pub parameters: Value,
    #[serde(default)]
    pub facilitator: FacilitatorConfig,
    /// Evaluated in declaration order.
    #[serde(default)]
    pub advisers: Vec<AdviserConfig>,
    #[serde(default)]
    pub resource_constraint: Option<ResourceConstraint>,
    /// Deadline for every asynchronous suspension of this node.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Node that runs after this one when the adviser says `Proceed`.
    #[serde(default)]
    pub next_node_id: Option<PlanNodeId>,
    #[serde(default)]
    pub skip_condition: Option<SkipCondition>,
}

impl PlanNode {
    /// Minimal synchronous node; mostly useful for building plans in code.
    pub fn new(id: impl Into<PlanNodeId>, step_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            step_type: step_type.into(),
            parameters: Value::Null,
            facilitator: FacilitatorConfig::Sync,
            advisers: Vec::new(),
            resource_constraint: None,
            timeout_ms: None,
            next_node_id: None,
            skip_condition: None,
        }
    }

    pub fn with_parameters(mut self, parameters: Value) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn with_facilitator(mut self, facilitator: FacilitatorConfig) -> Self {
        self.facilitator = facilitator;
        self
    }

    pub fn with_adviser(mut self, adviser: AdviserConfig) -> Self {
        self.advisers.push(adviser);
        self
    }

    pub fn with_resource(mut self, resource_key: impl Into<String>, capacity: u32) -> Self {
        self.resource_constraint = Some(ResourceConstraint {
            resource_key: resource_key.into(),
            capacity,
            acquire_timeout_ms: None,
        });
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn then(mut self, next: impl Into<PlanNodeId>) -> Self {
        self.next_node_id = Some(next.into());
        self
    }

    pub fn with_skip_condition(mut self, condition: SkipCondition) -> Self {
        self.skip_condition = Some(condition);
        self
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(self.id.as_str())
    }
}

/// A named, capacity-bounded resource the node must hold while it runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceConstraint {
    pub resource_key: String,
    pub capacity: u32,
    #[serde(default)]
    pub acquire_timeout_ms: Option<u64>,
}

/// How a node should execute.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FacilitatorConfig {
    /// Run the step in-process and use its return value as the outcome.
    #[default]
    Sync,
    /// Start the step and suspend until every key has been notified.
    Async {
        #[serde(default)]
        keys: Vec<String>,
    },
    /// Fan out to child nodes.
    Children {
        children: Vec<ChildConfig>,
        #[serde(default)]
        policy: ChildrenPolicy,
    },
    /// Dispatch remote tasks one after another.
    TaskChain { tasks: Vec<TaskSpec> },
}

impl FacilitatorConfig {
    pub fn kind(&self) -> FacilitationKind {
        match self {
            Self::Sync => FacilitationKind::Sync,
            Self::Async { .. } => FacilitationKind::Async,
            Self::Children { .. } => FacilitationKind::Children,
            Self::TaskChain { .. } => FacilitationKind::TaskChain,
        }
    }
}

/// Registry key for facilitators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FacilitationKind {
    Sync,
    Async,
    Children,
    TaskChain,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildConfig {
    pub node_id: PlanNodeId,
    #[serde(default = "default_true")]
    pub required: bool,
    #[serde(default)]
    pub inputs: Value,
}

impl ChildConfig {
    pub fn required(node_id: impl Into<PlanNodeId>) -> Self {
        Self {
            node_id: node_id.into(),
            required: true,
            inputs: Value::Null,
        }
    }

    pub fn optional(node_id: impl Into<PlanNodeId>) -> Self {
        Self {
            required: false,
            ..Self::required(node_id)
        }
    }
}

fn default_true() -> bool {
    true
}

/// How a `Children` parent aggregates child outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChildrenPolicy {
    /// Parent fails if any required child fails.
    #[default]
    FailOnRequiredFailure,
    /// Parent succeeds once every child has finished, whatever happened.
    IgnoreChildFailures,
}

/// Template for one task in a task chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub affinity: Option<String>,
    #[serde(default)]
    pub ttl_ms: Option<u64>,
}

/// Declarative adviser attached to a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AdviserConfig {
    /// Re-run the node on failure.
    Retry {
        max_retries: u32,
        #[serde(default)]
        wait_before_retry_ms: u64,
        /// Empty means any failure kind.
        #[serde(default)]
        on_failure_kinds: Vec<FailureKind>,
        #[serde(default)]
        on_exhausted: ExhaustedAction,
    },
    /// Continue past the failure.
    Ignore {
        #[serde(default)]
        on_failure_kinds: Vec<FailureKind>,
    },
    /// Record the node as succeeded.
    MarkSuccess {
        #[serde(default)]
        on_failure_kinds: Vec<FailureKind>,
    },
    /// Abort the whole run.
    AbortPlan {
        #[serde(default)]
        on_failure_kinds: Vec<FailureKind>,
    },
    /// Park the node until an operator decides.
    ManualIntervention {
        #[serde(default)]
        timeout_ms: Option<u64>,
        #[serde(default)]
        on_timeout: TimeoutAction,
    },
    /// Explicitly continue, regardless of status.
    Proceed,
}

impl AdviserConfig {
    pub fn kind(&self) -> AdviserKind {
        match self {
            Self::Retry { .. } => AdviserKind::Retry,
            Self::Ignore { .. } => AdviserKind::Ignore,
            Self::MarkSuccess { .. } => AdviserKind::MarkSuccess,
            Self::AbortPlan { .. } => AdviserKind::AbortPlan,
            Self::ManualIntervention { .. } => AdviserKind::ManualIntervention,
            Self::Proceed => AdviserKind::Proceed,
        }
    }

    pub fn retry(max_retries: u32, wait_before_retry_ms: u64) -> Self {
        Self::Retry {
            max_retries,
            wait_before_retry_ms,
            on_failure_kinds: Vec::new(),
            on_exhausted: ExhaustedAction::Fail,
        }
    }
}

/// Registry key for advisers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdviserKind {
    Retry,
    Ignore,
    MarkSuccess,
    AbortPlan,
    ManualIntervention,
    Proceed,
}

/// What a retry adviser turns into once its retries are used up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExhaustedAction {
    /// The node stays `FAILED` and its branch ends.
    #[default]
    Fail,
    Ignore,
    AbortPlan,
}

/// What an unanswered intervention resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutAction {
    #[default]
    Fail,
    Ignore,
    MarkSuccess,
    AbortPlan,
}

/// Condition under which a node is recorded `SKIPPED` instead of running.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SkipCondition {
    Always,
    AbstractionEquals { key: String, value: String },
}

impl SkipCondition {
    pub fn matches(&self, ambiance: &Ambiance) -> bool {
        match self {
            Self::Always => true,
            Self::AbstractionEquals { key, value } => ambiance.abstraction(key) == Some(value),
        }
    }
}

/// Acyclic graph of plan nodes for one execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub plan_id: String,
    pub start_node_id: PlanNodeId,
    pub nodes: BTreeMap<PlanNodeId, PlanNode>,
}

impl Plan {
    /// Build a plan from nodes; the start node must be one of them.
    pub fn new(
        plan_id: impl Into<String>,
        start_node_id: impl Into<PlanNodeId>,
        nodes: impl IntoIterator<Item = PlanNode>,
    ) -> Self {
        Self {
            plan_id: plan_id.into(),
            start_node_id: start_node_id.into(),
            nodes: nodes.into_iter().map(|n| (n.id.clone(), n)).collect(),
        }
    }

    pub fn node(&self, id: &PlanNodeId) -> Option<&PlanNode> {
        self.nodes.get(id)
    }

    pub fn require_node(&self, id: &PlanNodeId) -> EngineResult<&PlanNode> {
        self.node(id)
            .ok_or_else(|| EngineError::not_found(format!("plan node {}", id)))
    }

    pub fn start_node(&self) -> EngineResult<&PlanNode> {
        self.require_node(&self.start_node_id)
    }

    /// Parse a plan from JSON text and validate it.
    pub fn from_json(raw: &str) -> EngineResult<Self> {
        let plan: Plan = serde_json::from_str(raw)
            .map_err(|e| EngineError::Validation(format!("malformed plan JSON: {}", e)))?;
        plan.validate()?;
        Ok(plan)
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(Self::from_json(&raw)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_plan_from_json_with_defaults() {
        let raw = json!({
            "plan_id": "deploy",
            "start_node_id": "build",
            "nodes": {
                "build": {
                    "id": "build",
                    "step_type": "echo",
                    "next_node_id": "ship",
                    "advisers": [{"type": "retry", "max_retries": 2}]
                },
                "ship": {
                    "id": "ship",
                    "step_type": "remote",
                    "facilitator": {"type": "async", "keys": ["task-42"]},
                    "resource_constraint": {"resource_key": "prod", "capacity": 1}
                }
            }
        });

        let plan = Plan::from_json(&raw.to_string()).unwrap();
        let build = plan.start_node().unwrap();
        assert_eq!(build.facilitator, FacilitatorConfig::Sync);
        assert_eq!(
            build.advisers[0],
            AdviserConfig::Retry {
                max_retries: 2,
                wait_before_retry_ms: 0,
                on_failure_kinds: vec![],
                on_exhausted: ExhaustedAction::Fail,
            }
        );
        let ship = plan.node(&PlanNodeId::new("ship")).unwrap();
        assert_eq!(ship.facilitator.kind(), FacilitationKind::Async);
        assert_eq!(ship.resource_constraint.as_ref().unwrap().capacity, 1);
    }

    #[test]
    fn test_malformed_json_is_a_validation_error() {
        let err = Plan::from_json("{not json").unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[test]
    fn test_child_config_defaults_to_required() {
        let child: ChildConfig = serde_json::from_value(json!({"node_id": "a"})).unwrap();
        assert!(child.required);
        assert!(!ChildConfig::optional("b").required);
    }

    #[test]
    fn test_skip_condition_on_abstraction() {
        let mut abstractions = BTreeMap::new();
        abstractions.insert("env".to_string(), "dev".to_string());
        let amb = Ambiance::new(crate::types::RunId::new("r"), abstractions);

        let cond = SkipCondition::AbstractionEquals {
            key: "env".into(),
            value: "dev".into(),
        };
        assert!(cond.matches(&amb));
        assert!(SkipCondition::Always.matches(&amb));
        let other = SkipCondition::AbstractionEquals {
            key: "env".into(),
            value: "prod".into(),
        };
        assert!(!other.matches(&amb));
    }
}
