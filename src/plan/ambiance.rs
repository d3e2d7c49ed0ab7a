//! Execution context threaded through a run.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::types::{NodeExecutionId, PlanNodeId, RunId};

pub const ACCOUNT_KEY: &str = "accountId";
pub const ORG_KEY: &str = "orgIdentifier";
pub const PROJECT_KEY: &str = "projectIdentifier";

/// One entry in the node path: which plan node, which runtime instance of it,
/// and which attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Level {
    pub plan_node_id: PlanNodeId,
    pub node_execution_id: NodeExecutionId,
    pub step_type: String,
    #[serde(default)]
    pub attempt: u32,
}

/// Immutable execution context.
///
/// Deriving a context for a nested node never mutates the parent's; every
/// derivation returns a new value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ambiance {
    pub run_id: RunId,
    #[serde(default)]
    pub levels: Vec<Level>,
    #[serde(default)]
    pub setup_abstractions: BTreeMap<String, String>,
}

impl Ambiance {
    pub fn new(run_id: RunId, setup_abstractions: BTreeMap<String, String>) -> Self {
        Self {
            run_id,
            levels: Vec::new(),
            setup_abstractions,
        }
    }

    /// Context for a node nested under the current one.
    pub fn for_child(&self, level: Level) -> Self {
        let mut next = self.clone();
        next.levels.push(level);
        next
    }

    /// Context for the node that follows the current one at the same depth.
    pub fn for_sibling(&self, level: Level) -> Self {
        let mut next = self.clone();
        next.levels.pop();
        next.levels.push(level);
        next
    }

    /// Same node, next attempt.
    pub fn with_attempt(&self, attempt: u32) -> Self {
        let mut next = self.clone();
        if let Some(level) = next.levels.last_mut() {
            level.attempt = attempt;
        }
        next
    }

    pub fn current_level(&self) -> Option<&Level> {
        self.levels.last()
    }

    pub fn parent_level(&self) -> Option<&Level> {
        let len = self.levels.len();
        if len < 2 {
            None
        } else {
            self.levels.get(len - 2)
        }
    }

    pub fn node_execution_id(&self) -> Option<&NodeExecutionId> {
        self.current_level().map(|l| &l.node_execution_id)
    }

    pub fn attempt(&self) -> u32 {
        self.current_level().map(|l| l.attempt).unwrap_or(0)
    }

    /// Plan node ids from the outermost ancestor down to the current node.
    pub fn node_path(&self) -> Vec<&PlanNodeId> {
        self.levels.iter().map(|l| &l.plan_node_id).collect()
    }

    /// Dotted path, handy as a log field.
    pub fn fqn(&self) -> String {
        self.levels
            .iter()
            .map(|l| l.plan_node_id.as_str())
            .collect::<Vec<_>>()
            .join(".")
    }

    pub fn depth(&self) -> usize {
        self.levels.len()
    }

    pub fn abstraction(&self, key: &str) -> Option<&str> {
        self.setup_abstractions.get(key).map(String::as_str)
    }

    pub fn account_id(&self) -> Option<&str> {
        self.abstraction(ACCOUNT_KEY)
    }

    pub fn org_id(&self) -> Option<&str> {
        self.abstraction(ORG_KEY)
    }

    pub fn project_id(&self) -> Option<&str> {
        self.abstraction(PROJECT_KEY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn level(node: &str, exec: &str) -> Level {
        Level {
            plan_node_id: PlanNodeId::new(node),
            node_execution_id: NodeExecutionId::new(exec),
            step_type: "echo".to_string(),
            attempt: 0,
        }
    }

    fn root() -> Ambiance {
        let mut abstractions = BTreeMap::new();
        abstractions.insert(ACCOUNT_KEY.to_string(), "acc".to_string());
        abstractions.insert(PROJECT_KEY.to_string(), "proj".to_string());
        Ambiance::new(RunId::new("run-1"), abstractions)
    }

    #[test]
    fn test_for_child_does_not_mutate_parent() {
        let parent = root().for_child(level("stage", "e1"));
        let child = parent.for_child(level("step", "e2"));

        assert_eq!(parent.depth(), 1);
        assert_eq!(child.depth(), 2);
        assert_eq!(child.fqn(), "stage.step");
        assert_eq!(child.parent_level().unwrap().node_execution_id.as_str(), "e1");
        assert_eq!(child.node_execution_id().unwrap().as_str(), "e2");
    }

    #[test]
    fn test_for_sibling_replaces_current_level() {
        let first = root().for_child(level("stage", "e1")).for_child(level("a", "e2"));
        let second = first.for_sibling(level("b", "e3"));

        assert_eq!(second.fqn(), "stage.b");
        assert_eq!(first.fqn(), "stage.a");
    }

    #[test]
    fn test_with_attempt_only_touches_current_level() {
        let a = root().for_child(level("stage", "e1")).for_child(level("a", "e2"));
        let retried = a.with_attempt(2);
        assert_eq!(retried.attempt(), 2);
        assert_eq!(retried.levels[0].attempt, 0);
        assert_eq!(a.attempt(), 0);
    }

    #[test]
    fn test_abstraction_getters() {
        let amb = root();
        assert_eq!(amb.account_id(), Some("acc"));
        assert_eq!(amb.project_id(), Some("proj"));
        assert_eq!(amb.org_id(), None);
        assert!(amb.current_level().is_none());
    }
}
