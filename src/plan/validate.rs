use std::collections::{BTreeMap, BTreeSet};

use super::{AdviserConfig, FacilitatorConfig, Plan, PlanNode};
use crate::error::{EngineError, EngineResult};
use crate::types::PlanNodeId;
use crate::utils::MAX_TIMEOUT_MS;

impl Plan {
    /// Reject malformed plans before anything executes.
    pub fn validate(&self) -> EngineResult<()> {
        if self.nodes.is_empty() {
            return Err(invalid("plan has no nodes"));
        }
        if !self.nodes.contains_key(&self.start_node_id) {
            return Err(invalid(format!(
                "start node {} is not part of the plan",
                self.start_node_id
            )));
        }

        for (key, node) in &self.nodes {
            if key != &node.id {
                return Err(invalid(format!(
                    "node stored under {} declares id {}",
                    key, node.id
                )));
            }
            if node.step_type.trim().is_empty() {
                return Err(invalid(format!("node {} has an empty step type", node.id)));
            }
            self.validate_edges(node)?;
            validate_node_config(node)?;
        }

        self.detect_cycle()
    }

    fn validate_edges(&self, node: &PlanNode) -> EngineResult<()> {
        for target in edges(node) {
            if target == &node.id {
                return Err(invalid(format!("node {} references itself", node.id)));
            }
            if !self.nodes.contains_key(target) {
                return Err(invalid(format!(
                    "node {} references unknown node {}",
                    node.id, target
                )));
            }
        }
        Ok(())
    }

    /// Depth-first search over next and child edges.
    fn detect_cycle(&self) -> EngineResult<()> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Visiting,
            Done,
        }

        fn visit<'a>(
            plan: &'a Plan,
            id: &'a PlanNodeId,
            marks: &mut BTreeMap<&'a PlanNodeId, Mark>,
        ) -> EngineResult<()> {
            match marks.get(id) {
                Some(Mark::Done) => return Ok(()),
                Some(Mark::Visiting) => {
                    return Err(invalid(format!("cycle detected through node {}", id)));
                }
                None => {}
            }
            marks.insert(id, Mark::Visiting);
            if let Some(node) = plan.nodes.get(id) {
                for target in edges(node) {
                    visit(plan, target, marks)?;
                }
            }
            marks.insert(id, Mark::Done);
            Ok(())
        }

        let mut marks = BTreeMap::new();
        for id in self.nodes.keys() {
            visit(self, id, &mut marks)?;
        }
        Ok(())
    }
}

fn edges(node: &PlanNode) -> Vec<&PlanNodeId> {
    let mut out: Vec<&PlanNodeId> = node.next_node_id.iter().collect();
    if let FacilitatorConfig::Children { children, .. } = &node.facilitator {
        out.extend(children.iter().map(|c| &c.node_id));
    }
    out
}

fn validate_node_config(node: &PlanNode) -> EngineResult<()> {
    match &node.facilitator {
        FacilitatorConfig::Children { children, .. } => {
            if children.is_empty() {
                return Err(invalid(format!("node {} fans out to no children", node.id)));
            }
            let mut seen = BTreeSet::new();
            for child in children {
                if !seen.insert(&child.node_id) {
                    return Err(invalid(format!(
                        "node {} lists child {} twice",
                        node.id, child.node_id
                    )));
                }
            }
        }
        FacilitatorConfig::TaskChain { tasks } if tasks.is_empty() => {
            return Err(invalid(format!("node {} has an empty task chain", node.id)));
        }
        FacilitatorConfig::Async { keys } => {
            let unique: BTreeSet<_> = keys.iter().collect();
            if unique.len() != keys.len() {
                return Err(invalid(format!("node {} declares duplicate async keys", node.id)));
            }
        }
        _ => {}
    }

    for (what, ms) in timeouts(node) {
        if ms > MAX_TIMEOUT_MS {
            return Err(invalid(format!(
                "node {} declares {} of {} ms, more than the {} ms limit",
                node.id, what, ms, MAX_TIMEOUT_MS
            )));
        }
    }

    if let Some(constraint) = &node.resource_constraint {
        if constraint.resource_key.trim().is_empty() {
            return Err(invalid(format!("node {} has an empty resource key", node.id)));
        }
        if constraint.capacity == 0 {
            return Err(invalid(format!(
                "node {} declares resource {} with zero capacity",
                node.id, constraint.resource_key
            )));
        }
    }
    Ok(())
}

fn timeouts(node: &PlanNode) -> Vec<(&'static str, u64)> {
    let mut out = Vec::new();
    out.extend(node.timeout_ms.map(|ms| ("timeout_ms", ms)));
    if let Some(constraint) = &node.resource_constraint {
        out.extend(constraint.acquire_timeout_ms.map(|ms| ("acquire_timeout_ms", ms)));
    }
    for adviser in &node.advisers {
        if let AdviserConfig::ManualIntervention {
            timeout_ms: Some(ms), ..
        } = adviser
        {
            out.push(("intervention timeout_ms", *ms));
        }
    }
    if let FacilitatorConfig::TaskChain { tasks } = &node.facilitator {
        out.extend(tasks.iter().filter_map(|t| t.ttl_ms).map(|ms| ("ttl_ms", ms)));
    }
    out
}

fn invalid(msg: impl Into<String>) -> EngineError {
    EngineError::Validation(msg.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{ChildConfig, ChildrenPolicy, PlanNode};

    fn children(ids: &[&str]) -> FacilitatorConfig {
        FacilitatorConfig::Children {
            children: ids.iter().map(|id| ChildConfig::required(*id)).collect(),
            policy: ChildrenPolicy::default(),
        }
    }

    #[test]
    fn test_valid_plan_passes() {
        let plan = Plan::new(
            "p",
            "stage",
            vec![
                PlanNode::new("stage", "stage").with_facilitator(children(&["a", "b"])),
                PlanNode::new("a", "echo").then("c"),
                PlanNode::new("b", "echo"),
                PlanNode::new("c", "echo"),
            ],
        );
        assert!(plan.validate().is_ok());
    }

    #[test]
    fn test_missing_start_node_is_rejected() {
        let plan = Plan::new("p", "nope", vec![PlanNode::new("a", "echo")]);
        assert!(matches!(plan.validate(), Err(EngineError::Validation(_))));
    }

    #[test]
    fn test_dangling_next_is_rejected() {
        let plan = Plan::new("p", "a", vec![PlanNode::new("a", "echo").then("ghost")]);
        let err = plan.validate().unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn test_cycle_is_rejected() {
        let plan = Plan::new(
            "p",
            "a",
            vec![
                PlanNode::new("a", "echo").then("b"),
                PlanNode::new("b", "stage").with_facilitator(children(&["c"])),
                PlanNode::new("c", "echo").then("a"),
            ],
        );
        let err = plan.validate().unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn test_self_reference_is_rejected() {
        let plan = Plan::new("p", "a", vec![PlanNode::new("a", "echo").then("a")]);
        assert!(plan.validate().is_err());
    }

    #[test]
    fn test_zero_capacity_is_rejected() {
        let plan = Plan::new("p", "a", vec![PlanNode::new("a", "echo").with_resource("db", 0)]);
        assert!(plan.validate().is_err());
    }

    #[test]
    fn test_empty_fan_out_and_task_chain_are_rejected() {
        let empty_children = Plan::new(
            "p",
            "a",
            vec![PlanNode::new("a", "stage").with_facilitator(children(&[]))],
        );
        assert!(empty_children.validate().is_err());

        let empty_chain = Plan::new(
            "p",
            "a",
            vec![PlanNode::new("a", "remote")
                .with_facilitator(FacilitatorConfig::TaskChain { tasks: vec![] })],
        );
        assert!(empty_chain.validate().is_err());
    }

    #[test]
    fn test_oversized_timeout_is_rejected() {
        let plan = Plan::new(
            "p",
            "a",
            vec![PlanNode::new("a", "remote")
                .with_facilitator(FacilitatorConfig::Async { keys: vec![] })
                .with_timeout_ms(u64::MAX)],
        );
        let err = plan.validate().unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
        assert!(err.to_string().contains("timeout_ms"));

        let intervention = Plan::new(
            "p",
            "a",
            vec![PlanNode::new("a", "echo").with_adviser(AdviserConfig::ManualIntervention {
                timeout_ms: Some(MAX_TIMEOUT_MS + 1),
                on_timeout: Default::default(),
            })],
        );
        assert!(intervention.validate().is_err());
    }

    #[test]
    fn test_duplicate_child_is_rejected() {
        let plan = Plan::new(
            "p",
            "s",
            vec![
                PlanNode::new("s", "stage").with_facilitator(children(&["a", "a"])),
                PlanNode::new("a", "echo"),
            ],
        );
        assert!(plan.validate().is_err());
    }
}
