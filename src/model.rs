//! Runtime records: node executions, their statuses and failure information,
//! and the per-run record the engine finishes when a run completes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

use crate::plan::Ambiance;
use crate::types::{NodeExecutionId, PlanNodeId, ResourceKey, ResumeKey, RunId, TaskId};

/// Status of one node execution.
///
/// `QUEUED -> RUNNING -> {SUCCEEDED, FAILED, SKIPPED, ABORTED}`, with the
/// non-terminal detours `ASYNC_WAITING`, `SUSPENDED` (between a failed attempt
/// and its retry) and `INTERVENTION_WAITING`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Queued,
    Running,
    AsyncWaiting,
    Suspended,
    InterventionWaiting,
    Succeeded,
    Failed,
    Skipped,
    Aborted,
}

impl Status {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::Skipped | Self::Aborted
        )
    }

    /// Statuses an abort has to sweep up.
    pub fn is_in_flight(&self) -> bool {
        !self.is_terminal()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "QUEUED",
            Self::Running => "RUNNING",
            Self::AsyncWaiting => "ASYNC_WAITING",
            Self::Suspended => "SUSPENDED",
            Self::InterventionWaiting => "INTERVENTION_WAITING",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
            Self::Skipped => "SKIPPED",
            Self::Aborted => "ABORTED",
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classification of a node failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    StepExecution,
    Timeout,
    EngineInternal,
    ChildFailed,
    Aborted,
    DuplicateKey,
    /// A step type or facilitator that the registries cannot resolve.
    Unresolved,
}

/// What went wrong with a node, optionally wrapping the failure that caused it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureInfo {
    pub kind: FailureKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_node_id: Option<PlanNodeId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_execution_id: Option<NodeExecutionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<Box<FailureInfo>>,
}

impl FailureInfo {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            plan_node_id: None,
            node_execution_id: None,
            cause: None,
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Timeout, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(FailureKind::EngineInternal, message)
    }

    /// Attach the node this failure belongs to.
    pub fn at(mut self, plan_node_id: &PlanNodeId, node_execution_id: &NodeExecutionId) -> Self {
        self.plan_node_id = Some(plan_node_id.clone());
        self.node_execution_id = Some(node_execution_id.clone());
        self
    }

    pub fn caused_by(mut self, cause: FailureInfo) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// Flatten the cause chain, outermost first, deepest last.
    pub fn chain(&self) -> Vec<FailureInfo> {
        let mut out = Vec::new();
        let mut current = Some(self);
        while let Some(failure) = current {
            let mut level = failure.clone();
            level.cause = None;
            out.push(level);
            current = failure.cause.as_deref();
        }
        out
    }

    /// The deepest failure in the chain: the root cause.
    pub fn root_cause(&self) -> &FailureInfo {
        let mut current = self;
        while let Some(cause) = current.cause.as_deref() {
            current = cause;
        }
        current
    }
}

impl std::fmt::Display for FailureInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.plan_node_id {
            Some(node) => write!(f, "[{:?}] {} (node {})", self.kind, self.message, node),
            None => write!(f, "[{:?}] {}", self.kind, self.message),
        }
    }
}

/// Audit entry for one attempt of a node execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub attempt: u32,
    pub status: Status,
    pub failure: Option<FailureInfo>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: DateTime<Utc>,
}

/// The mutable execution record for one instantiation of a plan node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeExecution {
    pub id: NodeExecutionId,
    pub run_id: RunId,
    pub plan_node_id: PlanNodeId,
    pub ambiance: Ambiance,
    pub status: Status,
    pub parent_id: Option<NodeExecutionId>,
    #[serde(default)]
    pub children: Vec<NodeExecutionId>,
    pub retry_count: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub outcome: Option<Value>,
    pub failure: Option<FailureInfo>,
    /// Extra inputs handed down by a `Children` parent.
    #[serde(default)]
    pub inputs: Value,
    /// Key the parent waits on for the branch this node belongs to; `None`
    /// for nodes on the root branch of the run.
    pub branch_key: Option<ResumeKey>,
    /// Correlation keys that have not delivered yet for the current attempt.
    #[serde(default)]
    pub pending_keys: BTreeSet<ResumeKey>,
    /// Results delivered so far for the current attempt, by resume key.
    #[serde(default)]
    pub responses: BTreeMap<String, Value>,
    /// Position in a task chain.
    #[serde(default)]
    pub task_chain_index: usize,
    /// Every task queued on behalf of this node, oldest first.
    #[serde(default)]
    pub task_ids: Vec<TaskId>,
    /// Resource this node currently holds a permit for.
    pub held_permit: Option<ResourceKey>,
    /// Resource this node is queued on.
    pub awaiting_permit: Option<ResourceKey>,
    /// Set when an adviser let a failed node continue.
    #[serde(default)]
    pub failure_ignored: bool,
    #[serde(default)]
    pub attempts: Vec<AttemptRecord>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl NodeExecution {
    pub fn new(
        id: NodeExecutionId,
        plan_node_id: PlanNodeId,
        ambiance: Ambiance,
        parent_id: Option<NodeExecutionId>,
        branch_key: Option<ResumeKey>,
        inputs: Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            run_id: ambiance.run_id.clone(),
            plan_node_id,
            ambiance,
            status: Status::Queued,
            parent_id,
            children: Vec::new(),
            retry_count: 0,
            started_at: None,
            ended_at: None,
            outcome: None,
            failure: None,
            inputs,
            branch_key,
            pending_keys: BTreeSet::new(),
            responses: BTreeMap::new(),
            task_chain_index: 0,
            task_ids: Vec::new(),
            held_permit: None,
            awaiting_permit: None,
            failure_ignored: false,
            attempts: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Move to `next`, stamping timestamps. Terminal statuses are sticky.
    pub fn transition(&mut self, next: Status) -> bool {
        if self.status.is_terminal() && next != Status::Queued {
            return false;
        }
        let now = Utc::now();
        if next == Status::Running && self.started_at.is_none() {
            self.started_at = Some(now);
        }
        if next.is_terminal() {
            self.ended_at = Some(now);
        }
        self.status = next;
        self.updated_at = now;
        true
    }

    /// Close the current attempt into the history and reset per-attempt state
    /// so the node can run again.
    pub fn begin_retry(&mut self) {
        self.attempts.push(AttemptRecord {
            attempt: self.retry_count,
            status: self.status,
            failure: self.failure.clone(),
            started_at: self.started_at,
            ended_at: self.ended_at.unwrap_or_else(Utc::now),
        });
        self.retry_count += 1;
        self.failure = None;
        self.outcome = None;
        self.ended_at = None;
        self.started_at = None;
        self.pending_keys.clear();
        self.responses.clear();
        self.task_chain_index = 0;
        self.children.clear();
        self.failure_ignored = false;
        self.status = Status::Suspended;
        self.updated_at = Utc::now();
    }

    /// Set a status outside the normal transition rules. Used when an
    /// adviser or operator rewrites the result of a finished attempt.
    pub fn override_status(&mut self, status: Status) {
        let now = Utc::now();
        if status.is_terminal() {
            self.ended_at = Some(self.ended_at.unwrap_or(now));
        } else {
            self.ended_at = None;
        }
        self.status = status;
        self.updated_at = now;
    }

    /// Whether the branch should treat this node as having succeeded.
    pub fn counts_as_success(&self) -> bool {
        matches!(self.status, Status::Succeeded | Status::Skipped)
            || (self.status == Status::Failed && self.failure_ignored)
    }
}

/// Final status of a whole run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Succeeded,
    Failed,
    Aborted,
}

impl RunStatus {
    pub fn is_finished(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// Persisted record of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: RunId,
    pub plan_id: String,
    pub status: RunStatus,
    pub failure: Option<FailureInfo>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// What a caller sees once a run finishes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunOutcome {
    pub run_id: RunId,
    pub status: RunStatus,
    /// Failure chain from the outermost failing node down to the deepest.
    pub failure_chain: Vec<FailureInfo>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl From<&RunRecord> for RunOutcome {
    fn from(record: &RunRecord) -> Self {
        Self {
            run_id: record.run_id.clone(),
            status: record.status,
            failure_chain: record.failure.as_ref().map(|f| f.chain()).unwrap_or_default(),
            finished_at: record.finished_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn execution() -> NodeExecution {
        NodeExecution::new(
            NodeExecutionId::new("ne-1"),
            PlanNodeId::new("build"),
            Ambiance::new(RunId::new("run-1"), Default::default()),
            None,
            None,
            Value::Null,
        )
    }

    #[test]
    fn test_terminal_status_is_sticky() {
        let mut ne = execution();
        assert!(ne.transition(Status::Running));
        assert!(ne.transition(Status::Succeeded));
        assert!(!ne.transition(Status::Running));
        assert_eq!(ne.status, Status::Succeeded);
        assert!(ne.ended_at.is_some());
    }

    #[test]
    fn test_begin_retry_archives_attempt() {
        let mut ne = execution();
        ne.transition(Status::Running);
        ne.failure = Some(FailureInfo::new(FailureKind::StepExecution, "exit 1"));
        ne.transition(Status::Failed);
        ne.begin_retry();

        assert_eq!(ne.retry_count, 1);
        assert_eq!(ne.status, Status::Suspended);
        assert!(ne.failure.is_none());
        assert_eq!(ne.attempts.len(), 1);
        assert_eq!(ne.attempts[0].status, Status::Failed);
    }

    #[test]
    fn test_failure_chain_flattens_outermost_first() {
        let inner = FailureInfo::new(FailureKind::StepExecution, "disk full");
        let outer = FailureInfo::new(FailureKind::ChildFailed, "child failed").caused_by(inner);

        let chain = outer.chain();
        assert_eq!(chain.len(), 2);
        assert_eq!(chain[0].kind, FailureKind::ChildFailed);
        assert_eq!(chain[1].message, "disk full");
        assert!(chain.iter().all(|f| f.cause.is_none()));
        assert_eq!(outer.root_cause().message, "disk full");
    }

    #[test]
    fn test_ignored_failure_counts_as_success() {
        let mut ne = execution();
        ne.transition(Status::Failed);
        assert!(!ne.counts_as_success());
        ne.failure_ignored = true;
        assert!(ne.counts_as_success());
    }
}
