//! Advisers decide what the engine does once a node reaches a terminal status.
//!
//! Each [`AdviserConfig`] on a node is served by the adviser registered for
//! its kind. The chain is evaluated in declaration order and the first
//! applicable decision other than `Proceed` wins.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{EngineError, EngineResult};
use crate::model::{FailureInfo, FailureKind, Status};
use crate::plan::{AdviserConfig, AdviserKind, ExhaustedAction, PlanNode, TimeoutAction};

/// What the engine should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Advise {
    /// Continue to the next node in plan order.
    Proceed,
    /// Re-run the node, unless `max_retries` is already used up.
    Retry {
        wait_before_retry_ms: u64,
        max_retries: u32,
        on_exhausted: ExhaustedAction,
    },
    /// Continue as if the node had succeeded; the status stays `FAILED`.
    Ignore,
    /// Record the node as `SUCCEEDED` and continue.
    MarkSuccess,
    /// Abort the whole run.
    Abort,
    /// Park the node in `INTERVENTION_WAITING` until an operator decides.
    Intervene {
        timeout_ms: Option<u64>,
        on_timeout: TimeoutAction,
    },
    /// Fallback for a failure no adviser handled: the node stays `FAILED`
    /// and its branch ends, but the rest of the run is left alone.
    EndBranch,
}

impl Advise {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Proceed => "proceed",
            Self::Retry { .. } => "retry",
            Self::Ignore => "ignore",
            Self::MarkSuccess => "mark_success",
            Self::Abort => "abort",
            Self::Intervene { .. } => "intervene",
            Self::EndBranch => "end_branch",
        }
    }
}

impl ExhaustedAction {
    pub fn into_advise(self) -> Advise {
        match self {
            Self::Fail => Advise::EndBranch,
            Self::Ignore => Advise::Ignore,
            Self::AbortPlan => Advise::Abort,
        }
    }
}

impl TimeoutAction {
    pub fn into_advise(self) -> Advise {
        match self {
            Self::Fail => Advise::EndBranch,
            Self::Ignore => Advise::Ignore,
            Self::MarkSuccess => Advise::MarkSuccess,
            Self::AbortPlan => Advise::Abort,
        }
    }
}

/// An operator's answer to a manual intervention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterventionDecision {
    Retry,
    MarkSuccess,
    Ignore,
    MarkFailed,
    AbortPlan,
}

impl InterventionDecision {
    /// `None` for `Retry`: a retry ordered by an operator does not count
    /// against any retry budget.
    pub fn into_advise(self) -> Option<Advise> {
        match self {
            Self::Retry => None,
            Self::MarkSuccess => Some(Advise::MarkSuccess),
            Self::Ignore => Some(Advise::Ignore),
            Self::MarkFailed => Some(Advise::EndBranch),
            Self::AbortPlan => Some(Advise::Abort),
        }
    }
}

/// Pure decision function for one adviser kind. `None` means the adviser
/// does not apply to this status or failure.
pub trait Adviser: Send + Sync {
    fn advise(
        &self,
        config: &AdviserConfig,
        node: &PlanNode,
        status: Status,
        failure: Option<&FailureInfo>,
    ) -> Option<Advise>;
}

/// Failure advisers apply to `FAILED` nodes whose failure kind is in the
/// filter; an empty filter matches every kind.
fn applies_to_failure(status: Status, failure: Option<&FailureInfo>, kinds: &[FailureKind]) -> bool {
    if status != Status::Failed {
        return false;
    }
    kinds.is_empty() || failure.is_some_and(|f| kinds.contains(&f.kind))
}

pub struct RetryAdviser;

impl Adviser for RetryAdviser {
    fn advise(
        &self,
        config: &AdviserConfig,
        _node: &PlanNode,
        status: Status,
        failure: Option<&FailureInfo>,
    ) -> Option<Advise> {
        let AdviserConfig::Retry {
            max_retries,
            wait_before_retry_ms,
            on_failure_kinds,
            on_exhausted,
        } = config
        else {
            return None;
        };
        applies_to_failure(status, failure, on_failure_kinds).then_some(Advise::Retry {
            wait_before_retry_ms: *wait_before_retry_ms,
            max_retries: *max_retries,
            on_exhausted: *on_exhausted,
        })
    }
}

pub struct IgnoreAdviser;

impl Adviser for IgnoreAdviser {
    fn advise(
        &self,
        config: &AdviserConfig,
        _node: &PlanNode,
        status: Status,
        failure: Option<&FailureInfo>,
    ) -> Option<Advise> {
        let AdviserConfig::Ignore { on_failure_kinds } = config else {
            return None;
        };
        applies_to_failure(status, failure, on_failure_kinds).then_some(Advise::Ignore)
    }
}

pub struct MarkSuccessAdviser;

impl Adviser for MarkSuccessAdviser {
    fn advise(
        &self,
        config: &AdviserConfig,
        _node: &PlanNode,
        status: Status,
        failure: Option<&FailureInfo>,
    ) -> Option<Advise> {
        let AdviserConfig::MarkSuccess { on_failure_kinds } = config else {
            return None;
        };
        applies_to_failure(status, failure, on_failure_kinds).then_some(Advise::MarkSuccess)
    }
}

pub struct AbortPlanAdviser;

impl Adviser for AbortPlanAdviser {
    fn advise(
        &self,
        config: &AdviserConfig,
        _node: &PlanNode,
        status: Status,
        failure: Option<&FailureInfo>,
    ) -> Option<Advise> {
        let AdviserConfig::AbortPlan { on_failure_kinds } = config else {
            return None;
        };
        applies_to_failure(status, failure, on_failure_kinds).then_some(Advise::Abort)
    }
}

pub struct ManualInterventionAdviser;

impl Adviser for ManualInterventionAdviser {
    fn advise(
        &self,
        config: &AdviserConfig,
        _node: &PlanNode,
        status: Status,
        _failure: Option<&FailureInfo>,
    ) -> Option<Advise> {
        let AdviserConfig::ManualIntervention { timeout_ms, on_timeout } = config else {
            return None;
        };
        (status == Status::Failed).then_some(Advise::Intervene {
            timeout_ms: *timeout_ms,
            on_timeout: *on_timeout,
        })
    }
}

pub struct ProceedAdviser;

impl Adviser for ProceedAdviser {
    fn advise(
        &self,
        _config: &AdviserConfig,
        _node: &PlanNode,
        _status: Status,
        _failure: Option<&FailureInfo>,
    ) -> Option<Advise> {
        Some(Advise::Proceed)
    }
}

/// Adviser kind to adviser, plus the chain evaluation.
#[derive(Clone, Default)]
pub struct AdviserRegistry {
    advisers: HashMap<AdviserKind, Arc<dyn Adviser>>,
}

impl AdviserRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtins() -> Self {
        Self::new()
            .register(AdviserKind::Retry, Arc::new(RetryAdviser))
            .register(AdviserKind::Ignore, Arc::new(IgnoreAdviser))
            .register(AdviserKind::MarkSuccess, Arc::new(MarkSuccessAdviser))
            .register(AdviserKind::AbortPlan, Arc::new(AbortPlanAdviser))
            .register(AdviserKind::ManualIntervention, Arc::new(ManualInterventionAdviser))
            .register(AdviserKind::Proceed, Arc::new(ProceedAdviser))
    }

    pub fn register(mut self, kind: AdviserKind, adviser: Arc<dyn Adviser>) -> Self {
        self.advisers.insert(kind, adviser);
        self
    }

    pub fn get(&self, kind: AdviserKind) -> Option<Arc<dyn Adviser>> {
        self.advisers.get(&kind).cloned()
    }

    /// Run the node's adviser chain for a terminal status.
    ///
    /// With nothing applicable, success proceeds and failure ends the branch.
    /// An explicit `Proceed` on a failed node continues the plan past it.
    /// A missing adviser is an engine error: the chain cannot be trusted.
    pub fn evaluate(
        &self,
        node: &PlanNode,
        status: Status,
        failure: Option<&FailureInfo>,
    ) -> EngineResult<Advise> {
        let mut proceed = false;
        for config in &node.advisers {
            let adviser = self.get(config.kind()).ok_or_else(|| {
                EngineError::internal(format!(
                    "no adviser registered for {:?} on node {}",
                    config.kind(),
                    node.id
                ))
            })?;
            match adviser.advise(config, node, status, failure) {
                Some(Advise::Proceed) => proceed = true,
                Some(advise) => return Ok(advise),
                None => {}
            }
        }

        if status == Status::Failed && !proceed {
            Ok(Advise::EndBranch)
        } else {
            Ok(Advise::Proceed)
        }
    }
}
