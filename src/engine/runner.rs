use chrono::Utc;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::Engine;
use crate::adviser::Advise;
use crate::correlator::{BranchOutcome, ResumeResult, WaitInstance, WaitPurpose};
use crate::dispatcher::TaskRequest;
use crate::error::{EngineError, EngineResult};
use crate::facilitator::ExecutableResponse;
use crate::model::{FailureInfo, FailureKind, NodeExecution, Status};
use crate::plan::{Ambiance, AdviserConfig, ChildrenPolicy, FacilitatorConfig, Level, Plan, PlanNode, TimeoutAction};
use crate::resource::AcquireOutcome;
use crate::steps::{StepContext, StepExecutor};
use crate::types::{NodeExecutionId, PlanNodeId, ResourceKey, ResumeKey, TaskId};
use crate::utils::{KeyedGuard, deadline_after};

/// A node execution about to be created.
pub(super) struct Launch {
    pub id: NodeExecutionId,
    pub plan_node_id: PlanNodeId,
    /// Ambiance of the node this one nests under (`nested`) or follows.
    pub base: Ambiance,
    pub nested: bool,
    pub parent_id: Option<NodeExecutionId>,
    pub branch_key: Option<ResumeKey>,
    pub inputs: Value,
}

/// What has to happen once the node lock is released.
pub(super) enum Next {
    Idle,
    /// The node reached a terminal status; consult its advisers.
    Advise(NodeExecution),
    /// A decision was already made (intervention outcome).
    Apply(NodeExecution, Advise),
}

fn suspension_deadline(node: &PlanNode) -> Option<chrono::DateTime<Utc>> {
    node.timeout_ms.map(|ms| deadline_after(Utc::now(), ms))
}

fn step_context(ne: &NodeExecution, node: &PlanNode) -> StepContext {
    StepContext {
        node_execution_id: ne.id.clone(),
        plan_node_id: ne.plan_node_id.clone(),
        step_type: node.step_type.clone(),
        parameters: node.parameters.clone(),
        inputs: ne.inputs.clone(),
        ambiance: ne.ambiance.clone(),
        attempt: ne.retry_count,
    }
}

/// Runs the step on its own task so a panic becomes a failure instead of
/// taking the engine down.
async fn run_sync_step(
    step: Arc<dyn StepExecutor>,
    ctx: StepContext,
    timeout_ms: Option<u64>,
) -> Result<Value, FailureInfo> {
    let mut handle = tokio::spawn(async move { step.execute(&ctx).await });
    let joined = match timeout_ms {
        Some(ms) => match tokio::time::timeout(Duration::from_millis(ms), &mut handle).await {
            Ok(joined) => joined,
            Err(_) => {
                handle.abort();
                return Err(FailureInfo::timeout(format!("step did not finish within {} ms", ms)));
            }
        },
        None => handle.await,
    };

    match joined {
        Ok(Ok(outcome)) => Ok(outcome),
        Ok(Err(e)) => Err(FailureInfo::new(FailureKind::StepExecution, e.message)),
        Err(e) => Err(FailureInfo::internal(format!("step task failed: {}", e))),
    }
}

impl Engine {
    /// Persist a new node execution and schedule it.
    pub(super) async fn launch(&self, launch: Launch) -> EngineResult<()> {
        let context = self.context(&launch.base.run_id).await?;
        if context.is_aborting() {
            debug!(run_id = %launch.base.run_id, node = %launch.plan_node_id, "Run is halting, not launching");
            return Ok(());
        }

        let node = context.plan.require_node(&launch.plan_node_id)?;
        let level = Level {
            plan_node_id: launch.plan_node_id.clone(),
            node_execution_id: launch.id.clone(),
            step_type: node.step_type.clone(),
            attempt: 0,
        };
        let ambiance = if launch.nested {
            launch.base.for_child(level)
        } else {
            launch.base.for_sibling(level)
        };

        let execution = NodeExecution::new(
            launch.id,
            launch.plan_node_id,
            ambiance,
            launch.parent_id,
            launch.branch_key,
            launch.inputs,
        );
        self.store.save_node_execution(&execution).await?;
        debug!(
            node_execution_id = %execution.id,
            node = %execution.plan_node_id,
            path = %execution.ambiance.fqn(),
            "Node execution created"
        );

        self.spawn_begin(execution.id, None);
        Ok(())
    }

    pub(super) fn spawn_begin(&self, id: NodeExecutionId, delay: Option<Duration>) {
        let Some(engine) = self.arc() else {
            return;
        };
        tokio::spawn(async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            let next = match engine.begin(&id).await {
                Ok(next) => next,
                Err(e) => engine.fail_internal(&id, e).await,
            };
            engine.drive(next).await;
        });
    }

    async fn load(&self, id: &NodeExecutionId) -> EngineResult<NodeExecution> {
        self.store
            .load_node_execution(id)
            .await?
            .ok_or_else(|| EngineError::not_found(format!("node execution {}", id)))
    }

    /// Start (or restart, after a retry) a queued node: skip check, resource
    /// permit, then the attempt itself.
    pub(super) async fn begin(&self, id: &NodeExecutionId) -> EngineResult<Next> {
        let guard = self.node_locks.lock(id.as_str()).await;
        let mut ne = self.load(id).await?;
        if !matches!(ne.status, Status::Queued | Status::Suspended) {
            debug!(node_execution_id = %id, status = %ne.status, "Node already started");
            return Ok(Next::Idle);
        }

        let context = self.context(&ne.run_id).await?;
        if context.is_aborting() {
            self.mark_aborted(&mut ne, "run aborted").await?;
            return Ok(Next::Idle);
        }
        let plan = context.plan.clone();
        let node = plan.require_node(&ne.plan_node_id)?;

        if let Some(condition) = &node.skip_condition {
            if condition.matches(&ne.ambiance) {
                ne.transition(Status::Skipped);
                self.store.save_node_execution(&ne).await?;
                info!(node_execution_id = %ne.id, node = %ne.plan_node_id, "Node skipped");
                return Ok(Next::Advise(ne));
            }
        }

        if let Some(constraint) = &node.resource_constraint {
            if ne.held_permit.is_none() {
                let key = ResourceKey::new(constraint.resource_key.as_str());
                let deadline = constraint
                    .acquire_timeout_ms
                    .map(|ms| deadline_after(Utc::now(), ms));
                match self
                    .resources
                    .acquire(&key, constraint.capacity, &ne.id, &ne.run_id, deadline)
                    .await?
                {
                    AcquireOutcome::Granted => ne.held_permit = Some(key),
                    AcquireOutcome::Queued => {
                        info!(node_execution_id = %ne.id, resource = %key, "Node waiting for resource");
                        ne.awaiting_permit = Some(key);
                        ne.updated_at = Utc::now();
                        self.store.save_node_execution(&ne).await?;
                        return Ok(Next::Idle);
                    }
                }
            }
        }

        self.run_attempt(guard, ne, plan).await
    }

    /// `RUNNING`: ask the facilitator how to execute and act on its answer.
    async fn run_attempt(
        &self,
        guard: KeyedGuard,
        mut ne: NodeExecution,
        plan: Arc<Plan>,
    ) -> EngineResult<Next> {
        let node = plan.require_node(&ne.plan_node_id)?;
        ne.transition(Status::Running);
        ne.awaiting_permit = None;
        self.store.save_node_execution(&ne).await?;
        info!(
            node_execution_id = %ne.id,
            node = %node.display_name(),
            attempt = ne.retry_count,
            "Node running"
        );

        let kind = node.facilitator.kind();
        let Some(facilitator) = self.facilitators.get(kind) else {
            let failure = FailureInfo::new(
                FailureKind::Unresolved,
                format!("no facilitator registered for {:?}", kind),
            );
            return self.complete_attempt(ne, Err(failure)).await;
        };
        let response = match facilitator.facilitate(node, &ne.ambiance) {
            Ok(response) => response,
            Err(e) => return self.complete_attempt(ne, Err(FailureInfo::internal(e.to_string()))).await,
        };

        match response {
            ExecutableResponse::Sync => {
                let step = match self.resolve_step(node) {
                    Ok(step) => step,
                    Err(failure) => return self.complete_attempt(ne, Err(failure)).await,
                };
                let ctx = step_context(&ne, node);
                let attempt = ne.retry_count;
                drop(guard);

                let result = run_sync_step(step, ctx, node.timeout_ms).await;

                let _guard = self.node_locks.lock(ne.id.as_str()).await;
                let current = self.load(&ne.id).await?;
                if current.status != Status::Running || current.retry_count != attempt {
                    info!(node_execution_id = %ne.id, status = %current.status, "Step result discarded");
                    return Ok(Next::Idle);
                }
                self.complete_attempt(current, result).await
            }

            ExecutableResponse::Async { keys } => {
                let step = match self.resolve_step(node) {
                    Ok(step) => step,
                    Err(failure) => return self.complete_attempt(ne, Err(failure)).await,
                };
                let deadline = suspension_deadline(node);
                for key in &keys {
                    match self
                        .correlator
                        .register(key.clone(), ne.id.clone(), ne.run_id.clone(), WaitPurpose::AsyncResponse, deadline)
                        .await
                    {
                        Ok(_) => {
                            ne.pending_keys.insert(key.clone());
                        }
                        Err(EngineError::DuplicateKey(key)) => {
                            let failure = FailureInfo::new(
                                FailureKind::DuplicateKey,
                                format!("resume key {} is already registered", key),
                            );
                            return self.complete_attempt(ne, Err(failure)).await;
                        }
                        Err(e) => return Err(e),
                    }
                }
                ne.transition(Status::AsyncWaiting);
                self.store.save_node_execution(&ne).await?;
                info!(node_execution_id = %ne.id, keys = ?keys, "Node suspended for async results");

                if let Err(e) = step.start_async(&step_context(&ne, node), &keys).await {
                    let failure = FailureInfo::new(FailureKind::StepExecution, e.message);
                    return self.complete_attempt(ne, Err(failure)).await;
                }
                Ok(Next::Idle)
            }

            ExecutableResponse::Children { children, .. } => {
                let mut launches = Vec::with_capacity(children.len());
                let deadline = suspension_deadline(node);
                for child in children {
                    let id = NodeExecutionId::generate();
                    let key = ResumeKey::for_child(&id);
                    self.correlator
                        .register(key.clone(), ne.id.clone(), ne.run_id.clone(), WaitPurpose::ChildBranch, deadline)
                        .await?;
                    ne.children.push(id.clone());
                    ne.pending_keys.insert(key.clone());
                    launches.push(Launch {
                        id,
                        plan_node_id: child.plan_node_id,
                        base: ne.ambiance.clone(),
                        nested: true,
                        parent_id: Some(ne.id.clone()),
                        branch_key: Some(key),
                        inputs: child.inputs,
                    });
                }
                ne.updated_at = Utc::now();
                self.store.save_node_execution(&ne).await?;
                info!(node_execution_id = %ne.id, children = launches.len(), "Node fanned out");

                drop(guard);
                for launch in launches {
                    self.launch(launch).await?;
                }
                Ok(Next::Idle)
            }

            ExecutableResponse::TaskChain { next } => {
                if let Some(failure) = self.queue_chain_task(&mut ne, node, next).await? {
                    return self.complete_attempt(ne, Err(failure)).await;
                }
                ne.transition(Status::AsyncWaiting);
                self.store.save_node_execution(&ne).await?;
                Ok(Next::Idle)
            }
        }
    }

    fn resolve_step(&self, node: &PlanNode) -> Result<Arc<dyn StepExecutor>, FailureInfo> {
        self.steps.get(&node.step_type).ok_or_else(|| {
            FailureInfo::new(
                FailureKind::Unresolved,
                format!("no step registered for type {}", node.step_type),
            )
        })
    }

    /// Register the wait first, then queue, so an instant completion finds
    /// its waiter.
    async fn queue_chain_task(
        &self,
        ne: &mut NodeExecution,
        node: &PlanNode,
        mut request: TaskRequest,
    ) -> EngineResult<Option<FailureInfo>> {
        let task_id = request.task_id.get_or_insert_with(TaskId::generate).clone();
        request.owner = Some(ne.id.clone());
        let key = ResumeKey::for_task(&task_id);

        match self
            .correlator
            .register(key.clone(), ne.id.clone(), ne.run_id.clone(), WaitPurpose::TaskChain, suspension_deadline(node))
            .await
        {
            Ok(_) => {}
            Err(EngineError::DuplicateKey(key)) => {
                return Ok(Some(FailureInfo::new(
                    FailureKind::DuplicateKey,
                    format!("resume key {} is already registered", key),
                )));
            }
            Err(e) => return Err(e),
        }
        ne.pending_keys.insert(key.clone());
        ne.task_ids.push(task_id.clone());

        if let Err(e) = self.dispatcher.queue(request).await {
            self.correlator.cancel(&key).await?;
            ne.pending_keys.remove(&key);
            let kind = match e {
                EngineError::DuplicateKey(_) => FailureKind::DuplicateKey,
                _ => FailureKind::EngineInternal,
            };
            return Ok(Some(FailureInfo::new(kind, e.to_string())));
        }
        info!(
            node_execution_id = %ne.id,
            task_id = %task_id,
            position = ne.task_chain_index,
            "Chain task queued"
        );
        Ok(None)
    }

    /// Record the terminal status of an attempt and give back whatever the
    /// attempt still holds. Caller holds the node lock.
    pub(super) async fn complete_attempt(
        &self,
        mut ne: NodeExecution,
        result: Result<Value, FailureInfo>,
    ) -> EngineResult<Next> {
        match result {
            Ok(outcome) => {
                ne.outcome = Some(outcome);
                ne.transition(Status::Succeeded);
            }
            Err(failure) => {
                self.correlator.cancel_for_waiter(&ne.id).await?;
                ne.pending_keys.clear();
                self.dispatcher.abort_for_owner(&ne.id).await?;
                ne.failure = Some(failure.at(&ne.plan_node_id, &ne.id));
                ne.transition(Status::Failed);
            }
        }

        if let Some(key) = ne.awaiting_permit.take() {
            self.resources.cancel_waiter(&key, &ne.id).await?;
        }
        ne.held_permit = None;
        self.store.save_node_execution(&ne).await?;
        self.resources.release_all_for_holder(&ne.id).await?;

        match &ne.failure {
            Some(failure) if ne.status == Status::Failed => {
                warn!(node_execution_id = %ne.id, node = %ne.plan_node_id, failure = %failure, "Node failed");
            }
            _ => info!(node_execution_id = %ne.id, node = %ne.plan_node_id, status = %ne.status, "Node finished"),
        }
        Ok(Next::Advise(ne))
    }

    /// Turn an engine error into a failed attempt so the advisers still run.
    pub(super) async fn fail_internal(&self, id: &NodeExecutionId, err: EngineError) -> Next {
        error!(node_execution_id = %id, error = %err, "Engine error while executing node");
        let _guard = self.node_locks.lock(id.as_str()).await;
        let ne = match self.store.load_node_execution(id).await {
            Ok(Some(ne)) if !ne.status.is_terminal() => ne,
            Ok(_) => return Next::Idle,
            Err(e) => {
                error!(node_execution_id = %id, error = %e, "Could not load node to record failure");
                return Next::Idle;
            }
        };
        match self
            .complete_attempt(ne, Err(FailureInfo::internal(err.to_string())))
            .await
        {
            Ok(next) => next,
            Err(e) => {
                error!(node_execution_id = %id, error = %e, "Could not record node failure");
                Next::Idle
            }
        }
    }

    /// Continue a node from a delivered result.
    pub(super) async fn on_resume(&self, wait: WaitInstance, result: ResumeResult) -> EngineResult<Next> {
        let guard = self.node_locks.lock(wait.waiter_id.as_str()).await;
        let Some(mut ne) = self.store.load_node_execution(&wait.waiter_id).await? else {
            warn!(resume_key = %wait.resume_key, waiter = %wait.waiter_id, "Resumption for unknown node");
            return Ok(Next::Idle);
        };
        let context = self.context(&ne.run_id).await?;

        if ne.status.is_terminal() || context.is_aborting() {
            if result == ResumeResult::PermitGranted {
                self.resources.release_all_for_holder(&ne.id).await?;
            }
            info!(
                node_execution_id = %ne.id,
                resume_key = %wait.resume_key,
                status = %ne.status,
                "Resumption for finished node ignored"
            );
            return Ok(Next::Idle);
        }

        let expected = match wait.purpose {
            WaitPurpose::ResourcePermit => matches!(ne.status, Status::Queued | Status::Suspended),
            WaitPurpose::AsyncResponse | WaitPurpose::TaskChain => ne.status == Status::AsyncWaiting,
            WaitPurpose::ChildBranch => ne.status == Status::Running,
            WaitPurpose::Intervention => ne.status == Status::InterventionWaiting,
        };
        if !expected {
            warn!(
                node_execution_id = %ne.id,
                resume_key = %wait.resume_key,
                status = %ne.status,
                purpose = ?wait.purpose,
                "Resumption does not match node status, ignored"
            );
            return Ok(Next::Idle);
        }

        let plan = context.plan.clone();
        let node = plan.require_node(&ne.plan_node_id)?;
        let key = wait.resume_key;
        debug!(node_execution_id = %ne.id, resume_key = %key, "Node resumed");

        match (wait.purpose, result) {
            (WaitPurpose::ResourcePermit, ResumeResult::PermitGranted) => {
                ne.held_permit = ne.awaiting_permit.take();
                self.run_attempt(guard, ne, plan).await
            }
            (WaitPurpose::ResourcePermit, ResumeResult::Timeout) => {
                let failure = FailureInfo::timeout("timed out waiting for a resource permit");
                self.complete_attempt(ne, Err(failure)).await
            }

            (WaitPurpose::AsyncResponse, ResumeResult::Response { payload }) => {
                ne.pending_keys.remove(&key);
                ne.responses.insert(key.into_inner(), payload);
                if !ne.pending_keys.is_empty() {
                    ne.updated_at = Utc::now();
                    self.store.save_node_execution(&ne).await?;
                    return Ok(Next::Idle);
                }
                let outcome = if ne.responses.len() == 1 {
                    ne.responses.values().next().cloned().unwrap_or(Value::Null)
                } else {
                    Value::Object(ne.responses.clone().into_iter().collect::<Map<_, _>>())
                };
                self.complete_attempt(ne, Ok(outcome)).await
            }

            (WaitPurpose::TaskChain, ResumeResult::Response { payload }) => {
                ne.pending_keys.remove(&key);
                ne.responses.insert(key.into_inner(), payload.clone());
                ne.task_chain_index += 1;

                let Some(facilitator) = self.facilitators.get(node.facilitator.kind()) else {
                    let failure = FailureInfo::new(FailureKind::Unresolved, "task chain facilitator missing");
                    return self.complete_attempt(ne, Err(failure)).await;
                };
                match facilitator.next_task(node, &ne.ambiance, ne.task_chain_index) {
                    Ok(Some(request)) => {
                        if let Some(failure) = self.queue_chain_task(&mut ne, node, request).await? {
                            return self.complete_attempt(ne, Err(failure)).await;
                        }
                        ne.updated_at = Utc::now();
                        self.store.save_node_execution(&ne).await?;
                        Ok(Next::Idle)
                    }
                    Ok(None) => self.complete_attempt(ne, Ok(payload)).await,
                    Err(e) => self.complete_attempt(ne, Err(FailureInfo::internal(e.to_string()))).await,
                }
            }

            (WaitPurpose::AsyncResponse | WaitPurpose::TaskChain, ResumeResult::Failure { message }) => {
                let failure = FailureInfo::new(FailureKind::StepExecution, message);
                self.complete_attempt(ne, Err(failure)).await
            }
            (WaitPurpose::AsyncResponse | WaitPurpose::TaskChain, ResumeResult::Timeout) => {
                let failure = FailureInfo::timeout(format!("no result for {} before the deadline", key));
                self.complete_attempt(ne, Err(failure)).await
            }

            (WaitPurpose::ChildBranch, ResumeResult::BranchFinished(outcome)) => {
                self.record_branch(ne, node, key, outcome).await
            }
            (WaitPurpose::ChildBranch, ResumeResult::Timeout) => {
                let Some(child_id) = ne.children.iter().find(|c| ResumeKey::for_child(c) == key).cloned() else {
                    return Err(EngineError::internal(format!("no child owns branch {}", key)));
                };
                let failure = FailureInfo::timeout(format!("child branch {} timed out", child_id));
                self.spawn_abort_branch(ne.run_id.clone(), key.clone(), failure.message.clone());
                let outcome = BranchOutcome {
                    child_id,
                    succeeded: false,
                    failure: Some(failure),
                };
                self.record_branch(ne, node, key, outcome).await
            }

            (WaitPurpose::Intervention, ResumeResult::Decision { decision }) => {
                ne.status = Status::Failed;
                ne.updated_at = Utc::now();
                match decision.into_advise() {
                    Some(advise) => {
                        self.store.save_node_execution(&ne).await?;
                        Ok(Next::Apply(ne, advise))
                    }
                    None => {
                        self.restart_attempt(&mut ne).await?;
                        Ok(Next::Idle)
                    }
                }
            }
            (WaitPurpose::Intervention, ResumeResult::Timeout) => {
                let on_timeout = node
                    .advisers
                    .iter()
                    .find_map(|a| match a {
                        AdviserConfig::ManualIntervention { on_timeout, .. } => Some(*on_timeout),
                        _ => None,
                    })
                    .unwrap_or(TimeoutAction::Fail);
                info!(node_execution_id = %ne.id, ?on_timeout, "Intervention timed out");
                ne.status = Status::Failed;
                ne.updated_at = Utc::now();
                self.store.save_node_execution(&ne).await?;
                Ok(Next::Apply(ne, on_timeout.into_advise()))
            }

            (purpose, result) => Err(EngineError::internal(format!(
                "unexpected {:?} result for a {:?} wait",
                result, purpose
            ))),
        }
    }

    async fn record_branch(
        &self,
        mut ne: NodeExecution,
        node: &PlanNode,
        key: ResumeKey,
        outcome: BranchOutcome,
    ) -> EngineResult<Next> {
        debug!(
            node_execution_id = %ne.id,
            branch = %key,
            succeeded = outcome.succeeded,
            "Child branch finished"
        );
        ne.pending_keys.remove(&key);
        ne.responses.insert(key.into_inner(), serde_json::to_value(&outcome)?);
        if !ne.pending_keys.is_empty() {
            ne.updated_at = Utc::now();
            self.store.save_node_execution(&ne).await?;
            return Ok(Next::Idle);
        }
        let result = aggregate_children(&ne, node)?;
        self.complete_attempt(ne, result).await
    }

    /// Archive the failed attempt and schedule the next one right away.
    /// Caller holds the node lock.
    pub(super) async fn restart_attempt(&self, ne: &mut NodeExecution) -> EngineResult<()> {
        ne.begin_retry();
        ne.ambiance = ne.ambiance.with_attempt(ne.retry_count);
        self.store.save_node_execution(ne).await?;
        info!(node_execution_id = %ne.id, attempt = ne.retry_count, "Node retrying");
        self.spawn_begin(ne.id.clone(), None);
        Ok(())
    }
}

/// Fold child branch outcomes into the parent's result.
fn aggregate_children(ne: &NodeExecution, node: &PlanNode) -> EngineResult<Result<Value, FailureInfo>> {
    let FacilitatorConfig::Children { children, policy } = &node.facilitator else {
        return Err(EngineError::internal(format!("node {} has no children configured", node.id)));
    };

    let mut summary = Map::new();
    let mut failed: Option<(PlanNodeId, BranchOutcome)> = None;
    for (index, child_id) in ne.children.iter().enumerate() {
        let key = ResumeKey::for_child(child_id);
        let outcome: BranchOutcome = match ne.responses.get(key.as_str()) {
            Some(raw) => serde_json::from_value(raw.clone())?,
            None => {
                return Err(EngineError::internal(format!("no outcome recorded for branch {}", key)));
            }
        };
        let config = children.get(index);
        let plan_node_id = config
            .map(|c| c.node_id.clone())
            .unwrap_or_else(|| PlanNodeId::new(child_id.as_str()));
        let required = config.is_none_or(|c| c.required);

        summary.insert(
            plan_node_id.to_string(),
            serde_json::json!({
                "node_execution_id": child_id,
                "succeeded": outcome.succeeded,
            }),
        );
        if !outcome.succeeded
            && required
            && *policy == ChildrenPolicy::FailOnRequiredFailure
            && failed.is_none()
        {
            failed = Some((plan_node_id, outcome));
        }
    }

    Ok(match failed {
        Some((plan_node_id, outcome)) => {
            let failure = FailureInfo::new(
                FailureKind::ChildFailed,
                format!("required child {} failed", plan_node_id),
            );
            Err(match outcome.failure {
                Some(cause) => failure.caused_by(cause),
                None => failure,
            })
        }
        None => Ok(Value::Object(summary)),
    })
}
