//! The node execution state machine.
//!
//! The engine walks a plan one node execution at a time. Every node runs on
//! its own tokio task; transitions of one node are serialized by a per-node
//! lock and every continuation reloads the record first, dropping out if the
//! node already reached a terminal status. Suspensions go through the
//! correlator, so a resumption is driven by the durable wait record and can
//! happen in a different process than the one that suspended.

mod abort;
mod advise;
mod recover;
mod runner;

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{RwLock, watch};
use tracing::{info, warn};

use crate::adviser::{AdviserRegistry, InterventionDecision};
use crate::config::EngineConfig;
use crate::correlator::{NotifyOutcome, ResumeHandler, ResumeResult, WaitInstance, WaitNotifyCorrelator};
use crate::db::ExecutionStore;
use crate::dispatcher::TaskDispatcher;
use crate::error::{EngineError, EngineResult};
use crate::facilitator::FacilitatorRegistry;
use crate::model::{NodeExecution, RunOutcome, RunRecord, RunStatus};
use crate::plan::{Ambiance, Plan};
use crate::resource::ResourceConstraintManager;
use crate::steps::{StepExecutor, StepRegistry};
use crate::types::{NodeExecutionId, ResumeKey, RunId};
use crate::utils::KeyedLocks;

pub use recover::SweepReport;

/// In-memory view of a live run.
struct RunContext {
    plan: Arc<Plan>,
    outcome: watch::Sender<Option<RunOutcome>>,
    aborting: AtomicBool,
}

impl RunContext {
    fn is_aborting(&self) -> bool {
        self.aborting.load(Ordering::SeqCst)
    }
}

/// Handle to a started run.
pub struct RunHandle {
    run_id: RunId,
    outcome: watch::Receiver<Option<RunOutcome>>,
}

impl RunHandle {
    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    /// The outcome, if the run already finished.
    pub fn outcome(&self) -> Option<RunOutcome> {
        self.outcome.borrow().clone()
    }

    /// Wait until the run reaches `SUCCEEDED`, `FAILED` or `ABORTED`.
    pub async fn wait(mut self) -> EngineResult<RunOutcome> {
        let outcome = self
            .outcome
            .wait_for(Option::is_some)
            .await
            .map_err(|_| EngineError::internal("engine dropped before the run finished"))?;
        outcome
            .clone()
            .ok_or_else(|| EngineError::internal("run finished without an outcome"))
    }
}

pub struct EngineBuilder {
    store: Arc<dyn ExecutionStore>,
    task_ttl_ms: u64,
    extra_steps: Vec<(String, Arc<dyn StepExecutor>)>,
    facilitators: FacilitatorRegistry,
    advisers: AdviserRegistry,
}

impl EngineBuilder {
    pub fn new(store: Arc<dyn ExecutionStore>) -> Self {
        Self {
            store,
            task_ttl_ms: EngineConfig::DEFAULT_TASK_TTL_MS,
            extra_steps: Vec::new(),
            facilitators: FacilitatorRegistry::with_builtins(),
            advisers: AdviserRegistry::with_builtins(),
        }
    }

    pub fn with_config(mut self, config: &EngineConfig) -> Self {
        self.task_ttl_ms = config.default_task_ttl_ms;
        self
    }

    pub fn task_ttl_ms(mut self, ttl_ms: u64) -> Self {
        self.task_ttl_ms = ttl_ms;
        self
    }

    /// Register a step type on top of the built-ins.
    pub fn step(mut self, step_type: impl Into<String>, executor: Arc<dyn StepExecutor>) -> Self {
        self.extra_steps.push((step_type.into(), executor));
        self
    }

    pub fn facilitators(mut self, registry: FacilitatorRegistry) -> Self {
        self.facilitators = registry;
        self
    }

    pub fn advisers(mut self, registry: AdviserRegistry) -> Self {
        self.advisers = registry;
        self
    }

    pub fn build(self) -> Arc<Engine> {
        let correlator = Arc::new(WaitNotifyCorrelator::new(self.store.clone()));
        let dispatcher = Arc::new(TaskDispatcher::new(
            self.store.clone(),
            correlator.clone(),
            self.task_ttl_ms,
        ));
        let resources = Arc::new(ResourceConstraintManager::new(
            self.store.clone(),
            correlator.clone(),
        ));

        let mut steps = StepRegistry::with_builtins(dispatcher.clone());
        for (name, executor) in self.extra_steps {
            steps = steps.register(name, executor);
        }

        let engine = Arc::new_cyclic(|weak| Engine {
            store: self.store,
            correlator: correlator.clone(),
            dispatcher,
            resources,
            steps,
            facilitators: self.facilitators,
            advisers: self.advisers,
            node_locks: KeyedLocks::new(),
            run_locks: KeyedLocks::new(),
            runs: RwLock::new(HashMap::new()),
            this: weak.clone(),
        });

        let handler: Weak<dyn ResumeHandler> = Arc::downgrade(&engine) as Weak<dyn ResumeHandler>;
        correlator.bind(handler);
        engine
    }
}

pub struct Engine {
    store: Arc<dyn ExecutionStore>,
    correlator: Arc<WaitNotifyCorrelator>,
    dispatcher: Arc<TaskDispatcher>,
    resources: Arc<ResourceConstraintManager>,
    steps: StepRegistry,
    facilitators: FacilitatorRegistry,
    advisers: AdviserRegistry,
    node_locks: KeyedLocks,
    run_locks: KeyedLocks,
    runs: RwLock<HashMap<RunId, Arc<RunContext>>>,
    this: Weak<Engine>,
}

impl Engine {
    pub fn builder(store: Arc<dyn ExecutionStore>) -> EngineBuilder {
        EngineBuilder::new(store)
    }

    pub fn store(&self) -> &Arc<dyn ExecutionStore> {
        &self.store
    }

    pub fn correlator(&self) -> &Arc<WaitNotifyCorrelator> {
        &self.correlator
    }

    pub fn dispatcher(&self) -> &Arc<TaskDispatcher> {
        &self.dispatcher
    }

    pub fn resources(&self) -> &Arc<ResourceConstraintManager> {
        &self.resources
    }

    /// Validate and persist the plan, then launch its start node.
    pub async fn start_run(
        &self,
        plan: Plan,
        setup_abstractions: BTreeMap<String, String>,
    ) -> EngineResult<RunHandle> {
        plan.validate()?;

        let run_id = RunId::generate();
        self.store.save_plan(&run_id, &plan).await?;
        self.store
            .save_run(&RunRecord {
                run_id: run_id.clone(),
                plan_id: plan.plan_id.clone(),
                status: RunStatus::Running,
                failure: None,
                started_at: chrono::Utc::now(),
                finished_at: None,
            })
            .await?;

        let start = plan.start_node_id.clone();
        let (tx, rx) = watch::channel(None);
        let context = Arc::new(RunContext {
            plan: Arc::new(plan),
            outcome: tx,
            aborting: AtomicBool::new(false),
        });
        self.runs.write().await.insert(run_id.clone(), context);

        info!(run_id = %run_id, start = %start, "Run started");
        let root = Ambiance::new(run_id.clone(), setup_abstractions);
        self.launch(runner::Launch {
            id: NodeExecutionId::generate(),
            plan_node_id: start,
            base: root,
            nested: true,
            parent_id: None,
            branch_key: None,
            inputs: serde_json::Value::Null,
        })
        .await?;

        Ok(RunHandle {
            run_id,
            outcome: rx,
        })
    }

    /// Subscribe to a run's outcome, loading it from the store if needed.
    pub async fn watch_run(&self, run_id: &RunId) -> EngineResult<RunHandle> {
        let context = self.context(run_id).await?;
        Ok(RunHandle {
            run_id: run_id.clone(),
            outcome: context.outcome.subscribe(),
        })
    }

    /// Resolve a node parked in `INTERVENTION_WAITING`.
    pub async fn intervene(
        &self,
        node_execution_id: &NodeExecutionId,
        decision: InterventionDecision,
    ) -> EngineResult<()> {
        let key = ResumeKey::for_intervention(node_execution_id);
        match self
            .correlator
            .notify(&key, ResumeResult::Decision { decision })
            .await?
        {
            NotifyOutcome::Delivered => {
                info!(node_execution_id = %node_execution_id, ?decision, "Intervention resolved");
                Ok(())
            }
            NotifyOutcome::NotWaiting => Err(EngineError::InvalidTransition(format!(
                "node execution {} is not waiting for intervention",
                node_execution_id
            ))),
        }
    }

    pub async fn node_executions(&self, run_id: &RunId) -> EngineResult<Vec<NodeExecution>> {
        self.store.list_node_executions(run_id).await
    }

    pub async fn node_execution(&self, id: &NodeExecutionId) -> EngineResult<Option<NodeExecution>> {
        self.store.load_node_execution(id).await
    }

    pub async fn run_outcome(&self, run_id: &RunId) -> EngineResult<Option<RunOutcome>> {
        Ok(self.store.load_run(run_id).await?.as_ref().map(RunOutcome::from))
    }

    pub async fn plan(&self, run_id: &RunId) -> EngineResult<Option<Plan>> {
        self.store.load_plan(run_id).await
    }

    /// Live context for a run, rebuilt from the store after a restart.
    async fn context(&self, run_id: &RunId) -> EngineResult<Arc<RunContext>> {
        if let Some(context) = self.runs.read().await.get(run_id) {
            return Ok(context.clone());
        }

        let _guard = self.run_locks.lock(run_id.as_str()).await;
        if let Some(context) = self.runs.read().await.get(run_id) {
            return Ok(context.clone());
        }
        let plan = self
            .store
            .load_plan(run_id)
            .await?
            .ok_or_else(|| EngineError::not_found(format!("plan for run {}", run_id)))?;
        let record = self
            .store
            .load_run(run_id)
            .await?
            .ok_or_else(|| EngineError::not_found(format!("run {}", run_id)))?;
        let finished = record.status.is_finished();
        let (tx, _) = watch::channel(finished.then(|| RunOutcome::from(&record)));

        // Finished runs are served from the store and never cached again.
        if finished {
            return Ok(Arc::new(RunContext {
                plan: Arc::new(plan),
                outcome: tx,
                aborting: AtomicBool::new(true),
            }));
        }

        let mut runs = self.runs.write().await;
        let context = runs
            .entry(run_id.clone())
            .or_insert_with(|| {
                Arc::new(RunContext {
                    plan: Arc::new(plan),
                    outcome: tx,
                    aborting: AtomicBool::new(false),
                })
            })
            .clone();
        Ok(context)
    }

    /// Number of runs with a live in-memory context.
    pub async fn live_runs(&self) -> usize {
        self.runs.read().await.len()
    }

    fn arc(&self) -> Option<Arc<Engine>> {
        self.this.upgrade()
    }
}

#[async_trait]
impl ResumeHandler for Engine {
    /// Hands the resumption to a fresh task so the correlator's key lock is
    /// released right away.
    async fn resume(&self, wait: WaitInstance, result: ResumeResult) {
        let Some(engine) = self.arc() else {
            warn!(resume_key = %wait.resume_key, "Engine is shutting down, resumption dropped");
            return;
        };
        tokio::spawn(async move {
            let waiter = wait.waiter_id.clone();
            let next = match engine.on_resume(wait, result).await {
                Ok(next) => next,
                Err(e) => engine.fail_internal(&waiter, e).await,
            };
            engine.drive(next).await;
        });
    }
}
