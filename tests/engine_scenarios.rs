mod common;

use chrono::Utc;
use common::{
    ConcurrencyGauge, engine, has_status, node, store, wait_for_task, wait_for_task_status, wait_until,
};
use pipeline_engine::adviser::{Adviser, AdviserRegistry, InterventionDecision, RetryAdviser};
use pipeline_engine::correlator::NotifyOutcome;
use pipeline_engine::dispatcher::{EchoTaskHandler, LocalWorker, TaskResult, TaskStatus};
use pipeline_engine::plan::{
    AdviserConfig, AdviserKind, ChildConfig, ChildrenPolicy, FacilitatorConfig, SkipCondition, TaskSpec,
    TimeoutAction,
};
use pipeline_engine::types::{ResourceKey, ResumeKey, TaskId};
use pipeline_engine::{
    Engine, EngineError, ExecutionStore, FailureInfo, FailureKind, NodeExecution, Plan, PlanNode, RunStatus,
    Status,
};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::watch;

fn remote(id: &str, keys: &[&str]) -> PlanNode {
    PlanNode::new(id, "remote")
        .with_parameters(json!({"capabilities": ["docker"], "payload": {"image": "alpine"}}))
        .with_facilitator(FacilitatorConfig::Async {
            keys: keys.iter().map(|k| k.to_string()).collect(),
        })
}

fn failing(id: &str) -> PlanNode {
    PlanNode::new(id, "fail").with_parameters(json!({"message": "exit code 1"}))
}

fn stage(id: &str, children: Vec<ChildConfig>, policy: ChildrenPolicy) -> PlanNode {
    PlanNode::new(id, "stage").with_facilitator(FacilitatorConfig::Children { children, policy })
}

#[tokio::test]
async fn test_linear_plan_runs_in_order() {
    let engine = engine();
    let plan = Plan::new(
        "linear",
        "checkout",
        [PlanNode::new("checkout", "echo").then("build"), PlanNode::new("build", "echo")],
    );

    let outcome = engine.start_run(plan, BTreeMap::new()).await.unwrap().wait().await.unwrap();
    assert_eq!(outcome.status, RunStatus::Succeeded);
    assert!(outcome.failure_chain.is_empty());

    let nodes = engine.node_executions(&outcome.run_id).await.unwrap();
    assert_eq!(nodes.len(), 2);
    let build = node(&nodes, "build");
    assert_eq!(build.status, Status::Succeeded);
    assert_eq!(build.ambiance.depth(), 1);
    assert!(node(&nodes, "checkout").ended_at <= build.started_at);
}

#[tokio::test]
async fn test_async_completion_resumes_node_once() {
    let engine = engine();
    let plan = Plan::new("async", "deploy", [remote("deploy", &["task-42"])]);
    let handle = engine.start_run(plan, BTreeMap::new()).await.unwrap();
    let run_id = handle.run_id().clone();

    wait_until(&engine, &run_id, |n| has_status(n, "deploy", Status::AsyncWaiting)).await;
    let task_id = TaskId::new("task-42");
    assert_eq!(wait_for_task(&engine, &task_id).await.status, TaskStatus::Queued);
    let dispatcher = engine.dispatcher();

    let first = dispatcher
        .complete(&task_id, TaskResult::success(json!({"url": "https://svc"})))
        .await
        .unwrap();
    assert_eq!(first, NotifyOutcome::Delivered);
    let second = dispatcher.complete(&task_id, TaskResult::success(json!({}))).await.unwrap();
    assert_eq!(second, NotifyOutcome::NotWaiting);

    let outcome = handle.wait().await.unwrap();
    assert_eq!(outcome.status, RunStatus::Succeeded);
    let nodes = engine.node_executions(&run_id).await.unwrap();
    assert_eq!(node(&nodes, "deploy").outcome, Some(json!({"url": "https://svc"})));
}

#[tokio::test]
async fn test_remote_failure_fails_node() {
    let engine = engine();
    let plan = Plan::new("async", "deploy", [remote("deploy", &["task-9"])]);
    let handle = engine.start_run(plan, BTreeMap::new()).await.unwrap();
    let run_id = handle.run_id().clone();

    wait_for_task(&engine, &TaskId::new("task-9")).await;
    engine
        .dispatcher()
        .complete(&TaskId::new("task-9"), TaskResult::failure("image pull failed"))
        .await
        .unwrap();

    let outcome = handle.wait().await.unwrap();
    assert_eq!(outcome.status, RunStatus::Failed);
    assert_eq!(outcome.failure_chain[0].kind, FailureKind::StepExecution);
    assert_eq!(outcome.failure_chain[0].message, "image pull failed");
}

#[tokio::test]
async fn test_remote_retry_queues_declared_task_again() {
    let engine = engine();
    let plan = Plan::new(
        "redeploy",
        "deploy",
        [remote("deploy", &["task-42"]).with_adviser(AdviserConfig::retry(2, 0))],
    );
    let handle = engine.start_run(plan, BTreeMap::new()).await.unwrap();
    let run_id = handle.run_id().clone();
    let task_id = TaskId::new("task-42");

    wait_for_task_status(&engine, &task_id, TaskStatus::Queued).await;
    engine
        .dispatcher()
        .complete(&task_id, TaskResult::failure("transient"))
        .await
        .unwrap();

    wait_until(&engine, &run_id, |n| {
        n.iter()
            .any(|ne| ne.retry_count == 1 && ne.status == Status::AsyncWaiting)
    })
    .await;
    let requeued = wait_for_task_status(&engine, &task_id, TaskStatus::Queued).await;
    assert!(requeued.result.is_none());
    let delivered = engine
        .dispatcher()
        .complete(&task_id, TaskResult::success(json!({"ok": true})))
        .await
        .unwrap();
    assert_eq!(delivered, NotifyOutcome::Delivered);

    let outcome = handle.wait().await.unwrap();
    assert_eq!(outcome.status, RunStatus::Succeeded);
    let nodes = engine.node_executions(&run_id).await.unwrap();
    let deploy = node(&nodes, "deploy");
    assert_eq!(deploy.retry_count, 1);
    assert_eq!(deploy.attempts[0].failure.as_ref().unwrap().message, "transient");
}

#[tokio::test]
async fn test_retry_exhausts_after_three_attempts() {
    let engine = engine();
    let plan = Plan::new(
        "retry",
        "flaky",
        [failing("flaky").with_adviser(AdviserConfig::retry(2, 0))],
    );

    let outcome = engine.start_run(plan, BTreeMap::new()).await.unwrap().wait().await.unwrap();
    assert_eq!(outcome.status, RunStatus::Failed);

    let nodes = engine.node_executions(&outcome.run_id).await.unwrap();
    let flaky = node(&nodes, "flaky");
    assert_eq!(flaky.status, Status::Failed);
    assert_eq!(flaky.retry_count, 2);
    assert_eq!(flaky.attempts.len(), 2);
    assert!(flaky.attempts.iter().all(|a| a.status == Status::Failed));
    assert_eq!(flaky.ambiance.attempt(), 2);
}

#[tokio::test]
async fn test_retry_recovers_flaky_step() {
    let engine = engine();
    let plan = Plan::new(
        "retry",
        "flaky",
        [PlanNode::new("flaky", "fail")
            .with_parameters(json!({"fail_times": 2}))
            .with_adviser(AdviserConfig::retry(3, 5))],
    );

    let outcome = engine.start_run(plan, BTreeMap::new()).await.unwrap().wait().await.unwrap();
    assert_eq!(outcome.status, RunStatus::Succeeded);
    let nodes = engine.node_executions(&outcome.run_id).await.unwrap();
    assert_eq!(node(&nodes, "flaky").retry_count, 2);
}

struct CountingRetry {
    calls: AtomicUsize,
}

impl Adviser for CountingRetry {
    fn advise(
        &self,
        config: &AdviserConfig,
        node: &PlanNode,
        status: Status,
        failure: Option<&FailureInfo>,
    ) -> Option<pipeline_engine::adviser::Advise> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        RetryAdviser.advise(config, node, status, failure)
    }
}

#[tokio::test]
async fn test_adviser_consulted_once_per_terminal_status() {
    let counting = Arc::new(CountingRetry {
        calls: AtomicUsize::new(0),
    });
    let engine = Engine::builder(store())
        .advisers(AdviserRegistry::with_builtins().register(AdviserKind::Retry, counting.clone()))
        .build();
    let plan = Plan::new(
        "count",
        "flaky",
        [
            PlanNode::new("flaky", "fail")
                .with_parameters(json!({"fail_times": 2}))
                .with_adviser(AdviserConfig::retry(5, 0))
                .then("after"),
            PlanNode::new("after", "echo"),
        ],
    );

    let outcome = engine.start_run(plan, BTreeMap::new()).await.unwrap().wait().await.unwrap();
    assert_eq!(outcome.status, RunStatus::Succeeded);
    // FAILED, FAILED, SUCCEEDED
    assert_eq!(counting.calls.load(Ordering::SeqCst), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_capacity_one_serializes_holders() {
    let gauge = Arc::new(ConcurrencyGauge::default());
    let engine = Engine::builder(store()).step("gauged", gauge.clone()).build();
    let guarded = |id: &str| PlanNode::new(id, "gauged").with_resource("db", 1);
    let plan = Plan::new(
        "fifo",
        "migrate",
        [
            stage(
                "migrate",
                vec![
                    ChildConfig::required("m1"),
                    ChildConfig::required("m2"),
                    ChildConfig::required("m3"),
                ],
                ChildrenPolicy::FailOnRequiredFailure,
            ),
            guarded("m1"),
            guarded("m2"),
            guarded("m3"),
        ],
    );

    let outcome = engine.start_run(plan, BTreeMap::new()).await.unwrap().wait().await.unwrap();
    assert_eq!(outcome.status, RunStatus::Succeeded);
    assert_eq!(gauge.calls.load(Ordering::SeqCst), 3);
    assert_eq!(gauge.peak.load(Ordering::SeqCst), 1);

    let db = ResourceKey::new("db");
    assert_eq!(engine.resources().live_permits(&db).await, 0);
    assert_eq!(engine.resources().queue_len(&db).await, 0);
}

#[tokio::test]
async fn test_permit_wait_times_out_and_leaves_no_trace() {
    let engine = engine();
    let mut waiter = PlanNode::new("waiter", "echo").with_resource("db", 1);
    waiter.resource_constraint.as_mut().unwrap().acquire_timeout_ms = Some(10);
    let plan = Plan::new(
        "contended",
        "outer",
        [
            stage("outer", vec![ChildConfig::required("waiter")], ChildrenPolicy::FailOnRequiredFailure)
                .with_resource("db", 1),
            waiter,
        ],
    );
    let handle = engine.start_run(plan, BTreeMap::new()).await.unwrap();
    let run_id = handle.run_id().clone();
    let db = ResourceKey::new("db");

    wait_until(&engine, &run_id, |n| {
        n.iter().any(|ne| ne.plan_node_id.as_str() == "waiter" && ne.awaiting_permit.is_some())
    })
    .await;
    assert_eq!(engine.resources().live_permits(&db).await, 1);
    assert_eq!(engine.resources().queue_len(&db).await, 1);

    let report = engine
        .sweep_expired(Utc::now() + chrono::Duration::seconds(1))
        .await
        .unwrap();
    assert_eq!(report.waits_expired, 1);

    let outcome = handle.wait().await.unwrap();
    assert_eq!(outcome.status, RunStatus::Failed);
    let kinds: Vec<FailureKind> = outcome.failure_chain.iter().map(|f| f.kind).collect();
    assert_eq!(kinds, vec![FailureKind::ChildFailed, FailureKind::Timeout]);

    let nodes = engine.node_executions(&run_id).await.unwrap();
    let waiter = node(&nodes, "waiter");
    assert_eq!(waiter.status, Status::Failed);
    assert!(waiter.started_at.is_none());
    assert_eq!(engine.resources().live_permits(&db).await, 0);
    assert_eq!(engine.resources().queue_len(&db).await, 0);
}

#[tokio::test]
async fn test_abort_leaves_no_permits_waits_or_tasks() {
    let engine = engine();
    let sleeper = |id: &str| {
        PlanNode::new(id, "sleep")
            .with_parameters(json!({"ms": 10_000}))
            .with_resource("db", 1)
    };
    let plan = Plan::new(
        "abort",
        "release",
        [
            stage(
                "release",
                vec![
                    ChildConfig::required("publish"),
                    ChildConfig::required("s1"),
                    ChildConfig::required("s2"),
                ],
                ChildrenPolicy::FailOnRequiredFailure,
            ),
            remote("publish", &[]),
            sleeper("s1"),
            sleeper("s2"),
        ],
    );
    let handle = engine.start_run(plan, BTreeMap::new()).await.unwrap();
    let run_id = handle.run_id().clone();

    let nodes = wait_until(&engine, &run_id, |n| {
        has_status(n, "publish", Status::AsyncWaiting)
            && n.iter().any(|ne| ne.status == Status::Running && ne.held_permit.is_some())
            && n.iter().any(|ne| ne.awaiting_permit.is_some())
    })
    .await;
    let publish = node(&nodes, "publish");
    let task_id = TaskId::new(format!("{}/0", publish.id));
    wait_for_task(&engine, &task_id).await;

    engine.abort_run(&run_id, "cancelled by user").await.unwrap();
    let outcome = handle.wait().await.unwrap();
    assert_eq!(outcome.status, RunStatus::Aborted);
    assert_eq!(outcome.failure_chain[0].message, "cancelled by user");

    let db = ResourceKey::new("db");
    assert_eq!(engine.resources().live_permits(&db).await, 0);
    assert_eq!(engine.resources().queue_len(&db).await, 0);
    assert!(engine.correlator().pending_for_run(&run_id).await.unwrap().is_empty());
    assert_eq!(
        engine.dispatcher().get(&task_id).await.unwrap().unwrap().status,
        TaskStatus::Aborted
    );

    let nodes = engine.node_executions(&run_id).await.unwrap();
    assert!(nodes.iter().all(|n| n.status == Status::Aborted));

    // Late completion of an aborted task resumes nothing.
    let late = engine
        .dispatcher()
        .complete(&task_id, TaskResult::success(json!({})))
        .await
        .unwrap();
    assert_eq!(late, NotifyOutcome::NotWaiting);
}

#[tokio::test]
async fn test_abort_plan_adviser_stops_the_run() {
    let engine = engine();
    let plan = Plan::new(
        "abort",
        "gate",
        [
            failing("gate")
                .with_adviser(AdviserConfig::AbortPlan { on_failure_kinds: vec![] })
                .then("ship"),
            PlanNode::new("ship", "echo"),
        ],
    );

    let outcome = engine.start_run(plan, BTreeMap::new()).await.unwrap().wait().await.unwrap();
    assert_eq!(outcome.status, RunStatus::Aborted);
    assert_eq!(outcome.failure_chain[0].kind, FailureKind::StepExecution);

    let nodes = engine.node_executions(&outcome.run_id).await.unwrap();
    assert_eq!(nodes.len(), 1);
    assert_eq!(node(&nodes, "gate").status, Status::Failed);
}

#[tokio::test]
async fn test_unadvised_failure_fails_the_run() {
    let engine = engine();
    let plan = Plan::new("fail", "gate", [failing("gate").then("ship"), PlanNode::new("ship", "echo")]);

    let outcome = engine.start_run(plan, BTreeMap::new()).await.unwrap().wait().await.unwrap();
    assert_eq!(outcome.status, RunStatus::Failed);
    assert_eq!(engine.node_executions(&outcome.run_id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_ignored_failure_continues_plan() {
    let engine = engine();
    let plan = Plan::new(
        "ignore",
        "lint",
        [
            failing("lint")
                .with_adviser(AdviserConfig::Ignore { on_failure_kinds: vec![] })
                .then("build"),
            PlanNode::new("build", "echo"),
        ],
    );

    let outcome = engine.start_run(plan, BTreeMap::new()).await.unwrap().wait().await.unwrap();
    assert_eq!(outcome.status, RunStatus::Succeeded);
    let nodes = engine.node_executions(&outcome.run_id).await.unwrap();
    let lint = node(&nodes, "lint");
    assert_eq!(lint.status, Status::Failed);
    assert!(lint.failure_ignored);
    assert_eq!(node(&nodes, "build").status, Status::Succeeded);
}

fn intervention_plan(step: PlanNode, timeout_ms: Option<u64>, on_timeout: TimeoutAction) -> Plan {
    Plan::new(
        "intervene",
        "deploy",
        [
            step.with_adviser(AdviserConfig::ManualIntervention { timeout_ms, on_timeout })
                .then("verify"),
            PlanNode::new("verify", "echo"),
        ],
    )
}

#[tokio::test]
async fn test_intervention_mark_success_continues() {
    let engine = engine();
    let plan = intervention_plan(failing("deploy"), None, TimeoutAction::Fail);
    let handle = engine.start_run(plan, BTreeMap::new()).await.unwrap();
    let run_id = handle.run_id().clone();

    let nodes = wait_until(&engine, &run_id, |n| has_status(n, "deploy", Status::InterventionWaiting)).await;
    let deploy_id = node(&nodes, "deploy").id.clone();

    engine
        .intervene(&deploy_id, InterventionDecision::MarkSuccess)
        .await
        .unwrap();
    let outcome = handle.wait().await.unwrap();
    assert_eq!(outcome.status, RunStatus::Succeeded);

    let nodes = engine.node_executions(&run_id).await.unwrap();
    assert_eq!(node(&nodes, "deploy").status, Status::Succeeded);
    assert_eq!(node(&nodes, "verify").status, Status::Succeeded);

    let again = engine.intervene(&deploy_id, InterventionDecision::Retry).await;
    assert!(matches!(again, Err(EngineError::InvalidTransition(_))));
}

#[tokio::test]
async fn test_intervention_retry_runs_another_attempt() {
    let engine = engine();
    let step = PlanNode::new("deploy", "fail").with_parameters(json!({"fail_times": 1}));
    let plan = intervention_plan(step, None, TimeoutAction::Fail);
    let handle = engine.start_run(plan, BTreeMap::new()).await.unwrap();
    let run_id = handle.run_id().clone();

    let nodes = wait_until(&engine, &run_id, |n| has_status(n, "deploy", Status::InterventionWaiting)).await;
    engine
        .intervene(&node(&nodes, "deploy").id, InterventionDecision::Retry)
        .await
        .unwrap();

    let outcome = handle.wait().await.unwrap();
    assert_eq!(outcome.status, RunStatus::Succeeded);
    let nodes = engine.node_executions(&run_id).await.unwrap();
    let deploy = node(&nodes, "deploy");
    assert_eq!(deploy.retry_count, 1);
    assert_eq!(deploy.attempts[0].status, Status::Failed);
}

#[tokio::test]
async fn test_intervention_timeout_applies_configured_action() {
    let engine = engine();
    let plan = intervention_plan(failing("deploy"), Some(10), TimeoutAction::Ignore);
    let handle = engine.start_run(plan, BTreeMap::new()).await.unwrap();
    let run_id = handle.run_id().clone();

    wait_until(&engine, &run_id, |n| has_status(n, "deploy", Status::InterventionWaiting)).await;
    let report = engine
        .sweep_expired(Utc::now() + chrono::Duration::seconds(1))
        .await
        .unwrap();
    assert_eq!(report.waits_expired, 1);

    let outcome = handle.wait().await.unwrap();
    assert_eq!(outcome.status, RunStatus::Succeeded);
    let nodes = engine.node_executions(&run_id).await.unwrap();
    assert!(node(&nodes, "deploy").failure_ignored);
}

#[tokio::test]
async fn test_required_child_failure_fails_parent_with_cause() {
    let engine = engine();
    let plan = Plan::new(
        "children",
        "ci",
        [
            stage(
                "ci",
                vec![ChildConfig::required("build"), ChildConfig::optional("lint")],
                ChildrenPolicy::FailOnRequiredFailure,
            ),
            PlanNode::new("build", "fail").with_parameters(json!({"message": "compile error"})),
            PlanNode::new("lint", "echo"),
        ],
    );

    let outcome = engine.start_run(plan, BTreeMap::new()).await.unwrap().wait().await.unwrap();
    assert_eq!(outcome.status, RunStatus::Failed);
    let kinds: Vec<FailureKind> = outcome.failure_chain.iter().map(|f| f.kind).collect();
    assert_eq!(kinds, vec![FailureKind::ChildFailed, FailureKind::StepExecution]);
    assert_eq!(outcome.failure_chain[1].message, "compile error");

    let nodes = engine.node_executions(&outcome.run_id).await.unwrap();
    let ci = node(&nodes, "ci");
    assert_eq!(ci.children.len(), 2);
    assert_eq!(node(&nodes, "build").parent_id.as_ref(), Some(&ci.id));
    assert_eq!(node(&nodes, "lint").ambiance.depth(), 2);
}

#[tokio::test]
async fn test_optional_child_failure_is_tolerated() {
    let engine = engine();
    let plan = Plan::new(
        "children",
        "ci",
        [
            stage(
                "ci",
                vec![ChildConfig::required("build"), ChildConfig::optional("lint")],
                ChildrenPolicy::FailOnRequiredFailure,
            ),
            PlanNode::new("build", "echo"),
            failing("lint"),
        ],
    );

    let outcome = engine.start_run(plan, BTreeMap::new()).await.unwrap().wait().await.unwrap();
    assert_eq!(outcome.status, RunStatus::Succeeded);
    let nodes = engine.node_executions(&outcome.run_id).await.unwrap();
    let ci = node(&nodes, "ci");
    assert_eq!(ci.outcome.as_ref().unwrap()["lint"]["succeeded"], json!(false));
}

#[tokio::test]
async fn test_skip_condition_matches_abstraction() {
    let engine = engine();
    let plan = Plan::new(
        "skip",
        "smoke",
        [
            PlanNode::new("smoke", "fail")
                .with_skip_condition(SkipCondition::AbstractionEquals {
                    key: "env".to_string(),
                    value: "prod".to_string(),
                })
                .then("deploy"),
            PlanNode::new("deploy", "echo"),
        ],
    );
    let abstractions = BTreeMap::from([("env".to_string(), "prod".to_string())]);

    let outcome = engine.start_run(plan, abstractions).await.unwrap().wait().await.unwrap();
    assert_eq!(outcome.status, RunStatus::Succeeded);
    let nodes = engine.node_executions(&outcome.run_id).await.unwrap();
    assert_eq!(node(&nodes, "smoke").status, Status::Skipped);
    assert_eq!(node(&nodes, "deploy").status, Status::Succeeded);
}

#[tokio::test]
async fn test_task_chain_runs_on_local_worker() {
    let engine = engine();
    let (stop, shutdown) = watch::channel(false);
    let worker = LocalWorker::new(
        "w1",
        ["build", "push"],
        engine.dispatcher().clone(),
        Arc::new(EchoTaskHandler),
    )
    .spawn(shutdown);

    let spec = |cap: &str, step: u32| TaskSpec {
        capabilities: vec![cap.to_string()],
        payload: json!({ "step": step }),
        affinity: None,
        ttl_ms: None,
    };
    let plan = Plan::new(
        "chain",
        "image",
        [PlanNode::new("image", "chain").with_facilitator(FacilitatorConfig::TaskChain {
            tasks: vec![spec("build", 1), spec("push", 2)],
        })],
    );

    let outcome = engine.start_run(plan, BTreeMap::new()).await.unwrap().wait().await.unwrap();
    assert_eq!(outcome.status, RunStatus::Succeeded);

    let nodes = engine.node_executions(&outcome.run_id).await.unwrap();
    let image = node(&nodes, "image");
    assert_eq!(image.task_ids.len(), 2);
    assert_eq!(image.task_chain_index, 2);
    assert_eq!(image.outcome.as_ref().unwrap()["payload"]["step"], json!(2));

    stop.send(true).unwrap();
    worker.await.unwrap();
}

#[tokio::test]
async fn test_async_timeout_fails_node_and_aborts_task() {
    let engine = engine();
    let plan = Plan::new("timeout", "deploy", [remote("deploy", &["task-slow"]).with_timeout_ms(10)]);
    let handle = engine.start_run(plan, BTreeMap::new()).await.unwrap();
    let run_id = handle.run_id().clone();

    wait_for_task(&engine, &TaskId::new("task-slow")).await;
    let report = engine
        .sweep_expired(Utc::now() + chrono::Duration::seconds(1))
        .await
        .unwrap();
    assert_eq!(report.waits_expired, 1);

    let outcome = handle.wait().await.unwrap();
    assert_eq!(outcome.status, RunStatus::Failed);
    assert_eq!(outcome.failure_chain[0].kind, FailureKind::Timeout);

    let task = engine.dispatcher().get(&TaskId::new("task-slow")).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Aborted);
}

#[tokio::test]
async fn test_child_branch_timeout_names_the_child_and_stops_it() {
    let engine = engine();
    let plan = Plan::new(
        "fanout-timeout",
        "fanout",
        [
            stage("fanout", vec![ChildConfig::required("slow")], ChildrenPolicy::FailOnRequiredFailure)
                .with_timeout_ms(10),
            remote("slow", &["task-child"]),
        ],
    );
    let handle = engine.start_run(plan, BTreeMap::new()).await.unwrap();
    let run_id = handle.run_id().clone();
    let task_id = TaskId::new("task-child");

    wait_for_task(&engine, &task_id).await;
    let report = engine
        .sweep_expired(Utc::now() + chrono::Duration::seconds(1))
        .await
        .unwrap();
    assert_eq!(report.waits_expired, 1);

    let outcome = handle.wait().await.unwrap();
    assert_eq!(outcome.status, RunStatus::Failed);
    let kinds: Vec<FailureKind> = outcome.failure_chain.iter().map(|f| f.kind).collect();
    assert_eq!(kinds, vec![FailureKind::ChildFailed, FailureKind::Timeout]);

    let nodes = wait_until(&engine, &run_id, |n| has_status(n, "slow", Status::Aborted)).await;
    let slow = node(&nodes, "slow");
    let fanout = node(&nodes, "fanout");
    let branch = &fanout.responses[ResumeKey::for_child(&slow.id).as_str()];
    assert_eq!(branch["child_id"], json!(slow.id));
    assert_eq!(branch["succeeded"], json!(false));
    assert_eq!(
        wait_for_task_status(&engine, &task_id, TaskStatus::Aborted).await.status,
        TaskStatus::Aborted
    );
}

#[tokio::test]
async fn test_duplicate_resume_key_fails_second_waiter() {
    let engine = engine();
    let plan = Plan::new(
        "dup",
        "fanout",
        [
            stage(
                "fanout",
                vec![ChildConfig::optional("a"), ChildConfig::optional("b")],
                ChildrenPolicy::IgnoreChildFailures,
            ),
            remote("a", &["shared"]),
            remote("b", &["shared"]),
        ],
    );
    let handle = engine.start_run(plan, BTreeMap::new()).await.unwrap();
    let run_id = handle.run_id().clone();

    let nodes = wait_until(&engine, &run_id, |n| {
        n.iter().any(|ne| ne.status == Status::Failed) && n.iter().any(|ne| ne.status == Status::AsyncWaiting)
    })
    .await;
    let failed: Vec<&NodeExecution> = nodes.iter().filter(|n| n.status == Status::Failed).collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].failure.as_ref().unwrap().kind, FailureKind::DuplicateKey);
    wait_for_task(&engine, &TaskId::new("shared")).await;

    engine
        .dispatcher()
        .complete(&TaskId::new("shared"), TaskResult::success(json!({})))
        .await
        .unwrap();
    assert_eq!(handle.wait().await.unwrap().status, RunStatus::Succeeded);
}

#[tokio::test]
async fn test_recover_resumes_suspended_run_after_restart() {
    let store = store();
    let first = Engine::builder(store.clone()).build();
    let plan = Plan::new("recover", "deploy", [remote("deploy", &["task-7"]).then("notify"), PlanNode::new("notify", "echo")]);
    let run_id = first.start_run(plan, BTreeMap::new()).await.unwrap().run_id().clone();
    wait_until(&first, &run_id, |n| has_status(n, "deploy", Status::AsyncWaiting)).await;
    wait_for_task(&first, &TaskId::new("task-7")).await;
    drop(first);

    let second = Engine::builder(store).build();
    let handle = second.recover(&run_id).await.unwrap();
    assert!(handle.outcome().is_none());

    let delivered = second
        .dispatcher()
        .complete(&TaskId::new("task-7"), TaskResult::success(json!({"ok": true})))
        .await
        .unwrap();
    assert_eq!(delivered, NotifyOutcome::Delivered);

    let outcome = handle.wait().await.unwrap();
    assert_eq!(outcome.status, RunStatus::Succeeded);
    let nodes = second.node_executions(&run_id).await.unwrap();
    assert_eq!(node(&nodes, "notify").status, Status::Succeeded);
}

#[tokio::test]
async fn test_recover_fails_node_whose_result_was_lost() {
    let store = store();
    let first = Engine::builder(store.clone()).build();
    let plan = Plan::new("lost", "deploy", [remote("deploy", &["task-7"]).then("notify"), PlanNode::new("notify", "echo")]);
    let run_id = first.start_run(plan, BTreeMap::new()).await.unwrap().run_id().clone();
    wait_until(&first, &run_id, |n| has_status(n, "deploy", Status::AsyncWaiting)).await;
    wait_for_task(&first, &TaskId::new("task-7")).await;
    drop(first);

    // The result was taken by a process that died before applying it.
    assert!(store.take_wait(&ResumeKey::new("task-7")).await.unwrap().is_some());

    let second = Engine::builder(store).build();
    let outcome = second.recover(&run_id).await.unwrap().wait().await.unwrap();
    assert_eq!(outcome.status, RunStatus::Failed);
    assert_eq!(outcome.failure_chain[0].kind, FailureKind::EngineInternal);

    let nodes = second.node_executions(&run_id).await.unwrap();
    assert!(nodes.iter().all(|n| n.plan_node_id.as_str() != "notify"));
    assert_eq!(
        second.dispatcher().get(&TaskId::new("task-7")).await.unwrap().unwrap().status,
        TaskStatus::Aborted
    );
}

#[tokio::test]
async fn test_recover_advises_node_that_finished_before_the_crash() {
    let store = store();
    let first = Engine::builder(store.clone()).build();
    let plan = Plan::new("unadvised", "deploy", [remote("deploy", &["task-8"]).then("notify"), PlanNode::new("notify", "echo")]);
    let run_id = first.start_run(plan, BTreeMap::new()).await.unwrap().run_id().clone();
    let nodes = wait_until(&first, &run_id, |n| has_status(n, "deploy", Status::AsyncWaiting)).await;
    wait_for_task(&first, &TaskId::new("task-8")).await;
    drop(first);

    // Completed and saved, but the process died before the adviser ran.
    store.take_wait(&ResumeKey::new("task-8")).await.unwrap();
    let mut deploy = node(&nodes, "deploy").clone();
    deploy.pending_keys.clear();
    deploy.outcome = Some(json!({"ok": true}));
    deploy.transition(Status::Succeeded);
    store.save_node_execution(&deploy).await.unwrap();

    let second = Engine::builder(store).build();
    let outcome = second.recover(&run_id).await.unwrap().wait().await.unwrap();
    assert_eq!(outcome.status, RunStatus::Succeeded);
    let nodes = second.node_executions(&run_id).await.unwrap();
    assert_eq!(node(&nodes, "notify").status, Status::Succeeded);
}

#[tokio::test]
async fn test_recover_unfinished_picks_up_every_running_run() {
    let store = store();
    let first = Engine::builder(store.clone()).build();
    let waiting = Plan::new("waiting", "deploy", [remote("deploy", &["task-9"])]);
    let done = Plan::new("done", "a", [PlanNode::new("a", "echo")]);
    let waiting_id = first.start_run(waiting, BTreeMap::new()).await.unwrap().run_id().clone();
    first.start_run(done, BTreeMap::new()).await.unwrap().wait().await.unwrap();
    wait_for_task(&first, &TaskId::new("task-9")).await;
    drop(first);

    let second = Engine::builder(store).build();
    assert_eq!(second.recover_unfinished().await.unwrap(), vec![waiting_id.clone()]);
    second
        .dispatcher()
        .complete(&TaskId::new("task-9"), TaskResult::success(json!({})))
        .await
        .unwrap();
    let outcome = second.watch_run(&waiting_id).await.unwrap().wait().await.unwrap();
    assert_eq!(outcome.status, RunStatus::Succeeded);
}

#[tokio::test]
async fn test_invalid_plan_is_rejected_before_start() {
    let engine = engine();
    let plan = Plan::new("bad", "a", [PlanNode::new("a", "echo").then("missing")]);
    let err = engine.start_run(plan, BTreeMap::new()).await.err().unwrap();
    assert!(matches!(err, EngineError::Validation(_)));
}

#[tokio::test]
async fn test_oversized_timeout_is_rejected_before_start() {
    let engine = engine();
    let plan = Plan::new("forever", "deploy", [remote("deploy", &["task-1"]).with_timeout_ms(u64::MAX)]);
    let err = engine.start_run(plan, BTreeMap::new()).await.err().unwrap();
    assert!(matches!(err, EngineError::Validation(_)));
}

#[tokio::test]
async fn test_finished_run_releases_its_context() {
    let engine = engine();
    let plan = Plan::new("short", "a", [PlanNode::new("a", "echo")]);
    let handle = engine.start_run(plan, BTreeMap::new()).await.unwrap();
    let run_id = handle.run_id().clone();
    assert_eq!(handle.wait().await.unwrap().status, RunStatus::Succeeded);
    assert_eq!(engine.live_runs().await, 0);

    // Late watchers are answered from the store without caching the run again.
    let late = engine.watch_run(&run_id).await.unwrap();
    assert_eq!(late.outcome().unwrap().status, RunStatus::Succeeded);
    assert_eq!(late.wait().await.unwrap().status, RunStatus::Succeeded);
    assert_eq!(engine.live_runs().await, 0);
}
