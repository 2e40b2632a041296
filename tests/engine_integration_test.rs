//! 引擎集成测试：通过 Engine 公共接口驱动脚本化工具

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use hive::config::{AppConfig, FailurePolicy};
use hive::core::{EngineError, ToolFailure};
use hive::engine::{Engine, EventType};
use hive::plan::{DependencyRef, Step, StepSpec, StepStatus, Task, TaskStatus, TaskSubmission};
use hive::sandbox::{ExecutionExit, ExecutionRecord, ResourceUsage, SandboxContext};
use hive::store::{MemoryTaskStore, StoreError, TaskFilter, TaskStore};
use hive::tools::{EchoTool, SecurityLevel, ToolDescriptor, ToolHandler, ToolRegistry};

const WAIT: Duration = Duration::from_secs(10);

/// 按脚本返回结果的工具；脚本用完后返回成功。记录调用次数、启动顺序与最大并发。
struct ScriptedTool {
    descriptor: ToolDescriptor,
    delay: Duration,
    script: Mutex<VecDeque<Result<Value, ToolFailure>>>,
    calls: AtomicUsize,
    active: AtomicUsize,
    peak: AtomicUsize,
    started: Mutex<Vec<String>>,
}

impl ScriptedTool {
    fn new(name: &str) -> Self {
        Self {
            descriptor: ToolDescriptor::new(name, "scripted test tool"),
            delay: Duration::from_millis(5),
            script: Mutex::new(VecDeque::new()),
            calls: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            started: Mutex::new(Vec::new()),
        }
    }

    fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn script(self, results: Vec<Result<Value, ToolFailure>>) -> Self {
        *self.script.lock().unwrap() = results.into();
        self
    }

    fn describe(mut self, f: impl FnOnce(ToolDescriptor) -> ToolDescriptor) -> Self {
        self.descriptor = f(self.descriptor);
        self
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn started(&self) -> Vec<String> {
        self.started.lock().unwrap().clone()
    }
}

#[async_trait]
impl ToolHandler for ScriptedTool {
    fn descriptor(&self) -> ToolDescriptor {
        self.descriptor.clone()
    }

    async fn invoke(&self, _params: Value, ctx: SandboxContext) -> Result<Value, ToolFailure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.started.lock().unwrap().push(ctx.step_id.clone());
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        let finished = tokio::select! {
            _ = tokio::time::sleep(self.delay) => true,
            _ = ctx.cancel.cancelled() => false,
        };
        self.active.fetch_sub(1, Ordering::SeqCst);
        if !finished {
            return Err(ToolFailure::Cancelled);
        }
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(json!({ "step": ctx.step_id, "attempt": ctx.attempt })))
    }
}

fn test_config(dir: &Path) -> AppConfig {
    let mut cfg = AppConfig::default();
    cfg.sandbox.root = Some(dir.to_path_buf());
    cfg.retry.base_delay_ms = 10;
    cfg.retry.max_delay_ms = 50;
    cfg.engine.cancel_grace_ms = 100;
    cfg
}

async fn engine_with(cfg: AppConfig, tools: &[Arc<ScriptedTool>]) -> Engine {
    let mut registry = ToolRegistry::new();
    registry.register(EchoTool);
    for tool in tools {
        registry.register_as(tool.descriptor(), Arc::clone(tool) as Arc<dyn ToolHandler>);
    }
    Engine::builder(cfg)
        .with_registry(registry)
        .with_store(Arc::new(MemoryTaskStore::new()))
        .build()
        .await
}

/// 第一次把步骤写成 completed 时返回后端错误，其余操作转发给内存存储
struct FlakyStore {
    inner: MemoryTaskStore,
    tripped: AtomicBool,
}

impl FlakyStore {
    fn new() -> Self {
        Self {
            inner: MemoryTaskStore::new(),
            tripped: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl TaskStore for FlakyStore {
    async fn insert_task(&self, task: &Task, steps: &[Step]) -> Result<(), StoreError> {
        self.inner.insert_task(task, steps).await
    }

    async fn get_task(&self, task_id: &str) -> Result<Option<Task>, StoreError> {
        self.inner.get_task(task_id).await
    }

    async fn get_step(&self, step_id: &str) -> Result<Option<Step>, StoreError> {
        self.inner.get_step(step_id).await
    }

    async fn list_steps(&self, task_id: &str) -> Result<Vec<Step>, StoreError> {
        self.inner.list_steps(task_id).await
    }

    async fn update_task(&self, task: &Task, expected_version: u64) -> Result<Task, StoreError> {
        self.inner.update_task(task, expected_version).await
    }

    async fn update_step(&self, step: &Step, expected_version: u64) -> Result<Step, StoreError> {
        if step.status == StepStatus::Completed && !self.tripped.swap(true, Ordering::SeqCst) {
            return Err(StoreError::Backend("transient io".into()));
        }
        self.inner.update_step(step, expected_version).await
    }

    async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>, StoreError> {
        self.inner.list_tasks(filter).await
    }

    async fn start_record(&self, record: &ExecutionRecord) -> Result<(), StoreError> {
        self.inner.start_record(record).await
    }

    async fn finish_record(
        &self,
        record_id: &str,
        exit: ExecutionExit,
        usage: ResourceUsage,
        ended_at: i64,
    ) -> Result<ExecutionRecord, StoreError> {
        self.inner.finish_record(record_id, exit, usage, ended_at).await
    }

    async fn list_records(&self, task_id: &str) -> Result<Vec<ExecutionRecord>, StoreError> {
        self.inner.list_records(task_id).await
    }

    async fn tool_records(&self, tool_name: &str, limit: usize) -> Result<Vec<ExecutionRecord>, StoreError> {
        self.inner.tool_records(tool_name, limit).await
    }
}

fn echo(text: &str) -> StepSpec {
    StepSpec::new("echo", json!({ "text": text }))
}

async fn wait_until<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check().await {
        assert!(tokio::time::Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_dependencies_respected_and_concurrency_bounded() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = test_config(dir.path());
    cfg.engine.max_concurrent_steps = 2;
    let work = Arc::new(ScriptedTool::new("work").delay(Duration::from_millis(40)));
    let engine = engine_with(cfg, &[work.clone()]).await;

    let mut submission = TaskSubmission::new("alice", "fan-in");
    for i in 0..4 {
        submission = submission.step(StepSpec::new("work", json!({})).key(format!("w{i}")));
    }
    let mut join = StepSpec::new("work", json!({})).key("join");
    for i in 0..4 {
        join = join.depends_on(DependencyRef::Key(format!("w{i}")));
    }
    let accepted = engine.submit(submission.step(join)).await.unwrap();
    assert_eq!(accepted.step_ids.len(), 5);
    assert_eq!(accepted.step_ids[4], format!("{}_step_5", accepted.task_id));

    let task = engine.wait_for_terminal(&accepted.task_id, WAIT).await.unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.progress_percent, 100);
    assert!(task.started_at.is_some() && task.completed_at.is_some());

    assert_eq!(work.calls(), 5);
    assert!(work.peak() <= 2, "peak concurrency {}", work.peak());
    assert_eq!(work.started().last(), Some(&accepted.step_ids[4]));
}

#[tokio::test]
async fn test_invalid_plans_leave_no_trace() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_with(test_config(dir.path()), &[]).await;

    let cyclic = TaskSubmission::new("alice", "cycle")
        .step(echo("a").key("a").depends_on(DependencyRef::Key("b".into())))
        .step(echo("b").key("b").depends_on(DependencyRef::Key("a".into())));
    let err = engine.submit(cyclic).await.unwrap_err();
    assert!(matches!(err, EngineError::PlanInvalid(ref m) if m.contains("cycle")), "{err}");

    let unknown = TaskSubmission::new("alice", "unknown").step(StepSpec::new("teleport", json!({})));
    assert!(matches!(
        engine.submit(unknown).await.unwrap_err(),
        EngineError::UnknownTool(name) if name == "teleport"
    ));

    let empty = TaskSubmission::new("alice", "empty");
    assert!(matches!(engine.submit(empty).await.unwrap_err(), EngineError::PlanInvalid(_)));

    assert!(engine.list_tasks(&TaskFilter::default()).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_duplicate_task_id_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine_with(test_config(dir.path()), &[]).await;
    let submission = TaskSubmission::new("alice", "once").with_id("fixed").step(echo("x"));
    engine.submit(submission.clone()).await.unwrap();
    assert!(matches!(
        engine.submit(submission).await.unwrap_err(),
        EngineError::DuplicateTask(id) if id == "fixed"
    ));
}

#[tokio::test]
async fn test_transient_failures_retried_with_backoff() {
    let dir = tempfile::tempdir().unwrap();
    let flaky = Arc::new(
        ScriptedTool::new("flaky")
            .describe(|d| d.retries(2))
            .script(vec![Err(ToolFailure::Timeout(10)), Err(ToolFailure::Timeout(10))]),
    );
    let engine = engine_with(test_config(dir.path()), &[flaky.clone()]).await;

    let accepted = engine
        .submit(TaskSubmission::new("alice", "retry").step(StepSpec::new("flaky", json!({}))))
        .await
        .unwrap();
    let task = engine.wait_for_terminal(&accepted.task_id, WAIT).await.unwrap();
    assert_eq!(task.status, TaskStatus::Completed);

    let step = engine.step(&accepted.step_ids[0]).await.unwrap();
    assert_eq!(step.status, StepStatus::Completed);
    assert_eq!(step.retry_count, 2);
    assert_eq!(step.output.as_ref().unwrap()["attempt"], 3);

    let records = engine.execution_records(&accepted.task_id).await.unwrap();
    assert_eq!(records.len(), 3);
    let attempts: Vec<u32> = records.iter().map(|r| r.attempt).collect();
    assert_eq!(attempts, vec![1, 2, 3]);
    assert_eq!(
        records[0].exit_status,
        Some(ExecutionExit::Failed(ToolFailure::Timeout(10)))
    );
    assert_eq!(records[2].exit_status, Some(ExecutionExit::Succeeded));
    assert_eq!(engine.registry().usage_count("flaky"), 1);
}

#[tokio::test]
async fn test_exhausted_retries_fail_task() {
    let dir = tempfile::tempdir().unwrap();
    let flaky = Arc::new(
        ScriptedTool::new("flaky")
            .describe(|d| d.retries(1))
            .script(vec![
                Err(ToolFailure::SandboxInfraFailure("spawn".into())),
                Err(ToolFailure::SandboxInfraFailure("spawn".into())),
            ]),
    );
    let engine = engine_with(test_config(dir.path()), &[flaky.clone()]).await;
    let accepted = engine
        .submit(TaskSubmission::new("alice", "exhaust").step(StepSpec::new("flaky", json!({}))))
        .await
        .unwrap();
    let task = engine.wait_for_terminal(&accepted.task_id, WAIT).await.unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(flaky.calls(), 2);
    let step = engine.step(&accepted.step_ids[0]).await.unwrap();
    assert_eq!(step.retry_count, 1);
    assert!(matches!(step.error, Some(ToolFailure::SandboxInfraFailure(_))));
}

#[tokio::test]
async fn test_permanent_failure_skips_dependents_only() {
    let dir = tempfile::tempdir().unwrap();
    let broken = Arc::new(
        ScriptedTool::new("broken")
            .describe(|d| d.retries(3))
            .script(vec![Err(ToolFailure::InvalidParameters("missing url".into()))]),
    );
    let engine = engine_with(test_config(dir.path()), &[broken.clone()]).await;

    let submission = TaskSubmission::new("alice", "cascade")
        .step(echo("first"))
        .step(StepSpec::new("broken", json!({})).after(0))
        .step(echo("after broken").after(1))
        .step(echo("after that").after(2))
        .step(echo("independent"));
    let accepted = engine.submit(submission).await.unwrap();
    let task = engine.wait_for_terminal(&accepted.task_id, WAIT).await.unwrap();

    assert_eq!(task.status, TaskStatus::Failed);
    let message = task.error_message.unwrap();
    assert!(message.contains(&accepted.step_ids[1]), "{message}");
    assert_eq!(broken.calls(), 1);

    let statuses: Vec<StepStatus> = engine
        .steps(&accepted.task_id)
        .await
        .unwrap()
        .iter()
        .map(|s| s.status)
        .collect();
    assert_eq!(
        statuses,
        vec![
            StepStatus::Completed,
            StepStatus::Failed,
            StepStatus::Skipped,
            StepStatus::Skipped,
            StepStatus::Completed,
        ]
    );

    let report = engine.task_report(&accepted.task_id).await.unwrap();
    assert_eq!(report.completed_steps, 2);
    assert_eq!(report.failed_steps, vec![accepted.step_ids[1].clone()]);
    assert_eq!(report.skipped_steps, accepted.step_ids[2..4].to_vec());
    assert_eq!(report.tools_used, vec!["broken".to_string(), "echo".to_string()]);
    // skipped 步骤不产生执行记录
    assert_eq!(report.attempts, 3);
}

#[tokio::test]
async fn test_best_effort_policy_completes_with_partial_failure() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = test_config(dir.path());
    cfg.engine.failure_policy = FailurePolicy::BestEffort;
    let broken = Arc::new(
        ScriptedTool::new("broken").script(vec![Err(ToolFailure::UnauthorizedTool("denied".into()))]),
    );
    let engine = engine_with(cfg, &[broken]).await;

    let accepted = engine
        .submit(
            TaskSubmission::new("alice", "partial")
                .step(StepSpec::new("broken", json!({})))
                .step(echo("fine")),
        )
        .await
        .unwrap();
    let task = engine.wait_for_terminal(&accepted.task_id, WAIT).await.unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.progress_percent, 50);
    assert!(task.error_message.unwrap().contains("denied"));
}

#[tokio::test]
async fn test_cancel_stops_running_steps() {
    let dir = tempfile::tempdir().unwrap();
    let slow = Arc::new(ScriptedTool::new("slow").delay(Duration::from_secs(30)));
    let engine = engine_with(test_config(dir.path()), &[slow.clone()]).await;

    let accepted = engine
        .submit(
            TaskSubmission::new("alice", "long")
                .step(StepSpec::new("slow", json!({})))
                .step(StepSpec::new("slow", json!({})))
                .step(echo("later").after(0)),
        )
        .await
        .unwrap();

    let task_id = accepted.task_id.clone();
    wait_until(|| {
        let engine = engine.clone();
        let task_id = task_id.clone();
        async move {
            let steps = engine.steps(&task_id).await.unwrap();
            steps.iter().filter(|s| s.status == StepStatus::Running).count() == 2
        }
    })
    .await;

    let cancelled = engine.cancel_task(&accepted.task_id).await.unwrap();
    assert_eq!(cancelled.status, TaskStatus::Cancelled);
    assert!(engine
        .steps(&accepted.task_id)
        .await
        .unwrap()
        .iter()
        .all(|s| s.status == StepStatus::Cancelled));

    assert!(matches!(
        engine.cancel_task(&accepted.task_id).await.unwrap_err(),
        EngineError::InvalidState(_)
    ));

    // 在途执行在宽限期内退出，并各自留下一条 cancelled 记录
    let task_id = accepted.task_id.clone();
    wait_until(|| {
        let engine = engine.clone();
        let task_id = task_id.clone();
        async move {
            let records = engine.execution_records(&task_id).await.unwrap();
            records.len() == 2 && records.iter().all(|r| r.is_finalized())
        }
    })
    .await;
    let records = engine.execution_records(&accepted.task_id).await.unwrap();
    assert!(records
        .iter()
        .all(|r| r.exit_status == Some(ExecutionExit::Failed(ToolFailure::Cancelled))));
    assert_eq!(slow.calls(), 2);

    wait_until(|| {
        let engine = engine.clone();
        async move { engine.active_tasks().is_empty() }
    })
    .await;
    assert_eq!(engine.task(&accepted.task_id).await.unwrap().status, TaskStatus::Cancelled);
}

#[tokio::test]
async fn test_confirmation_gate_blocks_until_approved() {
    let dir = tempfile::tempdir().unwrap();
    let deploy = Arc::new(
        ScriptedTool::new("deploy").describe(|d| d.security(SecurityLevel::Dangerous).confirm(true)),
    );
    let engine = engine_with(test_config(dir.path()), &[deploy.clone()]).await;

    let accepted = engine
        .submit(TaskSubmission::new("alice", "gated").step(StepSpec::new("deploy", json!({}))))
        .await
        .unwrap();
    let step_id = accepted.step_ids[0].clone();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(engine.step(&step_id).await.unwrap().status, StepStatus::Ready);
    assert_eq!(deploy.calls(), 0);

    assert!(engine.approve_step(&step_id).await.unwrap());
    let task = engine.wait_for_terminal(&accepted.task_id, WAIT).await.unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(deploy.calls(), 1);

    assert!(matches!(
        engine.approve_step(&step_id).await.unwrap_err(),
        EngineError::InvalidState(_)
    ));
    assert!(matches!(
        engine.approve_step("nope").await.unwrap_err(),
        EngineError::StepNotFound(_)
    ));
}

#[tokio::test]
async fn test_confirmation_timeout_fails_step_without_record() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = test_config(dir.path());
    cfg.engine.task_timeout_secs = 1;
    let deploy = Arc::new(ScriptedTool::new("deploy").describe(|d| d.confirm(true)));
    let engine = engine_with(cfg, &[deploy.clone()]).await;

    let accepted = engine
        .submit(
            TaskSubmission::new("alice", "unattended")
                .step(StepSpec::new("deploy", json!({})))
                .step(echo("after").after(0)),
        )
        .await
        .unwrap();
    let task = engine.wait_for_terminal(&accepted.task_id, WAIT).await.unwrap();
    assert_eq!(task.status, TaskStatus::Failed);

    let steps = engine.steps(&accepted.task_id).await.unwrap();
    assert_eq!(
        steps[0].error,
        Some(ToolFailure::ConfirmationTimeout(accepted.step_ids[0].clone()))
    );
    assert_eq!(steps[1].status, StepStatus::Skipped);
    assert_eq!(deploy.calls(), 0);
    assert!(engine.execution_records(&accepted.task_id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_retry_task_reopens_failed_and_skipped_steps() {
    let dir = tempfile::tempdir().unwrap();
    let once = Arc::new(
        ScriptedTool::new("once").script(vec![Err(ToolFailure::InvalidParameters("first run".into()))]),
    );
    let engine = engine_with(test_config(dir.path()), &[once.clone()]).await;

    let accepted = engine
        .submit(
            TaskSubmission::new("alice", "retry me")
                .step(echo("ok"))
                .step(StepSpec::new("once", json!({})).after(0))
                .step(echo("tail").after(1)),
        )
        .await
        .unwrap();
    let task = engine.wait_for_terminal(&accepted.task_id, WAIT).await.unwrap();
    assert_eq!(task.status, TaskStatus::Failed);

    let reopened = engine.retry_task(&accepted.task_id).await.unwrap();
    assert_eq!(reopened.status, TaskStatus::Running);
    assert!(reopened.error_message.is_none());

    let task = engine.wait_for_terminal(&accepted.task_id, WAIT).await.unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(once.calls(), 2);
    let steps = engine.steps(&accepted.task_id).await.unwrap();
    assert!(steps.iter().all(|s| s.status == StepStatus::Completed && s.error.is_none()));

    assert!(matches!(
        engine.retry_task(&accepted.task_id).await.unwrap_err(),
        EngineError::InvalidState(_)
    ));
}

#[tokio::test]
async fn test_subscription_streams_ordered_events() {
    let dir = tempfile::tempdir().unwrap();
    let work = Arc::new(ScriptedTool::new("work").delay(Duration::from_millis(30)));
    let engine = engine_with(test_config(dir.path()), &[work]).await;

    let accepted = engine
        .submit(
            TaskSubmission::new("alice", "watched")
                .step(StepSpec::new("work", json!({})))
                .step(StepSpec::new("work", json!({})).after(0)),
        )
        .await
        .unwrap();
    let mut subscription = engine.subscribe(&accepted.task_id).await.unwrap();
    assert_eq!(engine.subscriber_count(&accepted.task_id), 1);
    assert_eq!(subscription.snapshot.steps.len(), 2);

    let mut events = Vec::new();
    while let Some(event) = subscription.next().await {
        events.push(event);
    }
    assert!(!events.is_empty());
    assert!(events.windows(2).all(|w| w[0].seq < w[1].seq));
    assert!(events.iter().all(|e| e.seq > subscription.snapshot.last_seq));

    let last = events.last().unwrap();
    assert_eq!(last.event_type, EventType::TaskStatus);
    assert_eq!(last.status, "completed");
    assert_eq!(last.progress_percent, 100);

    // 第二步的 running 一定在第一步 completed 之后
    let position = |step: &str, status: &str| {
        events
            .iter()
            .position(|e| e.step_id.as_deref() == Some(step) && e.status == status)
            .unwrap()
    };
    assert!(position(&accepted.step_ids[0], "completed") < position(&accepted.step_ids[1], "running"));

    // 步骤事件携带本次提交之后的进度
    let completed_progress: Vec<u8> = events
        .iter()
        .filter(|e| e.event_type == EventType::StepStatus && e.status == "completed")
        .map(|e| e.progress_percent)
        .collect();
    assert_eq!(completed_progress, vec![50, 100]);

    assert!(engine.unsubscribe(&accepted.task_id, &subscription.observer_id));
    assert_eq!(engine.subscriber_count(&accepted.task_id), 0);
}

#[tokio::test]
async fn test_store_error_fails_task_instead_of_hanging() {
    let dir = tempfile::tempdir().unwrap();
    let mut registry = ToolRegistry::new();
    registry.register(EchoTool);
    let engine = Engine::builder(test_config(dir.path()))
        .with_registry(registry)
        .with_store(Arc::new(FlakyStore::new()))
        .build()
        .await;

    let accepted = engine
        .submit(TaskSubmission::new("alice", "flaky store").step(echo("hi")))
        .await
        .unwrap();
    let task = engine.wait_for_terminal(&accepted.task_id, WAIT).await.unwrap();
    assert_eq!(task.status, TaskStatus::Failed);

    let steps = engine.steps(&accepted.task_id).await.unwrap();
    assert_eq!(steps[0].status, StepStatus::Failed);
    assert!(matches!(steps[0].error, Some(ToolFailure::SandboxInfraFailure(_))));
    wait_until(|| {
        let engine = engine.clone();
        async move { engine.active_tasks().is_empty() }
    })
    .await;

    // 存储恢复后可以重试到完成
    engine.retry_task(&accepted.task_id).await.unwrap();
    let task = engine.wait_for_terminal(&accepted.task_id, WAIT).await.unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
}

#[tokio::test]
async fn test_per_user_slots_shared_across_tasks() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = test_config(dir.path());
    cfg.governor.per_user_slots = 1;
    let work = Arc::new(ScriptedTool::new("work").delay(Duration::from_millis(30)));
    let engine = engine_with(cfg, &[work.clone()]).await;

    let mut ids = Vec::new();
    for i in 0..3 {
        let accepted = engine
            .submit(
                TaskSubmission::new("alice", format!("task {i}"))
                    .step(StepSpec::new("work", json!({})))
                    .step(StepSpec::new("work", json!({}))),
            )
            .await
            .unwrap();
        ids.push(accepted.task_id);
    }
    for id in &ids {
        let task = engine.wait_for_terminal(id, WAIT).await.unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
    }
    assert_eq!(work.calls(), 6);
    assert_eq!(work.peak(), 1);
}

#[tokio::test]
async fn test_stats_and_history() {
    let dir = tempfile::tempdir().unwrap();
    let broken = Arc::new(
        ScriptedTool::new("broken").script(vec![Err(ToolFailure::InvalidParameters("bad".into()))]),
    );
    let engine = engine_with(test_config(dir.path()), &[broken]).await;

    let ok = engine
        .submit(TaskSubmission::new("alice", "ok").step(echo("hi")))
        .await
        .unwrap();
    let bad = engine
        .submit(TaskSubmission::new("bob", "bad").step(StepSpec::new("broken", json!({}))))
        .await
        .unwrap();
    engine.wait_for_terminal(&ok.task_id, WAIT).await.unwrap();
    engine.wait_for_terminal(&bad.task_id, WAIT).await.unwrap();

    let stats = engine.stats().await.unwrap();
    assert_eq!(stats.total_tasks, 2);
    assert_eq!(stats.completed_tasks, 1);
    assert_eq!(stats.failed_tasks, 1);
    assert!((stats.success_rate - 50.0).abs() < f64::EPSILON);

    let bobs = engine.list_tasks(&TaskFilter::user("bob")).await.unwrap();
    assert_eq!(bobs.len(), 1);
    assert_eq!(bobs[0].id, bad.task_id);
    let failed = engine
        .list_tasks(&TaskFilter::default().with_status(TaskStatus::Failed))
        .await
        .unwrap();
    assert_eq!(failed.len(), 1);

    let history = engine.tool_history("echo", 10).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].task_id, ok.task_id);
    assert!(matches!(
        engine.tool_history("teleport", 10).await.unwrap_err(),
        EngineError::UnknownTool(_)
    ));
    assert!(matches!(
        engine.task("missing").await.unwrap_err(),
        EngineError::TaskNotFound(_)
    ));
}

#[tokio::test]
async fn test_shutdown_cancels_and_rejects() {
    let dir = tempfile::tempdir().unwrap();
    let slow = Arc::new(ScriptedTool::new("slow").delay(Duration::from_secs(30)));
    let engine = engine_with(test_config(dir.path()), &[slow]).await;

    let accepted = engine
        .submit(TaskSubmission::new("alice", "long").step(StepSpec::new("slow", json!({}))))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    engine.shutdown().await;
    assert!(engine.is_shutting_down());
    assert_eq!(engine.task(&accepted.task_id).await.unwrap().status, TaskStatus::Cancelled);
    assert!(engine.active_tasks().is_empty());
    assert!(matches!(
        engine
            .submit(TaskSubmission::new("alice", "late").step(echo("x")))
            .await
            .unwrap_err(),
        EngineError::ShuttingDown
    ));
}
