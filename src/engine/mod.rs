//! 执行引擎：对外的提交 / 订阅 / 控制 / 查询接口
//!
//! Engine 持有共享组件（StateTracker、ResourceGovernor、SandboxExecutor），每个活跃任务一个 TaskCoordinator。
//! 通过 EngineBuilder 组装，未指定的组件按 AppConfig 创建。

pub mod events;
pub mod scheduler;
pub mod tracker;

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::core::{EngineError, RecoveryPolicy, ResourceGovernor, ShutdownCleanup};
use crate::plan::{PlanCompiler, PlanGraph, Step, StepId, StepStatus, Task, TaskAccepted, TaskId, TaskStatus, TaskSubmission};
use crate::sandbox::{ConfirmationGate, ExecutionRecord, SandboxExecutor};
use crate::store::{create_task_store, TaskFilter, TaskStore};
use crate::tools::{builtin_registry, ToolRegistry};

pub use events::{EventPublisher, EventType, Subscription, TaskEvent, TaskSnapshot};
pub use scheduler::{Services, TaskCoordinator};
pub use tracker::{aggregate_status, progress_percent, Applied, StateTracker, StepChange};

/// 全局统计
#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub total_tasks: usize,
    pub pending_tasks: usize,
    pub running_tasks: usize,
    pub completed_tasks: usize,
    pub failed_tasks: usize,
    pub cancelled_tasks: usize,
    /// 已完成任务的平均执行时间（毫秒）
    pub average_execution_ms: f64,
    /// completed / total * 100
    pub success_rate: f64,
}

/// 单个任务的执行报告
#[derive(Debug, Clone, Serialize)]
pub struct TaskReport {
    pub task_id: TaskId,
    pub title: String,
    pub status: TaskStatus,
    pub error_message: Option<String>,
    pub total_steps: usize,
    pub completed_steps: usize,
    pub failed_steps: Vec<StepId>,
    pub skipped_steps: Vec<StepId>,
    pub tools_used: Vec<String>,
    pub attempts: usize,
    pub execution_time_ms: Option<i64>,
}

struct ActiveTask {
    generation: u64,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

struct EngineInner {
    config: AppConfig,
    compiler: PlanCompiler,
    services: Arc<Services>,
    store: Arc<dyn TaskStore>,
    active: Mutex<HashMap<TaskId, ActiveTask>>,
    generation: AtomicU64,
    shutting_down: AtomicBool,
    root_cancel: CancellationToken,
}

/// 引擎构建器
pub struct EngineBuilder {
    config: AppConfig,
    registry: Option<ToolRegistry>,
    store: Option<Arc<dyn TaskStore>>,
    governor: Option<Arc<ResourceGovernor>>,
}

impl EngineBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            registry: None,
            store: None,
            governor: None,
        }
    }

    /// 使用自定义工具注册表（默认注册全部内置工具）
    pub fn with_registry(mut self, registry: ToolRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn TaskStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// 多个引擎共享同一组执行槽位
    pub fn with_governor(mut self, governor: Arc<ResourceGovernor>) -> Self {
        self.governor = Some(governor);
        self
    }

    pub async fn build(self) -> Engine {
        let config = self.config;
        let store = match self.store {
            Some(store) => store,
            None => create_task_store(&config.storage).await,
        };
        let registry = Arc::new(self.registry.unwrap_or_else(|| builtin_registry(&config.tools)));
        let governor = self
            .governor
            .unwrap_or_else(|| Arc::new(ResourceGovernor::from_config(&config.governor)));

        let publisher = Arc::new(EventPublisher::new(config.engine.event_buffer));
        let tracker = Arc::new(StateTracker::new(
            Arc::clone(&store),
            publisher,
            config.engine.failure_policy,
        ));
        let executor = Arc::new(SandboxExecutor::new(
            Arc::clone(&registry),
            Arc::new(ConfirmationGate::new()),
            Arc::clone(&store),
            config.sandbox.clone(),
            Duration::from_millis(config.engine.cancel_grace_ms),
        ));
        let services = Arc::new(Services {
            tracker,
            governor,
            executor,
            recovery: RecoveryPolicy::from_config(&config.retry),
            max_concurrent_steps: config.engine.max_concurrent_steps.max(1),
            confirmation_timeout: Duration::from_secs(config.engine.task_timeout_secs),
        });
        let compiler = PlanCompiler::new(registry, config.retry.default_max_retries);

        tracing::info!(
            tools = services.executor.registry().tool_names().len(),
            global_slots = services.governor.global_slots(),
            policy = ?config.engine.failure_policy,
            "engine ready"
        );

        Engine {
            inner: Arc::new(EngineInner {
                config,
                compiler,
                services,
                store,
                active: Mutex::new(HashMap::new()),
                generation: AtomicU64::new(0),
                shutting_down: AtomicBool::new(false),
                root_cancel: CancellationToken::new(),
            }),
        }
    }
}

#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    pub fn builder(config: AppConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    pub async fn from_config(config: AppConfig) -> Self {
        EngineBuilder::new(config).build().await
    }

    pub fn config(&self) -> &AppConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        self.inner.services.executor.registry()
    }

    pub fn governor(&self) -> &Arc<ResourceGovernor> {
        &self.inner.services.governor
    }

    fn tracker(&self) -> &Arc<StateTracker> {
        &self.inner.services.tracker
    }

    fn lock_active(&self) -> std::sync::MutexGuard<'_, HashMap<TaskId, ActiveTask>> {
        self.inner.active.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 编译、持久化并开始执行；校验失败时不产生任何任务或步骤
    pub async fn submit(&self, submission: TaskSubmission) -> Result<TaskAccepted, EngineError> {
        if self.inner.shutting_down.load(Ordering::SeqCst) {
            return Err(EngineError::ShuttingDown);
        }
        let plan = self.inner.compiler.compile(submission)?;
        let accepted = self.tracker().register(&plan).await?;
        self.spawn_coordinator(&plan.task.id, &plan.task.user_id, plan.graph);
        Ok(accepted)
    }

    fn spawn_coordinator(&self, task_id: &str, user_id: &str, graph: PlanGraph) {
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst);
        let cancel = self.inner.root_cancel.child_token();
        let coordinator = TaskCoordinator::new(
            task_id.to_string(),
            user_id.to_string(),
            graph,
            Arc::clone(&self.inner.services),
            cancel.clone(),
        );

        // 持锁插入，协调器结束时的移除一定发生在插入之后
        let mut active = self.lock_active();
        let inner = Arc::clone(&self.inner);
        let id = task_id.to_string();
        let handle = tokio::spawn(async move {
            coordinator.run().await;
            inner.services.tracker.publisher().close(&id);
            let mut active = inner.active.lock().unwrap_or_else(|e| e.into_inner());
            if active.get(&id).map(|a| a.generation) == Some(generation) {
                active.remove(&id);
            }
        });
        active.insert(
            task_id.to_string(),
            ActiveTask {
                generation,
                cancel,
                handle,
            },
        );
    }

    /// 订阅任务事件：先得到快照，再接收之后的实时事件
    pub async fn subscribe(&self, task_id: &str) -> Result<Subscription, EngineError> {
        self.tracker().subscribe(task_id).await
    }

    pub fn unsubscribe(&self, task_id: &str, observer_id: &str) -> bool {
        self.tracker().publisher().unsubscribe(task_id, observer_id)
    }

    pub fn subscriber_count(&self, task_id: &str) -> usize {
        self.tracker().publisher().subscriber_count(task_id)
    }

    /// 取消任务：未结束的步骤立即标记为 cancelled，在途执行在宽限期内退出
    pub async fn cancel_task(&self, task_id: &str) -> Result<Task, EngineError> {
        let task = self.tracker().cancel_task(task_id).await?;
        if let Some(active) = self.lock_active().get(task_id) {
            active.cancel.cancel();
        }
        let gate = self.inner.services.executor.gate();
        for step in self.tracker().steps(task_id).await? {
            gate.clear(&step.id);
        }
        Ok(task)
    }

    /// 批准需要确认的步骤；返回 false 表示此前已批准
    pub async fn approve_step(&self, step_id: &str) -> Result<bool, EngineError> {
        let step = self.tracker().step(step_id).await?;
        if step.status.is_terminal() {
            return Err(EngineError::InvalidState(format!(
                "step {step_id} is already {}",
                step.status
            )));
        }
        let task = self.tracker().task(&step.task_id).await?;
        if task.status.is_terminal() {
            return Err(EngineError::InvalidState(format!(
                "task {} is already {}",
                task.id, task.status
            )));
        }
        let first = self.inner.services.executor.gate().approve(step_id);
        tracing::info!(task_id = %task.id, step_id = %step_id, first, "step approval recorded");
        Ok(first)
    }

    /// 重试失败的任务：failed / skipped 步骤重新打开后启动新的协调器
    pub async fn retry_task(&self, task_id: &str) -> Result<Task, EngineError> {
        if self.inner.shutting_down.load(Ordering::SeqCst) {
            return Err(EngineError::ShuttingDown);
        }
        let task = self.tracker().task(task_id).await?;
        if task.status != TaskStatus::Failed {
            return Err(EngineError::InvalidState(format!(
                "only failed tasks can be retried, task {task_id} is {}",
                task.status
            )));
        }

        // 旧协调器在任务失败后即将退出，等它收尾（关闭事件通道）
        let previous = self.lock_active().remove(task_id);
        if let Some(previous) = previous {
            let _ = previous.handle.await;
        }

        let task = self.tracker().reopen_failed(task_id).await?;
        let steps = self.tracker().steps(task_id).await?;
        self.spawn_coordinator(task_id, &task.user_id, PlanGraph::from_steps(&steps));
        Ok(task)
    }

    pub async fn task(&self, task_id: &str) -> Result<Task, EngineError> {
        self.tracker().task(task_id).await
    }

    pub async fn steps(&self, task_id: &str) -> Result<Vec<Step>, EngineError> {
        self.tracker().steps(task_id).await
    }

    pub async fn step(&self, step_id: &str) -> Result<Step, EngineError> {
        self.tracker().step(step_id).await
    }

    pub async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>, EngineError> {
        Ok(self.inner.store.list_tasks(filter).await?)
    }

    pub async fn execution_records(&self, task_id: &str) -> Result<Vec<ExecutionRecord>, EngineError> {
        self.tracker().task(task_id).await?;
        Ok(self.inner.store.list_records(task_id).await?)
    }

    pub async fn tool_history(&self, tool_name: &str, limit: usize) -> Result<Vec<ExecutionRecord>, EngineError> {
        if !self.registry().contains(tool_name) {
            return Err(EngineError::UnknownTool(tool_name.to_string()));
        }
        Ok(self.inner.store.tool_records(tool_name, limit).await?)
    }

    /// 正在由协调器驱动的任务
    pub fn active_tasks(&self) -> Vec<TaskId> {
        let mut ids: Vec<TaskId> = self.lock_active().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn stats(&self) -> Result<EngineStats, EngineError> {
        let tasks = self.inner.store.list_tasks(&TaskFilter::default()).await?;
        let count = |status: TaskStatus| tasks.iter().filter(|t| t.status == status).count();

        let durations: Vec<i64> = tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Completed)
            .filter_map(|t| Some(t.completed_at? - t.started_at?))
            .collect();
        let average_execution_ms = if durations.is_empty() {
            0.0
        } else {
            durations.iter().sum::<i64>() as f64 / durations.len() as f64
        };

        let completed = count(TaskStatus::Completed);
        let success_rate = if tasks.is_empty() {
            0.0
        } else {
            completed as f64 / tasks.len() as f64 * 100.0
        };

        Ok(EngineStats {
            total_tasks: tasks.len(),
            pending_tasks: count(TaskStatus::Pending),
            running_tasks: count(TaskStatus::Running),
            completed_tasks: completed,
            failed_tasks: count(TaskStatus::Failed),
            cancelled_tasks: count(TaskStatus::Cancelled),
            average_execution_ms,
            success_rate,
        })
    }

    pub async fn task_report(&self, task_id: &str) -> Result<TaskReport, EngineError> {
        let task = self.tracker().task(task_id).await?;
        let steps = self.inner.store.list_steps(task_id).await?;
        let records = self.inner.store.list_records(task_id).await?;

        let ids_with = |status: StepStatus| -> Vec<StepId> {
            steps
                .iter()
                .filter(|s| s.status == status)
                .map(|s| s.id.clone())
                .collect()
        };
        let tools_used: BTreeSet<String> = records.iter().map(|r| r.tool_name.clone()).collect();

        Ok(TaskReport {
            task_id: task.id.clone(),
            title: task.title.clone(),
            status: task.status,
            error_message: task.error_message.clone(),
            total_steps: steps.len(),
            completed_steps: steps.iter().filter(|s| s.status == StepStatus::Completed).count(),
            failed_steps: ids_with(StepStatus::Failed),
            skipped_steps: ids_with(StepStatus::Skipped),
            tools_used: tools_used.into_iter().collect(),
            attempts: records.len(),
            execution_time_ms: match (task.started_at, task.completed_at) {
                (Some(start), Some(end)) => Some(end - start),
                _ => None,
            },
        })
    }

    /// 等待任务进入终态，超时返回 WaitTimeout；事件流在非终态下关闭返回 InvalidState
    pub async fn wait_for_terminal(&self, task_id: &str, timeout: Duration) -> Result<Task, EngineError> {
        let mut subscription = self.subscribe(task_id).await?;
        if subscription.snapshot.task.is_finished() {
            return Ok(subscription.snapshot.task.clone());
        }

        let finished = async {
            while let Some(event) = subscription.next().await {
                let terminal = event.event_type == EventType::TaskStatus
                    && event
                        .status
                        .parse::<TaskStatus>()
                        .map(TaskStatus::is_terminal)
                        .unwrap_or(false);
                if terminal {
                    return true;
                }
            }
            false
        };
        let seen_terminal = tokio::time::timeout(timeout, finished)
            .await
            .map_err(|_| EngineError::WaitTimeout(task_id.to_string()))?;
        let task = self.task(task_id).await?;
        if !seen_terminal && !task.is_finished() {
            return Err(EngineError::InvalidState(format!(
                "event stream of task {task_id} closed while task is {}",
                task.status
            )));
        }
        Ok(task)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::SeqCst)
    }

    /// 停止接收新任务，取消所有活跃任务并等待协调器退出，最后关闭槽位与存储
    pub async fn shutdown(&self) {
        if self.inner.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let active: Vec<(TaskId, ActiveTask)> = self.lock_active().drain().collect();
        tracing::info!(active = active.len(), "engine shutting down");

        for (task_id, _) in &active {
            match self.tracker().cancel_task(task_id).await {
                Ok(_) | Err(EngineError::InvalidState(_)) => {}
                Err(e) => tracing::warn!(task_id = %task_id, error = %e, "failed to cancel task on shutdown"),
            }
        }
        self.inner.root_cancel.cancel();

        let wait = Duration::from_millis(self.inner.config.engine.cancel_grace_ms.saturating_mul(2).max(100));
        futures_util::future::join_all(active.into_iter().map(|(task_id, active)| async move {
            if tokio::time::timeout(wait, active.handle).await.is_err() {
                tracing::warn!(task_id = %task_id, "coordinator did not stop within grace period");
            }
        }))
        .await;

        self.inner.services.governor.close();
        self.inner.store.close().await;
        tracing::info!("engine stopped");
    }
}

/// 关闭时取消全部任务并关闭存储
pub struct EngineCleanup {
    engine: Engine,
}

impl EngineCleanup {
    pub fn new(engine: Engine) -> Self {
        Self { engine }
    }
}

#[async_trait::async_trait]
impl ShutdownCleanup for EngineCleanup {
    async fn cleanup(&self) -> anyhow::Result<()> {
        self.engine.shutdown().await;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "Engine"
    }
}
