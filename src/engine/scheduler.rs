//! 任务协调器：每个任务一个 actor，按 DAG 推进步骤
//!
//! 协调器只通过 StateTracker 改状态，通过 ResourceGovernor 申请槽位，通过 SandboxExecutor 运行工具。
//! 执行结果、确认结果与退避唤醒都作为 Signal 投递到协调器自己的收件箱，串行处理。

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::core::{EngineError, GovernorError, RecoveryAction, RecoveryPolicy, ResourceGovernor, SlotGrant, ToolFailure};
use crate::engine::tracker::{Applied, StateTracker, StepChange};
use crate::plan::{PlanGraph, Step, StepId, StepStatus, TaskId};
use crate::sandbox::{ExecutionOutcome, ExecutionRequest, SandboxExecutor};

/// 协调器出错后终结任务的最大尝试次数
const ABORT_ATTEMPTS: u32 = 3;

/// 协调器共享的引擎组件
pub struct Services {
    pub tracker: Arc<StateTracker>,
    pub governor: Arc<ResourceGovernor>,
    pub executor: Arc<SandboxExecutor>,
    pub recovery: RecoveryPolicy,
    /// 单任务同时 running 的步骤上限
    pub max_concurrent_steps: usize,
    /// 确认闸门等待上限
    pub confirmation_timeout: Duration,
}

enum Signal {
    Finished(ExecutionOutcome),
    Approved(StepId),
    GateFailed(StepId, ToolFailure),
    /// 退避到期，重新尝试调度
    Wake,
}

pub struct TaskCoordinator {
    task_id: TaskId,
    user_id: String,
    graph: PlanGraph,
    services: Arc<Services>,
    cancel: CancellationToken,
    tx: mpsc::UnboundedSender<Signal>,
    rx: mpsc::UnboundedReceiver<Signal>,
    running: HashSet<StepId>,
    awaiting_gate: HashSet<StepId>,
    /// 退避中的步骤，到期前不调度
    not_before: HashMap<StepId, Instant>,
}

impl TaskCoordinator {
    pub fn new(
        task_id: TaskId,
        user_id: String,
        graph: PlanGraph,
        services: Arc<Services>,
        cancel: CancellationToken,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            task_id,
            user_id,
            graph,
            services,
            cancel,
            tx,
            rx,
            running: HashSet::new(),
            awaiting_gate: HashSet::new(),
            not_before: HashMap::new(),
        }
    }

    pub async fn run(mut self) {
        tracing::info!(task_id = %self.task_id, steps = self.graph.len(), "coordinator started");
        if let Err(e) = self.drive().await {
            tracing::error!(task_id = %self.task_id, error = %e, "coordinator stopped on error");
            // 在途执行不再有人接收结果
            self.cancel.cancel();
            self.abort(&e).await;
        }
        let gate = self.services.executor.gate();
        for step_id in self.graph.order() {
            gate.clear(step_id);
        }
        tracing::info!(task_id = %self.task_id, cancelled = self.cancel.is_cancelled(), "coordinator finished");
    }

    /// 把任务推进到终态，使其可以被 retry_task 重新调度
    async fn abort(&self, cause: &EngineError) {
        let failure = ToolFailure::SandboxInfraFailure(format!("coordinator error: {cause}"));
        for attempt in 0..ABORT_ATTEMPTS {
            match self.services.tracker.abort_task(&self.task_id, failure.clone()).await {
                Ok(_) => return,
                Err(e) => {
                    tracing::warn!(task_id = %self.task_id, attempt = attempt + 1, error = %e, "failed to abort task");
                    tokio::time::sleep(self.services.recovery.backoff(attempt)).await;
                }
            }
        }
        tracing::error!(task_id = %self.task_id, "task left unfinished after coordinator error");
    }

    async fn drive(&mut self) -> Result<(), EngineError> {
        loop {
            if self.cancel.is_cancelled() {
                // 取消后只等待在途执行与确认等待退出
                if self.running.is_empty() && self.awaiting_gate.is_empty() {
                    return Ok(());
                }
            } else {
                self.dispatch().await?;
                if self.running.is_empty() && self.awaiting_gate.is_empty() && self.is_drained().await? {
                    return Ok(());
                }
            }

            let signal = tokio::select! {
                s = self.rx.recv() => s,
                _ = self.cancel.cancelled(), if !self.cancel.is_cancelled() => continue,
            };
            match signal {
                Some(signal) => self.handle(signal).await?,
                None => return Ok(()),
            }
        }
    }

    /// 没有 pending / ready / running 的步骤
    async fn is_drained(&self) -> Result<bool, EngineError> {
        let steps = self.services.tracker.steps(&self.task_id).await?;
        Ok(steps
            .iter()
            .all(|s| !matches!(s.status, StepStatus::Pending | StepStatus::Ready | StepStatus::Running)))
    }

    async fn load_steps(&self) -> Result<Vec<Step>, EngineError> {
        self.services.tracker.steps(&self.task_id).await
    }

    /// 提升依赖已满足的步骤，然后按创建顺序启动 ready 步骤直到并发上限
    async fn dispatch(&mut self) -> Result<(), EngineError> {
        let mut steps = self.load_steps().await?;
        let statuses: HashMap<StepId, StepStatus> = steps.iter().map(|s| (s.id.clone(), s.status)).collect();
        let promotable = self.graph.promotable(&statuses);
        if !promotable.is_empty() {
            for id in &promotable {
                self.services
                    .tracker
                    .transition_step(&self.task_id, id, StepChange::Promote)
                    .await?;
            }
            steps = self.load_steps().await?;
        }

        let now = Instant::now();
        for step in steps.into_iter().filter(|s| s.status == StepStatus::Ready) {
            if self.cancel.is_cancelled() || self.running.len() >= self.services.max_concurrent_steps {
                break;
            }
            if self.running.contains(&step.id) || self.awaiting_gate.contains(&step.id) {
                continue;
            }
            if matches!(self.not_before.get(&step.id), Some(t) if *t > now) {
                continue;
            }

            let executor = Arc::clone(&self.services.executor);
            if executor.needs_confirmation(&step.tool_name) && !executor.gate().is_approved(&step.id) {
                self.await_gate(&step.id);
                continue;
            }

            let wait = executor
                .registry()
                .describe(&step.tool_name)
                .map(|d| d.resource_limits.timeout())
                .unwrap_or_else(|| self.services.recovery.base_delay());
            let grant = tokio::select! {
                g = self.services.governor.acquire(&self.user_id, wait) => g,
                _ = self.cancel.cancelled() => return Ok(()),
            };
            let grant = match grant {
                Ok(grant) => grant,
                Err(GovernorError::Timeout(_)) => {
                    tracing::debug!(task_id = %self.task_id, step_id = %step.id, "no execution slot, backing off");
                    let delay = self.services.recovery.base_delay();
                    self.defer(&step.id, delay);
                    continue;
                }
                Err(GovernorError::Closed) => {
                    tracing::warn!(task_id = %self.task_id, "governor closed, dispatch stopped");
                    return Ok(());
                }
            };

            match self
                .services
                .tracker
                .transition_step(&self.task_id, &step.id, StepChange::Start)
                .await
            {
                Ok(Applied::Committed(started)) => self.launch(started, grant),
                Ok(Applied::Unchanged(_)) => {}
                Err(EngineError::InvalidState(reason)) => {
                    tracing::debug!(task_id = %self.task_id, step_id = %step.id, reason = %reason, "step not started");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn launch(&mut self, step: Step, grant: SlotGrant) {
        self.running.insert(step.id.clone());
        self.not_before.remove(&step.id);
        let attempt = step.retry_count + 1;
        tracing::info!(
            task_id = %self.task_id,
            step_id = %step.id,
            tool = %step.tool_name,
            attempt,
            "step started"
        );

        let req = ExecutionRequest {
            task_id: self.task_id.clone(),
            step_id: step.id,
            tool_name: step.tool_name,
            params: step.input_parameters,
            attempt,
            cancel: self.cancel.clone(),
        };
        let executor = Arc::clone(&self.services.executor);
        let governor = Arc::clone(&self.services.governor);
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let outcome = executor.execute(req).await;
            governor.release(grant);
            let _ = tx.send(Signal::Finished(outcome));
        });
    }

    fn await_gate(&mut self, step_id: &str) {
        self.awaiting_gate.insert(step_id.to_string());
        let executor = Arc::clone(&self.services.executor);
        let tx = self.tx.clone();
        let cancel = self.cancel.clone();
        let deadline = self.services.confirmation_timeout;
        let step_id = step_id.to_string();
        tokio::spawn(async move {
            let signal = match executor.await_confirmation(&step_id, deadline, &cancel).await {
                Ok(()) => Signal::Approved(step_id),
                Err(failure) => Signal::GateFailed(step_id, failure),
            };
            let _ = tx.send(signal);
        });
    }

    fn defer(&mut self, step_id: &str, delay: Duration) {
        self.not_before.insert(step_id.to_string(), Instant::now() + delay);
        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(Signal::Wake);
        });
    }

    async fn handle(&mut self, signal: Signal) -> Result<(), EngineError> {
        match signal {
            Signal::Wake => Ok(()),
            Signal::Approved(step_id) => {
                tracing::info!(task_id = %self.task_id, step_id = %step_id, "step approved");
                self.awaiting_gate.remove(&step_id);
                Ok(())
            }
            Signal::GateFailed(step_id, failure) => {
                self.awaiting_gate.remove(&step_id);
                if self.cancel.is_cancelled() {
                    return Ok(());
                }
                tracing::warn!(task_id = %self.task_id, step_id = %step_id, error = %failure, "confirmation not granted");
                self.fail_step(&step_id, failure).await
            }
            Signal::Finished(outcome) => self.on_finished(outcome).await,
        }
    }

    async fn on_finished(&mut self, outcome: ExecutionOutcome) -> Result<(), EngineError> {
        self.running.remove(&outcome.step_id);
        let step_id = outcome.step_id;
        let tracker = Arc::clone(&self.services.tracker);

        let failure = match outcome.result {
            Ok(output) => {
                tracker
                    .transition_step(&self.task_id, &step_id, StepChange::Complete { output })
                    .await?;
                self.services.executor.gate().clear(&step_id);
                tracing::info!(task_id = %self.task_id, step_id = %step_id, attempt = outcome.attempt, "step completed");
                return Ok(());
            }
            Err(failure) => failure,
        };

        if self.cancel.is_cancelled() {
            tracker
                .transition_step(&self.task_id, &step_id, StepChange::Cancel)
                .await?;
            return Ok(());
        }

        let step = tracker.step(&step_id).await?;
        match self
            .services
            .recovery
            .handle(&failure, step.retry_count, step.max_retries)
        {
            RecoveryAction::Retry { delay } => {
                tracing::warn!(
                    task_id = %self.task_id,
                    step_id = %step_id,
                    attempt = outcome.attempt,
                    retry_in_ms = delay.as_millis() as u64,
                    error = %failure,
                    "step failed, will retry"
                );
                let applied = tracker
                    .transition_step(&self.task_id, &step_id, StepChange::RetryLater { failure })
                    .await?;
                if applied.is_committed() {
                    self.defer(&step_id, delay);
                }
                Ok(())
            }
            RecoveryAction::Fail => {
                tracing::warn!(task_id = %self.task_id, step_id = %step_id, error = %failure, "step failed");
                self.fail_step(&step_id, failure).await
            }
            RecoveryAction::Cancel => {
                tracing::info!(task_id = %self.task_id, step_id = %step_id, "step cancelled");
                tracker
                    .transition_step(&self.task_id, &step_id, StepChange::Cancel)
                    .await?;
                self.services.executor.gate().clear(&step_id);
                self.skip_descendants(&step_id).await
            }
        }
    }

    async fn fail_step(&mut self, step_id: &str, failure: ToolFailure) -> Result<(), EngineError> {
        self.services
            .tracker
            .transition_step(&self.task_id, step_id, StepChange::Fail { failure })
            .await?;
        self.services.executor.gate().clear(step_id);
        self.skip_descendants(step_id).await
    }

    /// 级联跳过所有（传递）依赖 step_id 的步骤
    async fn skip_descendants(&mut self, step_id: &str) -> Result<(), EngineError> {
        for dependent in self.graph.descendants(step_id) {
            let change = StepChange::Skip {
                cause: step_id.to_string(),
            };
            match self
                .services
                .tracker
                .transition_step(&self.task_id, &dependent, change)
                .await
            {
                Ok(Applied::Committed(_)) => {
                    tracing::info!(task_id = %self.task_id, step_id = %dependent, cause = %step_id, "step skipped");
                }
                Ok(Applied::Unchanged(_)) => {}
                Err(EngineError::InvalidState(reason)) => {
                    tracing::warn!(task_id = %self.task_id, step_id = %dependent, reason = %reason, "skip refused");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}
