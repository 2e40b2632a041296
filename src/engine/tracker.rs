//! 状态跟踪：步骤状态机、任务聚合状态、事件发布
//!
//! 所有状态写入都经过这里：同一任务的写入在任务锁内串行，存储层再用 version 做条件写入，
//! 冲突时重新读取并重试。每次步骤提交后重新计算任务的聚合状态与进度，并按提交顺序发布事件。

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use serde_json::{json, Value};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::config::FailurePolicy;
use crate::core::{EngineError, ToolFailure};
use crate::engine::events::{EventDraft, EventPublisher, EventType, Subscription, TaskSnapshot};
use crate::plan::{now_millis, CompiledPlan, Step, StepId, StepStatus, Task, TaskAccepted, TaskId, TaskStatus};
use crate::store::{StoreError, TaskStore};

/// 版本冲突时的最大尝试次数
const MAX_WRITE_ATTEMPTS: usize = 3;

/// 对单个步骤请求的状态变化
#[derive(Debug, Clone)]
pub enum StepChange {
    /// pending → ready（依赖全部完成）
    Promote,
    /// ready → running；任务已取消 / 已结束或依赖未完成时拒绝
    Start,
    Complete { output: Value },
    /// running → ready，消耗一次重试
    RetryLater { failure: ToolFailure },
    Fail { failure: ToolFailure },
    /// 上游失败导致的级联跳过
    Skip { cause: StepId },
    Cancel,
    /// failed / skipped → ready 或 pending（任务重试）
    Reopen,
}

impl StepChange {
    fn label(&self) -> &'static str {
        match self {
            StepChange::Promote => "promote",
            StepChange::Start => "start",
            StepChange::Complete { .. } => "complete",
            StepChange::RetryLater { .. } => "retry_later",
            StepChange::Fail { .. } => "fail",
            StepChange::Skip { .. } => "skip",
            StepChange::Cancel => "cancel",
            StepChange::Reopen => "reopen",
        }
    }
}

/// 状态变化的结果
#[derive(Debug, Clone)]
pub enum Applied {
    Committed(Step),
    /// 步骤已处于终态（或无需变化），未写入
    Unchanged(Step),
}

impl Applied {
    pub fn step(&self) -> &Step {
        match self {
            Applied::Committed(s) | Applied::Unchanged(s) => s,
        }
    }

    pub fn is_committed(&self) -> bool {
        matches!(self, Applied::Committed(_))
    }
}

/// 由步骤状态推导任务状态
///
/// 显式取消优先；所有步骤进入终态后按失败策略判定完成或失败；否则有步骤开始过即为 running。
pub fn aggregate_status(task: &Task, steps: &[Step], policy: FailurePolicy) -> TaskStatus {
    if task.cancel_requested {
        return TaskStatus::Cancelled;
    }
    if !steps.is_empty() && steps.iter().all(|s| s.status.is_terminal()) {
        let succeeded = match policy {
            FailurePolicy::Strict => steps.iter().all(|s| s.status == StepStatus::Completed),
            FailurePolicy::BestEffort => steps.iter().any(|s| s.status == StepStatus::Completed),
        };
        return if succeeded {
            TaskStatus::Completed
        } else {
            TaskStatus::Failed
        };
    }
    let started = task.started_at.is_some()
        || steps
            .iter()
            .any(|s| !matches!(s.status, StepStatus::Pending | StepStatus::Ready) || s.retry_count > 0);
    if started {
        TaskStatus::Running
    } else {
        TaskStatus::Pending
    }
}

/// completed / total * 100（向下取整）
pub fn progress_percent(steps: &[Step]) -> u8 {
    if steps.is_empty() {
        return 0;
    }
    let completed = steps.iter().filter(|s| s.status == StepStatus::Completed).count();
    (completed * 100 / steps.len()) as u8
}

/// changed 写入后的进度（steps 为写入前读到的全部步骤）
fn progress_after(steps: &[Step], changed: &Step) -> u8 {
    let after: Vec<Step> = steps
        .iter()
        .map(|s| if s.id == changed.id { changed.clone() } else { s.clone() })
        .collect();
    progress_percent(&after)
}

/// 任务失败时的错误描述：最早结束的失败步骤优先
fn failure_message(steps: &[Step]) -> Option<String> {
    let first = |status: StepStatus| {
        steps
            .iter()
            .filter(|s| s.status == status)
            .min_by_key(|s| (s.completed_at.unwrap_or(i64::MAX), s.seq))
    };
    if let Some(step) = first(StepStatus::Failed) {
        let reason = step
            .error
            .as_ref()
            .map(|e| e.to_string())
            .unwrap_or_else(|| "unknown error".to_string());
        return Some(format!("step {} ({}) failed: {}", step.id, step.tool_name, reason));
    }
    first(StepStatus::Cancelled).map(|step| format!("step {} ({}) was cancelled", step.id, step.tool_name))
}

fn apply_change(
    step: &Step,
    change: &StepChange,
    task: &Task,
    statuses: &HashMap<StepId, StepStatus>,
) -> Result<Option<Step>, EngineError> {
    let deps_completed = || {
        step.dependency_ids
            .iter()
            .all(|d| statuses.get(d) == Some(&StepStatus::Completed))
    };

    if let StepChange::Reopen = change {
        if !matches!(step.status, StepStatus::Failed | StepStatus::Skipped) {
            return Ok(None);
        }
        let mut next = step.clone();
        next.status = if deps_completed() {
            StepStatus::Ready
        } else {
            StepStatus::Pending
        };
        next.retry_count = 0;
        next.output = None;
        next.error = None;
        next.started_at = None;
        next.completed_at = None;
        return Ok(Some(next));
    }

    // 终态步骤上的任何变化都是无操作（重复投递的完成通知等）
    if step.status.is_terminal() {
        return Ok(None);
    }

    let invalid = |what: &str| -> Result<Option<Step>, EngineError> {
        Err(EngineError::InvalidState(format!(
            "cannot {what} step {} in state {}",
            step.id, step.status
        )))
    };
    let mut next = step.clone();
    let now = now_millis();

    match change {
        StepChange::Promote => {
            if step.status != StepStatus::Pending {
                return Ok(None);
            }
            next.status = StepStatus::Ready;
        }
        StepChange::Start => {
            if task.cancel_requested || task.status.is_terminal() {
                return Err(EngineError::InvalidState(format!(
                    "task {} is {}, step {} cannot start",
                    task.id,
                    if task.cancel_requested { "cancelled" } else { task.status.as_str() },
                    step.id
                )));
            }
            if step.status != StepStatus::Ready {
                return invalid("start");
            }
            if !deps_completed() {
                return Err(EngineError::InvalidState(format!(
                    "step {} has unfinished dependencies",
                    step.id
                )));
            }
            next.status = StepStatus::Running;
            next.started_at = Some(now);
        }
        StepChange::Complete { output } => {
            if step.status != StepStatus::Running {
                return invalid("complete");
            }
            next.status = StepStatus::Completed;
            next.output = Some(output.clone());
            next.error = None;
            next.completed_at = Some(now);
        }
        StepChange::RetryLater { failure } => {
            if step.status != StepStatus::Running {
                return invalid("retry");
            }
            if step.retry_count >= step.max_retries {
                return Err(EngineError::InvalidState(format!(
                    "step {} has no retries left ({}/{})",
                    step.id, step.retry_count, step.max_retries
                )));
            }
            next.status = StepStatus::Ready;
            next.retry_count += 1;
            next.error = Some(failure.clone());
        }
        StepChange::Fail { failure } => {
            next.status = StepStatus::Failed;
            next.error = Some(failure.clone());
            next.completed_at = Some(now);
        }
        StepChange::Skip { .. } => {
            if step.status == StepStatus::Running {
                return invalid("skip");
            }
            next.status = StepStatus::Skipped;
            next.completed_at = Some(now);
        }
        StepChange::Cancel => {
            next.status = StepStatus::Cancelled;
            next.completed_at = Some(now);
        }
        StepChange::Reopen => return Ok(None),
    }
    Ok(Some(next))
}

type TaskLocks = Arc<StdMutex<HashMap<TaskId, Arc<Mutex<()>>>>>;

/// 持有中的任务锁；释放时若没有其他持有者或等待者，移除该任务的锁条目
struct TaskGuard {
    locks: TaskLocks,
    task_id: TaskId,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        self.guard.take();
        if locks.get(&self.task_id).is_some_and(|l| Arc::strong_count(l) == 1) {
            locks.remove(&self.task_id);
        }
    }
}

pub struct StateTracker {
    store: Arc<dyn TaskStore>,
    publisher: Arc<EventPublisher>,
    policy: FailurePolicy,
    locks: TaskLocks,
}

impl StateTracker {
    pub fn new(store: Arc<dyn TaskStore>, publisher: Arc<EventPublisher>, policy: FailurePolicy) -> Self {
        Self {
            store,
            publisher,
            policy,
            locks: Arc::new(StdMutex::new(HashMap::new())),
        }
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    pub fn publisher(&self) -> &Arc<EventPublisher> {
        &self.publisher
    }

    async fn lock_task(&self, task_id: &str) -> TaskGuard {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            Arc::clone(locks.entry(task_id.to_string()).or_default())
        };
        TaskGuard {
            locks: Arc::clone(&self.locks),
            task_id: task_id.to_string(),
            guard: Some(lock.lock_owned().await),
        }
    }

    /// 当前有持有者或等待者的任务锁数量
    pub fn held_locks(&self) -> usize {
        self.locks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// 持久化编译好的计划并发布 task_accepted
    pub async fn register(&self, plan: &CompiledPlan) -> Result<TaskAccepted, EngineError> {
        let task_id = plan.task.id.clone();
        let _guard = self.lock_task(&task_id).await;

        self.store
            .insert_task(&plan.task, &plan.steps)
            .await
            .map_err(|e| match e {
                StoreError::Duplicate(id) => EngineError::DuplicateTask(id),
                other => other.into(),
            })?;

        let step_ids = plan.step_ids();
        self.publisher.open(&task_id);
        self.publisher.publish(
            &task_id,
            EventDraft {
                event_type: EventType::TaskAccepted,
                step_id: None,
                status: plan.task.status.as_str().to_string(),
                progress_percent: 0,
                detail: Some(json!({ "step_ids": step_ids })),
            },
        );
        tracing::info!(task_id = %task_id, user_id = %plan.task.user_id, steps = step_ids.len(), "task accepted");

        Ok(TaskAccepted { task_id, step_ids })
    }

    pub async fn task(&self, task_id: &str) -> Result<Task, EngineError> {
        self.store
            .get_task(task_id)
            .await?
            .ok_or_else(|| EngineError::TaskNotFound(task_id.to_string()))
    }

    pub async fn steps(&self, task_id: &str) -> Result<Vec<Step>, EngineError> {
        self.task(task_id).await?;
        Ok(self.store.list_steps(task_id).await?)
    }

    pub async fn step(&self, step_id: &str) -> Result<Step, EngineError> {
        self.store
            .get_step(step_id)
            .await?
            .ok_or_else(|| EngineError::StepNotFound(step_id.to_string()))
    }

    async fn snapshot_locked(&self, task_id: &str) -> Result<TaskSnapshot, EngineError> {
        let task = self.task(task_id).await?;
        let steps = self.store.list_steps(task_id).await?;
        Ok(TaskSnapshot {
            task,
            steps,
            last_seq: self.publisher.last_seq(),
        })
    }

    pub async fn snapshot(&self, task_id: &str) -> Result<TaskSnapshot, EngineError> {
        let _guard = self.lock_task(task_id).await;
        self.snapshot_locked(task_id).await
    }

    /// 快照与订阅在同一把任务锁内完成，中间不会漏掉或重复事件
    pub async fn subscribe(&self, task_id: &str) -> Result<Subscription, EngineError> {
        let _guard = self.lock_task(task_id).await;
        let snapshot = self.snapshot_locked(task_id).await?;
        Ok(self.publisher.subscribe(snapshot))
    }

    pub async fn transition_step(
        &self,
        task_id: &str,
        step_id: &str,
        change: StepChange,
    ) -> Result<Applied, EngineError> {
        let _guard = self.lock_task(task_id).await;
        let applied = self.commit_step(task_id, step_id, &change).await?;
        if applied.is_committed() {
            self.refresh_task(task_id).await?;
        }
        Ok(applied)
    }

    /// 设置取消标记，把所有未结束的步骤置为 cancelled；已结束的任务返回 InvalidState
    pub async fn cancel_task(&self, task_id: &str) -> Result<Task, EngineError> {
        let _guard = self.lock_task(task_id).await;

        self.write_task(task_id, |task| {
            if task.status.is_terminal() {
                return Err(EngineError::InvalidState(format!(
                    "task {} is already {}",
                    task.id, task.status
                )));
            }
            let changed = !task.cancel_requested;
            task.cancel_requested = true;
            Ok(changed)
        })
        .await?;

        for step in self.store.list_steps(task_id).await? {
            if !step.status.is_terminal() {
                self.commit_step(task_id, &step.id, &StepChange::Cancel).await?;
            }
        }
        let task = self.refresh_task(task_id).await?;
        tracing::info!(task_id = %task_id, "task cancelled");
        Ok(task)
    }

    /// 协调器无法继续推进时终结任务：所有未结束的步骤以 failure 失败，任务按失败策略重新聚合
    pub async fn abort_task(&self, task_id: &str, failure: ToolFailure) -> Result<Task, EngineError> {
        let _guard = self.lock_task(task_id).await;
        for step in self.store.list_steps(task_id).await? {
            if !step.status.is_terminal() {
                let change = StepChange::Fail {
                    failure: failure.clone(),
                };
                self.commit_step(task_id, &step.id, &change).await?;
            }
        }
        let task = self.refresh_task(task_id).await?;
        tracing::warn!(task_id = %task_id, status = %task.status, error = %failure, "task aborted");
        Ok(task)
    }

    /// 把失败任务的 failed / skipped 步骤重新打开，任务回到 running
    pub async fn reopen_failed(&self, task_id: &str) -> Result<Task, EngineError> {
        let _guard = self.lock_task(task_id).await;

        self.write_task(task_id, |task| {
            if task.status != TaskStatus::Failed {
                return Err(EngineError::InvalidState(format!(
                    "only failed tasks can be retried, task {} is {}",
                    task.id, task.status
                )));
            }
            task.status = TaskStatus::Running;
            task.error_message = None;
            task.completed_at = None;
            Ok(true)
        })
        .await?;
        self.publisher.open(task_id);

        for step in self.store.list_steps(task_id).await? {
            if matches!(step.status, StepStatus::Failed | StepStatus::Skipped) {
                self.commit_step(task_id, &step.id, &StepChange::Reopen).await?;
            }
        }
        let task = self.refresh_task(task_id).await?;
        tracing::info!(task_id = %task_id, "task reopened for retry");
        Ok(task)
    }

    /// 调用方须持有任务锁
    async fn commit_step(&self, task_id: &str, step_id: &str, change: &StepChange) -> Result<Applied, EngineError> {
        for _ in 0..MAX_WRITE_ATTEMPTS {
            let task = self.task(task_id).await?;
            let steps = self.store.list_steps(task_id).await?;
            let step = steps
                .iter()
                .find(|s| s.id == step_id)
                .cloned()
                .ok_or_else(|| EngineError::StepNotFound(step_id.to_string()))?;
            let statuses: HashMap<StepId, StepStatus> = steps.iter().map(|s| (s.id.clone(), s.status)).collect();

            let Some(next) = apply_change(&step, change, &task, &statuses)? else {
                tracing::debug!(step_id = %step_id, change = change.label(), status = %step.status, "step unchanged");
                return Ok(Applied::Unchanged(step));
            };

            match self.store.update_step(&next, step.version).await {
                Ok(stored) => {
                    tracing::debug!(
                        task_id = %task_id,
                        step_id = %step_id,
                        change = change.label(),
                        from = %step.status,
                        to = %stored.status,
                        "step transition"
                    );
                    self.publish_step(task_id, &stored, progress_after(&steps, &stored));
                    return Ok(Applied::Committed(stored));
                }
                Err(StoreError::VersionConflict { .. }) => {
                    tracing::warn!(step_id = %step_id, change = change.label(), "step version conflict, re-reading");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(EngineError::VersionConflict(format!("step {step_id}")))
    }

    /// 条件写入任务；mutate 返回 false 表示无需写入
    async fn write_task<F>(&self, task_id: &str, mutate: F) -> Result<Task, EngineError>
    where
        F: Fn(&mut Task) -> Result<bool, EngineError>,
    {
        for _ in 0..MAX_WRITE_ATTEMPTS {
            let task = self.task(task_id).await?;
            let mut next = task.clone();
            if !mutate(&mut next)? {
                return Ok(task);
            }
            match self.store.update_task(&next, task.version).await {
                Ok(stored) => return Ok(stored),
                Err(StoreError::VersionConflict { .. }) => {
                    tracing::warn!(task_id = %task_id, "task version conflict, re-reading");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(EngineError::VersionConflict(format!("task {task_id}")))
    }

    /// 根据步骤重新计算任务状态、进度、时间戳与错误信息；有变化则写入并发布 task_status
    async fn refresh_task(&self, task_id: &str) -> Result<Task, EngineError> {
        for _ in 0..MAX_WRITE_ATTEMPTS {
            let task = self.task(task_id).await?;
            let steps = self.store.list_steps(task_id).await?;

            let mut next = task.clone();
            next.status = aggregate_status(&task, &steps, self.policy);
            next.progress_percent = progress_percent(&steps);
            let now = now_millis();
            if next.status != TaskStatus::Pending && next.started_at.is_none() {
                next.started_at = Some(now);
            }
            if next.status.is_terminal() && next.completed_at.is_none() {
                next.completed_at = Some(now);
            }
            // best_effort 下完成的任务同样记录首个失败
            if matches!(next.status, TaskStatus::Failed | TaskStatus::Completed) && next.error_message.is_none() {
                next.error_message = failure_message(&steps);
            }
            if next == task {
                return Ok(task);
            }

            match self.store.update_task(&next, task.version).await {
                Ok(stored) => {
                    if stored.status != task.status || stored.progress_percent != task.progress_percent {
                        self.publish_task(&stored);
                    }
                    if stored.status.is_terminal() && !task.status.is_terminal() {
                        tracing::info!(
                            task_id = %task_id,
                            status = %stored.status,
                            progress = stored.progress_percent,
                            error = stored.error_message.as_deref().unwrap_or(""),
                            "task finished"
                        );
                    }
                    return Ok(stored);
                }
                Err(StoreError::VersionConflict { .. }) => {
                    tracing::warn!(task_id = %task_id, "task version conflict during refresh, re-reading");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(EngineError::VersionConflict(format!("task {task_id}")))
    }

    fn publish_step(&self, task_id: &str, step: &Step, progress: u8) {
        let mut detail = json!({
            "tool_name": step.tool_name,
            "retry_count": step.retry_count,
        });
        if let Some(error) = &step.error {
            detail["error"] = serde_json::to_value(error).unwrap_or(Value::Null);
        }
        self.publisher.publish(
            task_id,
            EventDraft {
                event_type: EventType::StepStatus,
                step_id: Some(step.id.clone()),
                status: step.status.as_str().to_string(),
                progress_percent: progress,
                detail: Some(detail),
            },
        );
    }

    fn publish_task(&self, task: &Task) {
        self.publisher.publish(
            &task.id,
            EventDraft {
                event_type: EventType::TaskStatus,
                step_id: None,
                status: task.status.as_str().to_string(),
                progress_percent: task.progress_percent,
                detail: Some(json!({
                    "priority": task.priority,
                    "error_message": task.error_message,
                })),
            },
        );
    }
}
