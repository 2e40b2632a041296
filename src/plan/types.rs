//! 任务与步骤类型定义
//!
//! TaskSubmission / StepSpec 是上游提交的计划格式；Task / Step 是编译后持久化的记录，
//! 每条记录带单调递增的 version，用于乐观并发写入。

use std::fmt;
use std::str::FromStr;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::ToolFailure;

pub type TaskId = String;
pub type StepId = String;

/// 当前毫秒时间戳
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// 任务状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "running" => Ok(TaskStatus::Running),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "cancelled" => Ok(TaskStatus::Cancelled),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}

/// 步骤状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// 等待依赖完成
    Pending,
    /// 依赖已满足，可调度
    Ready,
    Running,
    Completed,
    Failed,
    /// 上游依赖失败，级联跳过
    Skipped,
    Cancelled,
}

impl StepStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StepStatus::Completed | StepStatus::Failed | StepStatus::Skipped | StepStatus::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Ready => "ready",
            StepStatus::Running => "running",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
            StepStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(StepStatus::Pending),
            "ready" => Ok(StepStatus::Ready),
            "running" => Ok(StepStatus::Running),
            "completed" => Ok(StepStatus::Completed),
            "failed" => Ok(StepStatus::Failed),
            "skipped" => Ok(StepStatus::Skipped),
            "cancelled" => Ok(StepStatus::Cancelled),
            other => Err(format!("unknown step status: {other}")),
        }
    }
}

/// 任务优先级；随任务事件与列表输出
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low = 0,
    Normal = 1,
    High = 2,
    Urgent = 3,
}

impl Default for TaskPriority {
    fn default() -> Self {
        Self::Normal
    }
}

impl TaskPriority {
    pub fn from_i64(p: i64) -> Self {
        match p {
            0 => TaskPriority::Low,
            2 => TaskPriority::High,
            3 => TaskPriority::Urgent,
            _ => TaskPriority::Normal,
        }
    }
}

/// 依赖引用：提交列表中的下标（从 0 开始）或步骤的 key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum DependencyRef {
    Index(usize),
    Key(String),
}

impl fmt::Display for DependencyRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DependencyRef::Index(i) => write!(f, "#{i}"),
            DependencyRef::Key(k) => f.write_str(k),
        }
    }
}

/// 计划中的一步：调用哪个工具、参数、依赖谁
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct StepSpec {
    /// 可选的步骤别名，供 dependency_refs 引用
    #[serde(default)]
    pub key: Option<String>,
    /// 可读名称
    #[serde(default)]
    pub name: Option<String>,
    pub tool_name: String,
    #[serde(default)]
    pub input_parameters: Value,
    #[serde(default)]
    pub dependency_refs: Vec<DependencyRef>,
}

impl StepSpec {
    pub fn new(tool_name: impl Into<String>, input_parameters: Value) -> Self {
        Self {
            key: None,
            name: None,
            tool_name: tool_name.into(),
            input_parameters,
            dependency_refs: Vec::new(),
        }
    }

    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn depends_on(mut self, dep: DependencyRef) -> Self {
        self.dependency_refs.push(dep);
        self
    }

    pub fn after(self, index: usize) -> Self {
        self.depends_on(DependencyRef::Index(index))
    }
}

/// 上游提交的任务（尚未编译）
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct TaskSubmission {
    /// 不填则自动生成 task_<uuid>
    #[serde(default)]
    pub task_id: Option<TaskId>,
    pub user_id: String,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub priority: TaskPriority,
    pub steps: Vec<StepSpec>,
}

impl TaskSubmission {
    pub fn new(user_id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            task_id: None,
            user_id: user_id.into(),
            title: title.into(),
            description: None,
            priority: TaskPriority::Normal,
            steps: Vec::new(),
        }
    }

    pub fn with_id(mut self, task_id: impl Into<TaskId>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn step(mut self, step: StepSpec) -> Self {
        self.steps.push(step);
        self
    }
}

/// 任务记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub user_id: String,
    pub title: String,
    pub description: Option<String>,
    pub status: TaskStatus,
    pub priority: TaskPriority,
    /// 0-100
    pub progress_percent: u8,
    pub error_message: Option<String>,
    /// 显式取消标记；置位后任务状态恒为 cancelled
    pub cancel_requested: bool,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub version: u64,
}

impl Task {
    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }
}

/// 步骤记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub id: StepId,
    pub task_id: TaskId,
    /// 创建顺序（0 开始），同优先级内按此 FIFO
    pub seq: usize,
    pub name: Option<String>,
    pub tool_name: String,
    pub input_parameters: Value,
    pub dependency_ids: Vec<StepId>,
    pub status: StepStatus,
    pub retry_count: u32,
    /// 编译时从工具描述复制
    pub max_retries: u32,
    pub output: Option<Value>,
    pub error: Option<ToolFailure>,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub version: u64,
}

impl Step {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

/// 提交成功的回执
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskAccepted {
    pub task_id: TaskId,
    pub step_ids: Vec<StepId>,
}
