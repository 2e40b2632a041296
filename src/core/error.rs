//! 引擎错误类型与失败分类
//!
//! EngineError：提交 / 控制接口返回的错误；ToolFailure：单步执行的失败分类，
//! 与 RecoveryPolicy 配合决定重试、失败还是取消。

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::store::StoreError;

/// 提交、控制与查询接口可能返回的错误
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Plan invalid: {0}")]
    PlanInvalid(String),

    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Step not found: {0}")]
    StepNotFound(String),

    #[error("Task already exists: {0}")]
    DuplicateTask(String),

    /// 当前状态不允许该操作（如取消已结束的任务）
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// 乐观并发写入多次重试后仍冲突
    #[error("Version conflict: {0}")]
    VersionConflict(String),

    #[error("Engine is shutting down")]
    ShuttingDown,

    #[error("Timed out waiting for task {0}")]
    WaitTimeout(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// 单次工具执行的失败分类
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum ToolFailure {
    #[error("Timeout after {0}ms")]
    Timeout(u64),

    #[error("Resource exceeded: {0}")]
    ResourceExceeded(String),

    #[error("Sandbox infrastructure failure: {0}")]
    SandboxInfraFailure(String),

    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("Unauthorized tool: {0}")]
    UnauthorizedTool(String),

    #[error("Cancelled")]
    Cancelled,

    #[error("Confirmation timeout for step {0}")]
    ConfirmationTimeout(String),
}

/// 失败类别：瞬时（可重试）/ 永久 / 取消
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    Transient,
    Permanent,
    Cancellation,
}

impl ToolFailure {
    pub fn class(&self) -> FailureClass {
        match self {
            ToolFailure::Timeout(_)
            | ToolFailure::ResourceExceeded(_)
            | ToolFailure::SandboxInfraFailure(_) => FailureClass::Transient,
            ToolFailure::InvalidParameters(_) | ToolFailure::UnauthorizedTool(_) => {
                FailureClass::Permanent
            }
            ToolFailure::Cancelled | ToolFailure::ConfirmationTimeout(_) => {
                FailureClass::Cancellation
            }
        }
    }

    /// 审计日志中的短名称
    pub fn kind(&self) -> &'static str {
        match self {
            ToolFailure::Timeout(_) => "timeout",
            ToolFailure::ResourceExceeded(_) => "resource_exceeded",
            ToolFailure::SandboxInfraFailure(_) => "sandbox_infra_failure",
            ToolFailure::InvalidParameters(_) => "invalid_parameters",
            ToolFailure::UnauthorizedTool(_) => "unauthorized_tool",
            ToolFailure::Cancelled => "cancelled",
            ToolFailure::ConfirmationTimeout(_) => "confirmation_timeout",
        }
    }

    pub fn is_transient(&self) -> bool {
        self.class() == FailureClass::Transient
    }
}

/// Resource Governor 的获取错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GovernorError {
    #[error("No execution slot available within {0:?}")]
    Timeout(Duration),

    #[error("Governor closed")]
    Closed,
}
