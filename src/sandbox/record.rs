//! 执行审计记录：每次沙箱运行一条，开始时写入，结束时定稿，定稿后不可再改

use serde::{Deserialize, Serialize};

use crate::core::ToolFailure;

/// 一次运行的资源用量
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub wall_time_ms: u64,
    pub cpu_time_ms: u64,
    pub peak_memory_bytes: u64,
    pub output_bytes: u64,
}

/// 运行结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "failure", rename_all = "snake_case")]
pub enum ExecutionExit {
    Succeeded,
    Failed(ToolFailure),
}

impl ExecutionExit {
    pub fn is_success(&self) -> bool {
        matches!(self, ExecutionExit::Succeeded)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: String,
    pub task_id: String,
    pub step_id: String,
    /// 第几次尝试（从 1 开始）
    pub attempt: u32,
    pub sandbox_id: String,
    pub tool_name: String,
    pub resource_usage: ResourceUsage,
    /// None 表示仍在运行（未定稿）
    pub exit_status: Option<ExecutionExit>,
    pub started_at: i64,
    pub ended_at: Option<i64>,
}

impl ExecutionRecord {
    pub fn start(
        task_id: impl Into<String>,
        step_id: impl Into<String>,
        attempt: u32,
        sandbox_id: impl Into<String>,
        tool_name: impl Into<String>,
    ) -> Self {
        Self {
            id: format!("exec_{}", uuid::Uuid::new_v4().simple()),
            task_id: task_id.into(),
            step_id: step_id.into(),
            attempt,
            sandbox_id: sandbox_id.into(),
            tool_name: tool_name.into(),
            resource_usage: ResourceUsage::default(),
            exit_status: None,
            started_at: crate::plan::now_millis(),
            ended_at: None,
        }
    }

    pub fn is_finalized(&self) -> bool {
        self.exit_status.is_some()
    }
}
