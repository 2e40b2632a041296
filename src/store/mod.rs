//! 任务 / 步骤存储抽象层
//!
//! 按任务分区；每条 Task / Step 记录带 version，update_* 只有在存储中的版本等于 expected_version 时才提交，
//! 提交后版本加一。ExecutionRecord 只追加，定稿后不可修改。支持内存与 SQLite（async-sqlite feature）两种实现。

pub mod memory;
#[cfg(feature = "async-sqlite")]
pub mod sqlite;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::config::StorageSection;
use crate::plan::{Step, Task, TaskStatus};
use crate::sandbox::{ExecutionExit, ExecutionRecord, ResourceUsage};

pub use memory::MemoryTaskStore;
#[cfg(feature = "async-sqlite")]
pub use sqlite::SqliteTaskStore;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Version conflict on {entity} {id}: expected {expected}, found {found}")]
    VersionConflict {
        entity: &'static str,
        id: String,
        expected: u64,
        found: u64,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    Duplicate(String),

    #[error("Execution record already finalized: {0}")]
    AlreadyFinalized(String),

    #[error("Store backend error: {0}")]
    Backend(String),
}

/// list_tasks 过滤条件
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub user_id: Option<String>,
    pub status: Option<TaskStatus>,
}

impl TaskFilter {
    pub fn user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            status: None,
        }
    }

    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn matches(&self, task: &Task) -> bool {
        self.user_id.as_deref().map_or(true, |u| task.user_id == u)
            && self.status.map_or(true, |s| task.status == s)
    }
}

/// 存储接口
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// 原子地写入任务及其全部步骤；任务已存在返回 Duplicate
    async fn insert_task(&self, task: &Task, steps: &[Step]) -> Result<(), StoreError>;

    async fn get_task(&self, task_id: &str) -> Result<Option<Task>, StoreError>;

    async fn get_step(&self, step_id: &str) -> Result<Option<Step>, StoreError>;

    /// 按创建顺序返回
    async fn list_steps(&self, task_id: &str) -> Result<Vec<Step>, StoreError>;

    /// 条件写入；成功返回存储后的记录（version = expected_version + 1）
    async fn update_task(&self, task: &Task, expected_version: u64) -> Result<Task, StoreError>;

    async fn update_step(&self, step: &Step, expected_version: u64) -> Result<Step, StoreError>;

    /// 按创建时间排序
    async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>, StoreError>;

    async fn start_record(&self, record: &ExecutionRecord) -> Result<(), StoreError>;

    /// 定稿一条执行记录；重复定稿返回 AlreadyFinalized
    async fn finish_record(
        &self,
        record_id: &str,
        exit: ExecutionExit,
        usage: ResourceUsage,
        ended_at: i64,
    ) -> Result<ExecutionRecord, StoreError>;

    /// 某任务的全部执行记录（按开始时间）
    async fn list_records(&self, task_id: &str) -> Result<Vec<ExecutionRecord>, StoreError>;

    /// 某工具最近的执行记录（新的在前）
    async fn tool_records(&self, tool_name: &str, limit: usize) -> Result<Vec<ExecutionRecord>, StoreError>;

    async fn close(&self) {}
}

/// 创建任务存储
///
/// 如果配置了 database_path 且启用了 async-sqlite feature，则使用 SQLite；否则使用内存存储
pub async fn create_task_store(cfg: &StorageSection) -> Arc<dyn TaskStore> {
    #[cfg(feature = "async-sqlite")]
    if let Some(path) = &cfg.database_path {
        match SqliteTaskStore::open(path).await {
            Ok(store) => {
                tracing::info!("Using SQLite task store: {:?}", path);
                return Arc::new(store);
            }
            Err(e) => {
                tracing::warn!("Failed to open SQLite task store, falling back to memory: {}", e);
            }
        }
    }

    #[cfg(not(feature = "async-sqlite"))]
    if cfg.database_path.is_some() {
        tracing::warn!("database_path set but async-sqlite feature not enabled, using memory store");
    }

    tracing::info!("Using in-memory task store");
    Arc::new(MemoryTaskStore::new())
}
