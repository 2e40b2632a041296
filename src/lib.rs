//! Hive - Rust 任务执行与工具编排引擎
//!
//! 模块划分：
//! - **config**: 配置加载（TOML + 环境变量）
//! - **core**: 错误分类、失败恢复、资源调控、优雅关闭
//! - **engine**: 对外接口、状态跟踪、事件推送、任务协调器
//! - **observability**: 日志初始化
//! - **plan**: 任务 / 步骤类型与计划编译（DAG）
//! - **sandbox**: 沙箱执行、资源限制、确认闸门、执行记录
//! - **store**: 版本化的任务 / 步骤存储（内存、SQLite）
//! - **tools**: 工具注册表与内置工具（echo、shell_exec、file_read、file_write、http_request）

pub mod config;
pub mod core;
pub mod engine;
pub mod observability;
pub mod plan;
pub mod sandbox;
pub mod store;
pub mod tools;

pub use crate::core::{EngineError, ToolFailure};
pub use engine::{Engine, EngineBuilder, Subscription, TaskEvent};
pub use plan::{StepSpec, TaskSubmission};
