//! 沙箱执行上下文：一次工具调用能看到的全部环境

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::sandbox::limits::{ResourceLimits, SandboxPolicy};

/// 工具自报的资源用量（外部进程由工具读取 rusage 后上报）
#[derive(Debug, Default)]
pub struct UsageMeter {
    peak_memory_bytes: AtomicU64,
    cpu_time_ms: AtomicU64,
}

impl UsageMeter {
    pub fn peak_memory_bytes(&self) -> u64 {
        self.peak_memory_bytes.load(Ordering::Relaxed)
    }

    pub fn cpu_time_ms(&self) -> u64 {
        self.cpu_time_ms.load(Ordering::Relaxed)
    }
}

/// 传给 ToolHandler::invoke 的上下文；clone 共享同一个用量计数与取消令牌
#[derive(Debug, Clone)]
pub struct SandboxContext {
    pub sandbox_id: String,
    pub task_id: String,
    pub step_id: String,
    /// 从 1 开始
    pub attempt: u32,
    /// 任务独立工作目录，文件类工具只能访问其内部
    pub workdir: PathBuf,
    pub limits: ResourceLimits,
    pub policy: SandboxPolicy,
    /// 协作式取消信号；工具应在宽限期内自行退出
    pub cancel: CancellationToken,
    usage: Arc<UsageMeter>,
}

impl SandboxContext {
    pub fn new(
        task_id: impl Into<String>,
        step_id: impl Into<String>,
        attempt: u32,
        workdir: PathBuf,
        limits: ResourceLimits,
        policy: SandboxPolicy,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            sandbox_id: format!("sbx_{}", uuid::Uuid::new_v4().simple()),
            task_id: task_id.into(),
            step_id: step_id.into(),
            attempt,
            workdir,
            limits,
            policy,
            cancel,
            usage: Arc::new(UsageMeter::default()),
        }
    }

    /// 上报内存峰值（取最大值）
    pub fn report_memory(&self, bytes: u64) {
        self.usage.peak_memory_bytes.fetch_max(bytes, Ordering::Relaxed);
    }

    pub fn report_cpu_time(&self, millis: u64) {
        self.usage.cpu_time_ms.fetch_add(millis, Ordering::Relaxed);
    }

    pub fn usage(&self) -> &UsageMeter {
        &self.usage
    }

    /// 内存上限（字节）
    pub fn memory_limit_bytes(&self) -> Option<u64> {
        self.limits.memory_limit_mb.map(|mb| mb * 1024 * 1024)
    }
}
