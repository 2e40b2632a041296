//! 沙箱资源上限与按安全级别划分的访问策略

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::SandboxSection;
use crate::tools::SecurityLevel;

/// 单次工具执行的资源上限
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// CPU 时间上限（秒），None 表示不限
    pub cpu_time_secs: Option<u64>,
    /// 内存上限（MB），None 表示不限
    pub memory_limit_mb: Option<u64>,
    /// 墙钟超时（毫秒）
    pub timeout_ms: u64,
    /// 输出（序列化后的 JSON）大小上限，None 时使用 [sandbox].max_output_bytes
    pub max_output_bytes: Option<usize>,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            cpu_time_secs: Some(60),
            memory_limit_mb: Some(512),
            timeout_ms: 30_000,
            max_output_bytes: None,
        }
    }
}

impl ResourceLimits {
    /// 用于不受信任的工具
    pub fn strict() -> Self {
        Self {
            cpu_time_secs: Some(10),
            memory_limit_mb: Some(256),
            timeout_ms: 10_000,
            max_output_bytes: Some(256 * 1024),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_memory_mb(mut self, mb: u64) -> Self {
        self.memory_limit_mb = Some(mb);
        self
    }

    pub fn with_cpu_secs(mut self, secs: u64) -> Self {
        self.cpu_time_secs = Some(secs);
        self
    }

    pub fn with_max_output(mut self, bytes: usize) -> Self {
        self.max_output_bytes = Some(bytes);
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.timeout_ms == 0 {
            return Err("timeout cannot be 0".to_string());
        }
        if self.cpu_time_secs == Some(0) {
            return Err("CPU time limit cannot be 0".to_string());
        }
        if let Some(memory) = self.memory_limit_mb {
            if memory == 0 {
                return Err("Memory limit cannot be 0".to_string());
            }
            if memory > 65_536 {
                return Err("Memory limit cannot exceed 64GB".to_string());
            }
        }
        if self.max_output_bytes == Some(0) {
            return Err("Output limit cannot be 0".to_string());
        }
        Ok(())
    }
}

/// 沙箱内允许的操作，由工具安全级别与 [sandbox] 配置共同决定
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SandboxPolicy {
    pub network: bool,
    pub filesystem_write: bool,
    pub allow_processes: bool,
}

impl SandboxPolicy {
    /// - safe：只读文件系统，无网络，不可起进程
    /// - moderate：可写工作目录，网络取决于配置
    /// - dangerous：额外允许起子进程
    pub fn for_level(level: SecurityLevel, cfg: &SandboxSection) -> Self {
        match level {
            SecurityLevel::Safe => Self {
                network: false,
                filesystem_write: false,
                allow_processes: false,
            },
            SecurityLevel::Moderate => Self {
                network: cfg.allow_network,
                filesystem_write: true,
                allow_processes: false,
            },
            SecurityLevel::Dangerous => Self {
                network: cfg.allow_network,
                filesystem_write: true,
                allow_processes: true,
            },
        }
    }

    pub fn locked_down() -> Self {
        Self {
            network: false,
            filesystem_write: false,
            allow_processes: false,
        }
    }
}
