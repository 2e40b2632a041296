//! 引擎配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `HIVE__*` 覆盖（双下划线表示嵌套，如 `HIVE__GOVERNOR__GLOBAL_SLOTS=16`）。

use std::path::PathBuf;

use serde::Deserialize;

/// 配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub engine: EngineSection,
    pub governor: GovernorSection,
    pub retry: RetrySection,
    pub sandbox: SandboxSection,
    pub tools: ToolsSection,
    pub storage: StorageSection,
    pub logging: LoggingSection,
}

/// 任务失败判定策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// 任一步骤失败即任务失败
    #[default]
    Strict,
    /// 所有步骤结束后，只要有步骤成功即视为完成
    BestEffort,
}

/// [engine] 段：单任务并发、失败策略、事件缓冲、取消宽限期
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineSection {
    /// 同一任务同时处于 running 的步骤上限
    pub max_concurrent_steps: usize,
    pub failure_policy: FailurePolicy,
    /// 每个任务事件通道的缓冲条数；慢订阅者超出后丢失实时事件
    pub event_buffer: usize,
    /// 确认闸门等待上限（秒）
    pub task_timeout_secs: u64,
    /// 取消信号发出后等待沙箱自行退出的时间（毫秒），超时强制回收
    pub cancel_grace_ms: u64,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            max_concurrent_steps: 4,
            failure_policy: FailurePolicy::Strict,
            event_buffer: 256,
            task_timeout_secs: 3600,
            cancel_grace_ms: 2000,
        }
    }
}

/// [governor] 段：全局与单用户执行槽位
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GovernorSection {
    pub global_slots: usize,
    pub per_user_slots: usize,
}

impl Default for GovernorSection {
    fn default() -> Self {
        Self {
            global_slots: 10,
            per_user_slots: 4,
        }
    }
}

/// [retry] 段：指数退避参数
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    /// 工具描述未指定 max_retries 时使用
    pub default_max_retries: u32,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            base_delay_ms: 500,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            default_max_retries: 2,
        }
    }
}

/// [sandbox] 段：沙箱根目录、网络与危险工具开关、输出上限
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SandboxSection {
    /// 每个任务在 root 下拥有独立工作目录，未设置时用 ./workspace/sandbox
    pub root: Option<PathBuf>,
    pub allow_network: bool,
    pub allow_dangerous: bool,
    pub max_output_bytes: usize,
}

impl Default for SandboxSection {
    fn default() -> Self {
        Self {
            root: None,
            allow_network: true,
            allow_dangerous: true,
            max_output_bytes: 1024 * 1024,
        }
    }
}

impl SandboxSection {
    pub fn root_dir(&self) -> PathBuf {
        self.root
            .clone()
            .unwrap_or_else(|| PathBuf::from("workspace").join("sandbox"))
    }
}

/// [tools] 段：内置工具参数
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ToolsSection {
    pub shell: ShellSection,
    pub http: HttpSection,
}

/// [tools.shell] 段：允许执行的命令名（仅首词，如 ls、grep、cargo）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ShellSection {
    pub allowed_commands: Vec<String>,
}

impl Default for ShellSection {
    fn default() -> Self {
        Self {
            allowed_commands: ["ls", "grep", "cat", "head", "tail", "wc", "find", "echo", "cargo"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

/// [tools.http] 段：允许访问的域名（为空表示不限制）与请求超时
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpSection {
    pub allowed_domains: Vec<String>,
    pub timeout_secs: u64,
}

impl Default for HttpSection {
    fn default() -> Self {
        Self {
            allowed_domains: Vec::new(),
            timeout_secs: 30,
        }
    }
}

/// [storage] 段：设置 database_path 且启用 async-sqlite 时使用 SQLite 存储
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct StorageSection {
    pub database_path: Option<PathBuf>,
}

/// [logging] 段
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct LoggingSection {
    /// 输出 JSON 格式日志
    pub json: bool,
}

/// 从 config 目录加载配置，环境变量 HIVE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 HIVE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("HIVE")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.engine.failure_policy, FailurePolicy::Strict);
        assert_eq!(cfg.governor.global_slots, 10);
        assert_eq!(cfg.retry.default_max_retries, 2);
        assert!(cfg.storage.database_path.is_none());
    }

    #[test]
    fn test_load_from_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hive.toml");
        std::fs::write(
            &path,
            "[engine]\nmax_concurrent_steps = 2\nfailure_policy = \"best_effort\"\n\n[governor]\nper_user_slots = 1\n",
        )
        .unwrap();

        let cfg = load_config(Some(path)).unwrap();
        assert_eq!(cfg.engine.max_concurrent_steps, 2);
        assert_eq!(cfg.engine.failure_policy, FailurePolicy::BestEffort);
        assert_eq!(cfg.governor.per_user_slots, 1);
        // 未出现的键保持默认
        assert_eq!(cfg.governor.global_slots, 10);
        assert_eq!(cfg.engine.event_buffer, 256);
    }
}
