//! 工具注册表
//!
//! 所有工具实现 ToolHandler trait（descriptor / invoke），由 ToolRegistry 按名注册与查找；
//! 调度器只通过 describe(name) 读取 ToolDescriptor，通过 handler(name) 拿到处理器。

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::ToolFailure;
use crate::sandbox::{ResourceLimits, SandboxContext};

/// 工具安全级别：决定沙箱限制与是否需要人工确认
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityLevel {
    Safe,
    Moderate,
    Dangerous,
}

impl SecurityLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            SecurityLevel::Safe => "safe",
            SecurityLevel::Moderate => "moderate",
            SecurityLevel::Dangerous => "dangerous",
        }
    }
}

/// 工具的静态描述
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    /// 参数 JSON Schema（object / properties / required）
    pub capability_schema: Value,
    pub security_level: SecurityLevel,
    pub requires_confirmation: bool,
    pub resource_limits: ResourceLimits,
    /// None 时使用 [retry].default_max_retries
    pub max_retries: Option<u32>,
    pub enabled: bool,
}

impl ToolDescriptor {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            capability_schema: serde_json::json!({
                "type": "object",
                "properties": {},
                "required": []
            }),
            security_level: SecurityLevel::Safe,
            requires_confirmation: false,
            resource_limits: ResourceLimits::default(),
            max_retries: None,
            enabled: true,
        }
    }

    pub fn schema(mut self, schema: Value) -> Self {
        self.capability_schema = schema;
        self
    }

    pub fn security(mut self, level: SecurityLevel) -> Self {
        self.security_level = level;
        self
    }

    pub fn confirm(mut self, requires_confirmation: bool) -> Self {
        self.requires_confirmation = requires_confirmation;
        self
    }

    pub fn limits(mut self, limits: ResourceLimits) -> Self {
        self.resource_limits = limits;
        self
    }

    pub fn retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// dangerous 工具总是需要确认
    pub fn needs_confirmation(&self) -> bool {
        self.requires_confirmation || self.security_level == SecurityLevel::Dangerous
    }
}

/// 工具处理器：每个工具实现一次，按名注册
#[async_trait]
pub trait ToolHandler: Send + Sync {
    fn descriptor(&self) -> ToolDescriptor;

    /// 在沙箱上下文中执行；params 已通过 capability_schema 校验
    async fn invoke(&self, params: Value, ctx: SandboxContext) -> Result<Value, ToolFailure>;
}

struct Entry {
    descriptor: ToolDescriptor,
    handler: Arc<dyn ToolHandler>,
    usage: AtomicU64,
}

/// 工具注册表：启动时注册，运行期只读（使用计数为原子变量）
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Entry>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handler: impl ToolHandler + 'static) {
        let descriptor = handler.descriptor();
        self.register_as(descriptor, Arc::new(handler));
    }

    /// 用自定义描述注册（覆盖处理器自带的描述，如改 max_retries / 超时）
    pub fn register_as(&mut self, descriptor: ToolDescriptor, handler: Arc<dyn ToolHandler>) {
        let name = descriptor.name.clone();
        if self.tools.contains_key(&name) {
            tracing::warn!(tool = %name, "tool re-registered, replacing previous handler");
        }
        self.tools.insert(
            name,
            Entry {
                descriptor,
                handler,
                usage: AtomicU64::new(0),
            },
        );
    }

    pub fn describe(&self, name: &str) -> Option<ToolDescriptor> {
        self.tools.get(name).map(|e| e.descriptor.clone())
    }

    pub fn handler(&self, name: &str) -> Option<Arc<dyn ToolHandler>> {
        self.tools.get(name).map(|e| Arc::clone(&e.handler))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn descriptors(&self) -> Vec<ToolDescriptor> {
        let mut list: Vec<ToolDescriptor> = self.tools.values().map(|e| e.descriptor.clone()).collect();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        list
    }

    pub fn record_success(&self, name: &str) {
        if let Some(entry) = self.tools.get(name) {
            entry.usage.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// 成功调用次数
    pub fn usage_count(&self, name: &str) -> u64 {
        self.tools
            .get(name)
            .map(|e| e.usage.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// 工具目录 JSON（名称、描述、安全级别、参数 schema、使用次数）
    pub fn to_schema_json(&self) -> String {
        let tools: Vec<Value> = self
            .descriptors()
            .into_iter()
            .map(|d| {
                serde_json::json!({
                    "name": d.name,
                    "description": d.description,
                    "security_level": d.security_level.as_str(),
                    "requires_confirmation": d.needs_confirmation(),
                    "enabled": d.enabled,
                    "parameters": d.capability_schema,
                    "usage_count": self.usage_count(&d.name),
                })
            })
            .collect();
        serde_json::to_string_pretty(&tools).unwrap_or_else(|_| "[]".to_string())
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.tool_names())
            .finish()
    }
}
