//! 工具箱：注册表、参数校验与内置工具（echo、shell_exec、file_read、file_write、http_request）

pub mod echo;
pub mod filesystem;
pub mod http;
pub mod registry;
pub mod schema;
pub mod shell;

pub use echo::EchoTool;
pub use filesystem::{FileReadTool, FileWriteTool, FsError, SafeFs};
pub use http::HttpRequestTool;
pub use registry::{SecurityLevel, ToolDescriptor, ToolHandler, ToolRegistry};
pub use schema::{submission_schema_json, validate_parameters};
pub use shell::ShellExecTool;

use crate::config::ToolsSection;

/// 注册全部内置工具
pub fn register_builtin(registry: &mut ToolRegistry, cfg: &ToolsSection) {
    registry.register(EchoTool);
    registry.register(ShellExecTool::new(cfg.shell.allowed_commands.clone()));
    registry.register(FileReadTool);
    registry.register(FileWriteTool);
    registry.register(HttpRequestTool::new(&cfg.http));
}

/// 内置工具注册表
pub fn builtin_registry(cfg: &ToolsSection) -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    register_builtin(&mut registry, cfg);
    registry
}
