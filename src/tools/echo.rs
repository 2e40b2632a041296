//! Echo 工具（诊断 / 测试用）

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::core::ToolFailure;
use crate::sandbox::{ResourceLimits, SandboxContext};
use crate::tools::{SecurityLevel, ToolDescriptor, ToolHandler};

/// Echo 工具：回显文本
pub struct EchoTool;

#[async_trait]
impl ToolHandler for EchoTool {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor::new("echo", "Echo text back (diagnostics). Args: {\"text\": \"message\"}")
            .schema(json!({
                "type": "object",
                "properties": { "text": { "type": "string" } },
                "required": []
            }))
            .security(SecurityLevel::Safe)
            .limits(ResourceLimits::strict())
    }

    async fn invoke(&self, params: Value, _ctx: SandboxContext) -> Result<Value, ToolFailure> {
        let text = params
            .get("text")
            .and_then(|v| v.as_str())
            .unwrap_or("(empty)");
        Ok(json!({ "text": text }))
    }
}
