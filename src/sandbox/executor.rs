//! 沙箱执行器
//!
//! 一次 execute 对应一次尝试：先写 ExecutionRecord，再做预检（启用状态、危险工具开关、参数校验、确认状态），
//! 然后在独立的 tokio 任务中运行处理器，施加墙钟超时、协作式取消（宽限期后强制回收）、输出与内存上限，
//! 最后定稿记录并输出一行 JSON 审计日志。

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::config::SandboxSection;
use crate::core::ToolFailure;
use crate::sandbox::context::SandboxContext;
use crate::sandbox::gate::ConfirmationGate;
use crate::sandbox::limits::SandboxPolicy;
use crate::sandbox::record::{ExecutionExit, ExecutionRecord, ResourceUsage};
use crate::store::TaskStore;
use crate::tools::{validate_parameters, SecurityLevel, ToolDescriptor, ToolRegistry};

/// 调度器发给执行器的一次运行请求
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub task_id: String,
    pub step_id: String,
    pub tool_name: String,
    pub params: Value,
    /// 从 1 开始
    pub attempt: u32,
    /// 任务级取消令牌
    pub cancel: CancellationToken,
}

/// 一次运行的结果
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub task_id: String,
    pub step_id: String,
    pub attempt: u32,
    pub record_id: Option<String>,
    pub result: Result<Value, ToolFailure>,
    pub usage: ResourceUsage,
}

pub struct SandboxExecutor {
    registry: Arc<ToolRegistry>,
    gate: Arc<ConfirmationGate>,
    store: Arc<dyn TaskStore>,
    config: SandboxSection,
    grace: Duration,
}

impl SandboxExecutor {
    pub fn new(
        registry: Arc<ToolRegistry>,
        gate: Arc<ConfirmationGate>,
        store: Arc<dyn TaskStore>,
        config: SandboxSection,
        grace: Duration,
    ) -> Self {
        Self {
            registry,
            gate,
            store,
            config,
            grace,
        }
    }

    pub fn gate(&self) -> &Arc<ConfirmationGate> {
        &self.gate
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    /// 该工具的步骤是否需要人工确认
    pub fn needs_confirmation(&self, tool_name: &str) -> bool {
        self.registry
            .describe(tool_name)
            .map(|d| d.needs_confirmation())
            .unwrap_or(false)
    }

    /// 等待外部批准（在申请槽位与进入 running 之前调用）
    pub async fn await_confirmation(
        &self,
        step_id: &str,
        deadline: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), ToolFailure> {
        self.gate.wait(step_id, deadline, cancel).await
    }

    /// 任务工作目录：root/<task_id>（task_id 中的非常规字符替换为 _）
    fn workdir(&self, task_id: &str) -> PathBuf {
        let safe: String = task_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.config.root_dir().join(safe)
    }

    fn preflight(&self, descriptor: &ToolDescriptor, req: &ExecutionRequest) -> Result<(), ToolFailure> {
        if !descriptor.enabled {
            return Err(ToolFailure::UnauthorizedTool(format!("tool '{}' is disabled", descriptor.name)));
        }
        if descriptor.security_level == SecurityLevel::Dangerous && !self.config.allow_dangerous {
            return Err(ToolFailure::UnauthorizedTool(format!(
                "dangerous tool '{}' is not allowed by sandbox configuration",
                descriptor.name
            )));
        }
        if descriptor.needs_confirmation() && !self.gate.is_approved(&req.step_id) {
            return Err(ToolFailure::UnauthorizedTool(format!(
                "step {} has not been approved",
                req.step_id
            )));
        }
        validate_parameters(&descriptor.capability_schema, &req.params).map_err(ToolFailure::InvalidParameters)
    }

    pub async fn execute(&self, req: ExecutionRequest) -> ExecutionOutcome {
        let started = Instant::now();
        let descriptor = self.registry.describe(&req.tool_name);

        let (limits, policy) = match &descriptor {
            Some(d) => (
                d.resource_limits.clone(),
                SandboxPolicy::for_level(d.security_level, &self.config),
            ),
            None => (Default::default(), SandboxPolicy::locked_down()),
        };
        let child_cancel = req.cancel.child_token();
        let ctx = SandboxContext::new(
            req.task_id.clone(),
            req.step_id.clone(),
            req.attempt,
            self.workdir(&req.task_id),
            limits,
            policy,
            child_cancel.clone(),
        );

        let record = ExecutionRecord::start(
            &req.task_id,
            &req.step_id,
            req.attempt,
            &ctx.sandbox_id,
            &req.tool_name,
        );
        if let Err(e) = self.store.start_record(&record).await {
            tracing::error!(step_id = %req.step_id, error = %e, "failed to write execution record");
            return ExecutionOutcome {
                task_id: req.task_id,
                step_id: req.step_id,
                attempt: req.attempt,
                record_id: None,
                result: Err(ToolFailure::SandboxInfraFailure(format!("execution record: {e}"))),
                usage: ResourceUsage::default(),
            };
        }

        let result = match descriptor {
            None => Err(ToolFailure::UnauthorizedTool(format!("unknown tool '{}'", req.tool_name))),
            Some(d) => match self.preflight(&d, &req) {
                Err(f) => Err(f),
                Ok(()) => self.run(&req, ctx.clone(), child_cancel).await,
            },
        };

        let output_bytes = match &result {
            Ok(v) => serde_json::to_vec(v).map(|b| b.len() as u64).unwrap_or(0),
            Err(_) => 0,
        };
        let result = result.and_then(|value| self.check_output(&ctx, value, output_bytes));

        let usage = ResourceUsage {
            wall_time_ms: started.elapsed().as_millis() as u64,
            cpu_time_ms: ctx.usage().cpu_time_ms(),
            peak_memory_bytes: ctx.usage().peak_memory_bytes(),
            output_bytes,
        };
        let exit = match &result {
            Ok(_) => ExecutionExit::Succeeded,
            Err(f) => ExecutionExit::Failed(f.clone()),
        };
        if let Err(e) = self
            .store
            .finish_record(&record.id, exit, usage.clone(), crate::plan::now_millis())
            .await
        {
            tracing::warn!(record_id = %record.id, error = %e, "failed to finalize execution record");
        }

        let audit = serde_json::json!({
            "event": "tool_audit",
            "task_id": req.task_id,
            "step_id": req.step_id,
            "tool": req.tool_name,
            "sandbox_id": ctx.sandbox_id,
            "attempt": req.attempt,
            "ok": result.is_ok(),
            "outcome": result.as_ref().err().map(|f| f.kind()).unwrap_or("ok"),
            "duration_ms": usage.wall_time_ms,
            "args_preview": args_preview(&req.params),
        });
        tracing::info!(audit = %audit.to_string(), "tool");

        if result.is_ok() {
            self.registry.record_success(&req.tool_name);
        }

        ExecutionOutcome {
            task_id: req.task_id,
            step_id: req.step_id,
            attempt: req.attempt,
            record_id: Some(record.id),
            result,
            usage,
        }
    }

    async fn run(
        &self,
        req: &ExecutionRequest,
        ctx: SandboxContext,
        child_cancel: CancellationToken,
    ) -> Result<Value, ToolFailure> {
        let handler = self
            .registry
            .handler(&req.tool_name)
            .ok_or_else(|| ToolFailure::UnauthorizedTool(format!("unknown tool '{}'", req.tool_name)))?;

        tokio::fs::create_dir_all(&ctx.workdir)
            .await
            .map_err(|e| ToolFailure::SandboxInfraFailure(format!("workdir: {e}")))?;

        let timeout = ctx.limits.timeout();
        let params = req.params.clone();
        let mut join = tokio::spawn(async move { handler.invoke(params, ctx).await });

        tokio::select! {
            joined = &mut join => match joined {
                Ok(r) => r,
                Err(e) if e.is_panic() => Err(ToolFailure::SandboxInfraFailure("tool panicked".into())),
                Err(_) => Err(ToolFailure::Cancelled),
            },
            _ = tokio::time::sleep(timeout) => {
                child_cancel.cancel();
                join.abort();
                tracing::warn!(step_id = %req.step_id, timeout_ms = timeout.as_millis() as u64, "tool timed out");
                Err(ToolFailure::Timeout(timeout.as_millis() as u64))
            }
            _ = req.cancel.cancelled() => {
                // 给工具 grace 时间自行退出，之后强制回收
                if tokio::time::timeout(self.grace, &mut join).await.is_err() {
                    join.abort();
                    tracing::warn!(step_id = %req.step_id, "tool ignored cancellation, aborted after grace period");
                }
                Err(ToolFailure::Cancelled)
            }
        }
    }

    fn check_output(&self, ctx: &SandboxContext, value: Value, output_bytes: u64) -> Result<Value, ToolFailure> {
        let max_output = ctx
            .limits
            .max_output_bytes
            .unwrap_or(self.config.max_output_bytes) as u64;
        if output_bytes > max_output {
            return Err(ToolFailure::ResourceExceeded(format!(
                "output {output_bytes} bytes exceeds limit {max_output}"
            )));
        }
        if let Some(limit) = ctx.memory_limit_bytes() {
            let peak = ctx.usage().peak_memory_bytes();
            if peak > limit {
                return Err(ToolFailure::ResourceExceeded(format!(
                    "memory {peak} bytes exceeds limit {limit}"
                )));
            }
        }
        Ok(value)
    }
}

fn args_preview(args: &Value) -> String {
    let s = args.to_string();
    if s.len() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}
