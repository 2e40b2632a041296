//! shell_exec：白名单命令，禁止危险操作
//!
//! 仅允许配置中的命令名（首词，如 ls、grep、cargo）；禁止 rm -rf、wget、chmod 777 等子串；
//! 通过 sh -c 在任务工作目录中执行，CPU / 内存上限用 ulimit 施加，取消时杀掉子进程。

use std::collections::HashSet;
use std::process::Stdio;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::process::Command;

use crate::core::ToolFailure;
use crate::sandbox::{ResourceLimits, SandboxContext};
use crate::tools::{SecurityLevel, ToolDescriptor, ToolHandler};

/// 禁止的命令/子串（即使白名单中有同名，也不允许带这些参数）
const FORBIDDEN_SUBSTR: &[&str] = &[
    "rm -rf",
    "rm -fr",
    "rm -r",
    "wget ",
    "curl | sh",
    "chmod 777",
    "chmod +s",
    "mkfs",
    "dd if=",
    "> /dev/sd",
    ":(){ :|:& };:", // fork bomb
];

#[cfg(unix)]
const SIGKILL: i32 = 9;
#[cfg(unix)]
const SIGXCPU: i32 = 24;

/// shell_exec 工具：dangerous 级别，执行前需要确认
pub struct ShellExecTool {
    allowed_commands: HashSet<String>,
}

impl ShellExecTool {
    pub fn new(allowed_commands: Vec<String>) -> Self {
        let allowed_commands = allowed_commands
            .into_iter()
            .map(|s| s.to_lowercase())
            .collect();
        Self { allowed_commands }
    }

    /// 只取第一个 token 作为命令名
    fn command_name<'a>(&self, raw: &'a str) -> &'a str {
        raw.split_whitespace().next().unwrap_or("")
    }

    fn is_allowed(&self, raw: &str) -> Result<(), String> {
        let raw_lower = raw.to_lowercase();
        for forbidden in FORBIDDEN_SUBSTR {
            if raw_lower.contains(forbidden) {
                return Err(format!("Forbidden pattern: {}", forbidden));
            }
        }
        let name = self.command_name(&raw_lower);
        if name.is_empty() {
            return Err("Empty command".to_string());
        }
        if self.allowed_commands.contains(name) {
            return Ok(());
        }
        Err(format!("Command '{}' not in allowlist", name))
    }

    /// 在命令前加 ulimit，由内核强制 CPU 时间与虚拟内存上限
    fn limited_script(command: &str, limits: &ResourceLimits) -> String {
        let mut prefix = String::new();
        if let Some(secs) = limits.cpu_time_secs {
            prefix.push_str(&format!("ulimit -t {secs} 2>/dev/null; "));
        }
        if let Some(mb) = limits.memory_limit_mb {
            prefix.push_str(&format!("ulimit -v {} 2>/dev/null; ", mb * 1024));
        }
        format!("{prefix}{command}")
    }
}

#[async_trait]
impl ToolHandler for ShellExecTool {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor::new(
            "shell_exec",
            "Run a whitelisted shell command inside the task workspace. Requires approval.",
        )
        .schema(json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The shell command to execute (must be in allowlist)"
                }
            },
            "required": ["command"]
        }))
        .security(SecurityLevel::Dangerous)
        .confirm(true)
        .limits(ResourceLimits::default())
    }

    async fn invoke(&self, params: Value, ctx: SandboxContext) -> Result<Value, ToolFailure> {
        if !ctx.policy.allow_processes {
            return Err(ToolFailure::UnauthorizedTool(
                "process execution is not permitted by the sandbox policy".into(),
            ));
        }
        let command = params
            .get("command")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .trim();
        self.is_allowed(command).map_err(ToolFailure::UnauthorizedTool)?;

        tracing::info!(step_id = %ctx.step_id, command = %command, "shell_exec");

        let script = if cfg!(unix) {
            Self::limited_script(command, &ctx.limits)
        } else {
            command.to_string()
        };

        let mut cmd = if cfg!(target_os = "windows") {
            let mut c = Command::new("cmd");
            c.args(["/C", &script]);
            c
        } else {
            let mut c = Command::new("sh");
            c.args(["-c", &script]);
            c
        };
        cmd.current_dir(&ctx.workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd
            .spawn()
            .map_err(|e| ToolFailure::SandboxInfraFailure(format!("spawn failed: {e}")))?;

        let output = tokio::select! {
            out = child.wait_with_output() => {
                out.map_err(|e| ToolFailure::SandboxInfraFailure(format!("wait failed: {e}")))?
            }
            // 丢弃 future 时 kill_on_drop 会杀掉子进程
            _ = ctx.cancel.cancelled() => return Err(ToolFailure::Cancelled),
        };

        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            match output.status.signal() {
                Some(SIGXCPU) => {
                    return Err(ToolFailure::ResourceExceeded("cpu time limit".into()));
                }
                Some(SIGKILL) => {
                    return Err(ToolFailure::ResourceExceeded("process killed".into()));
                }
                _ => {}
            }
        }

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        Ok(json!({
            "stdout": stdout,
            "stderr": stderr,
            "returncode": output.status.code().unwrap_or(-1),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::SandboxPolicy;
    use tokio_util::sync::CancellationToken;

    fn tool() -> ShellExecTool {
        ShellExecTool::new(vec!["echo".into(), "ls".into(), "sleep".into()])
    }

    fn ctx(dir: &std::path::Path, policy: SandboxPolicy) -> SandboxContext {
        SandboxContext::new(
            "t1",
            "t1_step_1",
            1,
            dir.to_path_buf(),
            ResourceLimits::default(),
            policy,
            CancellationToken::new(),
        )
    }

    fn dangerous() -> SandboxPolicy {
        SandboxPolicy {
            network: false,
            filesystem_write: true,
            allow_processes: true,
        }
    }

    #[test]
    fn test_allowlist_and_forbidden() {
        let t = tool();
        assert!(t.is_allowed("echo hi").is_ok());
        assert!(t.is_allowed("cat /etc/passwd").is_err());
        assert!(t.is_allowed("ls; rm -rf /").is_err());
        assert!(t.is_allowed("   ").is_err());
    }

    #[test]
    fn test_limited_script_prefix() {
        let limits = ResourceLimits::default().with_cpu_secs(5).with_memory_mb(64);
        let script = ShellExecTool::limited_script("echo hi", &limits);
        assert!(script.starts_with("ulimit -t 5"));
        assert!(script.contains("ulimit -v 65536"));
        assert!(script.ends_with("echo hi"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_runs_in_workdir() {
        let dir = tempfile::tempdir().unwrap();
        let out = tool()
            .invoke(json!({"command": "echo hello"}), ctx(dir.path(), dangerous()))
            .await
            .unwrap();
        assert_eq!(out["stdout"].as_str().unwrap().trim(), "hello");
        assert_eq!(out["returncode"], 0);
    }

    #[tokio::test]
    async fn test_requires_process_policy() {
        let dir = tempfile::tempdir().unwrap();
        let err = tool()
            .invoke(json!({"command": "echo hi"}), ctx(dir.path(), SandboxPolicy::locked_down()))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolFailure::UnauthorizedTool(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cancel_kills_command() {
        let dir = tempfile::tempdir().unwrap();
        let c = ctx(dir.path(), dangerous());
        let token = c.cancel.clone();
        let handle = tokio::spawn(async move { tool().invoke(json!({"command": "sleep 5"}), c).await });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        token.cancel();
        let err = handle.await.unwrap().unwrap_err();
        assert_eq!(err, ToolFailure::Cancelled);
    }
}
