//! 沙箱文件系统工具
//!
//! SafeFs 绑定任务工作目录，所有路径经 resolve 校验必须在 root 下（禁止 ../ 逃逸）；
//! FileReadTool / FileWriteTool 基于 SafeFs 提供 file_read / file_write 能力。

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use serde_json::{json, Value};
use thiserror::Error;

use crate::core::ToolFailure;
use crate::sandbox::{ResourceLimits, SandboxContext};
use crate::tools::{SecurityLevel, ToolDescriptor, ToolHandler};

#[derive(Error, Debug)]
pub enum FsError {
    #[error("Path escapes sandbox: {0}")]
    PathEscape(String),

    #[error("Path not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<FsError> for ToolFailure {
    fn from(e: FsError) -> Self {
        match e {
            FsError::PathEscape(p) => ToolFailure::UnauthorizedTool(format!("path escapes sandbox: {p}")),
            FsError::NotFound(p) => ToolFailure::InvalidParameters(format!("path not found: {p}")),
            FsError::Io(e) => ToolFailure::SandboxInfraFailure(e.to_string()),
        }
    }
}

/// 沙箱文件系统：绑定根目录，resolve 校验路径在根下，防止路径逃逸
#[derive(Debug, Clone)]
pub struct SafeFs {
    root_dir: PathBuf,
}

impl SafeFs {
    pub fn new(root_dir: impl AsRef<Path>) -> Self {
        let root = root_dir.as_ref().to_path_buf();
        let root_dir = root.canonicalize().unwrap_or(root);
        Self { root_dir }
    }

    pub fn root(&self) -> &Path {
        &self.root_dir
    }

    /// 已存在的路径：canonicalize 后必须仍在 root 下（符号链接也算）
    pub fn resolve(&self, path: &str) -> Result<PathBuf, FsError> {
        let lexical = self.lexical_join(path)?;
        let canonical = lexical
            .canonicalize()
            .map_err(|_| FsError::NotFound(path.to_string()))?;
        if canonical.starts_with(&self.root_dir) {
            Ok(canonical)
        } else {
            Err(FsError::PathEscape(path.to_string())) // 如 ../../etc/passwd
        }
    }

    /// 写入目标：文件可以不存在，但父目录创建后必须在 root 下
    pub fn resolve_for_write(&self, path: &str) -> Result<PathBuf, FsError> {
        let lexical = self.lexical_join(path)?;
        let file_name = lexical
            .file_name()
            .map(|n| n.to_os_string())
            .ok_or_else(|| FsError::NotFound(path.to_string()))?;
        let parent = lexical.parent().unwrap_or(&self.root_dir).to_path_buf();
        std::fs::create_dir_all(&parent)?;
        let parent = parent.canonicalize()?;
        if !parent.starts_with(&self.root_dir) {
            return Err(FsError::PathEscape(path.to_string()));
        }
        Ok(parent.join(file_name))
    }

    /// 纯词法拼接：拒绝绝对路径，.. 不允许越过 root
    fn lexical_join(&self, path: &str) -> Result<PathBuf, FsError> {
        let mut out = self.root_dir.clone();
        let mut depth = 0usize;
        for component in Path::new(path.trim()).components() {
            match component {
                Component::CurDir => {}
                Component::Normal(part) => {
                    out.push(part);
                    depth += 1;
                }
                Component::ParentDir => {
                    if depth == 0 {
                        return Err(FsError::PathEscape(path.to_string()));
                    }
                    out.pop();
                    depth -= 1;
                }
                Component::RootDir | Component::Prefix(_) => {
                    return Err(FsError::PathEscape(path.to_string()));
                }
            }
        }
        Ok(out)
    }
}

fn path_param(params: &Value) -> Result<&str, ToolFailure> {
    params
        .get("path")
        .and_then(|v| v.as_str())
        .filter(|p| !p.trim().is_empty())
        .ok_or_else(|| ToolFailure::InvalidParameters("'path' is required".into()))
}

/// file_read：读取工作目录内的文本文件
pub struct FileReadTool;

#[async_trait]
impl ToolHandler for FileReadTool {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor::new(
            "file_read",
            "Read a text file from the task workspace. Args: {\"path\": \"relative path\"}",
        )
        .schema(json!({
            "type": "object",
            "properties": {
                "path": { "type": "string" },
                "max_bytes": { "type": "integer" }
            },
            "required": ["path"]
        }))
        .security(SecurityLevel::Safe)
        .limits(ResourceLimits::default())
    }

    async fn invoke(&self, params: Value, ctx: SandboxContext) -> Result<Value, ToolFailure> {
        let path = path_param(&params)?;
        let fs = SafeFs::new(&ctx.workdir);
        let resolved = fs.resolve(path)?;
        tracing::info!(step_id = %ctx.step_id, path = %path, "file_read");

        let bytes = tokio::fs::read(&resolved).await.map_err(FsError::from)?;
        let size = bytes.len();
        let limit = params
            .get("max_bytes")
            .and_then(Value::as_u64)
            .map(|n| n as usize)
            .unwrap_or(size);
        let content = String::from_utf8_lossy(&bytes[..size.min(limit)]).to_string();
        Ok(json!({
            "path": path,
            "content": content,
            "size": size,
            "truncated": limit < size,
        }))
    }
}

/// file_write：写入工作目录内的文件（moderate，需要可写策略）
pub struct FileWriteTool;

#[async_trait]
impl ToolHandler for FileWriteTool {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor::new(
            "file_write",
            "Write text to a file in the task workspace. Args: {\"path\": \"...\", \"content\": \"...\", \"append\": false}",
        )
        .schema(json!({
            "type": "object",
            "properties": {
                "path": { "type": "string" },
                "content": { "type": "string" },
                "append": { "type": "boolean" }
            },
            "required": ["path", "content"]
        }))
        .security(SecurityLevel::Moderate)
        .limits(ResourceLimits::default())
    }

    async fn invoke(&self, params: Value, ctx: SandboxContext) -> Result<Value, ToolFailure> {
        if !ctx.policy.filesystem_write {
            return Err(ToolFailure::UnauthorizedTool(
                "filesystem writes are not permitted by the sandbox policy".into(),
            ));
        }
        let path = path_param(&params)?;
        let content = params
            .get("content")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ToolFailure::InvalidParameters("'content' is required".into()))?;
        let append = params.get("append").and_then(Value::as_bool).unwrap_or(false);

        let fs = SafeFs::new(&ctx.workdir);
        let target = fs.resolve_for_write(path)?;
        tracing::info!(step_id = %ctx.step_id, path = %path, append, "file_write");

        if append {
            use tokio::io::AsyncWriteExt;
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&target)
                .await
                .map_err(FsError::from)?;
            file.write_all(content.as_bytes()).await.map_err(FsError::from)?;
            file.flush().await.map_err(FsError::from)?;
        } else {
            tokio::fs::write(&target, content).await.map_err(FsError::from)?;
        }

        Ok(json!({
            "path": path,
            "bytes_written": content.len(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::SandboxPolicy;
    use tokio_util::sync::CancellationToken;

    fn ctx(dir: &Path, policy: SandboxPolicy) -> SandboxContext {
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

    fn writable() -> SandboxPolicy {
        SandboxPolicy {
            network: false,
            filesystem_write: true,
            allow_processes: false,
        }
    }

    #[test]
    fn test_resolve_rejects_escape() {
        let dir = tempfile::tempdir().unwrap();
        let fs = SafeFs::new(dir.path());
        assert!(matches!(fs.resolve("../../etc/passwd"), Err(FsError::PathEscape(_))));
        assert!(matches!(fs.resolve("/etc/passwd"), Err(FsError::PathEscape(_))));
        assert!(matches!(fs.resolve("missing.txt"), Err(FsError::NotFound(_))));
        assert!(fs.resolve_for_write("a/../../x").is_err());
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        FileWriteTool
            .invoke(json!({"path": "out/notes.txt", "content": "hello"}), ctx(dir.path(), writable()))
            .await
            .unwrap();
        FileWriteTool
            .invoke(
                json!({"path": "out/notes.txt", "content": " world", "append": true}),
                ctx(dir.path(), writable()),
            )
            .await
            .unwrap();

        let out = FileReadTool
            .invoke(json!({"path": "out/notes.txt"}), ctx(dir.path(), SandboxPolicy::locked_down()))
            .await
            .unwrap();
        assert_eq!(out["content"], "hello world");
        assert_eq!(out["truncated"], false);
    }

    #[tokio::test]
    async fn test_write_denied_under_read_only_policy() {
        let dir = tempfile::tempdir().unwrap();
        let err = FileWriteTool
            .invoke(json!({"path": "x.txt", "content": "x"}), ctx(dir.path(), SandboxPolicy::locked_down()))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolFailure::UnauthorizedTool(_)));
    }

    #[tokio::test]
    async fn test_read_missing_is_invalid_parameters() {
        let dir = tempfile::tempdir().unwrap();
        let err = FileReadTool
            .invoke(json!({"path": "nope.txt"}), ctx(dir.path(), SandboxPolicy::locked_down()))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolFailure::InvalidParameters(_)));
    }
}
