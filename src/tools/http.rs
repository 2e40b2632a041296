//! http_request：域名白名单、超时、响应大小限制
//!
//! 沙箱策略禁止网络时直接拒绝；allowed_domains 为空表示不限制域名，否则只允许列表中的域名及其子域名。

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method};
use serde_json::{json, Value};

use crate::config::HttpSection;
use crate::core::ToolFailure;
use crate::sandbox::{ResourceLimits, SandboxContext};
use crate::tools::{SecurityLevel, ToolDescriptor, ToolHandler};

/// 从 URL 中提取 host（不含端口后的路径）
fn extract_domain(url: &str) -> Option<String> {
    let url = url.trim();
    let url = url.strip_prefix("https://").or_else(|| url.strip_prefix("http://"))?;
    let host = url.split('/').next()?;
    let host = host.split('@').last()?;
    let host = host.split(':').next()?;
    if host.is_empty() {
        return None;
    }
    Some(host.to_lowercase())
}

/// http_request 工具：moderate 级别
pub struct HttpRequestTool {
    client: Client,
    allowed_domains: HashSet<String>,
    timeout: Duration,
}

impl HttpRequestTool {
    pub fn new(cfg: &HttpSection) -> Self {
        let timeout = Duration::from_secs(cfg.timeout_secs.max(1));
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("hive/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_default();
        Self {
            client,
            allowed_domains: cfg.allowed_domains.iter().map(|d| d.to_lowercase()).collect(),
            timeout,
        }
    }

    fn is_allowed(&self, url: &str) -> Result<(), ToolFailure> {
        let domain = extract_domain(url)
            .ok_or_else(|| ToolFailure::InvalidParameters(format!("invalid url: {url}")))?;
        if self.allowed_domains.is_empty() {
            return Ok(());
        }
        let permitted = self
            .allowed_domains
            .iter()
            .any(|d| domain == *d || domain.ends_with(&format!(".{d}")));
        if permitted {
            Ok(())
        } else {
            Err(ToolFailure::UnauthorizedTool(format!("domain not in allowlist: {domain}")))
        }
    }

    fn classify(&self, e: reqwest::Error) -> ToolFailure {
        if e.is_timeout() {
            ToolFailure::Timeout(self.timeout.as_millis() as u64)
        } else if e.is_builder() {
            ToolFailure::InvalidParameters(e.to_string())
        } else {
            ToolFailure::SandboxInfraFailure(format!("request failed: {e}"))
        }
    }
}

#[async_trait]
impl ToolHandler for HttpRequestTool {
    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor::new(
            "http_request",
            "Send an HTTP request. Args: {\"url\": \"https://...\", \"method\": \"GET\", \"headers\": {}, \"body\": ...}",
        )
        .schema(json!({
            "type": "object",
            "properties": {
                "url": { "type": "string" },
                "method": { "type": "string" },
                "headers": { "type": "object" },
                "body": {}
            },
            "required": ["url"]
        }))
        .security(SecurityLevel::Moderate)
        .limits(ResourceLimits::default().with_timeout(self.timeout + Duration::from_secs(5)))
    }

    async fn invoke(&self, params: Value, ctx: SandboxContext) -> Result<Value, ToolFailure> {
        if !ctx.policy.network {
            return Err(ToolFailure::UnauthorizedTool(
                "network access is not permitted by the sandbox policy".into(),
            ));
        }
        let url = params
            .get("url")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .trim();
        self.is_allowed(url)?;

        let method = params
            .get("method")
            .and_then(|v| v.as_str())
            .unwrap_or("GET")
            .to_uppercase();
        let method = Method::from_bytes(method.as_bytes())
            .map_err(|_| ToolFailure::InvalidParameters(format!("invalid method: {method}")))?;

        tracing::info!(step_id = %ctx.step_id, url = %url, method = %method, "http_request");

        let mut req = self.client.request(method, url);
        if let Some(Value::Object(headers)) = params.get("headers") {
            for (k, v) in headers {
                if let Some(v) = v.as_str() {
                    req = req.header(k.as_str(), v);
                }
            }
        }
        match params.get("body") {
            None | Some(Value::Null) => {}
            Some(Value::String(s)) => req = req.body(s.clone()),
            Some(other) => req = req.json(other),
        }

        let resp = tokio::select! {
            r = req.send() => r.map_err(|e| self.classify(e))?,
            _ = ctx.cancel.cancelled() => return Err(ToolFailure::Cancelled),
        };

        let status = resp.status().as_u16();
        let headers: serde_json::Map<String, Value> = resp
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.to_string(), Value::String(v.to_string()))))
            .collect();
        let body = resp.text().await.map_err(|e| self.classify(e))?;

        Ok(json!({
            "status_code": status,
            "headers": headers,
            "content": body,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_domain() {
        assert_eq!(extract_domain("https://Docs.rs/tokio"), Some("docs.rs".into()));
        assert_eq!(extract_domain("http://localhost:8080/x"), Some("localhost".into()));
        assert_eq!(extract_domain("ftp://example.com"), None);
        assert_eq!(extract_domain("https://"), None);
    }

    #[test]
    fn test_domain_allowlist() {
        let open = HttpRequestTool::new(&HttpSection::default());
        assert!(open.is_allowed("https://example.com").is_ok());

        let cfg = HttpSection {
            allowed_domains: vec!["docs.rs".into()],
            timeout_secs: 5,
        };
        let restricted = HttpRequestTool::new(&cfg);
        assert!(restricted.is_allowed("https://docs.rs/serde").is_ok());
        assert!(restricted.is_allowed("https://api.docs.rs/serde").is_ok());
        assert!(matches!(
            restricted.is_allowed("https://evil.com"),
            Err(ToolFailure::UnauthorizedTool(_))
        ));
        assert!(matches!(
            restricted.is_allowed("not a url"),
            Err(ToolFailure::InvalidParameters(_))
        ));
    }

    #[tokio::test]
    async fn test_network_policy_enforced() {
        let tool = HttpRequestTool::new(&HttpSection::default());
        let ctx = SandboxContext::new(
            "t1",
            "t1_step_1",
            1,
            std::env::temp_dir(),
            ResourceLimits::default(),
            crate::sandbox::SandboxPolicy::locked_down(),
            tokio_util::sync::CancellationToken::new(),
        );
        let err = tool
            .invoke(json!({"url": "https://example.com"}), ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, ToolFailure::UnauthorizedTool(_)));
    }
}
