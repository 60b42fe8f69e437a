//! External sandbox-provider surface: create/start/stop/destroy a sandbox,
//! run a command inside it, and resolve its preview URL.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::OrchestratorError;

#[derive(Debug, Clone)]
pub struct CreateSandboxRequest {
    pub thread_id: String,
    pub guild_id: String,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone)]
pub struct SandboxHandle {
    pub sandbox_id: String,
}

#[derive(Debug, Clone)]
pub struct ExecRequest<'a> {
    pub cwd: Option<&'a str>,
    pub env: HashMap<String, String>,
}

impl Default for ExecRequest<'_> {
    fn default() -> Self {
        Self {
            cwd: None,
            env: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExecResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Preview connectivity for [`crate::agent_client::AgentClient`]. The
/// provider may embed the token as a `tkn` query parameter instead of a
/// separate field; `Preview::normalize` folds both shapes into this one.
#[derive(Debug, Clone)]
pub struct Preview {
    pub url: String,
    pub token: Option<String>,
}

impl Preview {
    /// Normalize a raw `(url, token)` pair from the provider: if `token` is
    /// absent, look for a `tkn` query parameter on `url` and extract it.
    pub fn normalize(url: String, token: Option<String>) -> Self {
        if token.is_some() {
            return Self { url, token };
        }
        if let Some(idx) = url.find("tkn=") {
            let after = &url[idx + "tkn=".len()..];
            let end = after.find('&').unwrap_or(after.len());
            let extracted = after[..end].to_string();
            let mut base = url[..idx].trim_end_matches(['?', '&']).to_string();
            if base.is_empty() {
                base = url.clone();
            }
            return Self {
                url: base,
                token: Some(extracted),
            };
        }
        Self { url, token: None }
    }
}

/// External sandbox-provider SDK surface. A production implementation talks
/// to whatever remote sandbox service backs this deployment; tests supply an
/// in-memory fake.
#[async_trait]
pub trait SandboxAPI: Send + Sync {
    async fn create(&self, req: CreateSandboxRequest) -> Result<SandboxHandle, OrchestratorError>;

    async fn exec(
        &self,
        sandbox_id: &str,
        label: &str,
        command: &str,
        opts: ExecRequest<'_>,
    ) -> Result<ExecResult, OrchestratorError>;

    async fn start(&self, sandbox_id: &str, timeout_secs: u64) -> Result<(), OrchestratorError>;

    async fn stop(&self, sandbox_id: &str) -> Result<(), OrchestratorError>;

    async fn destroy(&self, sandbox_id: &str) -> Result<(), OrchestratorError>;

    async fn get_preview(&self, sandbox_id: &str) -> Result<Preview, OrchestratorError>;
}

/// Reference `reqwest`-backed implementation of [`SandboxAPI`], talking to a
/// provider that exposes sandbox create/start/stop/destroy/exec/preview as a
/// plain REST surface over `base_url` — the same bearer-auth REST shape
/// [`crate::agent_client::HttpAgentClient`] uses against the agent server.
/// A provider with a different wire contract supplies its own [`SandboxAPI`]
/// impl instead; this one exists so the daemon has something to construct
/// out of the box.
pub struct HttpSandboxAPI {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpSandboxAPI {
    pub fn new(config: crate::config::SandboxProviderConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: config.base_url,
            api_key: config.api_key,
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}{}", self.base_url.trim_end_matches('/'), path);
        let mut req = self.client.request(method, url);
        if let Some(key) = &self.api_key {
            req = req.header("Authorization", format!("Bearer {key}"));
        }
        req
    }
}

#[derive(serde::Deserialize)]
struct CreateResponse {
    sandbox_id: String,
}

#[derive(serde::Deserialize)]
struct ExecResponse {
    exit_code: i32,
    #[serde(default)]
    stdout: String,
    #[serde(default)]
    stderr: String,
}

#[derive(serde::Deserialize)]
struct PreviewResponse {
    url: String,
    #[serde(default)]
    token: Option<String>,
}

#[async_trait]
impl SandboxAPI for HttpSandboxAPI {
    async fn create(&self, req: CreateSandboxRequest) -> Result<SandboxHandle, OrchestratorError> {
        let resp = self
            .request(reqwest::Method::POST, "/sandboxes")
            .json(&serde_json::json!({
                "thread_id": req.thread_id,
                "guild_id": req.guild_id,
                "timeout_secs": req.timeout_secs,
            }))
            .send()
            .await
            .map_err(|e| create_error(&e.to_string(), ""))?;
        if !resp.status().is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(create_error("sandbox provider rejected create", &body));
        }
        let parsed: CreateResponse = resp
            .json()
            .await
            .map_err(|e| create_error(&e.to_string(), ""))?;
        Ok(SandboxHandle {
            sandbox_id: parsed.sandbox_id,
        })
    }

    async fn exec(
        &self,
        sandbox_id: &str,
        label: &str,
        command: &str,
        opts: ExecRequest<'_>,
    ) -> Result<ExecResult, OrchestratorError> {
        let resp = self
            .request(reqwest::Method::POST, &format!("/sandboxes/{sandbox_id}/exec"))
            .json(&serde_json::json!({
                "label": label,
                "command": command,
                "cwd": opts.cwd,
                "env": opts.env,
            }))
            .send()
            .await
            .map_err(|e| OrchestratorError::SandboxExec(e.to_string()))?;
        if !resp.status().is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(OrchestratorError::SandboxExec(body));
        }
        let parsed: ExecResponse = resp
            .json()
            .await
            .map_err(|e| OrchestratorError::SandboxExec(e.to_string()))?;
        Ok(ExecResult {
            exit_code: parsed.exit_code,
            stdout: parsed.stdout,
            stderr: parsed.stderr,
        })
    }

    async fn start(&self, sandbox_id: &str, timeout_secs: u64) -> Result<(), OrchestratorError> {
        let resp = self
            .request(reqwest::Method::POST, &format!("/sandboxes/{sandbox_id}/start"))
            .json(&serde_json::json!({ "timeout_secs": timeout_secs }))
            .send()
            .await
            .map_err(|e| OrchestratorError::SandboxStart(e.to_string()))?;
        if !resp.status().is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(OrchestratorError::SandboxStart(body));
        }
        Ok(())
    }

    async fn stop(&self, sandbox_id: &str) -> Result<(), OrchestratorError> {
        let resp = self
            .request(reqwest::Method::POST, &format!("/sandboxes/{sandbox_id}/stop"))
            .send()
            .await
            .map_err(|e| OrchestratorError::SandboxNotFound(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(OrchestratorError::SandboxNotFound(sandbox_id.to_string()));
        }
        Ok(())
    }

    async fn destroy(&self, sandbox_id: &str) -> Result<(), OrchestratorError> {
        let resp = self
            .request(reqwest::Method::DELETE, &format!("/sandboxes/{sandbox_id}"))
            .send()
            .await
            .map_err(|e| OrchestratorError::SandboxNotFound(e.to_string()))?;
        if !resp.status().is_success() && resp.status().as_u16() != 404 {
            return Err(OrchestratorError::SandboxNotFound(sandbox_id.to_string()));
        }
        Ok(())
    }

    async fn get_preview(&self, sandbox_id: &str) -> Result<Preview, OrchestratorError> {
        let resp = self
            .request(reqwest::Method::GET, &format!("/sandboxes/{sandbox_id}/preview"))
            .send()
            .await
            .map_err(|e| OrchestratorError::SandboxNotFound(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(OrchestratorError::SandboxNotFound(sandbox_id.to_string()));
        }
        let parsed: PreviewResponse = resp
            .json()
            .await
            .map_err(|e| OrchestratorError::SandboxNotFound(e.to_string()))?;
        Ok(Preview::normalize(parsed.url, parsed.token))
    }
}

fn create_error(message: &str, log_tail: &str) -> OrchestratorError {
    OrchestratorError::SandboxCreate {
        message: message.to_string(),
        log_tail: log_tail.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_sandbox_api_constructs_from_config() {
        let _api = HttpSandboxAPI::new(crate::config::SandboxProviderConfig {
            base_url: "https://example.test".to_string(),
            api_key: Some("k".to_string()),
        });
    }

    #[test]
    fn normalize_passes_through_separate_token() {
        let p = Preview::normalize("https://host/x".into(), Some("abc".into()));
        assert_eq!(p.url, "https://host/x");
        assert_eq!(p.token.as_deref(), Some("abc"));
    }

    #[test]
    fn normalize_extracts_embedded_query_token() {
        let p = Preview::normalize("https://host/x?tkn=secret&foo=1".into(), None);
        assert_eq!(p.token.as_deref(), Some("secret"));
        assert_eq!(p.url, "https://host/x");
    }

    #[test]
    fn normalize_extracts_trailing_embedded_query_token() {
        let p = Preview::normalize("https://host/x?tkn=secret".into(), None);
        assert_eq!(p.token.as_deref(), Some("secret"));
        assert_eq!(p.url, "https://host/x");
    }

    #[test]
    fn normalize_with_no_token_anywhere_is_none() {
        let p = Preview::normalize("https://host/x".into(), None);
        assert!(p.token.is_none());
        assert_eq!(p.url, "https://host/x");
    }
}
