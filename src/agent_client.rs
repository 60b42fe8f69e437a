//! External agent-server surface: the HTTP API exposed by the agent process
//! running inside a sandbox (health, session CRUD, prompt submission).

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::OrchestratorError;
use crate::sandbox_api::Preview;

#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub id: String,
    pub title: String,
    pub updated_at: Option<chrono::DateTime<chrono::Utc>>,
}

#[async_trait]
pub trait AgentClient: Send + Sync {
    async fn wait_for_healthy(&self, preview: &Preview, max_wait_ms: u64) -> bool;

    async fn create_session(&self, preview: &Preview, title: &str) -> Result<String, OrchestratorError>;

    async fn session_exists(&self, preview: &Preview, session_id: &str) -> Result<bool, OrchestratorError>;

    async fn list_sessions(&self, preview: &Preview, limit: u32) -> Result<Vec<SessionSummary>, OrchestratorError>;

    async fn send_prompt(&self, preview: &Preview, session_id: &str, text: &str) -> Result<String, OrchestratorError>;

    async fn abort_session(&self, preview: &Preview, session_id: &str) -> Result<(), OrchestratorError>;
}

/// Reference `reqwest`-backed implementation of [`AgentClient`], mirroring
/// the bearer-token REST client used by this codebase's own headless CLI.
pub struct HttpAgentClient {
    client: reqwest::Client,
}

impl HttpAgentClient {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    fn auth_header(preview: &Preview) -> Option<String> {
        preview.token.as_ref().map(|t| format!("Bearer {t}"))
    }

    fn request(&self, method: reqwest::Method, preview: &Preview, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}{}", preview.url.trim_end_matches('/'), path);
        let mut req = self.client.request(method, url);
        if let Some(header) = Self::auth_header(preview) {
            req = req.header("Authorization", header);
        }
        req
    }
}

impl Default for HttpAgentClient {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Deserialize)]
struct HealthResponse {
    #[serde(default)]
    ok: bool,
}

#[derive(Debug, Deserialize)]
struct CreateSessionResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
struct SessionListEntry {
    id: String,
    title: String,
    #[serde(default)]
    updated_at: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Debug, Deserialize)]
struct SendPromptResponse {
    reply: String,
}

#[async_trait]
impl AgentClient for HttpAgentClient {
    async fn wait_for_healthy(&self, preview: &Preview, max_wait_ms: u64) -> bool {
        let deadline = tokio::time::Instant::now() + std::time::Duration::from_millis(max_wait_ms);
        loop {
            let probe = self
                .request(reqwest::Method::GET, preview, "/health")
                .send()
                .await;
            if let Ok(resp) = probe {
                if let Ok(body) = resp.json::<HealthResponse>().await {
                    if body.ok {
                        return true;
                    }
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(std::time::Duration::from_secs(2)).await;
        }
    }

    async fn create_session(&self, preview: &Preview, title: &str) -> Result<String, OrchestratorError> {
        let resp = self
            .request(reqwest::Method::POST, preview, "/sessions")
            .json(&serde_json::json!({ "title": title }))
            .send()
            .await
            .map_err(|e| agent_error("create_session", &e))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(agent_client_error("create_session", Some(status.as_u16()), body));
        }
        let parsed: CreateSessionResponse = resp
            .json()
            .await
            .map_err(|e| agent_error("create_session", &e))?;
        Ok(parsed.id)
    }

    async fn session_exists(&self, preview: &Preview, session_id: &str) -> Result<bool, OrchestratorError> {
        let resp = self
            .request(reqwest::Method::GET, preview, &format!("/sessions/{session_id}"))
            .send()
            .await
            .map_err(|e| agent_error("session_exists", &e))?;
        Ok(resp.status().is_success())
    }

    async fn list_sessions(&self, preview: &Preview, limit: u32) -> Result<Vec<SessionSummary>, OrchestratorError> {
        let resp = self
            .request(reqwest::Method::GET, preview, &format!("/sessions?limit={limit}"))
            .send()
            .await
            .map_err(|e| agent_error("list_sessions", &e))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(agent_client_error("list_sessions", Some(status.as_u16()), body));
        }
        let entries: Vec<SessionListEntry> = resp
            .json()
            .await
            .map_err(|e| agent_error("list_sessions", &e))?;
        Ok(entries
            .into_iter()
            .map(|e| SessionSummary {
                id: e.id,
                title: e.title,
                updated_at: e.updated_at,
            })
            .collect())
    }

    async fn send_prompt(&self, preview: &Preview, session_id: &str, text: &str) -> Result<String, OrchestratorError> {
        let resp = self
            .request(
                reqwest::Method::POST,
                preview,
                &format!("/sessions/{session_id}/prompt"),
            )
            .json(&serde_json::json!({ "text": text }))
            .send()
            .await
            .map_err(|e| agent_error("send_prompt", &e))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(agent_client_error("send_prompt", Some(status.as_u16()), body));
        }
        let parsed: SendPromptResponse = resp
            .json()
            .await
            .map_err(|e| agent_error("send_prompt", &e))?;
        Ok(parsed.reply)
    }

    async fn abort_session(&self, preview: &Preview, session_id: &str) -> Result<(), OrchestratorError> {
        let resp = self
            .request(reqwest::Method::DELETE, preview, &format!("/sessions/{session_id}"))
            .send()
            .await
            .map_err(|e| agent_error("abort_session", &e))?;
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(agent_client_error("abort_session", Some(status), body));
        }
        Ok(())
    }
}

fn agent_error(operation: &str, e: &reqwest::Error) -> OrchestratorError {
    agent_client_error(operation, e.status().map(|s| s.as_u16()), e.to_string())
}

fn agent_client_error(operation: &str, status_code: Option<u16>, body: String) -> OrchestratorError {
    let kind = crate::error::SendFailureKind::classify(status_code, &body);
    OrchestratorError::AgentClient {
        operation: operation.to_string(),
        status_code,
        body,
        kind,
    }
}
