//! Pure functional orchestration over [`SessionStore`], [`SandboxAPI`], and
//! [`AgentClient`] realizing the session lifecycle state machine. Holds
//! collaborator handles and config but no session state of its own.

use std::sync::Arc;

use tracing::{instrument, warn};

use crate::agent_client::AgentClient;
use crate::config::SandboxConfig;
use crate::error::{OrchestratorError, SendFailureKind};
use crate::sandbox_api::{CreateSandboxRequest, ExecRequest, Preview, SandboxAPI};
use crate::store::{SessionRecord, SessionStatus, SessionStore};

const AGENT_PORT: u16 = 4096;
const AGENT_LOG_PATH: &str = "/tmp/sandboxrelay-agent.log";
const AGENT_CHECKOUT_DIR: &str = "/opt/agent";

/// Outcome of [`Provisioner::resume`].
pub enum ResumeOutcome {
    Resumed(SessionRecord),
    ResumeFailed { allow_recreate: bool },
}

pub struct Provisioner {
    store: Arc<dyn SessionStore>,
    sandbox: Arc<dyn SandboxAPI>,
    agent: Arc<dyn AgentClient>,
    config: SandboxConfig,
}

impl Provisioner {
    pub fn new(
        store: Arc<dyn SessionStore>,
        sandbox: Arc<dyn SandboxAPI>,
        agent: Arc<dyn AgentClient>,
        config: SandboxConfig,
    ) -> Self {
        Self {
            store,
            sandbox,
            agent,
            config,
        }
    }

    /// Provision a brand-new sandbox and agent session for `thread_id`.
    #[instrument(skip(self), fields(thread_id = %thread_id))]
    pub async fn provision(
        &self,
        thread_id: &str,
        channel_id: &str,
        guild_id: &str,
    ) -> Result<SessionRecord, OrchestratorError> {
        let mut record = self
            .store
            .get_by_thread(thread_id)
            .await?
            .unwrap_or_else(|| SessionRecord::new_creating(thread_id, channel_id, guild_id));
        record.status = SessionStatus::Creating;
        self.store.upsert(&record).await?;

        let handle = self
            .sandbox
            .create(CreateSandboxRequest {
                thread_id: thread_id.to_string(),
                guild_id: guild_id.to_string(),
                timeout_secs: self.config.creation_timeout_secs,
            })
            .await?;

        match self.provision_body(thread_id, &handle.sandbox_id).await {
            Ok((preview, session_id)) => {
                let now = chrono::Utc::now();
                record.sandbox_id = handle.sandbox_id;
                record.agent_session_id = session_id;
                record.preview_url = preview.url;
                record.preview_token = preview.token;
                record.status = SessionStatus::Active;
                record.last_error = None;
                record.resume_fail_count = 0;
                record.last_health_ok_at = Some(now);
                self.store.upsert(&record).await?;
                Ok(record)
            }
            Err(e) => {
                let _ = self.sandbox.destroy(&handle.sandbox_id).await;
                self.store
                    .update_status(thread_id, SessionStatus::Error, Some(&e.to_string()))
                    .await?;
                Err(e)
            }
        }
    }

    async fn provision_body(
        &self,
        thread_id: &str,
        sandbox_id: &str,
    ) -> Result<(Preview, String), OrchestratorError> {
        self.install_agent(sandbox_id).await?;
        let preview = self.sandbox.get_preview(sandbox_id).await?;

        let healthy = self
            .agent
            .wait_for_healthy(&preview, self.config.startup_health_timeout_ms)
            .await;
        if !healthy {
            let log_tail = self.tail_agent_log(sandbox_id).await;
            return Err(OrchestratorError::SandboxCreate {
                message: "agent never became healthy during provision".into(),
                log_tail,
            });
        }

        let title = SessionRecord::canonical_session_title(thread_id);
        let session_id = self.agent.create_session(&preview, &title).await?;
        Ok((preview, session_id))
    }

    async fn install_agent(&self, sandbox_id: &str) -> Result<(), OrchestratorError> {
        let clone_cmd = format!(
            "mkdir -p {AGENT_CHECKOUT_DIR} && git clone --depth 1 https://example.invalid/agent.git {AGENT_CHECKOUT_DIR} 2>&1 || true"
        );
        self.sandbox
            .exec(sandbox_id, "install-agent-clone", &clone_cmd, ExecRequest::default())
            .await?;

        let launch_cmd = format!(
            "cd {AGENT_CHECKOUT_DIR} && nohup ./agent --port {AGENT_PORT} > {AGENT_LOG_PATH} 2>&1 < /dev/null &"
        );
        self.sandbox
            .exec(sandbox_id, "install-agent-launch", &launch_cmd, ExecRequest::default())
            .await?;
        Ok(())
    }

    async fn tail_agent_log(&self, sandbox_id: &str) -> String {
        let cmd = format!("tail -n 200 {AGENT_LOG_PATH} 2>/dev/null || true");
        match self
            .sandbox
            .exec(sandbox_id, "tail-agent-log", &cmd, ExecRequest::default())
            .await
        {
            Ok(result) => result.stdout,
            Err(_) => String::new(),
        }
    }

    /// Attempt to resume a paused/dead/errored sandbox without losing its
    /// agent session state.
    #[instrument(skip(self, record), fields(thread_id = %record.thread_id))]
    pub async fn resume(&self, record: &SessionRecord) -> Result<ResumeOutcome, OrchestratorError> {
        if !matches!(
            record.status,
            SessionStatus::Paused
                | SessionStatus::Destroyed
                | SessionStatus::Error
                | SessionStatus::Pausing
                | SessionStatus::Resuming
        ) {
            return Ok(ResumeOutcome::ResumeFailed {
                allow_recreate: true,
            });
        }

        let thread_id = &record.thread_id;
        self.store
            .update_status(thread_id, SessionStatus::Resuming, None)
            .await?;

        match self
            .sandbox
            .start(&record.sandbox_id, self.config.creation_timeout_secs)
            .await
        {
            Err(OrchestratorError::SandboxNotFound(_)) => {
                self.store
                    .update_status(thread_id, SessionStatus::Destroyed, Some("sandbox not found on resume"))
                    .await?;
                return Ok(ResumeOutcome::ResumeFailed {
                    allow_recreate: true,
                });
            }
            Err(e) => {
                self.store
                    .increment_resume_failure(thread_id, &e.to_string())
                    .await?;
                self.store
                    .update_status(thread_id, SessionStatus::Error, Some(&e.to_string()))
                    .await?;
                return Ok(ResumeOutcome::ResumeFailed {
                    allow_recreate: true,
                });
            }
            Ok(()) => {}
        }

        self.restart_agent_process(&record.sandbox_id).await;

        let preview = self.sandbox.get_preview(&record.sandbox_id).await?;
        let healthy = self
            .agent
            .wait_for_healthy(&preview, self.config.resume_health_timeout_ms)
            .await;
        if !healthy {
            let log_tail = self.tail_agent_log(&record.sandbox_id).await;
            self.store
                .increment_resume_failure(thread_id, &log_tail)
                .await?;
            self.store
                .update_status(thread_id, SessionStatus::Error, Some(&log_tail))
                .await?;
            return Ok(ResumeOutcome::ResumeFailed {
                allow_recreate: false,
            });
        }

        let session_id = self
            .find_or_create_session_id(&preview, thread_id, &record.agent_session_id)
            .await?;

        let mut updated = record.clone();
        updated.preview_url = preview.url;
        updated.preview_token = preview.token;
        updated.agent_session_id = session_id;
        updated.status = SessionStatus::Active;
        updated.last_health_ok_at = Some(chrono::Utc::now());
        self.store.upsert(&updated).await?;

        Ok(ResumeOutcome::Resumed(updated))
    }

    async fn restart_agent_process(&self, sandbox_id: &str) {
        let cmd = format!(
            "pkill -f 'agent --port {AGENT_PORT}' 2>/dev/null; cd {AGENT_CHECKOUT_DIR} && nohup ./agent --port {AGENT_PORT} > {AGENT_LOG_PATH} 2>&1 < /dev/null &"
        );
        match self
            .sandbox
            .exec(sandbox_id, "restart-agent", &cmd, ExecRequest::default())
            .await
        {
            Ok(result) if result.exit_code != 0 => {
                warn!(sandbox_id, exit_code = result.exit_code, "agent restart command exited non-zero");
            }
            Err(e) => {
                warn!(sandbox_id, error = %e, "agent restart command failed to execute");
            }
            _ => {}
        }
    }

    async fn find_or_create_session_id(
        &self,
        preview: &Preview,
        thread_id: &str,
        prior_session_id: &str,
    ) -> Result<String, OrchestratorError> {
        if !prior_session_id.is_empty() && self.agent.session_exists(preview, prior_session_id).await? {
            return Ok(prior_session_id.to_string());
        }

        let canonical_title = SessionRecord::canonical_session_title(thread_id);
        let sessions = self.agent.list_sessions(preview, 50).await?;
        let best = sessions
            .into_iter()
            .filter(|s| s.title == canonical_title)
            .max_by_key(|s| s.updated_at);
        if let Some(s) = best {
            return Ok(s.id);
        }

        self.agent.create_session(preview, &canonical_title).await
    }

    /// The top-level "give me a usable session" operation.
    #[instrument(skip(self, current), fields(thread_id = %thread_id))]
    pub async fn ensure_active(
        &self,
        thread_id: &str,
        channel_id: &str,
        guild_id: &str,
        current: Option<SessionRecord>,
    ) -> Result<SessionRecord, OrchestratorError> {
        let current = match current {
            None => return self.provision(thread_id, channel_id, guild_id).await,
            Some(r) => r,
        };

        if current.status == SessionStatus::Active {
            let preview = Preview {
                url: current.preview_url.clone(),
                token: current.preview_token.clone(),
            };
            let healthy = self
                .agent
                .wait_for_healthy(&preview, self.config.active_health_check_timeout_ms)
                .await;
            let session_ok = healthy
                && self
                    .agent
                    .session_exists(&preview, &current.agent_session_id)
                    .await
                    .unwrap_or(false);
            if session_ok {
                return Ok(current);
            }
        }

        let candidate = self
            .store
            .get_by_thread(thread_id)
            .await?
            .unwrap_or(current);

        if self.config.reuse_policy == crate::config::SandboxReusePolicy::ResumePreferred {
            match self.resume(&candidate).await? {
                ResumeOutcome::Resumed(r) => Ok(r),
                ResumeOutcome::ResumeFailed {
                    allow_recreate: false,
                } => Err(OrchestratorError::SandboxDead(candidate.thread_id.clone())),
                ResumeOutcome::ResumeFailed {
                    allow_recreate: true,
                } => {
                    self.destroy(&candidate, Some("resume-failed-allow-recreate")).await?;
                    self.provision(thread_id, channel_id, guild_id).await
                }
            }
        } else {
            self.destroy(&candidate, Some("recreate-policy")).await?;
            self.provision(thread_id, channel_id, guild_id).await
        }
    }

    /// Classify and react to an `AgentClient.sendPrompt` failure.
    pub async fn recover_send_failure(
        &self,
        record: &SessionRecord,
        kind: SendFailureKind,
    ) -> Result<SessionRecord, OrchestratorError> {
        match kind {
            SendFailureKind::NonRecoverable => Ok(record.clone()),
            SendFailureKind::SessionMissing => {
                self.store
                    .increment_resume_failure(&record.thread_id, "opencode-session-missing")
                    .await?;
                self.store
                    .update_status(&record.thread_id, SessionStatus::Error, Some("opencode-session-missing"))
                    .await?;
                let mut updated = record.clone();
                updated.status = SessionStatus::Error;
                updated.last_error = Some("opencode-session-missing".to_string());
                Ok(updated)
            }
            SendFailureKind::SandboxDown => self.pause(record, "sandbox-down-on-send").await,
        }
    }

    /// Best-effort stop; falls back to `destroyed` if the stop itself fails.
    pub async fn pause(&self, record: &SessionRecord, reason: &str) -> Result<SessionRecord, OrchestratorError> {
        if record.status == SessionStatus::Paused {
            return Ok(record.clone());
        }

        self.store
            .update_status(&record.thread_id, SessionStatus::Pausing, None)
            .await?;

        let mut updated = record.clone();
        match self.sandbox.stop(&record.sandbox_id).await {
            Ok(()) => {
                self.store
                    .update_status(&record.thread_id, SessionStatus::Paused, None)
                    .await?;
                updated.status = SessionStatus::Paused;
            }
            Err(_) => {
                self.store
                    .update_status(
                        &record.thread_id,
                        SessionStatus::Destroyed,
                        Some("sandbox-unavailable-during-pause"),
                    )
                    .await?;
                updated.status = SessionStatus::Destroyed;
                updated.last_error = Some("sandbox-unavailable-during-pause".to_string());
                let _ = reason;
            }
        }
        Ok(updated)
    }

    /// Best-effort destroy; errors from the sandbox provider are ignored
    /// because the target state is `destroyed` regardless.
    pub async fn destroy(
        &self,
        record: &SessionRecord,
        reason: Option<&str>,
    ) -> Result<SessionRecord, OrchestratorError> {
        if record.status == SessionStatus::Destroyed {
            return Ok(record.clone());
        }

        self.store
            .update_status(&record.thread_id, SessionStatus::Destroying, None)
            .await?;
        let _ = self.sandbox.destroy(&record.sandbox_id).await;
        self.store
            .update_status(&record.thread_id, SessionStatus::Destroyed, reason)
            .await?;

        let mut updated = record.clone();
        updated.status = SessionStatus::Destroyed;
        updated.last_error = reason.map(|s| s.to_string());
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{FakeAgentClient, FakeSandboxAPI, InMemorySessionStore};

    fn provisioner() -> (Provisioner, Arc<InMemorySessionStore>, Arc<FakeSandboxAPI>, Arc<FakeAgentClient>) {
        let store = Arc::new(InMemorySessionStore::new());
        let sandbox = Arc::new(FakeSandboxAPI::new());
        let agent = Arc::new(FakeAgentClient::new());
        let provisioner = Provisioner::new(store.clone(), sandbox.clone(), agent.clone(), SandboxConfig::default());
        (provisioner, store, sandbox, agent)
    }

    #[tokio::test]
    async fn provision_creates_active_record_on_success() {
        let (p, store, _sandbox, _agent) = provisioner();
        let record = p.provision("t1", "c1", "g1").await.unwrap();
        assert_eq!(record.status, SessionStatus::Active);
        assert!(!record.sandbox_id.is_empty());
        assert!(!record.agent_session_id.is_empty());

        let stored = store.get_by_thread("t1").await.unwrap().unwrap();
        assert_eq!(stored.status, SessionStatus::Active);
    }

    #[tokio::test]
    async fn provision_failure_leaves_record_in_error_and_destroys_sandbox() {
        let (p, store, sandbox, agent) = provisioner();
        agent.set_health_response(false);

        let result = p.provision("t1", "c1", "g1").await;
        assert!(result.is_err());

        let stored = store.get_by_thread("t1").await.unwrap().unwrap();
        assert_eq!(stored.status, SessionStatus::Error);
        assert_eq!(sandbox.destroy_calls(), 1);
    }

    #[tokio::test]
    async fn ensure_active_with_none_provisions() {
        let (p, _store, _sandbox, _agent) = provisioner();
        let record = p.ensure_active("t1", "c1", "g1", None).await.unwrap();
        assert_eq!(record.status, SessionStatus::Active);
    }

    #[tokio::test]
    async fn ensure_active_returns_same_record_when_healthy() {
        let (p, _store, _sandbox, agent) = provisioner();
        let record = p.provision("t1", "c1", "g1").await.unwrap();
        agent.set_session_exists(true);

        let result = p
            .ensure_active("t1", "c1", "g1", Some(record.clone()))
            .await
            .unwrap();
        assert_eq!(result.sandbox_id, record.sandbox_id);
        assert_eq!(result.agent_session_id, record.agent_session_id);
    }

    #[tokio::test]
    async fn resume_on_non_resumable_status_returns_allow_recreate() {
        let (p, _store, _sandbox, _agent) = provisioner();
        let mut record = SessionRecord::new_creating("t1", "c1", "g1");
        record.status = SessionStatus::Active;
        let outcome = p.resume(&record).await.unwrap();
        assert!(matches!(
            outcome,
            ResumeOutcome::ResumeFailed {
                allow_recreate: true
            }
        ));
    }

    #[tokio::test]
    async fn resume_succeeds_and_reuses_prior_session_when_it_exists() {
        let (p, store, _sandbox, agent) = provisioner();
        let mut record = p.provision("t1", "c1", "g1").await.unwrap();
        record.status = SessionStatus::Paused;
        store.upsert(&record).await.unwrap();
        agent.set_session_exists(true);

        let outcome = p.resume(&record).await.unwrap();
        match outcome {
            ResumeOutcome::Resumed(r) => {
                assert_eq!(r.status, SessionStatus::Active);
                assert_eq!(r.agent_session_id, record.agent_session_id);
            }
            _ => panic!("expected resumed"),
        }
    }

    #[tokio::test]
    async fn resume_unhealthy_agent_does_not_allow_recreate() {
        let (p, store, _sandbox, agent) = provisioner();
        let mut record = p.provision("t1", "c1", "g1").await.unwrap();
        record.status = SessionStatus::Paused;
        store.upsert(&record).await.unwrap();
        agent.set_health_response(false);

        let outcome = p.resume(&record).await.unwrap();
        assert!(matches!(
            outcome,
            ResumeOutcome::ResumeFailed {
                allow_recreate: false
            }
        ));
        let stored = store.get_by_thread("t1").await.unwrap().unwrap();
        assert_eq!(stored.status, SessionStatus::Error);
        assert_eq!(stored.resume_fail_count, 1);
    }

    #[tokio::test]
    async fn recover_send_failure_session_missing_marks_error() {
        let (p, _store, _sandbox, _agent) = provisioner();
        let record = p.provision("t1", "c1", "g1").await.unwrap();
        let updated = p
            .recover_send_failure(&record, SendFailureKind::SessionMissing)
            .await
            .unwrap();
        assert_eq!(updated.status, SessionStatus::Error);
    }

    #[tokio::test]
    async fn recover_send_failure_sandbox_down_pauses() {
        let (p, _store, _sandbox, _agent) = provisioner();
        let record = p.provision("t1", "c1", "g1").await.unwrap();
        let updated = p
            .recover_send_failure(&record, SendFailureKind::SandboxDown)
            .await
            .unwrap();
        assert_eq!(updated.status, SessionStatus::Paused);
    }

    #[tokio::test]
    async fn recover_send_failure_non_recoverable_leaves_record_unchanged() {
        let (p, _store, _sandbox, _agent) = provisioner();
        let record = p.provision("t1", "c1", "g1").await.unwrap();
        let updated = p
            .recover_send_failure(&record, SendFailureKind::NonRecoverable)
            .await
            .unwrap();
        assert_eq!(updated.status, record.status);
    }

    #[tokio::test]
    async fn pause_falls_back_to_destroyed_when_stop_fails() {
        let (p, _store, sandbox, _agent) = provisioner();
        let record = p.provision("t1", "c1", "g1").await.unwrap();
        sandbox.fail_stop(true);

        let updated = p.pause(&record, "test").await.unwrap();
        assert_eq!(updated.status, SessionStatus::Destroyed);
    }

    #[tokio::test]
    async fn destroy_on_already_destroyed_is_noop() {
        let (p, _store, _sandbox, _agent) = provisioner();
        let mut record = SessionRecord::new_creating("t1", "c1", "g1");
        record.status = SessionStatus::Destroyed;
        let updated = p.destroy(&record, None).await.unwrap();
        assert_eq!(updated.status, SessionStatus::Destroyed);
    }
}
