//! Binds [`ActorMap`] to [`Provisioner`]: one actor per thread id, holding
//! the session record as actor state and exposing
//! send/status/pause/resume/recreate/logs as operations that run inside the
//! owning actor's FIFO queue.

use std::sync::Arc;

use tracing::instrument;

use crate::actor::{ActorMap, ActorMapOptions, RunOpts};
use crate::agent_client::AgentClient;
use crate::collaborators::History;
use crate::error::{OrchestratorError, SendFailureKind};
use crate::provisioner::Provisioner;
use crate::sandbox_api::{ExecRequest, Preview, SandboxAPI};
use crate::store::{SessionRecord, SessionStore};

/// Ephemeral per-actor state: lazily bootstrapped from the store.
#[derive(Debug, Clone, Default)]
struct ThreadState {
    session: Option<SessionRecord>,
}

pub struct SendInput {
    pub thread_id: String,
    pub channel_id: String,
    pub guild_id: String,
    pub text: String,
}

pub struct SendOutput {
    pub text: String,
    pub session: SessionRecord,
    pub changed_session: bool,
    /// Set when a sandbox-down recovery kicked in mid-`send`, so callers can
    /// surface the optional "recovering" notice.
    pub recovered: bool,
}

pub struct ThreadEntity {
    actor_map: ActorMap<ThreadState>,
    provisioner: Arc<Provisioner>,
    store: Arc<dyn SessionStore>,
    agent: Arc<dyn AgentClient>,
    sandbox: Arc<dyn SandboxAPI>,
    history: Arc<dyn History>,
}

fn preview_of(record: &SessionRecord) -> Preview {
    Preview {
        url: record.preview_url.clone(),
        token: record.preview_token.clone(),
    }
}

async fn bootstrap(
    state: &mut Option<ThreadState>,
    store: &Arc<dyn SessionStore>,
    thread_id: &str,
) -> Result<(), OrchestratorError> {
    if state.is_none() {
        let session = store.get_by_thread(thread_id).await?;
        *state = Some(ThreadState { session });
    }
    Ok(())
}

async fn commit(
    state: &mut Option<ThreadState>,
    store: &Arc<dyn SessionStore>,
    record: SessionRecord,
) -> Result<(), OrchestratorError> {
    store.upsert(&record).await?;
    if let Some(s) = state {
        s.session = Some(record);
    } else {
        *state = Some(ThreadState {
            session: Some(record),
        });
    }
    Ok(())
}

impl ThreadEntity {
    pub fn new(
        provisioner: Arc<Provisioner>,
        store: Arc<dyn SessionStore>,
        agent: Arc<dyn AgentClient>,
        sandbox: Arc<dyn SandboxAPI>,
        history: Arc<dyn History>,
    ) -> Self {
        Self {
            actor_map: ActorMap::new(ActorMapOptions::default()),
            provisioner,
            store,
            agent,
            sandbox,
            history,
        }
    }

    /// Send a user prompt under the actor owning `key`. `key` is the
    /// dispatch-level ThreadKey (`thread:<id>` or `channel:<id>`);
    /// `input.thread_id` is always the real, resolved thread id.
    #[instrument(skip(self, input), fields(thread_id = %input.thread_id))]
    pub async fn send(&self, key: &str, input: SendInput) -> Result<SendOutput, OrchestratorError> {
        let provisioner = self.provisioner.clone();
        let store = self.store.clone();
        let agent = self.agent.clone();
        let history = self.history.clone();
        let thread_id = input.thread_id;
        let channel_id = input.channel_id;
        let guild_id = input.guild_id;
        let text = input.text;

        self.actor_map
            .run(
                key,
                move |state| async move {
                    bootstrap(state, &store, &thread_id).await?;
                    let pre_snapshot = state.as_ref().and_then(|s| s.session.clone());

                    let record = provisioner
                        .ensure_active(&thread_id, &channel_id, &guild_id, pre_snapshot.clone())
                        .await?;
                    commit(state, &store, record.clone()).await?;

                    let session_changed_before_send = pre_snapshot
                        .as_ref()
                        .map(|p| p.agent_session_id != record.agent_session_id)
                        .unwrap_or(false);
                    let prompt_text = if session_changed_before_send {
                        history.rehydrate(&thread_id, &text).await?
                    } else {
                        text.clone()
                    };

                    store.mark_activity(&thread_id).await?;
                    let send_result = agent
                        .send_prompt(&preview_of(&record), &record.agent_session_id, &prompt_text)
                        .await;

                    let (reply, final_record, recovered_mid_send) = match send_result {
                        Ok(reply) => (reply, record, false),
                        Err(OrchestratorError::AgentClient {
                            kind: SendFailureKind::SandboxDown,
                            ..
                        }) => {
                            let recovered = provisioner
                                .recover_send_failure(&record, SendFailureKind::SandboxDown)
                                .await?;
                            commit(state, &store, recovered.clone()).await?;

                            let reactivated = provisioner
                                .ensure_active(&thread_id, &channel_id, &guild_id, Some(recovered))
                                .await?;
                            commit(state, &store, reactivated.clone()).await?;

                            let retry_text = history.rehydrate(&thread_id, &text).await?;
                            let reply = agent
                                .send_prompt(&preview_of(&reactivated), &reactivated.agent_session_id, &retry_text)
                                .await
                                .map_err(|e| e.into_sandbox_send())?;
                            (reply, reactivated, true)
                        }
                        Err(e) => return Err(e.into_sandbox_send()),
                    };

                    let changed_session = pre_snapshot
                        .as_ref()
                        .map(|p| p.agent_session_id != final_record.agent_session_id)
                        .unwrap_or(true);

                    Ok(SendOutput {
                        text: reply,
                        session: final_record,
                        changed_session,
                        recovered: recovered_mid_send,
                    })
                },
                RunOpts::default(),
            )
            .await
    }

    /// Lazily-loaded session snapshot; a pure read that does not touch the
    /// idle timer.
    pub async fn status(&self, key: &str, thread_id: &str) -> Result<Option<SessionRecord>, OrchestratorError> {
        let store = self.store.clone();
        let thread_id = thread_id.to_owned();
        self.actor_map
            .run(
                key,
                move |state| async move {
                    bootstrap(state, &store, &thread_id).await?;
                    Ok::<_, OrchestratorError>(state.as_ref().and_then(|s| s.session.clone()))
                },
                RunOpts { touch: false },
            )
            .await
    }

    /// Destroy the current sandbox (if any) and forget the cached session so
    /// the next `send` provisions fresh.
    pub async fn recreate(&self, key: &str, thread_id: &str) -> Result<(), OrchestratorError> {
        let provisioner = self.provisioner.clone();
        let store = self.store.clone();
        let thread_id = thread_id.to_owned();
        self.actor_map
            .run(
                key,
                move |state| async move {
                    bootstrap(state, &store, &thread_id).await?;
                    if let Some(record) = state.as_ref().and_then(|s| s.session.clone()) {
                        let destroyed = provisioner.destroy(&record, Some("recreate")).await?;
                        store.upsert(&destroyed).await?;
                    }
                    if let Some(s) = state.as_mut() {
                        s.session = None;
                    }
                    Ok::<_, OrchestratorError>(())
                },
                RunOpts::default(),
            )
            .await
    }

    pub async fn pause(
        &self,
        key: &str,
        thread_id: &str,
        reason: &str,
    ) -> Result<Option<SessionRecord>, OrchestratorError> {
        let provisioner = self.provisioner.clone();
        let store = self.store.clone();
        let thread_id = thread_id.to_owned();
        let reason = reason.to_owned();
        self.actor_map
            .run(
                key,
                move |state| async move {
                    bootstrap(state, &store, &thread_id).await?;
                    let Some(record) = state.as_ref().and_then(|s| s.session.clone()) else {
                        return Ok(None);
                    };
                    let paused = provisioner.pause(&record, &reason).await?;
                    commit(state, &store, paused.clone()).await?;
                    Ok::<_, OrchestratorError>(Some(paused))
                },
                RunOpts::default(),
            )
            .await
    }

    pub async fn resume(
        &self,
        key: &str,
        thread_id: &str,
        channel_id: &str,
        guild_id: &str,
    ) -> Result<SessionRecord, OrchestratorError> {
        let provisioner = self.provisioner.clone();
        let store = self.store.clone();
        let thread_id = thread_id.to_owned();
        let channel_id = channel_id.to_owned();
        let guild_id = guild_id.to_owned();
        self.actor_map
            .run(
                key,
                move |state| async move {
                    bootstrap(state, &store, &thread_id).await?;
                    let current = state.as_ref().and_then(|s| s.session.clone());
                    let record = provisioner
                        .ensure_active(&thread_id, &channel_id, &guild_id, current)
                        .await?;
                    commit(state, &store, record.clone()).await?;
                    Ok::<_, OrchestratorError>(record)
                },
                RunOpts::default(),
            )
            .await
    }

    pub async fn logs(
        &self,
        key: &str,
        thread_id: &str,
        lines: u32,
    ) -> Result<Option<(String, String)>, OrchestratorError> {
        let store = self.store.clone();
        let sandbox = self.sandbox.clone();
        let thread_id = thread_id.to_owned();
        self.actor_map
            .run(
                key,
                move |state| async move {
                    bootstrap(state, &store, &thread_id).await?;
                    let Some(record) = state.as_ref().and_then(|s| s.session.clone()) else {
                        return Ok(None);
                    };
                    let cmd = format!("tail -n {lines} /tmp/sandboxrelay-agent.log 2>/dev/null || true");
                    let result = sandbox
                        .exec(&record.sandbox_id, "logs-tail", &cmd, ExecRequest::default())
                        .await?;
                    Ok::<_, OrchestratorError>(Some((record.sandbox_id, result.stdout)))
                },
                RunOpts::default(),
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SandboxConfig;
    use crate::testutil::{FakeAgentClient, FakeHistory, FakeSandboxAPI, InMemorySessionStore};

    fn entity() -> (
        ThreadEntity,
        Arc<InMemorySessionStore>,
        Arc<FakeSandboxAPI>,
        Arc<FakeAgentClient>,
        Arc<FakeHistory>,
    ) {
        let store = Arc::new(InMemorySessionStore::new());
        let sandbox = Arc::new(FakeSandboxAPI::new());
        let agent = Arc::new(FakeAgentClient::new());
        let history = Arc::new(FakeHistory::new());
        let provisioner = Arc::new(Provisioner::new(
            store.clone(),
            sandbox.clone(),
            agent.clone(),
            SandboxConfig::default(),
        ));
        let entity = ThreadEntity::new(provisioner, store.clone(), agent.clone(), sandbox.clone(), history.clone());
        (entity, store, sandbox, agent, history)
    }

    #[tokio::test]
    async fn send_provisions_fresh_session_on_first_call() {
        let (entity, _store, _sandbox, _agent, _history) = entity();
        let out = entity
            .send(
                "thread:t1",
                SendInput {
                    thread_id: "t1".into(),
                    channel_id: "c1".into(),
                    guild_id: "g1".into(),
                    text: "hello".into(),
                },
            )
            .await
            .unwrap();
        assert_eq!(out.text, "ok:hello");
        assert!(out.changed_session);
    }

    #[tokio::test]
    async fn send_does_not_rehydrate_when_session_unchanged() {
        let (entity, _store, _sandbox, _agent, history) = entity();
        entity
            .send(
                "thread:t1",
                SendInput {
                    thread_id: "t1".into(),
                    channel_id: "c1".into(),
                    guild_id: "g1".into(),
                    text: "first".into(),
                },
            )
            .await
            .unwrap();

        let out = entity
            .send(
                "thread:t1",
                SendInput {
                    thread_id: "t1".into(),
                    channel_id: "c1".into(),
                    guild_id: "g1".into(),
                    text: "second".into(),
                },
            )
            .await
            .unwrap();

        assert_eq!(out.text, "ok:second");
        assert!(!out.changed_session);
        assert_eq!(history.call_count(), 0);
    }

    #[tokio::test]
    async fn send_retries_once_on_sandbox_down_and_rehydrates() {
        let (entity, _store, _sandbox, agent, history) = entity();
        entity
            .send(
                "thread:t1",
                SendInput {
                    thread_id: "t1".into(),
                    channel_id: "c1".into(),
                    guild_id: "g1".into(),
                    text: "first".into(),
                },
            )
            .await
            .unwrap();

        agent.push_send_prompt_response(Err(()));
        let out = entity
            .send(
                "thread:t1",
                SendInput {
                    thread_id: "t1".into(),
                    channel_id: "c1".into(),
                    guild_id: "g1".into(),
                    text: "second".into(),
                },
            )
            .await
            .unwrap();

        assert_eq!(out.session.status, crate::store::SessionStatus::Active);
        assert_eq!(history.call_count(), 1);
        assert!(out.text.starts_with("ok:"));
    }

    #[tokio::test]
    async fn status_reflects_last_committed_session() {
        let (entity, _store, _sandbox, _agent, _history) = entity();
        assert!(entity.status("thread:t1", "t1").await.unwrap().is_none());

        entity
            .send(
                "thread:t1",
                SendInput {
                    thread_id: "t1".into(),
                    channel_id: "c1".into(),
                    guild_id: "g1".into(),
                    text: "hi".into(),
                },
            )
            .await
            .unwrap();

        let status = entity.status("thread:t1", "t1").await.unwrap();
        assert!(status.is_some());
    }

    #[tokio::test]
    async fn recreate_clears_cached_session_so_next_send_provisions_fresh() {
        let (entity, _store, sandbox, _agent, _history) = entity();
        let first = entity
            .send(
                "thread:t1",
                SendInput {
                    thread_id: "t1".into(),
                    channel_id: "c1".into(),
                    guild_id: "g1".into(),
                    text: "hi".into(),
                },
            )
            .await
            .unwrap();

        entity.recreate("thread:t1", "t1").await.unwrap();
        assert_eq!(sandbox.destroy_calls(), 1);

        let second = entity
            .send(
                "thread:t1",
                SendInput {
                    thread_id: "t1".into(),
                    channel_id: "c1".into(),
                    guild_id: "g1".into(),
                    text: "hi again".into(),
                },
            )
            .await
            .unwrap();

        assert_ne!(first.session.sandbox_id, second.session.sandbox_id);
    }

    #[tokio::test]
    async fn pause_on_unloaded_thread_is_none() {
        let (entity, _store, _sandbox, _agent, _history) = entity();
        let result = entity.pause("thread:never", "never", "test").await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn logs_returns_sandbox_id_and_output_when_loaded() {
        let (entity, _store, _sandbox, _agent, _history) = entity();
        entity
            .send(
                "thread:t1",
                SendInput {
                    thread_id: "t1".into(),
                    channel_id: "c1".into(),
                    guild_id: "g1".into(),
                    text: "hi".into(),
                },
            )
            .await
            .unwrap();

        let (sandbox_id, _output) = entity.logs("thread:t1", "t1", 50).await.unwrap().unwrap();
        assert!(!sandbox_id.is_empty());
    }
}
