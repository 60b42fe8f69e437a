//! Hand-written in-memory fakes for the external collaborator traits,
//! shared across this crate's `#[cfg(test)]` modules.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex as StdMutex;

use async_trait::async_trait;

use crate::agent_client::{AgentClient, SessionSummary};
use crate::collaborators::History;
use crate::error::OrchestratorError;
use crate::sandbox_api::{CreateSandboxRequest, ExecRequest, ExecResult, Preview, SandboxAPI, SandboxHandle};
use crate::store::{SessionRecord, SessionStatus, SessionStore};

/// In-memory [`SessionStore`] keyed by thread id.
pub struct InMemorySessionStore {
    records: StdMutex<HashMap<String, SessionRecord>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self {
            records: StdMutex::new(HashMap::new()),
        }
    }

    /// Insert `record` verbatim, bypassing `upsert`'s activity-timestamp
    /// bump. Lets tests seed stale/expired rows with crafted timestamps.
    pub fn insert_raw(&self, record: SessionRecord) {
        self.records.lock().unwrap().insert(record.thread_id.clone(), record);
    }
}

impl Default for InMemorySessionStore {
    fn default() -> Self {
        Self::new()
    }
}

fn timestamp_field<'a>(record: &'a mut SessionRecord, status: SessionStatus) -> Option<&'a mut Option<chrono::DateTime<chrono::Utc>>> {
    match status {
        SessionStatus::Pausing => Some(&mut record.pause_requested_at),
        SessionStatus::Paused => Some(&mut record.paused_at),
        SessionStatus::Resuming => Some(&mut record.resume_attempted_at),
        SessionStatus::Active => Some(&mut record.resumed_at),
        SessionStatus::Destroyed => Some(&mut record.destroyed_at),
        _ => None,
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn upsert(&self, record: &SessionRecord) -> Result<(), OrchestratorError> {
        let mut record = record.clone();
        record.updated_at = chrono::Utc::now();
        if record.status == SessionStatus::Active {
            record.last_activity = chrono::Utc::now();
            record.resumed_at = Some(chrono::Utc::now());
        }
        self.records.lock().unwrap().insert(record.thread_id.clone(), record);
        Ok(())
    }

    async fn get_by_thread(&self, thread_id: &str) -> Result<Option<SessionRecord>, OrchestratorError> {
        Ok(self.records.lock().unwrap().get(thread_id).cloned())
    }

    async fn has_tracked(&self, thread_id: &str) -> Result<bool, OrchestratorError> {
        Ok(self
            .records
            .lock()
            .unwrap()
            .get(thread_id)
            .map(|r| r.status != SessionStatus::Destroyed)
            .unwrap_or(false))
    }

    async fn get_active(&self, thread_id: &str) -> Result<Option<SessionRecord>, OrchestratorError> {
        Ok(self
            .records
            .lock()
            .unwrap()
            .get(thread_id)
            .filter(|r| r.status == SessionStatus::Active)
            .cloned())
    }

    async fn mark_activity(&self, thread_id: &str) -> Result<(), OrchestratorError> {
        if let Some(r) = self.records.lock().unwrap().get_mut(thread_id) {
            r.last_activity = chrono::Utc::now();
            r.updated_at = chrono::Utc::now();
        }
        Ok(())
    }

    async fn mark_health_ok(&self, thread_id: &str) -> Result<(), OrchestratorError> {
        if let Some(r) = self.records.lock().unwrap().get_mut(thread_id) {
            r.last_health_ok_at = Some(chrono::Utc::now());
            r.updated_at = chrono::Utc::now();
        }
        Ok(())
    }

    async fn update_status(
        &self,
        thread_id: &str,
        status: SessionStatus,
        last_error: Option<&str>,
    ) -> Result<(), OrchestratorError> {
        let mut records = self.records.lock().unwrap();
        let record = records
            .entry(thread_id.to_string())
            .or_insert_with(|| SessionRecord::new_creating(thread_id, "", ""));
        record.status = status;
        if let Some(err) = last_error {
            record.last_error = Some(err.to_string());
        }
        record.updated_at = chrono::Utc::now();
        let now = chrono::Utc::now();
        if let Some(slot) = timestamp_field(record, status) {
            *slot = Some(now);
        }
        Ok(())
    }

    async fn increment_resume_failure(&self, thread_id: &str, last_error: &str) -> Result<(), OrchestratorError> {
        let mut records = self.records.lock().unwrap();
        let record = records
            .entry(thread_id.to_string())
            .or_insert_with(|| SessionRecord::new_creating(thread_id, "", ""));
        record.resume_fail_count += 1;
        record.last_error = Some(last_error.to_string());
        record.updated_at = chrono::Utc::now();
        Ok(())
    }

    async fn list_active(&self) -> Result<Vec<SessionRecord>, OrchestratorError> {
        let mut v: Vec<_> = self
            .records
            .lock()
            .unwrap()
            .values()
            .filter(|r| r.status == SessionStatus::Active)
            .cloned()
            .collect();
        v.sort_by(|a, b| b.last_activity.cmp(&a.last_activity));
        Ok(v)
    }

    async fn list_tracked(&self) -> Result<Vec<SessionRecord>, OrchestratorError> {
        let mut v: Vec<_> = self.records.lock().unwrap().values().cloned().collect();
        v.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(v)
    }

    async fn list_stale_active(&self, minutes: i64) -> Result<Vec<SessionRecord>, OrchestratorError> {
        let cutoff = chrono::Utc::now() - chrono::Duration::minutes(minutes);
        Ok(self
            .records
            .lock()
            .unwrap()
            .values()
            .filter(|r| r.status == SessionStatus::Active && r.last_activity < cutoff)
            .cloned()
            .collect())
    }

    async fn list_expired_paused(&self, minutes: i64) -> Result<Vec<SessionRecord>, OrchestratorError> {
        let cutoff = chrono::Utc::now() - chrono::Duration::minutes(minutes);
        Ok(self
            .records
            .lock()
            .unwrap()
            .values()
            .filter(|r| r.status == SessionStatus::Paused && r.paused_at.map(|p| p < cutoff).unwrap_or(false))
            .cloned()
            .collect())
    }
}

/// In-memory [`SandboxAPI`] fake with toggleable failure injection.
pub struct FakeSandboxAPI {
    next_id: AtomicU64,
    fail_start: AtomicBool,
    fail_stop: AtomicBool,
    not_found_on_start: AtomicBool,
    destroy_calls: AtomicU64,
}

impl FakeSandboxAPI {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            fail_start: AtomicBool::new(false),
            fail_stop: AtomicBool::new(false),
            not_found_on_start: AtomicBool::new(false),
            destroy_calls: AtomicU64::new(0),
        }
    }

    pub fn fail_start(&self, v: bool) {
        self.fail_start.store(v, Ordering::SeqCst);
    }

    pub fn fail_stop(&self, v: bool) {
        self.fail_stop.store(v, Ordering::SeqCst);
    }

    pub fn not_found_on_start(&self, v: bool) {
        self.not_found_on_start.store(v, Ordering::SeqCst);
    }

    pub fn destroy_calls(&self) -> u64 {
        self.destroy_calls.load(Ordering::SeqCst)
    }
}

impl Default for FakeSandboxAPI {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SandboxAPI for FakeSandboxAPI {
    async fn create(&self, _req: CreateSandboxRequest) -> Result<SandboxHandle, OrchestratorError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        Ok(SandboxHandle {
            sandbox_id: format!("sandbox-{id}"),
        })
    }

    async fn exec(
        &self,
        _sandbox_id: &str,
        _label: &str,
        _command: &str,
        _opts: ExecRequest<'_>,
    ) -> Result<ExecResult, OrchestratorError> {
        Ok(ExecResult {
            exit_code: 0,
            stdout: String::new(),
            stderr: String::new(),
        })
    }

    async fn start(&self, sandbox_id: &str, _timeout_secs: u64) -> Result<(), OrchestratorError> {
        if self.not_found_on_start.load(Ordering::SeqCst) {
            return Err(OrchestratorError::SandboxNotFound(sandbox_id.to_string()));
        }
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(OrchestratorError::SandboxStart(sandbox_id.to_string()));
        }
        Ok(())
    }

    async fn stop(&self, sandbox_id: &str) -> Result<(), OrchestratorError> {
        if self.fail_stop.load(Ordering::SeqCst) {
            return Err(OrchestratorError::SandboxExec(sandbox_id.to_string()));
        }
        Ok(())
    }

    async fn destroy(&self, _sandbox_id: &str) -> Result<(), OrchestratorError> {
        self.destroy_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn get_preview(&self, sandbox_id: &str) -> Result<Preview, OrchestratorError> {
        Ok(Preview {
            url: format!("http://{sandbox_id}.local"),
            token: Some("test-token".to_string()),
        })
    }
}

/// In-memory [`AgentClient`] fake with toggleable failure injection.
pub struct FakeAgentClient {
    next_session_id: AtomicU64,
    healthy: AtomicBool,
    session_exists: AtomicBool,
    sessions: StdMutex<Vec<SessionSummary>>,
    send_prompt_responses: StdMutex<Vec<Result<String, ()>>>,
}

impl FakeAgentClient {
    pub fn new() -> Self {
        Self {
            next_session_id: AtomicU64::new(1),
            healthy: AtomicBool::new(true),
            session_exists: AtomicBool::new(false),
            sessions: StdMutex::new(Vec::new()),
            send_prompt_responses: StdMutex::new(Vec::new()),
        }
    }

    pub fn set_health_response(&self, v: bool) {
        self.healthy.store(v, Ordering::SeqCst);
    }

    pub fn set_session_exists(&self, v: bool) {
        self.session_exists.store(v, Ordering::SeqCst);
    }

    pub fn push_send_prompt_response(&self, response: Result<String, ()>) {
        self.send_prompt_responses.lock().unwrap().push(response);
    }
}

impl Default for FakeAgentClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AgentClient for FakeAgentClient {
    async fn wait_for_healthy(&self, _preview: &Preview, _max_wait_ms: u64) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    async fn create_session(&self, _preview: &Preview, title: &str) -> Result<String, OrchestratorError> {
        let id = self.next_session_id.fetch_add(1, Ordering::SeqCst);
        let session_id = format!("session-{id}");
        self.sessions.lock().unwrap().push(SessionSummary {
            id: session_id.clone(),
            title: title.to_string(),
            updated_at: Some(chrono::Utc::now()),
        });
        Ok(session_id)
    }

    async fn session_exists(&self, _preview: &Preview, _session_id: &str) -> Result<bool, OrchestratorError> {
        Ok(self.session_exists.load(Ordering::SeqCst))
    }

    async fn list_sessions(&self, _preview: &Preview, _limit: u32) -> Result<Vec<SessionSummary>, OrchestratorError> {
        Ok(self.sessions.lock().unwrap().clone())
    }

    async fn send_prompt(&self, _preview: &Preview, _session_id: &str, text: &str) -> Result<String, OrchestratorError> {
        let mut responses = self.send_prompt_responses.lock().unwrap();
        if !responses.is_empty() {
            return match responses.remove(0) {
                Ok(reply) => Ok(reply),
                Err(()) => Err(OrchestratorError::AgentClient {
                    operation: "send_prompt".to_string(),
                    status_code: Some(502),
                    body: "upstream error".to_string(),
                    kind: crate::error::SendFailureKind::SandboxDown,
                }),
            };
        }
        Ok(format!("ok:{text}"))
    }

    async fn abort_session(&self, _preview: &Preview, _session_id: &str) -> Result<(), OrchestratorError> {
        Ok(())
    }
}

/// In-memory [`History`] fake: tags the prompt so tests can assert
/// rehydration happened.
pub struct FakeHistory {
    calls: AtomicU64,
}

impl FakeHistory {
    pub fn new() -> Self {
        Self {
            calls: AtomicU64::new(0),
        }
    }

    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Default for FakeHistory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl History for FakeHistory {
    async fn rehydrate(&self, _thread_id: &str, latest_user_text: &str) -> Result<String, OrchestratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(format!("[rehydrated]{latest_user_text}"))
    }
}
