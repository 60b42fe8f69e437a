//! Crate-wide error taxonomy.
//!
//! Every operation that can fail returns one of the variants below (or a
//! narrower error that is folded into one on its way up). The outermost
//! wrapper seen by [`crate::pipeline::TurnPipeline`] is always
//! [`OrchestratorError`]; [`OrchestratorError::retriable`] is the single
//! place that decides whether a retry is worth attempting, so the bit can
//! never drift from the tag it was derived from.

use std::fmt;

/// How an [`crate::agent_client::AgentClient::send_prompt`] failure should be
/// treated by the session-recovery machinery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendFailureKind {
    /// HTTP 404: the agent no longer recognizes the session id.
    SessionMissing,
    /// HTTP 0 / 5xx, or a body indicating the sandbox itself is unreachable.
    SandboxDown,
    /// Anything else — retrying would not help.
    NonRecoverable,
}

impl SendFailureKind {
    /// Classify a send failure from transport observables alone.
    pub fn classify(status: Option<u16>, body: &str) -> Self {
        match status {
            Some(404) => SendFailureKind::SessionMissing,
            Some(0) | None => SendFailureKind::SandboxDown,
            Some(s) if s >= 500 => SendFailureKind::SandboxDown,
            _ => {
                let lower = body.to_ascii_lowercase();
                if lower.contains("sandbox not found") || lower.contains("is the sandbox started")
                {
                    SendFailureKind::SandboxDown
                } else {
                    SendFailureKind::NonRecoverable
                }
            }
        }
    }
}

impl fmt::Display for SendFailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SendFailureKind::SessionMissing => "session-missing",
            SendFailureKind::SandboxDown => "sandbox-down",
            SendFailureKind::NonRecoverable => "non-recoverable",
        };
        f.write_str(s)
    }
}

/// Crate-wide error taxonomy.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("turn routing failed: {0}")]
    Routing(String),

    #[error("thread creation failed (status {status:?}): {message}")]
    ThreadEnsure {
        status: Option<u16>,
        message: String,
    },

    #[error("history rehydration failed: {0}")]
    History(String),

    #[error("sandbox send failed: {source}")]
    SandboxSend {
        #[source]
        source: Box<OrchestratorError>,
    },

    #[error("sandbox is dead and cannot be resumed: {0}")]
    SandboxDead(String),

    #[error("sandbox failed to start: {0}")]
    SandboxStart(String),

    #[error("sandbox creation failed: {message}")]
    SandboxCreate { message: String, log_tail: String },

    #[error("sandbox command exec failed: {0}")]
    SandboxExec(String),

    #[error("sandbox not found: {0}")]
    SandboxNotFound(String),

    #[error("agent client error during {operation}: status={status_code:?} kind={kind}")]
    AgentClient {
        operation: String,
        status_code: Option<u16>,
        body: String,
        kind: SendFailureKind,
    },

    #[error("health check failed, last status: {last_status}")]
    HealthCheck { last_status: String },

    #[error("storage error: {0}")]
    Storage(String),

    #[error("config encode error: {0}")]
    ConfigEncode(String),

    #[error("actor job cancelled")]
    Cancelled,
}

impl From<crate::actor::Cancelled> for OrchestratorError {
    fn from(_: crate::actor::Cancelled) -> Self {
        OrchestratorError::Cancelled
    }
}

impl OrchestratorError {
    /// Whether TurnPipeline should retry an event that failed with this
    /// error. Only a handful of causes are retriable; the bit is derived
    /// here, once, rather than threaded through as a field.
    pub fn retriable(&self) -> bool {
        match self {
            OrchestratorError::SandboxDead(_) => true,
            OrchestratorError::SandboxStart(_) => true,
            OrchestratorError::HealthCheck { .. } => true,
            OrchestratorError::AgentClient { .. } => true,
            OrchestratorError::SandboxSend { source } => source.retriable(),
            OrchestratorError::ThreadEnsure { status, .. } => {
                matches!(status, Some(429) | Some(500..=599))
            }
            OrchestratorError::History(_) => true,
            _ => false,
        }
    }

    /// Wrap `self` as the cause of a `ThreadEntity.send` failure, preserving
    /// the inner error's retriable bit.
    pub fn into_sandbox_send(self) -> OrchestratorError {
        OrchestratorError::SandboxSend {
            source: Box::new(self),
        }
    }
}
