//! [`SessionRecord`] and [`SessionStatus`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// `status` ∈ {creating, active, pausing, paused, resuming, destroying,
/// destroyed, error}.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Creating,
    Active,
    Pausing,
    Paused,
    Resuming,
    Destroying,
    Destroyed,
    Error,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Creating => "creating",
            SessionStatus::Active => "active",
            SessionStatus::Pausing => "pausing",
            SessionStatus::Paused => "paused",
            SessionStatus::Resuming => "resuming",
            SessionStatus::Destroying => "destroying",
            SessionStatus::Destroyed => "destroyed",
            SessionStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Result<Self, String> {
        match s {
            "creating" => Ok(SessionStatus::Creating),
            "active" => Ok(SessionStatus::Active),
            "pausing" => Ok(SessionStatus::Pausing),
            "paused" => Ok(SessionStatus::Paused),
            "resuming" => Ok(SessionStatus::Resuming),
            "destroying" => Ok(SessionStatus::Destroying),
            "destroyed" => Ok(SessionStatus::Destroyed),
            "error" => Ok(SessionStatus::Error),
            other => Err(format!("unknown session status: {other}")),
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of the `sessions` table; the primary
/// entity owned by [`crate::store::SessionStore`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub thread_id: String,
    pub channel_id: String,
    pub guild_id: String,
    pub sandbox_id: String,
    pub agent_session_id: String,
    pub preview_url: String,
    pub preview_token: Option<String>,
    pub status: SessionStatus,
    pub last_activity: DateTime<Utc>,
    pub pause_requested_at: Option<DateTime<Utc>>,
    pub paused_at: Option<DateTime<Utc>>,
    pub resume_attempted_at: Option<DateTime<Utc>>,
    pub resumed_at: Option<DateTime<Utc>>,
    pub destroyed_at: Option<DateTime<Utc>>,
    pub last_health_ok_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub resume_fail_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SessionRecord {
    /// Construct a fresh record for a brand-new provision, with
    /// `status = creating` and all other timestamps unset.
    pub fn new_creating(thread_id: impl Into<String>, channel_id: impl Into<String>, guild_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            thread_id: thread_id.into(),
            channel_id: channel_id.into(),
            guild_id: guild_id.into(),
            sandbox_id: String::new(),
            agent_session_id: String::new(),
            preview_url: String::new(),
            preview_token: None,
            status: SessionStatus::Creating,
            last_activity: now,
            pause_requested_at: None,
            paused_at: None,
            resume_attempted_at: None,
            resumed_at: None,
            destroyed_at: None,
            last_health_ok_at: None,
            last_error: None,
            resume_fail_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// The canonical title used for the agent session backing this thread
    /// Centralized here so `provision` and `findOrCreateSessionId` never
    /// disagree.
    pub fn canonical_session_title(thread_id: &str) -> String {
        format!("Discord thread {thread_id}")
    }
}
