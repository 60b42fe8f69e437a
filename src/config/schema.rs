//! TOML configuration schema for the orchestrator.
//!
//! All fields have `#[serde(default)]` so a partially-filled `config.toml`
//! works correctly. Missing sections fall back to their `Default` impl.
//!
//! Example `~/.sandboxrelay/config.toml`:
//! ```toml
//! [sandbox]
//! creation_timeout_secs = 120
//! startup_health_timeout_ms = 60000
//! resume_health_timeout_ms = 30000
//! active_health_check_timeout_ms = 5000
//! idle_timeout_minutes = 30
//! reuse_policy = "resume_preferred"
//!
//! [reconciler]
//! cleanup_interval_secs = 300
//! stale_active_grace_minutes = 10
//! paused_ttl_minutes = 1440
//!
//! [agent]
//! model = "claude-3-5-sonnet"
//!
//! [routing]
//! mode = "heuristic"
//!
//! [sandbox_provider]
//! base_url = "https://sandboxes.example.internal"
//! ```

use serde::{Deserialize, Serialize};

/// `sandboxReusePolicy`: whether `ensureActive` prefers to resume a
/// paused/dead sandbox or always tears down and re-provisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SandboxReusePolicy {
    #[default]
    ResumePreferred,
    Recreate,
}

/// `turnRoutingMode`: consulted by the external `TurnRouter` collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TurnRoutingMode {
    Off,
    #[default]
    Heuristic,
    Ai,
}

// ─── SandboxConfig ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SandboxConfig {
    /// `sandboxCreationTimeout`, in seconds.
    pub creation_timeout_secs: u64,
    /// `startupHealthTimeoutMs`.
    pub startup_health_timeout_ms: u64,
    /// `resumeHealthTimeoutMs`.
    pub resume_health_timeout_ms: u64,
    /// `activeHealthCheckTimeoutMs`.
    pub active_health_check_timeout_ms: u64,
    /// `sandboxTimeout`: idle timeout for active sessions, in minutes.
    pub idle_timeout_minutes: u64,
    /// `sandboxReusePolicy`.
    pub reuse_policy: SandboxReusePolicy,
    /// Cadence of the health-poll loop during provision/resume, in milliseconds.
    pub health_poll_interval_ms: u64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            creation_timeout_secs: 120,
            startup_health_timeout_ms: 60_000,
            resume_health_timeout_ms: 30_000,
            active_health_check_timeout_ms: 5_000,
            idle_timeout_minutes: 30,
            reuse_policy: SandboxReusePolicy::default(),
            health_poll_interval_ms: 2_000,
        }
    }
}

// ─── ReconcilerConfig ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReconcilerConfig {
    /// `cleanupInterval`, in seconds.
    pub cleanup_interval_secs: u64,
    /// `staleActiveGraceMinutes`.
    pub stale_active_grace_minutes: u64,
    /// `pausedTtlMinutes`.
    pub paused_ttl_minutes: u64,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            cleanup_interval_secs: 5 * 60,
            stale_active_grace_minutes: 10,
            paused_ttl_minutes: 24 * 60,
        }
    }
}

// ─── AgentConfig ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct AgentConfig {
    /// `openCodeModel`: displayed in status output, forwarded to the agent.
    pub model: String,
}

// ─── RoutingConfig ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RoutingConfig {
    pub mode: TurnRoutingMode,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            mode: TurnRoutingMode::default(),
        }
    }
}

// ─── PipelineConfig ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PipelineConfig {
    /// IngressDedup capacity.
    pub dedup_capacity: usize,
    /// Retry base delay in milliseconds.
    pub retry_base_delay_ms: u64,
    /// Extra retry attempts beyond the first.
    pub retry_max_extra_attempts: u32,
    /// Typing-pulse cadence in milliseconds.
    pub typing_pulse_interval_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            dedup_capacity: 4_000,
            retry_base_delay_ms: 500,
            retry_max_extra_attempts: 2,
            typing_pulse_interval_ms: 8_000,
        }
    }
}

// ─── SandboxProviderConfig ───────────────────────────────────────────────────

/// Connection details for the reference `reqwest`-backed [`SandboxAPI`]
/// implementation. The provider behind `base_url` is expected to expose a
/// REST surface matching [`crate::sandbox_api::HttpSandboxAPI`]'s request
/// shapes; a deployment against a different provider supplies its own
/// [`SandboxAPI`] implementation instead and can leave this section unset.
///
/// [`SandboxAPI`]: crate::sandbox_api::SandboxAPI
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct SandboxProviderConfig {
    pub base_url: String,
    pub api_key: Option<String>,
}

// ─── DiscordConfig ───────────────────────────────────────────────────────────

/// Connection details for the reference Discord channel adapter.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct DiscordConfig {
    pub bot_token: String,
    pub allowed_guild_ids: Vec<String>,
    pub allowed_channel_ids: Vec<String>,
}

// ─── StoreConfig ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct StoreConfig {
    /// Override path to the sqlite database file (default: under the config
    /// directory, see [`super::loader::default_database_path`]).
    pub database_path: Option<String>,
}

// ─── AppConfig ────────────────────────────────────────────────────────────────

/// Top-level application configuration.
///
/// Loaded from `~/.sandboxrelay/config.toml`, falling back to defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct AppConfig {
    pub sandbox: SandboxConfig,
    pub reconciler: ReconcilerConfig,
    pub agent: AgentConfig,
    pub routing: RoutingConfig,
    pub pipeline: PipelineConfig,
    pub discord: DiscordConfig,
    pub store: StoreConfig,
    pub sandbox_provider: SandboxProviderConfig,
}
