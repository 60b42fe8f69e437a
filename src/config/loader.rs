//! TOML configuration loading, env-var overrides, and atomic saves.
//!
//! # Loading order
//! 1. Parse `~/.sandboxrelay/config.toml` (or the path in `SANDBOXRELAY_CONFIG`)
//! 2. Apply `SANDBOXRELAY_*` environment variable overrides
//! 3. Fall back to [`AppConfig::default()`] if the file is missing
//!
//! # Atomic save
//! Writes to `<path>.tmp` → fsync → rename to `<path>` to avoid partial
//! writes corrupting the config file.

use std::{
    env, fs,
    path::{Path, PathBuf},
};

use super::schema::{AppConfig, SandboxReusePolicy, TurnRoutingMode};

// ─── default_config_path ─────────────────────────────────────────────────────

/// Return the default config file path: `~/.sandboxrelay/config.toml`.
pub fn default_config_path() -> Result<PathBuf, String> {
    dirs::home_dir()
        .map(|h| h.join(".sandboxrelay").join("config.toml"))
        .ok_or_else(|| "could not determine home directory".to_string())
}

/// Return the default sqlite database path, alongside the config file unless
/// `store.database_path` overrides it.
pub fn default_database_path(config: &AppConfig) -> Result<PathBuf, String> {
    if let Some(p) = &config.store.database_path {
        return Ok(PathBuf::from(p));
    }
    dirs::home_dir()
        .map(|h| h.join(".sandboxrelay").join("sessions.db"))
        .ok_or_else(|| "could not determine home directory".to_string())
}

// ─── load_config ─────────────────────────────────────────────────────────────

/// Load [`AppConfig`] from the given path, falling back to defaults if the
/// file does not exist, then applying environment variable overrides.
pub fn load_config(path: &Path) -> Result<AppConfig, String> {
    let mut config = match fs::read_to_string(path) {
        Ok(content) => toml::from_str::<AppConfig>(&content)
            .map_err(|e| format!("failed to parse config at {path:?}: {e}"))?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => AppConfig::default(),
        Err(e) => return Err(format!("failed to read config at {path:?}: {e}")),
    };

    apply_env_overrides(&mut config);
    Ok(config)
}

/// Load config from the default path (or `$SANDBOXRELAY_CONFIG`), falling
/// back to defaults on any error.
pub fn load_default_config() -> AppConfig {
    let path = env::var("SANDBOXRELAY_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            default_config_path().unwrap_or_else(|_| PathBuf::from("config.toml"))
        });

    load_config(&path).unwrap_or_default()
}

// ─── apply_env_overrides ─────────────────────────────────────────────────────

/// Apply `SANDBOXRELAY_*` environment variable overrides to `config`.
///
/// Supported overrides:
/// - `SANDBOXRELAY_DISCORD_TOKEN`          → `discord.bot_token`
/// - `SANDBOXRELAY_SANDBOX_REUSE_POLICY`   → `sandbox.reuse_policy` (`resume_preferred`/`recreate`)
/// - `SANDBOXRELAY_SANDBOX_TIMEOUT_MIN`    → `sandbox.idle_timeout_minutes`
/// - `SANDBOXRELAY_CLEANUP_INTERVAL_SECS`  → `reconciler.cleanup_interval_secs`
/// - `SANDBOXRELAY_AGENT_MODEL`            → `agent.model`
/// - `SANDBOXRELAY_TURN_ROUTING_MODE`      → `routing.mode` (`off`/`heuristic`/`ai`)
/// - `SANDBOXRELAY_DATABASE_PATH`          → `store.database_path`
fn apply_env_overrides(config: &mut AppConfig) {
    if let Ok(v) = env::var("SANDBOXRELAY_DISCORD_TOKEN") {
        config.discord.bot_token = v;
    }
    if let Ok(v) = env::var("SANDBOXRELAY_SANDBOX_REUSE_POLICY") {
        config.sandbox.reuse_policy = match v.as_str() {
            "recreate" => SandboxReusePolicy::Recreate,
            _ => SandboxReusePolicy::ResumePreferred,
        };
    }
    if let Ok(v) = env::var("SANDBOXRELAY_SANDBOX_TIMEOUT_MIN") {
        if let Ok(minutes) = v.parse::<u64>() {
            config.sandbox.idle_timeout_minutes = minutes;
        }
    }
    if let Ok(v) = env::var("SANDBOXRELAY_CLEANUP_INTERVAL_SECS") {
        if let Ok(secs) = v.parse::<u64>() {
            config.reconciler.cleanup_interval_secs = secs;
        }
    }
    if let Ok(v) = env::var("SANDBOXRELAY_AGENT_MODEL") {
        config.agent.model = v;
    }
    if let Ok(v) = env::var("SANDBOXRELAY_TURN_ROUTING_MODE") {
        config.routing.mode = match v.as_str() {
            "off" => TurnRoutingMode::Off,
            "ai" => TurnRoutingMode::Ai,
            _ => TurnRoutingMode::Heuristic,
        };
    }
    if let Ok(v) = env::var("SANDBOXRELAY_DATABASE_PATH") {
        config.store.database_path = Some(v);
    }
}

// ─── save_config ─────────────────────────────────────────────────────────────

/// Atomically save `config` to `path`.
///
/// Writes to `<path>.tmp`, syncs to disk, creates a backup of the existing
/// file as `<path>.bak`, then renames the temp file to `<path>`.
pub fn save_config(path: &Path, config: &AppConfig) -> Result<(), String> {
    let content =
        toml::to_string_pretty(config).map_err(|e| format!("failed to serialise config: {e}"))?;

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| format!("failed to create config dir: {e}"))?;
    }

    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, &content).map_err(|e| format!("failed to write temp config: {e}"))?;

    if path.exists() {
        let bak_path = path.with_extension("toml.bak");
        fs::copy(path, &bak_path).map_err(|e| format!("failed to backup config: {e}"))?;
    }

    fs::rename(&tmp_path, path).map_err(|e| format!("failed to replace config file: {e}"))?;

    Ok(())
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(unsafe_code)] // env::set_var / remove_var are unsafe in Rust 2024; tests are single-threaded.
mod tests {
    use super::*;
    use crate::config::schema::SandboxReusePolicy;
    use tempfile::TempDir;

    fn write_config(dir: &TempDir, content: &str) -> PathBuf {
        let path = dir.path().join("config.toml");
        fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn load_missing_file_returns_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nonexistent.toml");
        let config = load_config(&path).unwrap();
        assert_eq!(config, AppConfig::default());
    }

    #[test]
    fn load_partial_config_fills_defaults() {
        let dir = TempDir::new().unwrap();
        let path = write_config(
            &dir,
            r#"
[agent]
model = "claude-3-5-sonnet"
"#,
        );
        let config = load_config(&path).unwrap();
        assert_eq!(config.agent.model, "claude-3-5-sonnet");
        assert_eq!(config.sandbox.creation_timeout_secs, 120);
        assert_eq!(config.reconciler.cleanup_interval_secs, 300);
    }

    #[test]
    fn load_full_config() {
        let dir = TempDir::new().unwrap();
        let path = write_config(
            &dir,
            r#"
[sandbox]
creation_timeout_secs = 60
idle_timeout_minutes = 15
reuse_policy = "recreate"

[reconciler]
cleanup_interval_secs = 120
paused_ttl_minutes = 60

[agent]
model = "gpt-4o"

[routing]
mode = "ai"

[pipeline]
dedup_capacity = 100
"#,
        );
        let config = load_config(&path).unwrap();
        assert_eq!(config.sandbox.creation_timeout_secs, 60);
        assert_eq!(config.sandbox.reuse_policy, SandboxReusePolicy::Recreate);
        assert_eq!(config.reconciler.cleanup_interval_secs, 120);
        assert_eq!(config.agent.model, "gpt-4o");
        assert_eq!(config.routing.mode, TurnRoutingMode::Ai);
        assert_eq!(config.pipeline.dedup_capacity, 100);
    }

    #[test]
    fn save_and_reload_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");

        let mut original = AppConfig::default();
        original.agent.model = "claude-3-haiku".to_owned();
        original.sandbox.reuse_policy = SandboxReusePolicy::Recreate;

        save_config(&path, &original).unwrap();
        let loaded = load_config(&path).unwrap();
        assert_eq!(
            loaded, original,
            "config should round-trip through save/load"
        );
    }

    #[test]
    fn save_creates_backup() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");

        save_config(&path, &AppConfig::default()).unwrap();
        save_config(&path, &AppConfig::default()).unwrap();

        let bak = path.with_extension("toml.bak");
        assert!(bak.exists(), "backup file should exist after second save");
    }

    #[test]
    fn save_creates_parent_directories() {
        let dir = TempDir::new().unwrap();
        let nested_path = dir.path().join("a").join("b").join("config.toml");
        save_config(&nested_path, &AppConfig::default()).unwrap();
        assert!(nested_path.exists(), "config should be created in nested dirs");
    }

    #[test]
    fn env_override_agent_model() {
        let key = "SANDBOXRELAY_AGENT_MODEL";
        // SAFETY: single-threaded test context; no other threads read this var.
        unsafe {
            env::set_var(key, "o3-mini");
        }
        let config = load_default_config();
        // SAFETY: same as set_var above.
        unsafe {
            env::remove_var(key);
        }
        assert_eq!(config.agent.model, "o3-mini");
    }

    #[test]
    fn env_override_reuse_policy() {
        let key = "SANDBOXRELAY_SANDBOX_REUSE_POLICY";
        // SAFETY: single-threaded test context; no other threads read this var.
        unsafe {
            env::set_var(key, "recreate");
        }
        let config = load_default_config();
        // SAFETY: same as set_var above.
        unsafe {
            env::remove_var(key);
        }
        assert_eq!(config.sandbox.reuse_policy, SandboxReusePolicy::Recreate);
    }

    #[test]
    fn load_invalid_toml_returns_error() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, "this is not valid toml!!!");
        let result = load_config(&path);
        assert!(result.is_err(), "invalid TOML should return an error");
    }
}
