//! Periodic sweep that pauses stale-active sessions and recreates
//! long-paused ones, acting only through [`ThreadEntity`] so every mutation
//! still flows through the owning thread's actor.

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, instrument, warn};

use crate::config::{ReconcilerConfig, SandboxConfig};
use crate::store::SessionStore;
use crate::thread_entity::ThreadEntity;

pub struct Reconciler {
    store: Arc<dyn SessionStore>,
    thread_entity: Arc<ThreadEntity>,
    sandbox_config: SandboxConfig,
    config: ReconcilerConfig,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn SessionStore>,
        thread_entity: Arc<ThreadEntity>,
        sandbox_config: SandboxConfig,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            store,
            thread_entity,
            sandbox_config,
            config,
        }
    }

    /// Run the sweep on a fixed cadence until the process exits.
    pub async fn run(&self) -> ! {
        let mut ticker = tokio::time::interval(Duration::from_secs(self.config.cleanup_interval_secs));
        loop {
            ticker.tick().await;
            self.sweep().await;
        }
    }

    #[instrument(skip(self))]
    pub async fn sweep(&self) {
        let stale_cutoff_minutes =
            (self.sandbox_config.idle_timeout_minutes + self.config.stale_active_grace_minutes) as i64;
        let stale = match self.store.list_stale_active(stale_cutoff_minutes).await {
            Ok(rows) => rows,
            Err(e) => {
                error!(error = %e, "list_stale_active failed, skipping this sweep's pause pass");
                Vec::new()
            }
        };

        let mut paused = 0u64;
        for record in &stale {
            let key = format!("thread:{}", record.thread_id);
            match self
                .thread_entity
                .pause(&key, &record.thread_id, "cleanup-stale-active")
                .await
            {
                Ok(_) => paused += 1,
                Err(e) => warn!(thread_id = %record.thread_id, error = %e, "failed to pause stale-active session"),
            }
        }

        let expired = match self
            .store
            .list_expired_paused(self.config.paused_ttl_minutes as i64)
            .await
        {
            Ok(rows) => rows,
            Err(e) => {
                error!(error = %e, "list_expired_paused failed, skipping this sweep's recreate pass");
                Vec::new()
            }
        };

        let mut recreated = 0u64;
        for record in &expired {
            let key = format!("thread:{}", record.thread_id);
            match self.thread_entity.recreate(&key, &record.thread_id).await {
                Ok(()) => recreated += 1,
                Err(e) => warn!(thread_id = %record.thread_id, error = %e, "failed to recreate expired-paused session"),
            }
        }

        info!(
            stale_active_seen = stale.len(),
            stale_active_paused = paused,
            expired_paused_seen = expired.len(),
            expired_paused_recreated = recreated,
            "reconciler sweep complete"
        );
    }
}
