//! SessionStore: the durable mapping from ThreadKey to [`SessionRecord`].

pub mod models;
pub mod pool;
pub mod sqlite;

pub use models::{SessionRecord, SessionStatus};
pub use pool::{DbError, DbPool};
pub use sqlite::SqliteSessionStore;

use async_trait::async_trait;

use crate::error::OrchestratorError;

/// Narrow, typed API over the `sessions` table. All operations return
/// either a value or an [`OrchestratorError::Storage`].
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Insert or update by `threadId`; touches `lastActivity` and, when
    /// `status = active`, `resumedAt`.
    async fn upsert(&self, record: &SessionRecord) -> Result<(), OrchestratorError>;

    async fn get_by_thread(&self, thread_id: &str) -> Result<Option<SessionRecord>, OrchestratorError>;

    /// True if any non-destroyed record exists for `thread_id`.
    async fn has_tracked(&self, thread_id: &str) -> Result<bool, OrchestratorError>;

    /// `Some(r)` only when `r.status = active`.
    async fn get_active(&self, thread_id: &str) -> Result<Option<SessionRecord>, OrchestratorError>;

    async fn mark_activity(&self, thread_id: &str) -> Result<(), OrchestratorError>;

    async fn mark_health_ok(&self, thread_id: &str) -> Result<(), OrchestratorError>;

    /// Atomic status transition; sets the one canonical timestamp column for
    /// the target status. Never clears earlier transition timestamps.
    async fn update_status(
        &self,
        thread_id: &str,
        status: SessionStatus,
        last_error: Option<&str>,
    ) -> Result<(), OrchestratorError>;

    async fn increment_resume_failure(
        &self,
        thread_id: &str,
        last_error: &str,
    ) -> Result<(), OrchestratorError>;

    /// Ordered by `lastActivity desc`.
    async fn list_active(&self) -> Result<Vec<SessionRecord>, OrchestratorError>;

    /// Ordered by `updatedAt desc`.
    async fn list_tracked(&self) -> Result<Vec<SessionRecord>, OrchestratorError>;

    /// `status = active AND lastActivity < now - minutes`.
    async fn list_stale_active(&self, minutes: i64) -> Result<Vec<SessionRecord>, OrchestratorError>;

    /// `status = paused AND pausedAt < now - minutes`.
    async fn list_expired_paused(&self, minutes: i64) -> Result<Vec<SessionRecord>, OrchestratorError>;
}
