//! SQLite-backed [`SessionStore`], mirroring the raw-SQL-with-bound-params
//! idiom used elsewhere in this codebase for crash-safe single-statement
//! transitions (no ORM-level row diffing).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::sql_types::{Integer, Nullable, Text};

use crate::error::OrchestratorError;
use crate::store::pool::DbPool;
use crate::store::{SessionRecord, SessionStatus, SessionStore};

pub struct SqliteSessionStore {
    pool: DbPool,
}

impl SqliteSessionStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    fn conn(&self) -> Result<diesel::r2d2::PooledConnection<diesel::r2d2::ConnectionManager<SqliteConnection>>, OrchestratorError> {
        self.pool
            .get()
            .map_err(|e| OrchestratorError::Storage(format!("failed to get connection: {e}")))
    }
}

/// The one canonical timestamp column touched per target status.
fn timestamp_column_for(status: SessionStatus) -> Option<&'static str> {
    match status {
        SessionStatus::Pausing => Some("pause_requested_at"),
        SessionStatus::Paused => Some("paused_at"),
        SessionStatus::Resuming => Some("resume_attempted_at"),
        SessionStatus::Active => Some("resumed_at"),
        SessionStatus::Destroyed => Some("destroyed_at"),
        SessionStatus::Creating | SessionStatus::Destroying | SessionStatus::Error => None,
    }
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    async fn upsert(&self, record: &SessionRecord) -> Result<(), OrchestratorError> {
        let conn = self.conn()?;
        let record = record.clone();
        tokio::task::spawn_blocking(move || upsert_blocking(conn, &record))
            .await
            .map_err(|e| OrchestratorError::Storage(format!("join error: {e}")))?
    }

    async fn get_by_thread(&self, thread_id: &str) -> Result<Option<SessionRecord>, OrchestratorError> {
        let conn = self.conn()?;
        let thread_id = thread_id.to_owned();
        tokio::task::spawn_blocking(move || get_by_thread_blocking(conn, &thread_id))
            .await
            .map_err(|e| OrchestratorError::Storage(format!("join error: {e}")))?
    }

    async fn has_tracked(&self, thread_id: &str) -> Result<bool, OrchestratorError> {
        Ok(self
            .get_by_thread(thread_id)
            .await?
            .map(|r| r.status != SessionStatus::Destroyed)
            .unwrap_or(false))
    }

    async fn get_active(&self, thread_id: &str) -> Result<Option<SessionRecord>, OrchestratorError> {
        Ok(self
            .get_by_thread(thread_id)
            .await?
            .filter(|r| r.status == SessionStatus::Active))
    }

    async fn mark_activity(&self, thread_id: &str) -> Result<(), OrchestratorError> {
        let conn = self.conn()?;
        let thread_id = thread_id.to_owned();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn;
            diesel::sql_query(
                "UPDATE sessions SET last_activity = ?, updated_at = ? WHERE thread_id = ?",
            )
            .bind::<Text, _>(Utc::now().to_rfc3339())
            .bind::<Text, _>(Utc::now().to_rfc3339())
            .bind::<Text, _>(&thread_id)
            .execute(&mut conn)
            .map_err(|e| OrchestratorError::Storage(format!("mark_activity failed: {e}")))?;
            Ok(())
        })
        .await
        .map_err(|e| OrchestratorError::Storage(format!("join error: {e}")))?
    }

    async fn mark_health_ok(&self, thread_id: &str) -> Result<(), OrchestratorError> {
        let conn = self.conn()?;
        let thread_id = thread_id.to_owned();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn;
            diesel::sql_query(
                "UPDATE sessions SET last_health_ok_at = ?, updated_at = ? WHERE thread_id = ?",
            )
            .bind::<Text, _>(Utc::now().to_rfc3339())
            .bind::<Text, _>(Utc::now().to_rfc3339())
            .bind::<Text, _>(&thread_id)
            .execute(&mut conn)
            .map_err(|e| OrchestratorError::Storage(format!("mark_health_ok failed: {e}")))?;
            Ok(())
        })
        .await
        .map_err(|e| OrchestratorError::Storage(format!("join error: {e}")))?
    }

    async fn update_status(
        &self,
        thread_id: &str,
        status: SessionStatus,
        last_error: Option<&str>,
    ) -> Result<(), OrchestratorError> {
        let conn = self.conn()?;
        let thread_id = thread_id.to_owned();
        let last_error = last_error.map(|s| s.to_owned());
        tokio::task::spawn_blocking(move || {
            let mut conn = conn;
            let now = Utc::now().to_rfc3339();
            let extra_col = timestamp_column_for(status);

            conn.transaction::<_, diesel::result::Error, _>(|conn| {
                diesel::sql_query(
                    "UPDATE sessions SET status = ?, last_error = COALESCE(?, last_error), updated_at = ? WHERE thread_id = ?",
                )
                .bind::<Text, _>(status.as_str())
                .bind::<Nullable<Text>, _>(&last_error)
                .bind::<Text, _>(&now)
                .bind::<Text, _>(&thread_id)
                .execute(conn)?;

                if let Some(col) = extra_col {
                    let sql = format!("UPDATE sessions SET {col} = ? WHERE thread_id = ?");
                    diesel::sql_query(sql)
                        .bind::<Text, _>(&now)
                        .bind::<Text, _>(&thread_id)
                        .execute(conn)?;
                }
                Ok(())
            })
            .map_err(|e| OrchestratorError::Storage(format!("update_status failed: {e}")))
        })
        .await
        .map_err(|e| OrchestratorError::Storage(format!("join error: {e}")))?
    }

    async fn increment_resume_failure(
        &self,
        thread_id: &str,
        last_error: &str,
    ) -> Result<(), OrchestratorError> {
        let conn = self.conn()?;
        let thread_id = thread_id.to_owned();
        let last_error = last_error.to_owned();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn;
            diesel::sql_query(
                "UPDATE sessions SET resume_fail_count = resume_fail_count + 1, last_error = ?, updated_at = ? WHERE thread_id = ?",
            )
            .bind::<Text, _>(&last_error)
            .bind::<Text, _>(Utc::now().to_rfc3339())
            .bind::<Text, _>(&thread_id)
            .execute(&mut conn)
            .map_err(|e| OrchestratorError::Storage(format!("increment_resume_failure failed: {e}")))?;
            Ok(())
        })
        .await
        .map_err(|e| OrchestratorError::Storage(format!("join error: {e}")))?
    }

    async fn list_active(&self) -> Result<Vec<SessionRecord>, OrchestratorError> {
        let conn = self.conn()?;
        tokio::task::spawn_blocking(move || {
            let mut conn = conn;
            let rows: Vec<SessionRow> = diesel::sql_query(
                format!("{SELECT_COLUMNS} FROM sessions WHERE status = 'active' ORDER BY last_activity DESC"),
            )
            .load(&mut conn)
            .map_err(|e| OrchestratorError::Storage(format!("list_active failed: {e}")))?;
            rows.into_iter().map(row_to_record).collect()
        })
        .await
        .map_err(|e| OrchestratorError::Storage(format!("join error: {e}")))?
    }

    async fn list_tracked(&self) -> Result<Vec<SessionRecord>, OrchestratorError> {
        let conn = self.conn()?;
        tokio::task::spawn_blocking(move || {
            let mut conn = conn;
            let rows: Vec<SessionRow> = diesel::sql_query(
                format!("{SELECT_COLUMNS} FROM sessions ORDER BY updated_at DESC"),
            )
            .load(&mut conn)
            .map_err(|e| OrchestratorError::Storage(format!("list_tracked failed: {e}")))?;
            rows.into_iter().map(row_to_record).collect()
        })
        .await
        .map_err(|e| OrchestratorError::Storage(format!("join error: {e}")))?
    }

    async fn list_stale_active(&self, minutes: i64) -> Result<Vec<SessionRecord>, OrchestratorError> {
        let conn = self.conn()?;
        let cutoff = (Utc::now() - chrono::Duration::minutes(minutes)).to_rfc3339();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn;
            let rows: Vec<SessionRow> = diesel::sql_query(
                format!("{SELECT_COLUMNS} FROM sessions WHERE status = 'active' AND last_activity < ? ORDER BY last_activity DESC"),
            )
            .bind::<Text, _>(&cutoff)
            .load(&mut conn)
            .map_err(|e| OrchestratorError::Storage(format!("list_stale_active failed: {e}")))?;
            rows.into_iter().map(row_to_record).collect()
        })
        .await
        .map_err(|e| OrchestratorError::Storage(format!("join error: {e}")))?
    }

    async fn list_expired_paused(&self, minutes: i64) -> Result<Vec<SessionRecord>, OrchestratorError> {
        let conn = self.conn()?;
        let cutoff = (Utc::now() - chrono::Duration::minutes(minutes)).to_rfc3339();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn;
            let rows: Vec<SessionRow> = diesel::sql_query(
                format!("{SELECT_COLUMNS} FROM sessions WHERE status = 'paused' AND paused_at < ? ORDER BY updated_at DESC"),
            )
            .bind::<Text, _>(&cutoff)
            .load(&mut conn)
            .map_err(|e| OrchestratorError::Storage(format!("list_expired_paused failed: {e}")))?;
            rows.into_iter().map(row_to_record).collect()
        })
        .await
        .map_err(|e| OrchestratorError::Storage(format!("join error: {e}")))?
    }
}

const SELECT_COLUMNS: &str = r#"
    SELECT thread_id, channel_id, guild_id, sandbox_id, agent_session_id,
           preview_url, preview_token, status, last_activity,
           pause_requested_at, paused_at, resume_attempted_at, resumed_at,
           destroyed_at, last_health_ok_at, last_error, resume_fail_count,
           created_at, updated_at
"#;

type PooledConn = diesel::r2d2::PooledConnection<diesel::r2d2::ConnectionManager<SqliteConnection>>;

fn upsert_blocking(conn: PooledConn, record: &SessionRecord) -> Result<(), OrchestratorError> {
    let now = Utc::now();
    // Active upserts also advance resumed_at; a non-active upsert keeps
    // whatever last_activity the caller set (mark_activity is the only path
    // meant to bump it outside of going active).
    let last_activity = if record.status == SessionStatus::Active {
        now.to_rfc3339()
    } else {
        record.last_activity.to_rfc3339()
    };
    let resumed_at = if record.status == SessionStatus::Active {
        Some(now.to_rfc3339())
    } else {
        record.resumed_at.map(|d| d.to_rfc3339())
    };

    execute_upsert(conn, record, &last_activity, resumed_at, &now.to_rfc3339())
}

/// Test-only: insert `record` verbatim, bypassing the `last_activity`/
/// `resumed_at` bump `upsert_blocking` applies to active rows. Mirrors
/// `InMemorySessionStore::insert_raw`, letting tests seed stale/expired rows
/// with crafted timestamps regardless of status.
#[cfg(test)]
fn insert_raw_blocking(conn: PooledConn, record: &SessionRecord) -> Result<(), OrchestratorError> {
    let now = Utc::now().to_rfc3339();
    let last_activity = record.last_activity.to_rfc3339();
    let resumed_at = record.resumed_at.map(|d| d.to_rfc3339());
    execute_upsert(conn, record, &last_activity, resumed_at, &now)
}

fn execute_upsert(
    mut conn: PooledConn,
    record: &SessionRecord,
    last_activity: &str,
    resumed_at: Option<String>,
    updated_at: &str,
) -> Result<(), OrchestratorError> {
    diesel::sql_query(
        r#"
        INSERT INTO sessions (
            thread_id, channel_id, guild_id, sandbox_id, agent_session_id,
            preview_url, preview_token, status, last_activity,
            pause_requested_at, paused_at, resume_attempted_at, resumed_at,
            destroyed_at, last_health_ok_at, last_error, resume_fail_count,
            created_at, updated_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(thread_id) DO UPDATE SET
            channel_id = excluded.channel_id,
            guild_id = excluded.guild_id,
            sandbox_id = excluded.sandbox_id,
            agent_session_id = excluded.agent_session_id,
            preview_url = excluded.preview_url,
            preview_token = excluded.preview_token,
            status = excluded.status,
            last_activity = excluded.last_activity,
            pause_requested_at = excluded.pause_requested_at,
            paused_at = excluded.paused_at,
            resume_attempted_at = excluded.resume_attempted_at,
            resumed_at = excluded.resumed_at,
            destroyed_at = excluded.destroyed_at,
            last_health_ok_at = excluded.last_health_ok_at,
            last_error = excluded.last_error,
            resume_fail_count = excluded.resume_fail_count,
            updated_at = excluded.updated_at
        "#,
    )
    .bind::<Text, _>(&record.thread_id)
    .bind::<Text, _>(&record.channel_id)
    .bind::<Text, _>(&record.guild_id)
    .bind::<Text, _>(&record.sandbox_id)
    .bind::<Text, _>(&record.agent_session_id)
    .bind::<Text, _>(&record.preview_url)
    .bind::<Nullable<Text>, _>(&record.preview_token)
    .bind::<Text, _>(record.status.as_str())
    .bind::<Text, _>(last_activity)
    .bind::<Nullable<Text>, _>(&record.pause_requested_at.map(|d| d.to_rfc3339()))
    .bind::<Nullable<Text>, _>(&record.paused_at.map(|d| d.to_rfc3339()))
    .bind::<Nullable<Text>, _>(&record.resume_attempted_at.map(|d| d.to_rfc3339()))
    .bind::<Nullable<Text>, _>(&resumed_at)
    .bind::<Nullable<Text>, _>(&record.destroyed_at.map(|d| d.to_rfc3339()))
    .bind::<Nullable<Text>, _>(&record.last_health_ok_at.map(|d| d.to_rfc3339()))
    .bind::<Nullable<Text>, _>(&record.last_error)
    .bind::<Integer, _>(record.resume_fail_count as i32)
    .bind::<Text, _>(record.created_at.to_rfc3339())
    .bind::<Text, _>(updated_at)
    .execute(&mut conn)
    .map_err(|e| OrchestratorError::Storage(format!("upsert failed: {e}")))?;

    Ok(())
}

fn get_by_thread_blocking(
    mut conn: PooledConn,
    thread_id: &str,
) -> Result<Option<SessionRecord>, OrchestratorError> {
    let rows: Vec<SessionRow> = diesel::sql_query(format!("{SELECT_COLUMNS} FROM sessions WHERE thread_id = ?"))
        .bind::<Text, _>(thread_id)
        .load(&mut conn)
        .map_err(|e| OrchestratorError::Storage(format!("get_by_thread failed: {e}")))?;

    rows.into_iter().next().map(row_to_record).transpose()
}

#[derive(Debug, Clone, QueryableByName)]
struct SessionRow {
    #[diesel(sql_type = Text)]
    thread_id: String,
    #[diesel(sql_type = Text)]
    channel_id: String,
    #[diesel(sql_type = Text)]
    guild_id: String,
    #[diesel(sql_type = Text)]
    sandbox_id: String,
    #[diesel(sql_type = Text)]
    agent_session_id: String,
    #[diesel(sql_type = Text)]
    preview_url: String,
    #[diesel(sql_type = Nullable<Text>)]
    preview_token: Option<String>,
    #[diesel(sql_type = Text)]
    status: String,
    #[diesel(sql_type = Text)]
    last_activity: String,
    #[diesel(sql_type = Nullable<Text>)]
    pause_requested_at: Option<String>,
    #[diesel(sql_type = Nullable<Text>)]
    paused_at: Option<String>,
    #[diesel(sql_type = Nullable<Text>)]
    resume_attempted_at: Option<String>,
    #[diesel(sql_type = Nullable<Text>)]
    resumed_at: Option<String>,
    #[diesel(sql_type = Nullable<Text>)]
    destroyed_at: Option<String>,
    #[diesel(sql_type = Nullable<Text>)]
    last_health_ok_at: Option<String>,
    #[diesel(sql_type = Nullable<Text>)]
    last_error: Option<String>,
    #[diesel(sql_type = Integer)]
    resume_fail_count: i32,
    #[diesel(sql_type = Text)]
    created_at: String,
    #[diesel(sql_type = Text)]
    updated_at: String,
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, OrchestratorError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| OrchestratorError::Storage(format!("failed to parse datetime '{s}': {e}")))
}

fn parse_datetime_opt(s: &Option<String>) -> Result<Option<DateTime<Utc>>, OrchestratorError> {
    s.as_deref().map(parse_datetime).transpose()
}

fn row_to_record(row: SessionRow) -> Result<SessionRecord, OrchestratorError> {
    Ok(SessionRecord {
        thread_id: row.thread_id,
        channel_id: row.channel_id,
        guild_id: row.guild_id,
        sandbox_id: row.sandbox_id,
        agent_session_id: row.agent_session_id,
        preview_url: row.preview_url,
        preview_token: row.preview_token,
        status: SessionStatus::parse(&row.status).map_err(OrchestratorError::Storage)?,
        last_activity: parse_datetime(&row.last_activity)?,
        pause_requested_at: parse_datetime_opt(&row.pause_requested_at)?,
        paused_at: parse_datetime_opt(&row.paused_at)?,
        resume_attempted_at: parse_datetime_opt(&row.resume_attempted_at)?,
        resumed_at: parse_datetime_opt(&row.resumed_at)?,
        destroyed_at: parse_datetime_opt(&row.destroyed_at)?,
        last_health_ok_at: parse_datetime_opt(&row.last_health_ok_at)?,
        last_error: row.last_error,
        resume_fail_count: row.resume_fail_count as i64,
        created_at: parse_datetime(&row.created_at)?,
        updated_at: parse_datetime(&row.updated_at)?,
    })
}
