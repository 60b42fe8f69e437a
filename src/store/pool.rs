//! Connection pool + embedded migrations bootstrap for the sqlite-backed
//! [`crate::store::SqliteSessionStore`].

use std::path::Path;

use diesel::r2d2::{self, ConnectionManager};
use diesel::sqlite::SqliteConnection;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

pub type DbPool = r2d2::Pool<ConnectionManager<SqliteConnection>>;

#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("database initialization error: {0}")]
    Init(String),

    #[error("database migration error: {0}")]
    Migration(String),

    #[error("connection pool error: {0}")]
    Pool(#[from] diesel::r2d2::Error),

    #[error("diesel error: {0}")]
    Diesel(#[from] diesel::result::Error),
}

/// Open (creating the parent directory if needed) a pooled connection to the
/// sqlite database at `db_path`, running any pending migrations.
pub fn init(db_path: &Path) -> Result<DbPool, DbError> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| DbError::Init(format!("failed to create database directory: {e}")))?;
    }

    let db_url = db_path.to_string_lossy().to_string();
    tracing::info!(db_url = %db_url, "initializing session store");

    let manager = ConnectionManager::<SqliteConnection>::new(&db_url);
    let pool = r2d2::Pool::builder()
        .max_size(10)
        .build(manager)
        .map_err(|e| DbError::Init(format!("failed to create connection pool: {e}")))?;

    let mut conn = pool
        .get()
        .map_err(|e| DbError::Init(format!("failed to get database connection: {e}")))?;
    conn.run_pending_migrations(MIGRATIONS)
        .map_err(|e| DbError::Migration(e.to_string()))?;

    tracing::info!("session store initialized");
    Ok(pool)
}
