use crate::error::{AppError, AppResult};
use crate::services::pool_manager::BackendConnector;
use sqlx::sqlite::SqliteConnectOptions;
use sqlx::{ConnectOptions, Connection, SqliteConnection};
use std::path::Path;
use std::str::FromStr;

/// Build SQLite connect options from a `sqlite://` URL, creating the parent
/// directory and the database file on first use. Every pooled backend
/// connection is opened from these options.
pub async fn connect_options(database_url: &str) -> AppResult<SqliteConnectOptions> {
    let db_path = database_url.trim_start_matches("sqlite://");

    if let Some(parent) = Path::new(db_path).parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                AppError::Database(format!("Failed to create database directory: {e}"))
            })?;
        }
    }

    let options = SqliteConnectOptions::from_str(database_url)
        .map_err(|e| AppError::Database(format!("Invalid database URL: {e}")))?
        .create_if_missing(true)
        .disable_statement_logging();

    Ok(options)
}

pub async fn open_connection(options: &SqliteConnectOptions) -> AppResult<SqliteConnection> {
    options
        .clone()
        .connect()
        .await
        .map_err(|e| AppError::Database(format!("Failed to open database connection: {e}")))
}

pub async fn run_migrations(conn: &mut SqliteConnection) -> AppResult<()> {
    sqlx::migrate!("./migrations")
        .run(&mut *conn)
        .await
        .map_err(|e| AppError::Database(format!("Failed to run migrations: {e}")))?;

    // WAL keeps concurrent agent connections from serializing on writes.
    tracing::info!("Applying SQLite performance optimizations");

    sqlx::query("PRAGMA journal_mode = WAL")
        .execute(&mut *conn)
        .await
        .map_err(|e| AppError::Database(format!("Failed to set journal mode: {e}")))?;

    sqlx::query("PRAGMA synchronous = NORMAL")
        .execute(&mut *conn)
        .await
        .map_err(|e| AppError::Database(format!("Failed to set synchronous mode: {e}")))?;

    Ok(())
}

/// Connection factory handed to the agent pool manager: one fresh SQLite
/// connection per pooled slot.
pub struct SqliteBackend {
    options: SqliteConnectOptions,
}

impl SqliteBackend {
    pub fn new(options: SqliteConnectOptions) -> Self {
        Self { options }
    }
}

impl BackendConnector for SqliteBackend {
    type Conn = SqliteConnection;

    async fn connect(&self) -> AppResult<SqliteConnection> {
        open_connection(&self.options).await
    }
}
