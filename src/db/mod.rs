//! SQLite store: pool construction, schema preparation, write-retry policy.

use std::future::Future;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::Row;

/// Maximum retries for a write that hits lock contention.
const WRITE_RETRIES: u32 = 3;

/// Base delay between contention retries; scaled by the attempt number.
const RETRY_BASE_DELAY: Duration = Duration::from_millis(50);

/// Pool and journal tuning, surfaced through the `[database]` config table.
#[derive(Debug, Clone)]
pub struct DatabaseSettings {
    /// Pool size. Readers share the pool; SQLite itself serializes writers.
    pub max_connections: u32,
    /// How long a connection waits on a locked database before reporting
    /// `SQLITE_BUSY` (which the retry helper then handles).
    pub busy_timeout: Duration,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            max_connections: 5,
            busy_timeout: Duration::from_secs(30),
        }
    }
}

/// Handle to the store; cheap to clone, shared by every repository.
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (or create) the database file and bring its schema up to date.
    ///
    /// WAL journaling keeps readers unblocked while the single logical
    /// writer commits.
    pub async fn open(path: &Path, settings: &DatabaseSettings) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating database directory: {}", parent.display()))?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(settings.busy_timeout);

        let pool = SqlitePoolOptions::new()
            .max_connections(settings.max_connections.max(1))
            .connect_with(options)
            .await
            .with_context(|| format!("opening database at {}", path.display()))?;

        let db = Self { pool };
        db.prepare_schema().await?;

        Ok(db)
    }

    /// Create an in-memory database for tests.
    ///
    /// Exactly one connection: SQLite gives every connection its own
    /// in-memory database, so a larger pool would scatter the tables.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .context("parsing in-memory database URL")?;

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .context("connecting to in-memory database")?;

        let db = Self { pool };
        db.prepare_schema().await?;

        Ok(db)
    }

    /// Versioned migrations, then the optional-column sweep.
    async fn prepare_schema(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("running database migrations")?;
        self.add_missing_columns().await
    }

    /// The tunnel pool-limit columns arrived after the versioned schema.
    /// Inspect the live table and add whichever are absent, so upgraded and
    /// freshly created databases converge on the same shape.
    async fn add_missing_columns(&self) -> Result<()> {
        let rows = sqlx::query("PRAGMA table_info(tunnels)")
            .fetch_all(&self.pool)
            .await
            .context("reading tunnels table info")?;

        let existing: Vec<String> = rows
            .iter()
            .map(|row| row.get::<String, _>("name"))
            .collect();

        for (column, ddl) in [
            ("min", "ALTER TABLE tunnels ADD COLUMN min INTEGER"),
            ("max", "ALTER TABLE tunnels ADD COLUMN max INTEGER"),
        ] {
            if !existing.iter().any(|name| name == column) {
                log::info!("adding optional column tunnels.{column}");
                sqlx::query(ddl)
                    .execute(&self.pool)
                    .await
                    .with_context(|| format!("adding column tunnels.{column}"))?;
            }
        }

        Ok(())
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// True when an error indicates SQLite lock contention worth retrying.
pub fn is_busy_error(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => {
            let message = db_err.message();
            message.contains("database is locked")
                || message.contains("database table is locked")
                || db_err
                    .code()
                    .map(|code| code == "5" || code == "6" || code == "517")
                    .unwrap_or(false)
        }
        _ => false,
    }
}

/// Run a write operation, retrying on lock contention.
///
/// The operation is re-invoked from scratch on each attempt, so it must be a
/// self-contained transaction. Non-contention errors are returned as-is.
pub async fn with_write_retry<T, F, Fut>(desc: &str, op: F) -> sqlx::Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = sqlx::Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Err(err) if is_busy_error(&err) && attempt < WRITE_RETRIES => {
                attempt += 1;
                log::warn!("{desc}: database busy, retrying (attempt {attempt})");
                tokio::time::sleep(RETRY_BASE_DELAY * attempt).await;
            }
            other => return other,
        }
    }
}
