//! Embedded SQLite storage for the fabric.
//!
//! Pure configuration and connection-string logic is kept separate from
//! the I/O that opens pools and runs migrations, so the former is testable
//! without a filesystem.

use crate::domain_types::ConnectionPoolSize;
use nutype::nutype;
use sqlx::migrate::Migrator;
use sqlx::{Pool, Sqlite};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

/// Embedded migrations, shipped with the crate.
static MIGRATOR: Migrator = sqlx::migrate!();

/// Database errors.
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Error surfaced by `SQLx`.
    #[error("database error: {source}")]
    Sqlx {
        #[from]
        source: sqlx::Error,
    },

    /// Filesystem error while preparing the store location.
    #[error("filesystem error: {message}")]
    FileSystem { message: String },

    /// Invalid store configuration.
    #[error("configuration error: {field} - {reason}")]
    Configuration { field: String, reason: String },

    /// A migration failed to apply.
    #[error("migration failed: {message}")]
    Migration { message: String },
}

/// Database result type.
pub type DatabaseResult<T> = Result<T, DatabaseError>;

#[nutype(
    validate(predicate = |path| !path.as_os_str().is_empty() && path.extension().is_some_and(|ext| ext == "db")),
    derive(Clone, Debug, Eq, PartialEq)
)]
pub struct DatabasePath(PathBuf);

impl DatabasePath {
    /// Creates a validated database path.
    ///
    /// # Errors
    ///
    /// Returns `DatabaseError::Configuration` when the path is empty or
    /// does not end in `.db`.
    pub fn new<P: AsRef<Path>>(path: P) -> DatabaseResult<Self> {
        Self::try_new(path.as_ref().to_path_buf()).map_err(|_| DatabaseError::Configuration {
            field: "store.path".to_string(),
            reason: "path is empty or missing the .db extension".to_string(),
        })
    }

    /// The path as a `PathBuf`.
    #[must_use]
    pub fn as_path(&self) -> PathBuf {
        self.clone().into_inner()
    }

    /// Parent directory to create before opening the file.
    #[must_use]
    pub fn parent_directory(&self) -> Option<PathBuf> {
        self.as_path().parent().map(Path::to_path_buf)
    }
}

impl std::fmt::Display for DatabasePath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_path().display())
    }
}

/// Database configuration: location plus pool and pragma settings.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DatabaseConfig {
    path: DatabasePath,
    pool_size: ConnectionPoolSize,
    enable_wal_mode: bool,
}

impl DatabaseConfig {
    /// Default settings: WAL mode on, default pool size.
    #[must_use]
    pub fn new(path: DatabasePath) -> Self {
        Self {
            path,
            pool_size: ConnectionPoolSize::default(),
            enable_wal_mode: true,
        }
    }

    /// Minimal settings for tests: a single connection, no WAL.
    ///
    /// # Panics
    ///
    /// Panics if pool size 1 is out of range, which cannot happen.
    #[must_use]
    pub fn for_testing(path: DatabasePath) -> Self {
        Self {
            path,
            pool_size: ConnectionPoolSize::try_new(1).expect("pool size 1 is in range"),
            enable_wal_mode: false,
        }
    }

    /// Sets the connection pool size.
    #[must_use]
    pub fn with_pool_size(mut self, pool_size: ConnectionPoolSize) -> Self {
        self.pool_size = pool_size;
        self
    }

    /// The configured path.
    #[must_use]
    pub fn path(&self) -> &DatabasePath {
        &self.path
    }

    /// The configured pool size.
    #[must_use]
    pub fn pool_size(&self) -> ConnectionPoolSize {
        self.pool_size
    }
}

/// Database connection with a managed pool.
#[derive(Clone)]
pub struct DatabaseConnection {
    pool: Pool<Sqlite>,
}

impl DatabaseConnection {
    /// Connect options derived from the config (pure).
    fn create_connect_options(config: &DatabaseConfig) -> sqlx::sqlite::SqliteConnectOptions {
        use sqlx::ConnectOptions;
        use sqlx::sqlite::SqliteConnectOptions;

        let mut options = SqliteConnectOptions::new()
            .filename(config.path().as_path())
            .create_if_missing(true)
            .pragma("foreign_keys", "ON");

        if config.enable_wal_mode {
            options = options.pragma("journal_mode", "WAL");
        }

        options.disable_statement_logging()
    }

    /// Opens the pool, applies pragmas, and runs embedded migrations.
    ///
    /// # Errors
    ///
    /// Returns an error when the parent directory cannot be created, the
    /// pool cannot be opened, or a migration fails.
    pub async fn initialize(config: DatabaseConfig) -> DatabaseResult<Self> {
        if let Some(parent) = config.path().parent_directory() {
            tokio::fs::create_dir_all(&parent)
                .await
                .map_err(|e| DatabaseError::FileSystem {
                    message: format!("failed to create {}: {e}", parent.display()),
                })?;
        }

        let options = Self::create_connect_options(&config);
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(config.pool_size().as_u32())
            .connect_with(options)
            .await?;

        // Trade full fsync for throughput; WAL keeps this crash-safe.
        sqlx::query("PRAGMA synchronous = NORMAL")
            .execute(&pool)
            .await?;
        sqlx::query("PRAGMA temp_store = MEMORY")
            .execute(&pool)
            .await?;

        MIGRATOR
            .run(&pool)
            .await
            .map_err(|e| DatabaseError::Migration {
                message: e.to_string(),
            })?;

        info!(path = %config.path(), "database initialized");
        Ok(Self { pool })
    }

    /// Access to the connection pool.
    #[must_use]
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    /// Closes the pool, flushing outstanding writes.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}
