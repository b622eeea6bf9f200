//! `SQLite` plumbing behind the channel registry.
//!
//! The registry schema and queries live in the daemon; this module only
//! opens pools, maps sqlx failures and stamps times.

use std::path::Path;
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use tracing::info;

/// How long a writer waits on a locked registry file.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Query error: {0}")]
    Query(String),

    /// The named row does not exist. Carries a human label like `Channel s1`.
    #[error("Not found: {0}")]
    NotFound(String),
}

impl From<sqlx::Error> for DatabaseError {
    fn from(e: sqlx::Error) -> Self {
        Self::Query(e.to_string())
    }
}

/// Whether an insert lost to a UNIQUE or PRIMARY KEY constraint, i.e. the
/// name or port is already registered.
pub fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

async fn connect(options: SqliteConnectOptions, max: u32) -> Result<Pool<Sqlite>, DatabaseError> {
    SqlitePoolOptions::new()
        .max_connections(max)
        .connect_with(options)
        .await
        .map_err(|e| DatabaseError::Connection(e.to_string()))
}

fn parse_url(url: &str) -> Result<SqliteConnectOptions, DatabaseError> {
    SqliteConnectOptions::from_str(url).map_err(|e| DatabaseError::Connection(e.to_string()))
}

/// Pool over the registry file at `path`, created along with its directory
/// on first use. WAL mode lets the API read while the supervisor writes.
pub async fn open_pool(path: &Path) -> Result<Pool<Sqlite>, DatabaseError> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|e| DatabaseError::Io(e.to_string()))?;
    }

    let options = parse_url(&format!("sqlite:{}?mode=rwc", path.display()))?
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(BUSY_TIMEOUT);
    let pool = connect(options, 5).await?;

    info!(path = %path.display(), "Registry database opened");
    Ok(pool)
}

/// Single-connection pool over a throwaway in-memory registry.
pub async fn open_pool_in_memory() -> Result<Pool<Sqlite>, DatabaseError> {
    // Every extra connection would get its own empty database.
    connect(parse_url("sqlite::memory:")?, 1).await
}

/// Seconds since the Unix epoch. Used for registry timestamps and log file
/// names.
#[allow(clippy::cast_possible_wrap)]
pub fn unix_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// Declares a cloneable registry handle `$name` wrapping a `SQLite` pool.
///
/// The invoking crate must carry a `migrations/` directory; it is embedded
/// at compile time and applied on every open, after which `$ready` is
/// logged.
///
/// ```ignore
/// speeddata_core::define_database!(Database, "Registry migrations complete");
/// ```
#[macro_export]
macro_rules! define_database {
    ($name:ident, $ready:expr) => {
        #[derive(Clone)]
        pub struct $name {
            pool: ::sqlx::Pool<::sqlx::Sqlite>,
        }

        impl $name {
            pub async fn open(
                path: &::std::path::Path,
            ) -> ::std::result::Result<Self, $crate::db::DatabaseError> {
                Self::migrated($crate::db::open_pool(path).await?).await
            }

            pub async fn open_in_memory() -> ::std::result::Result<Self, $crate::db::DatabaseError>
            {
                Self::migrated($crate::db::open_pool_in_memory().await?).await
            }

            async fn migrated(
                pool: ::sqlx::Pool<::sqlx::Sqlite>,
            ) -> ::std::result::Result<Self, $crate::db::DatabaseError> {
                ::sqlx::migrate!("./migrations")
                    .run(&pool)
                    .await
                    .map_err(|e| $crate::db::DatabaseError::Migration(e.to_string()))?;
                ::tracing::info!($ready);
                Ok(Self { pool })
            }

            pub const fn pool(&self) -> &::sqlx::Pool<::sqlx::Sqlite> {
                &self.pool
            }
        }
    };
}
