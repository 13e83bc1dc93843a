//! SQLite-backed durable medium shared by the record, cache and queue stores.
//!
//! One connection per store instance. Every operation goes through
//! [`Database::call`], which serialises access to the connection and maps
//! SQLite failures onto [`Error`]. Failures that mean the medium itself is
//! gone flip the instance into the unavailable state: the condition is logged
//! once, every later call fails fast with `StorageUnavailable`, and the host
//! can pick up a single notice via [`Database::take_unavailable_notice`].

use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::{Mutex as StdMutex, OnceLock};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use offgrid_common::{Error, Result};

/// Current persisted layout version.
pub const SCHEMA_VERSION: i64 = 1;

const SCHEMA_VERSION_KEY: &str = "schema_version";

/// Where the data lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Location {
    File(PathBuf),
    Memory,
}

/// Tracks loss of the medium and the pending one-time notice.
#[derive(Debug, Default)]
struct Health {
    lost: OnceLock<String>,
    notice: StdMutex<Option<String>>,
}

impl Health {
    fn mark_lost(&self, reason: &str) {
        if self.lost.set(reason.to_string()).is_ok() {
            error!("Offline storage became unavailable: {}", reason);
            self.set_notice(reason.to_string());
        }
    }

    fn set_notice(&self, reason: String) {
        let mut notice = self.notice.lock().unwrap_or_else(|e| e.into_inner());
        *notice = Some(reason);
    }

    fn take_notice(&self) -> Option<String> {
        self.notice
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }
}

/// Durable medium backing all stores.
pub struct Database {
    conn: Mutex<Connection>,
    location: Location,
    health: Health,
}

impl Database {
    /// Open or create a database file.
    ///
    /// Parent directories are created as needed.
    ///
    /// # Errors
    /// - `StorageUnavailable` if the file cannot be created, opened, or is
    ///   not a database
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    Error::StorageUnavailable(format!(
                        "cannot create {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }

        let conn = Connection::open(&path).map_err(|e| {
            Error::StorageUnavailable(format!("cannot open {}: {}", path.display(), e))
        })?;

        let db = Self::bootstrap(conn, Location::File(path))?;
        info!("Offline store opened at {:?}", db.location);
        Ok(db)
    }

    /// Create a memory-only database.
    ///
    /// Used as the fallback when the durable medium cannot be opened, and
    /// throughout the tests.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::StorageUnavailable(format!("cannot open memory store: {}", e)))?;
        Self::bootstrap(conn, Location::Memory)
    }

    fn bootstrap(conn: Connection, location: Location) -> Result<Self> {
        let unavailable = |e: rusqlite::Error| {
            Error::StorageUnavailable(format!("cannot initialise {:?}: {}", location, e))
        };

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            "#,
        )
        .map_err(unavailable)?;

        let stored: Option<String> = conn
            .query_row(
                "SELECT value FROM meta WHERE key = ?1",
                [SCHEMA_VERSION_KEY],
                |row| row.get(0),
            )
            .optional()
            .map_err(unavailable)?;

        let stored = stored.and_then(|v| v.parse::<i64>().ok());
        match stored {
            Some(v) if v == SCHEMA_VERSION => {
                debug!("Schema version {} is current", v);
            }
            Some(v) => {
                info!(
                    "Schema version {} differs from {}; missing collections will be created",
                    v, SCHEMA_VERSION
                );
            }
            None => {
                info!("Initialising new offline store (schema version {})", SCHEMA_VERSION);
            }
        }

        conn.execute(
            "INSERT OR REPLACE INTO meta (key, value) VALUES (?1, ?2)",
            params![SCHEMA_VERSION_KEY, SCHEMA_VERSION.to_string()],
        )
        .map_err(unavailable)?;

        Ok(Self {
            conn: Mutex::new(conn),
            location,
            health: Health::default(),
        })
    }

    /// Where the data lives.
    pub fn location(&self) -> &Location {
        &self.location
    }

    /// Whether this instance only keeps data in memory.
    pub fn is_memory(&self) -> bool {
        self.location == Location::Memory
    }

    /// Whether the medium is still usable.
    pub fn is_available(&self) -> bool {
        self.health.lost.get().is_none()
    }

    /// Return the reason storage became unavailable, exactly once.
    ///
    /// Subsequent calls return `None` until a new condition is recorded.
    pub fn take_unavailable_notice(&self) -> Option<String> {
        self.health.take_notice()
    }

    /// Record that the durable medium could not be used and this instance
    /// is a stand-in.
    pub(crate) fn record_fallback(&self, reason: String) {
        warn!("Falling back to memory-only storage: {}", reason);
        self.health.set_notice(reason);
    }

    /// Read the stored schema version.
    pub async fn schema_version(&self) -> Result<Option<i64>> {
        let value: Option<String> = self
            .call("schema_version", |conn| {
                conn.query_row(
                    "SELECT value FROM meta WHERE key = ?1",
                    [SCHEMA_VERSION_KEY],
                    |row| row.get(0),
                )
                .optional()
            })
            .await?;
        Ok(value.and_then(|v| v.parse().ok()))
    }

    /// Run `f` against the connection.
    ///
    /// This is the only suspension point of a storage operation; `f` itself
    /// runs to completion without yielding.
    pub async fn call<T, F>(&self, op: &str, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> rusqlite::Result<T>,
    {
        if let Some(reason) = self.health.lost.get() {
            return Err(Error::StorageUnavailable(reason.clone()));
        }

        let mut conn = self.conn.lock().await;
        f(&mut conn).map_err(|e| self.map_error(op, e))
    }

    /// Map a SQLite error, recording loss of the medium when applicable.
    pub(crate) fn map_error(&self, op: &str, err: rusqlite::Error) -> Error {
        if is_medium_failure(&err) {
            let reason = format!("{} failed: {}", op, err);
            self.health.mark_lost(&reason);
            return Error::StorageUnavailable(reason);
        }

        match err {
            rusqlite::Error::FromSqlConversionFailure(_, _, e) => {
                Error::Serialization(format!("{}: {}", op, e))
            }
            rusqlite::Error::ToSqlConversionFailure(e) => {
                Error::Serialization(format!("{}: {}", op, e))
            }
            other => Error::Storage(format!("{} failed: {}", op, other)),
        }
    }
}

/// Whether the error means the medium is gone rather than the statement
/// being wrong.
fn is_medium_failure(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(e, _) => matches!(
            e.code,
            ErrorCode::CannotOpen
                | ErrorCode::SystemIoFailure
                | ErrorCode::DiskFull
                | ErrorCode::ReadOnly
                | ErrorCode::DatabaseCorrupt
                | ErrorCode::NotADatabase
                | ErrorCode::PermissionDenied
        ),
        _ => false,
    }
}

/// Whether the error is a constraint violation (e.g. a unique index).
pub(crate) fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation
    )
}

/// Quote a validated identifier for use in SQL.
pub(crate) fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident)
}

/// Current wall-clock time in epoch milliseconds.
pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
