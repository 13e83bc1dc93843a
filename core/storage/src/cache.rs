//! Expiring cache store for memoized values.
//!
//! Expiry is enforced on read: an expired entry behaves as a miss and is
//! deleted by the read that finds it. [`CacheStore::sweep_expired`] and
//! [`CacheStore::run_sweeper`] only reclaim space.

use rusqlite::{params, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tracing::{debug, info, warn};

use offgrid_common::{Error, Result};

use crate::database::{now_millis, Database};

enum Lookup {
    Miss,
    Expired,
    Hit(String),
}

/// Key/value cache with a per-entry expiry timestamp.
#[derive(Clone)]
pub struct CacheStore {
    db: Arc<Database>,
}

impl CacheStore {
    /// Open the cache store, creating its table if missing.
    pub async fn open(db: Arc<Database>) -> Result<Self> {
        db.call("create cache", |conn| {
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS cache_entries (
                    key TEXT PRIMARY KEY,
                    value TEXT NOT NULL,
                    expires_at INTEGER NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_cache_expires ON cache_entries(expires_at);
                "#,
            )
        })
        .await?;

        Ok(Self { db })
    }

    /// Store `value` under `key` until `ttl` has elapsed.
    ///
    /// Overwrites any existing entry, expired or not.
    pub async fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T, ttl: Duration) -> Result<()> {
        let json = serde_json::to_string(value)?;
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        let expires_at = now_millis().saturating_add(ttl_ms);

        self.db
            .call("cache set", |conn| {
                conn.execute(
                    "INSERT OR REPLACE INTO cache_entries (key, value, expires_at) VALUES (?1, ?2, ?3)",
                    params![key, json, expires_at],
                )
            })
            .await?;

        debug!("Cached {} for {:?}", key, ttl);
        Ok(())
    }

    /// Get a live value.
    ///
    /// Returns `None` for a missing key. An expired entry is deleted and
    /// also reported as `None`.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let now = now_millis();

        let lookup = self
            .db
            .call("cache get", |conn| {
                let row: Option<(String, i64)> = conn
                    .query_row(
                        "SELECT value, expires_at FROM cache_entries WHERE key = ?1",
                        [key],
                        |row| Ok((row.get(0)?, row.get(1)?)),
                    )
                    .optional()?;

                match row {
                    None => Ok(Lookup::Miss),
                    Some((_, expires_at)) if now >= expires_at => {
                        conn.execute(
                            "DELETE FROM cache_entries WHERE key = ?1 AND expires_at = ?2",
                            params![key, expires_at],
                        )?;
                        Ok(Lookup::Expired)
                    }
                    Some((value, _)) => Ok(Lookup::Hit(value)),
                }
            })
            .await?;

        match lookup {
            Lookup::Miss => Ok(None),
            Lookup::Expired => {
                debug!("Evicted expired cache entry {}", key);
                Ok(None)
            }
            Lookup::Hit(json) => serde_json::from_str(&json).map(Some).map_err(|e| {
                Error::Serialization(format!("cache entry {}: {}", key, e))
            }),
        }
    }

    /// Return the cached value, or compute, cache and return it.
    pub async fn get_or_insert_with<T, F, Fut>(&self, key: &str, ttl: Duration, fetch: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if let Some(value) = self.get(key).await? {
            return Ok(value);
        }

        let value = fetch().await?;
        self.set(key, &value, ttl).await?;
        Ok(value)
    }

    /// Invalidate an entry. Missing keys are fine.
    pub async fn delete(&self, key: &str) -> Result<bool> {
        let removed = self
            .db
            .call("cache delete", |conn| {
                conn.execute("DELETE FROM cache_entries WHERE key = ?1", [key])
            })
            .await?;
        Ok(removed > 0)
    }

    /// Remove every entry that has expired as of now.
    ///
    /// Returns the number of entries removed.
    pub async fn sweep_expired(&self) -> Result<usize> {
        let now = now_millis();
        let removed = self
            .db
            .call("cache sweep", |conn| {
                conn.execute("DELETE FROM cache_entries WHERE expires_at <= ?1", [now])
            })
            .await?;

        if removed > 0 {
            debug!("Swept {} expired cache entries", removed);
        }
        Ok(removed)
    }

    /// Number of stored entries, expired ones included.
    pub async fn len(&self) -> Result<u64> {
        let count: i64 = self
            .db
            .call("cache len", |conn| {
                conn.query_row("SELECT COUNT(*) FROM cache_entries", [], |row| row.get(0))
            })
            .await?;
        Ok(count as u64)
    }

    /// Whether the cache holds no entries at all.
    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }

    /// Remove every entry.
    pub async fn clear(&self) -> Result<usize> {
        let removed = self
            .db
            .call("cache clear", |conn| conn.execute("DELETE FROM cache_entries", []))
            .await?;
        info!("Cleared {} cache entries", removed);
        Ok(removed)
    }

    /// Sweep expired entries every `period` until storage is lost.
    ///
    /// Spawn this on the host runtime if space reclamation is wanted.
    pub async fn run_sweeper(&self, period: Duration) {
        let mut ticker = interval(period);
        // The first tick completes immediately.
        ticker.tick().await;

        info!("Cache sweeper started (interval: {:?})", period);

        loop {
            ticker.tick().await;
            match self.sweep_expired().await {
                Ok(_) => {}
                Err(e) if e.is_storage_unavailable() => {
                    warn!("Cache sweeper stopping: {}", e);
                    break;
                }
                Err(e) => warn!("Cache sweep failed: {}", e),
            }
        }
    }
}
