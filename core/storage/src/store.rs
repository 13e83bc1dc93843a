//! Top-level handle tying the record, cache and queue stores to one medium.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use offgrid_common::{Error, Result};

use crate::cache::CacheStore;
use crate::config::StoreConfig;
use crate::database::Database;
use crate::queue::MutationQueue;
use crate::records::RecordStore;

/// Whether data outlives the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageMode {
    Durable,
    MemoryOnly,
}

/// Result of [`OfflineStore::clear_all`], one entry per part.
///
/// Each part is cleared independently so callers learn exactly which
/// parts were not erased.
#[derive(Debug)]
pub struct ClearReport {
    pub records: Result<usize>,
    pub cache: Result<usize>,
    pub mutations: Result<usize>,
}

impl ClearReport {
    /// Whether every part was cleared.
    pub fn is_complete(&self) -> bool {
        self.records.is_ok() && self.cache.is_ok() && self.mutations.is_ok()
    }

    /// The parts that failed, by name.
    pub fn failures(&self) -> Vec<(&'static str, &Error)> {
        [
            ("records", &self.records),
            ("cache", &self.cache),
            ("mutations", &self.mutations),
        ]
        .into_iter()
        .filter_map(|(name, result)| result.as_ref().err().map(|e| (name, e)))
        .collect()
    }
}

/// Offline persistence engine: records, cache and pending mutations.
#[derive(Clone)]
pub struct OfflineStore {
    db: Arc<Database>,
    records: RecordStore,
    cache: CacheStore,
    queue: MutationQueue,
    sweep_interval: Option<Duration>,
}

impl OfflineStore {
    /// Open the store described by `config`.
    ///
    /// # Errors
    /// - `StorageUnavailable` if the database file cannot be used
    /// - `Config` if the catalog is inconsistent
    pub async fn open(config: &StoreConfig) -> Result<Self> {
        let db = match &config.path {
            Some(path) => Database::open(path)?,
            None => Database::in_memory()?,
        };
        Self::with_database(Arc::new(db), config).await
    }

    /// Open the store, degrading to memory-only if the medium is unusable.
    ///
    /// The reason is kept as the one-time unavailable notice.
    pub async fn open_or_memory(config: &StoreConfig) -> Result<Self> {
        match Self::open(config).await {
            Ok(store) => Ok(store),
            Err(Error::StorageUnavailable(reason)) => {
                let db = Arc::new(Database::in_memory()?);
                db.record_fallback(reason);
                Self::with_database(db, config).await
            }
            Err(e) => Err(e),
        }
    }

    /// Build the stores on an already opened database.
    pub async fn with_database(db: Arc<Database>, config: &StoreConfig) -> Result<Self> {
        let records = RecordStore::open(db.clone(), config.catalog.clone()).await?;
        let cache = CacheStore::open(db.clone()).await?;
        let queue = MutationQueue::open(db.clone()).await?;

        Ok(Self {
            db,
            records,
            cache,
            queue,
            sweep_interval: config.sweep_interval(),
        })
    }

    pub fn records(&self) -> &RecordStore {
        &self.records
    }

    pub fn cache(&self) -> &CacheStore {
        &self.cache
    }

    pub fn queue(&self) -> &MutationQueue {
        &self.queue
    }

    /// Background cache sweep at the configured interval, for the host to
    /// spawn. `None` when sweeping is disabled.
    pub fn sweeper(&self) -> Option<impl Future<Output = ()> + Send + 'static> {
        let period = self.sweep_interval?;
        let cache = self.cache.clone();
        Some(async move { cache.run_sweeper(period).await })
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    pub fn mode(&self) -> StorageMode {
        if self.db.is_memory() {
            StorageMode::MemoryOnly
        } else {
            StorageMode::Durable
        }
    }

    /// Reason offline storage is degraded, returned once per condition.
    pub fn take_unavailable_notice(&self) -> Option<String> {
        self.db.take_unavailable_notice()
    }

    /// Erase every record, cache entry and pending mutation.
    ///
    /// Used for account deletion. Parts are cleared independently; check
    /// the report for any that failed.
    pub async fn clear_all(&self) -> ClearReport {
        let report = ClearReport {
            records: self.records.clear_all().await,
            cache: self.cache.clear().await,
            mutations: self.queue.clear().await,
        };

        if report.is_complete() {
            info!("Erased all offline data");
        } else {
            for (part, err) in report.failures() {
                warn!("Failed to erase {}: {}", part, err);
            }
        }
        report
    }
}
