//! Offline persistence for Offgrid.
//!
//! Everything lives in a single SQLite database:
//! - Record store: catalog-declared collections with secondary indexes
//! - Expiring cache store: memoized values with lazy expiry
//! - Pending mutation queue: ordered log of writes awaiting replay
//!
//! All operations are async and serialise on the one connection. When the
//! database cannot be opened, [`OfflineStore::open_or_memory`] keeps the
//! application running on an in-memory database instead.

pub mod cache;
pub mod catalog;
pub mod config;
pub mod database;
pub mod queue;
pub mod records;
pub mod store;

pub use cache::CacheStore;
pub use catalog::{Catalog, CollectionSpec, IndexSpec, LAST_UPDATED_FIELD};
pub use config::StoreConfig;
pub use database::{Database, Location, SCHEMA_VERSION};
pub use queue::{MutationQueue, PendingMutation};
pub use records::{BatchReport, Record, RecordStore};
pub use store::{ClearReport, OfflineStore, StorageMode};
