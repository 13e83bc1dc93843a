//! Common utilities and types shared across Offgrid modules.
//!
//! This module provides foundational types that are used throughout the codebase,
//! ensuring consistency and type safety.

pub mod error;
pub mod models;
pub mod types;

pub use error::{Error, Result};
pub use types::{CollectionName, RecordKey};
