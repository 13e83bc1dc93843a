//! Domain records persisted in the default collections.
//!
//! These are the shapes the application writes through the record store.
//! The store itself only sees JSON objects; the structs exist so callers can
//! use `put_typed` / `get_typed` instead of hand-building JSON.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A hitchhiking spot on the map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Spot {
    pub id: String,
    pub name: String,
    pub lat: f64,
    pub lng: f64,
    /// ISO 3166-1 alpha-2 code; indexed.
    pub country: String,
    #[serde(default)]
    pub rating: Option<f32>,
    #[serde(default)]
    pub description: Option<String>,
}

/// A trip made up of visited spots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trip {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub spot_ids: Vec<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

/// A chat message. The id is assigned by the store on first write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    /// Room the message belongs to; indexed.
    pub room: String,
    pub author: String,
    pub body: String,
    pub sent_at: DateTime<Utc>,
}

/// A user preference entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserSetting {
    pub key: String,
    pub value: serde_json::Value,
}
