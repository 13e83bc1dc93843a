//! Common types used throughout Offgrid.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Longest accepted collection name.
pub const MAX_COLLECTION_NAME_LEN: usize = 64;

/// Name of a record collection (e.g. `spots`).
///
/// Collection names end up as SQL identifiers, so only ASCII letters,
/// digits and underscores are accepted, and the first character must not
/// be a digit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CollectionName(String);

impl CollectionName {
    /// Create a new CollectionName from a string.
    ///
    /// # Errors
    /// - Returns error if the name is empty, too long, or not an identifier
    pub fn new(name: impl Into<String>) -> crate::Result<Self> {
        let name = name.into();
        validate_identifier(&name, "Collection name")?;
        Ok(Self(name))
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for CollectionName {
    type Error = crate::Error;

    fn try_from(value: String) -> crate::Result<Self> {
        Self::new(value)
    }
}

impl From<CollectionName> for String {
    fn from(name: CollectionName) -> Self {
        name.0
    }
}

impl fmt::Display for CollectionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Check that `value` is usable as a SQL identifier fragment.
pub fn validate_identifier(value: &str, what: &str) -> crate::Result<()> {
    if value.is_empty() {
        return Err(crate::Error::InvalidInput(format!("{} cannot be empty", what)));
    }
    if value.len() > MAX_COLLECTION_NAME_LEN {
        return Err(crate::Error::InvalidInput(format!(
            "{} longer than {} characters: {}",
            what, MAX_COLLECTION_NAME_LEN, value
        )));
    }
    let mut chars = value.chars();
    let first_ok = chars
        .next()
        .map(|c| c.is_ascii_alphabetic() || c == '_')
        .unwrap_or(false);
    if !first_ok || !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(crate::Error::InvalidInput(format!(
            "{} must match [A-Za-z_][A-Za-z0-9_]*: {}",
            what, value
        )));
    }
    Ok(())
}

/// Key of a record within its collection.
///
/// Keyed collections use whatever the record carries in its key field;
/// auto-increment collections are keyed by the sequence number the store
/// assigns.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RecordKey {
    Int(i64),
    Text(String),
}

impl RecordKey {
    /// Extract a key from a JSON value.
    ///
    /// Only strings and integers are valid keys.
    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) if !s.is_empty() => Some(RecordKey::Text(s.clone())),
            Value::Number(n) => n.as_i64().map(RecordKey::Int),
            _ => None,
        }
    }

    /// Convert back into the JSON form stored inside the record.
    pub fn to_json(&self) -> Value {
        match self {
            RecordKey::Int(i) => Value::from(*i),
            RecordKey::Text(s) => Value::from(s.clone()),
        }
    }

    /// Integer form, if the key is or parses as an integer.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            RecordKey::Int(i) => Some(*i),
            RecordKey::Text(s) => s.parse().ok(),
        }
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordKey::Int(i) => write!(f, "{}", i),
            RecordKey::Text(s) => write!(f, "{}", s),
        }
    }
}

impl From<i64> for RecordKey {
    fn from(value: i64) -> Self {
        RecordKey::Int(value)
    }
}

impl From<i32> for RecordKey {
    fn from(value: i32) -> Self {
        RecordKey::Int(i64::from(value))
    }
}

impl From<&str> for RecordKey {
    fn from(value: &str) -> Self {
        RecordKey::Text(value.to_string())
    }
}

impl From<String> for RecordKey {
    fn from(value: String) -> Self {
        RecordKey::Text(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_collection_name_creation() {
        let name = CollectionName::new("userData").unwrap();
        assert_eq!(name.as_str(), "userData");
    }

    #[test]
    fn test_collection_name_rejects_bad_input() {
        assert!(CollectionName::new("").is_err());
        assert!(CollectionName::new("1spots").is_err());
        assert!(CollectionName::new("spots; DROP TABLE x").is_err());
        assert!(CollectionName::new("sp\"ots").is_err());
        assert!(CollectionName::new("a".repeat(MAX_COLLECTION_NAME_LEN + 1)).is_err());
    }

    #[test]
    fn test_collection_name_deserialize_validates() {
        let ok: std::result::Result<CollectionName, _> = serde_json::from_str("\"trips\"");
        assert!(ok.is_ok());
        let bad: std::result::Result<CollectionName, _> = serde_json::from_str("\"no spaces\"");
        assert!(bad.is_err());
    }

    #[test]
    fn test_record_key_from_json() {
        assert_eq!(
            RecordKey::from_json(&serde_json::json!("abc")),
            Some(RecordKey::Text("abc".to_string()))
        );
        assert_eq!(RecordKey::from_json(&serde_json::json!(42)), Some(RecordKey::Int(42)));
        assert_eq!(RecordKey::from_json(&serde_json::json!(1.5)), None);
        assert_eq!(RecordKey::from_json(&serde_json::json!("")), None);
        assert_eq!(RecordKey::from_json(&serde_json::json!(null)), None);
    }

    #[test]
    fn test_record_key_as_int() {
        assert_eq!(RecordKey::from("17").as_int(), Some(17));
        assert_eq!(RecordKey::from("spot-a").as_int(), None);
    }

    proptest! {
        #[test]
        fn identifiers_are_accepted(name in "[A-Za-z_][A-Za-z0-9_]{0,63}") {
            prop_assert!(CollectionName::new(name).is_ok());
        }

        #[test]
        fn names_with_punctuation_are_rejected(
            prefix in "[a-z]{1,8}",
            bad in "[ \"'`;.\\-]",
            suffix in "[a-z]{0,8}",
        ) {
            let name = format!("{}{}{}", prefix, bad, suffix);
            prop_assert!(CollectionName::new(name).is_err());
        }
    }
}
