//! Collection catalog: the static set of collections and their indexes.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use offgrid_common::types::validate_identifier;
use offgrid_common::{CollectionName, Error, Result};

/// Field name the store stamps on every write.
pub const LAST_UPDATED_FIELD: &str = "lastUpdated";

/// Secondary index over a top-level record field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSpec {
    /// Record field the index is derived from. Also the index name.
    pub field: String,
    /// Whether two live records may share a value.
    #[serde(default)]
    pub unique: bool,
}

impl IndexSpec {
    /// Non-unique index on `field`.
    pub fn new(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            unique: false,
        }
    }

    /// Unique index on `field`.
    pub fn unique(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            unique: true,
        }
    }
}

/// Declaration of one collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionSpec {
    #[serde(rename = "collectionName")]
    pub name: CollectionName,
    /// Field holding the record key.
    pub key_field: String,
    /// Whether the store assigns integer keys to records without one.
    #[serde(default)]
    pub auto_increment: bool,
    #[serde(default)]
    pub indexes: Vec<IndexSpec>,
}

impl CollectionSpec {
    /// Declare a collection keyed by `key_field`.
    pub fn new(name: &str, key_field: &str) -> Result<Self> {
        let spec = Self {
            name: CollectionName::new(name)?,
            key_field: key_field.to_string(),
            auto_increment: false,
            indexes: Vec::new(),
        };
        spec.validate()?;
        Ok(spec)
    }

    /// Let the store assign integer keys.
    pub fn auto_increment(mut self) -> Self {
        self.auto_increment = true;
        self
    }

    /// Add a secondary index.
    pub fn with_index(mut self, index: IndexSpec) -> Result<Self> {
        self.indexes.push(index);
        self.validate()?;
        Ok(self)
    }

    /// Look up an index by name.
    pub fn index(&self, name: &str) -> Result<&IndexSpec> {
        self.indexes
            .iter()
            .find(|i| i.field == name)
            .ok_or_else(|| Error::UnknownIndex {
                collection: self.name.to_string(),
                index: name.to_string(),
            })
    }

    /// Check field names and index declarations.
    pub fn validate(&self) -> Result<()> {
        validate_identifier(&self.key_field, "Key field")?;
        if self.key_field == LAST_UPDATED_FIELD {
            return Err(Error::Config(format!(
                "{}: '{}' is managed by the store and cannot be the key",
                self.name, LAST_UPDATED_FIELD
            )));
        }

        let mut seen = HashSet::new();
        for index in &self.indexes {
            validate_identifier(&index.field, "Index field")?;
            if !seen.insert(index.field.as_str()) {
                return Err(Error::Config(format!(
                    "{}: duplicate index on '{}'",
                    self.name, index.field
                )));
            }
        }
        Ok(())
    }

    pub(crate) fn table_name(&self) -> String {
        format!("records_{}", self.name)
    }

    pub(crate) fn index_name(&self, index: &IndexSpec) -> String {
        format!("idx_{}_{}", self.name, index.field)
    }
}

/// The fixed set of collections a store is opened with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<CollectionSpec>", into = "Vec<CollectionSpec>")]
pub struct Catalog {
    collections: Vec<CollectionSpec>,
}

impl Catalog {
    /// Build a catalog, rejecting invalid or duplicate declarations.
    pub fn new(collections: Vec<CollectionSpec>) -> Result<Self> {
        let mut names = HashSet::new();
        for spec in &collections {
            spec.validate()?;
            if !names.insert(spec.name.clone()) {
                return Err(Error::Config(format!(
                    "collection '{}' declared twice",
                    spec.name
                )));
            }
        }
        Ok(Self { collections })
    }

    /// The collections used by the mobile client.
    pub fn standard() -> Self {
        let spots = CollectionSpec {
            name: builtin("spots"),
            key_field: "id".to_string(),
            auto_increment: false,
            indexes: vec![IndexSpec::new("country")],
        };
        let trips = CollectionSpec {
            name: builtin("trips"),
            key_field: "id".to_string(),
            auto_increment: false,
            indexes: Vec::new(),
        };
        let messages = CollectionSpec {
            name: builtin("messages"),
            key_field: "id".to_string(),
            auto_increment: true,
            indexes: vec![IndexSpec::new("room")],
        };
        let user_data = CollectionSpec {
            name: builtin("userData"),
            key_field: "key".to_string(),
            auto_increment: false,
            indexes: Vec::new(),
        };

        Self {
            collections: vec![spots, trips, messages, user_data],
        }
    }

    /// Look up a collection by name.
    pub fn get(&self, name: &str) -> Result<&CollectionSpec> {
        self.collections
            .iter()
            .find(|c| c.name.as_str() == name)
            .ok_or_else(|| Error::UnknownCollection(name.to_string()))
    }

    /// All declared collections.
    pub fn collections(&self) -> impl Iterator<Item = &CollectionSpec> {
        self.collections.iter()
    }

    pub fn len(&self) -> usize {
        self.collections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.collections.is_empty()
    }
}

impl Default for Catalog {
    fn default() -> Self {
        Self::standard()
    }
}

impl TryFrom<Vec<CollectionSpec>> for Catalog {
    type Error = Error;

    fn try_from(collections: Vec<CollectionSpec>) -> Result<Self> {
        Self::new(collections)
    }
}

impl From<Catalog> for Vec<CollectionSpec> {
    fn from(catalog: Catalog) -> Self {
        catalog.collections
    }
}

fn builtin(name: &str) -> CollectionName {
    CollectionName::new(name).expect("builtin collection names are identifiers")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_catalog() {
        let catalog = Catalog::standard();
        assert_eq!(catalog.len(), 4);
        assert!(catalog.get("messages").unwrap().auto_increment);
        assert!(catalog.get("spots").unwrap().index("country").is_ok());
        assert_eq!(catalog.get("userData").unwrap().key_field, "key");
    }

    #[test]
    fn test_unknown_lookups() {
        let catalog = Catalog::standard();
        assert!(matches!(
            catalog.get("badges"),
            Err(Error::UnknownCollection(_))
        ));
        assert!(matches!(
            catalog.get("trips").unwrap().index("country"),
            Err(Error::UnknownIndex { .. })
        ));
    }

    #[test]
    fn test_duplicate_declarations_rejected() {
        let a = CollectionSpec::new("spots", "id").unwrap();
        let b = CollectionSpec::new("spots", "id").unwrap();
        assert!(Catalog::new(vec![a, b]).is_err());

        let dup_index = CollectionSpec::new("spots", "id")
            .unwrap()
            .with_index(IndexSpec::new("country"))
            .unwrap()
            .with_index(IndexSpec::new("country"));
        assert!(dup_index.is_err());
    }

    #[test]
    fn test_bad_field_names_rejected() {
        assert!(CollectionSpec::new("spots", "id; --").is_err());
        assert!(CollectionSpec::new("spots", LAST_UPDATED_FIELD).is_err());
        assert!(CollectionSpec::new("spots", "id")
            .unwrap()
            .with_index(IndexSpec::new("a.b"))
            .is_err());
    }

    #[test]
    fn test_catalog_json_shape() {
        let json = serde_json::json!([
            {
                "collectionName": "spots",
                "keyField": "id",
                "indexes": [{ "field": "country" }]
            },
            {
                "collectionName": "messages",
                "keyField": "id",
                "autoIncrement": true,
                "indexes": [{ "field": "room" }]
            }
        ]);

        let catalog: Catalog = serde_json::from_value(json).unwrap();
        assert_eq!(catalog.len(), 2);
        assert!(catalog.get("messages").unwrap().auto_increment);
        assert!(!catalog.get("spots").unwrap().index("country").unwrap().unique);
    }

    #[test]
    fn test_catalog_json_rejects_duplicates() {
        let json = serde_json::json!([
            { "collectionName": "spots", "keyField": "id" },
            { "collectionName": "spots", "keyField": "id" }
        ]);
        assert!(serde_json::from_value::<Catalog>(json).is_err());
    }
}
