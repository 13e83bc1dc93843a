//! Record store: durable, catalog-typed collections with secondary lookups.
//!
//! Each collection lives in its own table holding the record as JSON.
//! Secondary indexes are SQLite expression indexes over that JSON, so they
//! are always derived from the record's own fields and never written
//! separately.

use chrono::{DateTime, Utc};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};

use offgrid_common::{Error, RecordKey, Result};

use crate::catalog::{Catalog, CollectionSpec, LAST_UPDATED_FIELD};
use crate::database::{is_constraint_violation, now_millis, quote_ident, Database};

/// A live record read back from a collection.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub key: RecordKey,
    pub last_updated: DateTime<Utc>,
    /// All stored fields, including the key and `lastUpdated`.
    pub fields: Map<String, Value>,
}

impl Record {
    /// Get a single field.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// Deserialize into a domain type.
    pub fn to_typed<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(Value::Object(self.fields.clone()))?)
    }

    /// Consume into the stored JSON object.
    pub fn into_value(self) -> Value {
        Value::Object(self.fields)
    }
}

/// Outcome of a batch write.
///
/// Valid records are committed even when others in the same batch are
/// rejected.
#[derive(Debug, Default)]
pub struct BatchReport {
    /// Keys written, in input order.
    pub written: Vec<RecordKey>,
    /// Rejected records by input position.
    pub rejected: Vec<(usize, Error)>,
}

impl BatchReport {
    /// Whether every record was written.
    pub fn is_complete(&self) -> bool {
        self.rejected.is_empty()
    }
}

/// A record validated and ready to write.
struct PreparedRecord {
    key: Option<RecordKey>,
    body: Map<String, Value>,
    stamped_at: i64,
}

/// Durable CRUD over the collections in a catalog.
#[derive(Clone)]
pub struct RecordStore {
    db: Arc<Database>,
    catalog: Arc<Catalog>,
}

impl RecordStore {
    /// Open the record store, creating missing collection tables and indexes.
    ///
    /// Idempotent; existing tables and indexes are left untouched.
    pub async fn open(db: Arc<Database>, catalog: Catalog) -> Result<Self> {
        let ddl = catalog
            .collections()
            .map(collection_ddl)
            .collect::<Vec<_>>()
            .join("\n");

        db.call("create collections", |conn| conn.execute_batch(&ddl))
            .await?;

        info!("Record store ready with {} collections", catalog.len());

        Ok(Self {
            db,
            catalog: Arc::new(catalog),
        })
    }

    /// The catalog this store was opened with.
    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// Upsert a record, stamping `lastUpdated`.
    ///
    /// Returns the record key, which for auto-increment collections may have
    /// been assigned by the store.
    ///
    /// # Errors
    /// - `InvalidRecord` if the record is not an object, lacks a usable key,
    ///   or violates a unique index
    /// - `UnknownCollection` if the collection is not in the catalog
    pub async fn put(&self, collection: &str, record: Value) -> Result<RecordKey> {
        let spec = self.catalog.get(collection)?;
        let prepared = prepare(spec, record, now_millis())?;

        let result = self
            .db
            .call("put", |conn| Ok(write_record(conn, spec, prepared)))
            .await?;

        match result {
            Ok(key) => {
                debug!("Put {}/{}", collection, key);
                Ok(key)
            }
            Err(e) => Err(self.map_write_error(collection, e)),
        }
    }

    /// Upsert a serializable value.
    pub async fn put_typed<T: Serialize>(&self, collection: &str, record: &T) -> Result<RecordKey> {
        let value = serde_json::to_value(record)
            .map_err(|e| Error::InvalidRecord(format!("cannot serialize record: {}", e)))?;
        self.put(collection, value).await
    }

    /// Upsert many records in one transaction.
    ///
    /// Malformed records are reported in the returned [`BatchReport`] and do
    /// not prevent the rest from committing. Only loss of the medium fails
    /// the whole call.
    pub async fn put_many(&self, collection: &str, records: Vec<Value>) -> Result<BatchReport> {
        let spec = self.catalog.get(collection)?;
        let now = now_millis();

        let mut report = BatchReport::default();
        let mut valid = Vec::with_capacity(records.len());
        for (position, record) in records.into_iter().enumerate() {
            match prepare(spec, record, now) {
                Ok(prepared) => valid.push((position, prepared)),
                Err(e) => {
                    warn!("Rejected record {} for {}: {}", position, collection, e);
                    report.rejected.push((position, e));
                }
            }
        }

        let results = self
            .db
            .call("put_many", |conn| {
                let tx = conn.transaction()?;
                let results: Vec<_> = valid
                    .into_iter()
                    .map(|(position, prepared)| (position, write_record(&tx, spec, prepared)))
                    .collect();
                tx.commit()?;
                Ok(results)
            })
            .await?;

        for (position, result) in results {
            match result {
                Ok(key) => report.written.push(key),
                Err(e) => {
                    let err = self.map_write_error(collection, e);
                    if err.is_storage_unavailable() {
                        return Err(err);
                    }
                    warn!("Rejected record {} for {}: {}", position, collection, err);
                    report.rejected.push((position, err));
                }
            }
        }
        report.rejected.sort_by_key(|(position, _)| *position);

        debug!(
            "Batch into {}: {} written, {} rejected",
            collection,
            report.written.len(),
            report.rejected.len()
        );
        Ok(report)
    }

    /// Get a record by key. Missing keys yield `None`.
    pub async fn get(&self, collection: &str, key: impl Into<RecordKey>) -> Result<Option<Record>> {
        let spec = self.catalog.get(collection)?;
        let Some(param) = key_param(spec, &key.into()) else {
            return Ok(None);
        };

        let sql = format!(
            "SELECT key, body, last_updated FROM {} WHERE key = ?1",
            quote_ident(&spec.table_name())
        );
        let row = self
            .db
            .call("get", |conn| {
                conn.query_row(&sql, [param], read_row).optional()
            })
            .await?;

        row.map(|row| decode(spec, row)).transpose()
    }

    /// Get a record and deserialize it.
    pub async fn get_typed<T: DeserializeOwned>(
        &self,
        collection: &str,
        key: impl Into<RecordKey>,
    ) -> Result<Option<T>> {
        match self.get(collection, key).await? {
            Some(record) => record.to_typed().map(Some),
            None => Ok(None),
        }
    }

    /// Every live record in the collection, in no particular order.
    pub async fn get_all(&self, collection: &str) -> Result<Vec<Record>> {
        let spec = self.catalog.get(collection)?;
        let sql = format!(
            "SELECT key, body, last_updated FROM {}",
            quote_ident(&spec.table_name())
        );
        self.query(spec, "get_all", sql, Vec::new()).await
    }

    /// Every live record, ordered by an index.
    pub async fn get_all_ordered_by(&self, collection: &str, index: &str) -> Result<Vec<Record>> {
        let spec = self.catalog.get(collection)?;
        let index = spec.index(index)?;
        let sql = format!(
            "SELECT key, body, last_updated FROM {} ORDER BY {}, key",
            quote_ident(&spec.table_name()),
            field_expr(&index.field)
        );
        self.query(spec, "get_all_ordered_by", sql, Vec::new()).await
    }

    /// All records whose indexed field equals `value`.
    ///
    /// # Errors
    /// - `UnknownIndex` if the index is not declared
    /// - `InvalidInput` if `value` is an array or object
    pub async fn get_by_index(
        &self,
        collection: &str,
        index: &str,
        value: &Value,
    ) -> Result<Vec<Record>> {
        let spec = self.catalog.get(collection)?;
        let index = spec.index(index)?;
        let table = quote_ident(&spec.table_name());
        let expr = field_expr(&index.field);

        let (sql, params) = match index_param(value)? {
            Some(param) => (
                format!(
                    "SELECT key, body, last_updated FROM {} WHERE {} = ?1",
                    table, expr
                ),
                vec![param],
            ),
            None => (
                format!(
                    "SELECT key, body, last_updated FROM {} WHERE {} IS NULL",
                    table, expr
                ),
                Vec::new(),
            ),
        };

        self.query(spec, "get_by_index", sql, params).await
    }

    /// Delete a record. Deleting a missing key succeeds.
    ///
    /// Returns whether a record was removed.
    pub async fn delete(&self, collection: &str, key: impl Into<RecordKey>) -> Result<bool> {
        let spec = self.catalog.get(collection)?;
        let key = key.into();
        let Some(param) = key_param(spec, &key) else {
            return Ok(false);
        };

        let sql = format!(
            "DELETE FROM {} WHERE key = ?1",
            quote_ident(&spec.table_name())
        );
        let removed = self
            .db
            .call("delete", |conn| conn.execute(&sql, [param]))
            .await?;

        debug!("Delete {}/{}: {} removed", collection, key, removed);
        Ok(removed > 0)
    }

    /// Number of live records in a collection.
    pub async fn count(&self, collection: &str) -> Result<u64> {
        let spec = self.catalog.get(collection)?;
        let sql = format!("SELECT COUNT(*) FROM {}", quote_ident(&spec.table_name()));
        let count: i64 = self
            .db
            .call("count", |conn| conn.query_row(&sql, [], |row| row.get(0)))
            .await?;
        Ok(count as u64)
    }

    /// Wipe every collection.
    ///
    /// Returns the number of records removed.
    pub async fn clear_all(&self) -> Result<usize> {
        let tables: Vec<String> = self
            .catalog
            .collections()
            .map(|spec| quote_ident(&spec.table_name()))
            .collect();

        let removed = self
            .db
            .call("clear records", |conn| {
                let tx = conn.transaction()?;
                let mut removed = 0;
                for table in &tables {
                    removed += tx.execute(&format!("DELETE FROM {}", table), [])?;
                }
                tx.commit()?;
                Ok(removed)
            })
            .await?;

        info!("Cleared {} records across {} collections", removed, tables.len());
        Ok(removed)
    }

    async fn query(
        &self,
        spec: &CollectionSpec,
        op: &str,
        sql: String,
        params: Vec<SqlValue>,
    ) -> Result<Vec<Record>> {
        let rows = self
            .db
            .call(op, |conn| {
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map(rusqlite::params_from_iter(params), read_row)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()
            })
            .await?;

        rows.into_iter().map(|row| decode(spec, row)).collect()
    }

    fn map_write_error(&self, collection: &str, err: rusqlite::Error) -> Error {
        if is_constraint_violation(&err) {
            Error::InvalidRecord(format!("{}: {}", collection, err))
        } else {
            self.db.map_error("put", err)
        }
    }
}

/// Raw row: key column, JSON body, last-updated millis.
type RawRow = (SqlValue, String, i64);

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRow> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?))
}

fn decode(spec: &CollectionSpec, (column_key, body, last_updated): RawRow) -> Result<Record> {
    let fields = match serde_json::from_str::<Value>(&body)? {
        Value::Object(map) => map,
        _ => {
            return Err(Error::Serialization(format!(
                "{}: stored record is not an object",
                spec.name
            )))
        }
    };

    let key = fields
        .get(&spec.key_field)
        .and_then(RecordKey::from_json)
        .or_else(|| match column_key {
            SqlValue::Integer(i) => Some(RecordKey::Int(i)),
            SqlValue::Text(s) => Some(RecordKey::Text(s)),
            _ => None,
        })
        .ok_or_else(|| Error::Serialization(format!("{}: stored record has no key", spec.name)))?;

    Ok(Record {
        key,
        last_updated: DateTime::<Utc>::from_timestamp_millis(last_updated).unwrap_or_default(),
        fields,
    })
}

/// Validate a record against its collection and stamp it.
fn prepare(spec: &CollectionSpec, record: Value, now: i64) -> Result<PreparedRecord> {
    let Value::Object(mut body) = record else {
        return Err(Error::InvalidRecord(format!(
            "{}: record must be a JSON object",
            spec.name
        )));
    };

    let key = match body.get(&spec.key_field) {
        None | Some(Value::Null) if spec.auto_increment => None,
        None | Some(Value::Null) => {
            return Err(Error::InvalidRecord(format!(
                "{}: missing key field '{}'",
                spec.name, spec.key_field
            )))
        }
        Some(value) => {
            let key = RecordKey::from_json(value).ok_or_else(|| {
                Error::InvalidRecord(format!(
                    "{}: key field '{}' must be a string or integer",
                    spec.name, spec.key_field
                ))
            })?;
            if spec.auto_increment && !matches!(key, RecordKey::Int(_)) {
                return Err(Error::InvalidRecord(format!(
                    "{}: auto-increment key must be an integer",
                    spec.name
                )));
            }
            Some(key)
        }
    };

    body.insert(LAST_UPDATED_FIELD.to_string(), Value::from(now));

    Ok(PreparedRecord {
        key,
        body,
        stamped_at: now,
    })
}

/// Write one prepared record. Errors are per record.
fn write_record(
    conn: &Connection,
    spec: &CollectionSpec,
    prepared: PreparedRecord,
) -> rusqlite::Result<RecordKey> {
    let table = quote_ident(&spec.table_name());
    let PreparedRecord {
        key,
        body,
        stamped_at,
    } = prepared;

    match key {
        Some(key) => {
            let param = key_param(spec, &key).unwrap_or(SqlValue::Null);
            let json = Value::Object(body).to_string();
            conn.execute(
                &format!(
                    "INSERT INTO {} (key, body, last_updated) VALUES (?1, ?2, ?3)
                     ON CONFLICT(key) DO UPDATE SET body = excluded.body, last_updated = excluded.last_updated",
                    table
                ),
                params![param, json, stamped_at],
            )?;
            Ok(key)
        }
        None => {
            // The row and its assigned key land together or not at all.
            conn.execute_batch("SAVEPOINT assign_key")?;
            match insert_with_assigned_key(conn, spec, &table, body, stamped_at) {
                Ok(id) => {
                    conn.execute_batch("RELEASE assign_key")?;
                    Ok(RecordKey::Int(id))
                }
                Err(e) => {
                    conn.execute_batch("ROLLBACK TO assign_key; RELEASE assign_key")?;
                    Err(e)
                }
            }
        }
    }
}

/// Insert the full record, then stamp the generated id into its body.
fn insert_with_assigned_key(
    conn: &Connection,
    spec: &CollectionSpec,
    table: &str,
    body: Map<String, Value>,
    stamped_at: i64,
) -> rusqlite::Result<i64> {
    conn.execute(
        &format!(
            "INSERT INTO {} (key, body, last_updated) VALUES (NULL, ?1, ?2)",
            table
        ),
        params![Value::Object(body).to_string(), stamped_at],
    )?;
    let id = conn.last_insert_rowid();
    conn.execute(
        &format!(
            "UPDATE {} SET body = json_set(body, '$.{}', ?1) WHERE key = ?1",
            table, spec.key_field
        ),
        params![id],
    )?;
    Ok(id)
}

/// Bind form of a key, or `None` if the key cannot exist in the collection.
fn key_param(spec: &CollectionSpec, key: &RecordKey) -> Option<SqlValue> {
    if spec.auto_increment {
        key.as_int().map(SqlValue::Integer)
    } else {
        Some(SqlValue::Text(key.to_string()))
    }
}

/// Bind form of an index lookup value; `None` means SQL NULL.
fn index_param(value: &Value) -> Result<Option<SqlValue>> {
    match value {
        Value::Null => Ok(None),
        Value::Bool(b) => Ok(Some(SqlValue::Integer(i64::from(*b)))),
        Value::Number(n) => match n.as_i64() {
            Some(i) => Ok(Some(SqlValue::Integer(i))),
            None => n
                .as_f64()
                .map(|f| Some(SqlValue::Real(f)))
                .ok_or_else(|| Error::InvalidInput(format!("unsupported number {}", n))),
        },
        Value::String(s) => Ok(Some(SqlValue::Text(s.clone()))),
        Value::Array(_) | Value::Object(_) => Err(Error::InvalidInput(
            "index values must be scalars".to_string(),
        )),
    }
}

fn field_expr(field: &str) -> String {
    format!("json_extract(body, '$.{}')", field)
}

fn collection_ddl(spec: &CollectionSpec) -> String {
    let table = quote_ident(&spec.table_name());
    let key_column = if spec.auto_increment {
        "key INTEGER PRIMARY KEY AUTOINCREMENT"
    } else {
        "key TEXT PRIMARY KEY NOT NULL"
    };

    let mut ddl = format!(
        "CREATE TABLE IF NOT EXISTS {} ({}, body TEXT NOT NULL, last_updated INTEGER NOT NULL);\n",
        table, key_column
    );
    for index in &spec.indexes {
        ddl.push_str(&format!(
            "CREATE {}INDEX IF NOT EXISTS {} ON {} ({});\n",
            if index.unique { "UNIQUE " } else { "" },
            quote_ident(&spec.index_name(index)),
            table,
            field_expr(&index.field)
        ));
    }
    ddl
}
