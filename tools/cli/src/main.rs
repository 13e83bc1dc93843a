//! Offgrid CLI - inspect and maintain an offline store on disk.
//!
//! Useful for looking at what a client has persisted, seeding test data and
//! erasing a store.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use offgrid_common::RecordKey;
use offgrid_storage::{Location, OfflineStore, Record, StoreConfig, SCHEMA_VERSION};

#[derive(Parser)]
#[command(name = "offgrid")]
#[command(about = "Offgrid - offline store inspection and maintenance")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// Database file (overrides the config file).
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// JSON store configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the collections in the catalog.
    Collections,

    /// Insert or replace records. A JSON array writes a batch.
    Put {
        collection: String,

        /// Record (or array of records) as JSON.
        json: String,
    },

    /// Show one record.
    Get { collection: String, key: String },

    /// Show every record in a collection.
    List {
        collection: String,

        /// Order by this index instead of by key.
        #[arg(short, long)]
        order_by: Option<String>,
    },

    /// Find records by an indexed field.
    Query {
        collection: String,
        index: String,

        /// Value to match, as JSON (bare words are taken as strings).
        value: String,
    },

    /// Delete one record.
    Delete { collection: String, key: String },

    /// Inspect or edit the pending mutation queue.
    Queue {
        #[command(subcommand)]
        command: QueueCommands,
    },

    /// Inspect or edit the response cache.
    Cache {
        #[command(subcommand)]
        command: CacheCommands,
    },

    /// Show store statistics.
    Stats,

    /// Erase all records, cache entries and pending mutations.
    Erase {
        /// Do not ask for confirmation.
        #[arg(short, long)]
        yes: bool,
    },
}

#[derive(Subcommand)]
enum QueueCommands {
    /// List pending mutations in replay order.
    List,

    /// Add a mutation.
    Enqueue {
        kind: String,

        /// Payload, stored as given.
        payload: String,
    },

    /// Remove a mutation.
    Remove { id: i64 },
}

#[derive(Subcommand)]
enum CacheCommands {
    /// Show a cached value.
    Get { key: String },

    /// Cache a JSON value.
    Set {
        key: String,
        json: String,

        /// Time to live in seconds.
        #[arg(short, long, default_value = "300")]
        ttl: u64,
    },

    /// Invalidate an entry.
    Delete { key: String },

    /// Remove expired entries now.
    Sweep,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::default().add_directive(level.into()));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = load_config(&cli)?;
    let store = OfflineStore::open(&config)
        .await
        .context("Failed to open store")?;

    match cli.command {
        Commands::Collections => cmd_collections(&store).await,
        Commands::Put { collection, json } => cmd_put(&store, &collection, &json).await,
        Commands::Get { collection, key } => cmd_get(&store, &collection, &key).await,
        Commands::List {
            collection,
            order_by,
        } => cmd_list(&store, &collection, order_by.as_deref()).await,
        Commands::Query {
            collection,
            index,
            value,
        } => cmd_query(&store, &collection, &index, &value).await,
        Commands::Delete { collection, key } => cmd_delete(&store, &collection, &key).await,
        Commands::Queue { command } => cmd_queue(&store, command).await,
        Commands::Cache { command } => cmd_cache(&store, command).await,
        Commands::Stats => cmd_stats(&store).await,
        Commands::Erase { yes } => cmd_erase(&store, yes).await,
    }
}

/// Resolve the store configuration from flags.
fn load_config(cli: &Cli) -> Result<StoreConfig> {
    let mut config = match &cli.config {
        Some(path) => StoreConfig::from_json_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => StoreConfig::default(),
    };

    if let Some(db) = &cli.db {
        config.path = Some(db.clone());
    }

    if config.path.is_none() {
        anyhow::bail!("No database location; pass --db");
    }

    Ok(config)
}

/// Parse a command-line value as JSON, falling back to a plain string.
fn parse_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_records(records: Vec<Record>) -> Result<()> {
    if records.is_empty() {
        println!("No records.");
        return Ok(());
    }
    let values: Vec<Value> = records.into_iter().map(Record::into_value).collect();
    print_json(&Value::Array(values))
}

async fn cmd_collections(store: &OfflineStore) -> Result<()> {
    let records = store.records();
    for spec in records.catalog().collections() {
        let count = records.count(spec.name.as_str()).await?;
        let key = if spec.auto_increment {
            format!("{} (auto)", spec.key_field)
        } else {
            spec.key_field.clone()
        };
        let indexes: Vec<String> = spec
            .indexes
            .iter()
            .map(|i| {
                if i.unique {
                    format!("{} (unique)", i.field)
                } else {
                    i.field.clone()
                }
            })
            .collect();

        println!("{}", spec.name);
        println!("  Key: {}", key);
        if !indexes.is_empty() {
            println!("  Indexes: {}", indexes.join(", "));
        }
        println!("  Records: {}", count);
    }
    Ok(())
}

async fn cmd_put(store: &OfflineStore, collection: &str, json: &str) -> Result<()> {
    let value: Value = serde_json::from_str(json).context("Record is not valid JSON")?;

    match value {
        Value::Array(items) => {
            let total = items.len();
            let report = store.records().put_many(collection, items).await?;
            println!("Wrote {} of {} records.", report.written.len(), total);
            for (position, err) in &report.rejected {
                println!("  Rejected #{}: {}", position, err);
            }
        }
        record => {
            let key = store
                .records()
                .put(collection, record)
                .await
                .context("Failed to write record")?;
            println!("Stored {} in {}", key, collection);
        }
    }
    Ok(())
}

async fn cmd_get(store: &OfflineStore, collection: &str, key: &str) -> Result<()> {
    match store.records().get(collection, RecordKey::from(key)).await? {
        Some(record) => print_json(&record.into_value()),
        None => {
            println!("No record {} in {}.", key, collection);
            Ok(())
        }
    }
}

async fn cmd_list(store: &OfflineStore, collection: &str, order_by: Option<&str>) -> Result<()> {
    let records = match order_by {
        Some(index) => store.records().get_all_ordered_by(collection, index).await?,
        None => store.records().get_all(collection).await?,
    };
    print_records(records)
}

async fn cmd_query(store: &OfflineStore, collection: &str, index: &str, value: &str) -> Result<()> {
    let records = store
        .records()
        .get_by_index(collection, index, &parse_value(value))
        .await?;
    print_records(records)
}

async fn cmd_delete(store: &OfflineStore, collection: &str, key: &str) -> Result<()> {
    if store.records().delete(collection, RecordKey::from(key)).await? {
        println!("Deleted {} from {}.", key, collection);
    } else {
        println!("No record {} in {}.", key, collection);
    }
    Ok(())
}

async fn cmd_queue(store: &OfflineStore, command: QueueCommands) -> Result<()> {
    let queue = store.queue();
    match command {
        QueueCommands::List => {
            let pending = queue.list().await?;
            if pending.is_empty() {
                println!("Queue is empty.");
            }
            for mutation in pending {
                let payload = mutation
                    .payload_str()
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("<{} bytes>", mutation.payload.len()));
                println!(
                    "  #{} {} retries={} enqueued={} {}",
                    mutation.id,
                    mutation.kind,
                    mutation.retries,
                    mutation.enqueued_at.format("%Y-%m-%d %H:%M:%S"),
                    payload
                );
            }
        }
        QueueCommands::Enqueue { kind, payload } => {
            let id = queue.enqueue(&kind, payload.into_bytes()).await?;
            println!("Enqueued mutation #{}", id);
        }
        QueueCommands::Remove { id } => {
            if queue.remove(id).await? {
                println!("Removed mutation #{}", id);
            } else {
                println!("No mutation #{}", id);
            }
        }
    }
    Ok(())
}

async fn cmd_cache(store: &OfflineStore, command: CacheCommands) -> Result<()> {
    let cache = store.cache();
    match command {
        CacheCommands::Get { key } => match cache.get::<Value>(&key).await? {
            Some(value) => print_json(&value)?,
            None => println!("No live entry for {}.", key),
        },
        CacheCommands::Set { key, json, ttl } => {
            let value = parse_value(&json);
            cache.set(&key, &value, Duration::from_secs(ttl)).await?;
            println!("Cached {} for {}s", key, ttl);
        }
        CacheCommands::Delete { key } => {
            cache.delete(&key).await?;
            println!("Invalidated {}", key);
        }
        CacheCommands::Sweep => {
            let removed = cache.sweep_expired().await?;
            println!("Removed {} expired entries", removed);
        }
    }
    Ok(())
}

async fn cmd_stats(store: &OfflineStore) -> Result<()> {
    let db = store.database();
    let location = match db.location() {
        Location::File(path) => path.display().to_string(),
        Location::Memory => "memory".to_string(),
    };

    println!("Store: {}", location);
    println!(
        "  Schema: v{} (current v{})",
        db.schema_version().await?.unwrap_or(0),
        SCHEMA_VERSION
    );

    let records = store.records();
    for spec in records.catalog().collections() {
        println!(
            "  {}: {} records",
            spec.name,
            records.count(spec.name.as_str()).await?
        );
    }
    println!("  Cache entries: {}", store.cache().len().await?);

    let pending = store.queue().list().await?;
    let retried = pending.iter().filter(|m| m.retries > 0).count();
    println!("  Pending mutations: {} ({} retried)", pending.len(), retried);
    if let Some(oldest) = pending.first() {
        let age = chrono::Utc::now() - oldest.enqueued_at;
        println!("  Oldest pending: {} minutes ago", age.num_minutes());
    }
    Ok(())
}

async fn cmd_erase(store: &OfflineStore, yes: bool) -> Result<()> {
    if !yes {
        anyhow::bail!("Refusing to erase without --yes");
    }

    info!("Erasing offline store");
    let report = store.clear_all().await;

    for (part, result) in [
        ("Records", &report.records),
        ("Cache entries", &report.cache),
        ("Pending mutations", &report.mutations),
    ] {
        match result {
            Ok(n) => println!("  {}: {} removed", part, n),
            Err(e) => println!("  {}: FAILED ({})", part, e),
        }
    }

    if !report.is_complete() {
        anyhow::bail!("Store was only partially erased");
    }
    Ok(())
}
