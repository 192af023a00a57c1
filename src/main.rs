//! # chunkd - chunked listing over an MVCC key-value store
//!
//! Command line entry point: writes keys into a data directory, compacts it, and lists
//! it page by page with continuation tokens.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::filter::EnvFilter;

use chunkd::list::{ConsistencyMode, ListRequest, ListResponse};
use chunkd::server::{AutoCompactionMode, ChunkdServer, ServerConfig};
use chunkd::KeyValue;

/// Chunked listing over an MVCC key-value store.
///
/// chunkd serves large key ranges in bounded pages. Every page carries a continuation
/// token pinned to one store revision, so a multi-page listing reads a single snapshot.
#[derive(Parser, Debug)]
#[command(
    name = "chunkd",
    version,
    about = "Chunked listing over an MVCC key-value store"
)]
struct Args {
    /// Path to the data directory where chunkd stores all persistent data.
    #[arg(long, default_value = "default.chunkd", global = true)]
    data_dir: String,

    /// Backend page cache size in megabytes.
    #[arg(long, default_value_t = 256, global = true)]
    cache_size_mb: u64,

    /// Largest single store read while filtering with a selector.
    #[arg(long, default_value_t = 10_000, global = true)]
    max_chunk_size: usize,

    /// Auto compaction mode - 'periodic' or 'revision'.
    #[arg(long, default_value = "periodic", global = true)]
    auto_compaction_mode: String,

    /// Auto compaction retention: a duration for periodic mode, a revision count for
    /// revision mode. '0' disables auto compaction.
    #[arg(long, default_value = "0", global = true)]
    auto_compaction_retention: String,

    /// Revisions kept readable by periodic auto compaction.
    #[arg(long, default_value_t = 1000, global = true)]
    retain_revisions: i64,

    /// Report remaining_item_count on list pages.
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set, global = true)]
    remaining_item_count: bool,

    /// Log level - 'trace', 'debug', 'info', 'warn', or 'error'.
    #[arg(long, default_value = "warn", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Store a value under a key.
    Put { key: String, value: String },

    /// Read a key, optionally as of an older revision.
    Get {
        key: String,

        #[arg(long, default_value_t = 0)]
        revision: i64,
    },

    /// Delete a key.
    Delete { key: String },

    /// Write `count` keys named `<prefix>-<n>`.
    Seed {
        #[arg(long, default_value_t = 400)]
        count: usize,

        #[arg(long, default_value = "item")]
        prefix: String,
    },

    /// List keys one page at a time.
    List {
        /// Page size. Omit to list everything in one page.
        #[arg(long)]
        limit: Option<i64>,

        /// Continue token from a previous page.
        #[arg(long = "continue")]
        continue_token: Option<String>,

        /// Resource version for a fresh listing.
        #[arg(long)]
        resource_version: Option<i64>,

        /// Read exactly at --resource-version instead of treating it as a lower bound.
        #[arg(long, default_value_t = false)]
        exact: bool,

        /// Only return entries whose value equals this.
        #[arg(long)]
        value: Option<String>,

        /// Keep following continue tokens until the listing is complete.
        #[arg(long, default_value_t = false)]
        all: bool,

        /// Deadline for each page in milliseconds.
        #[arg(long)]
        timeout_ms: Option<u64>,
    },

    /// Compact history up to a revision (default: latest).
    Compact {
        #[arg(long)]
        revision: Option<i64>,
    },

    /// Show the store's revisions and key count.
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    initialize_tracing(&args.log_level)?;

    let server = ChunkdServer::new(build_server_config(&args)?)?;

    let result = run_command(&server, args.command).await;
    if let Err(e) = &result {
        error!("Command failed: {:?}", e);
    }

    server.shutdown()?;
    result
}

async fn run_command(server: &ChunkdServer, command: Command) -> anyhow::Result<()> {
    let store = server.store();

    match command {
        Command::Put { key, value } => {
            let (revision, _, _) = store.put(key.as_bytes(), value.as_bytes())?;
            println!("{}", serde_json::json!({ "revision": revision }));
        }
        Command::Get { key, revision } => {
            match store.get(key.as_bytes(), revision)? {
                Some(kv) => println!(
                    "{}",
                    serde_json::json!({
                        "key": key,
                        "value": String::from_utf8_lossy(&kv.value),
                        "create_revision": kv.create_revision,
                        "mod_revision": kv.mod_revision,
                        "version": kv.version,
                    })
                ),
                None => println!("{}", serde_json::json!({ "key": key, "found": false })),
            }
        }
        Command::Delete { key } => {
            let end = single_key_end(key.as_bytes());
            let (revision, deleted) = store.delete_range(key.as_bytes(), &end)?;
            println!(
                "{}",
                serde_json::json!({ "revision": revision, "deleted": deleted.len() })
            );
        }
        Command::Seed { count, prefix } => {
            let width = count.to_string().len();
            for i in 0..count {
                let key = format!("{}-{:0width$}", prefix, i, width = width);
                store.put(key.as_bytes(), format!("value-{}", i).as_bytes())?;
            }
            info!(count, prefix = %prefix, "Seeded keys");
            println!(
                "{}",
                serde_json::json!({ "seeded": count, "revision": store.current_revision() })
            );
        }
        Command::List {
            limit,
            continue_token,
            resource_version,
            exact,
            value,
            all,
            timeout_ms,
        } => {
            let mut request = ListRequest::new();
            request.limit = limit;
            request.continue_token = continue_token;
            if let Some(revision) = resource_version {
                let mode = if exact {
                    ConsistencyMode::ExactRevision
                } else {
                    ConsistencyMode::Any
                };
                request = request.with_resource_version(revision, mode);
            }
            if let Some(expected) = value {
                request = request.with_selector(move |kv: &KeyValue| kv.value == expected.as_bytes());
            }
            if let Some(ms) = timeout_ms {
                request = request.with_timeout(Duration::from_millis(ms));
            }

            let service = server.list_service();
            loop {
                let page = service
                    .list(request.clone())
                    .await
                    .map_err(|e| anyhow::anyhow!("list failed with status {}: {}", e.status().code, e))?;
                println!("{}", render_page(&page)?);

                match (&page.continue_token, all) {
                    (Some(token), true) => {
                        request.continue_token = Some(token.clone());
                        request.resource_version = None;
                        request.consistency = ConsistencyMode::Any;
                    }
                    _ => break,
                }
            }
        }
        Command::Compact { revision } => {
            let target = revision.unwrap_or_else(|| store.current_revision());
            let removed = store.compact(target)?;
            println!(
                "{}",
                serde_json::json!({ "compact_revision": target, "removed": removed })
            );
        }
        Command::Status => {
            println!(
                "{}",
                serde_json::json!({
                    "current_revision": store.current_revision(),
                    "compact_revision": store.compact_revision(),
                    "keys": store.key_count(),
                    "db_size_bytes": store.db_size(),
                })
            );
        }
    }

    Ok(())
}

/// Renders a page as one JSON line. Keys and values are shown as lossy UTF-8.
fn render_page(page: &ListResponse) -> anyhow::Result<String> {
    if let Some(status) = page.api_status() {
        warn!(code = status.code, "{}", status.message);
    }

    let items: Vec<_> = page
        .items
        .iter()
        .map(|kv| {
            serde_json::json!({
                "key": String::from_utf8_lossy(&kv.key),
                "value": String::from_utf8_lossy(&kv.value),
                "mod_revision": kv.mod_revision,
            })
        })
        .collect();

    Ok(serde_json::to_string(&serde_json::json!({
        "items": items,
        "resource_version": page.resource_version,
        "continue": page.continue_token,
        "remaining_item_count": page.remaining_item_count,
        "status": page.status,
        "phases": page.phases,
    }))?)
}

/// Exclusive end bound that covers exactly `key`.
fn single_key_end(key: &[u8]) -> Vec<u8> {
    let mut end = key.to_vec();
    end.push(0);
    end
}

/// Initialize the tracing/logging system with the specified log level.
fn initialize_tracing(log_level: &str) -> anyhow::Result<()> {
    let env_filter = match log_level {
        "trace" => EnvFilter::new("trace"),
        "debug" => EnvFilter::new("debug"),
        "info" => EnvFilter::new("info"),
        "warn" => EnvFilter::new("warn"),
        "error" => EnvFilter::new("error"),
        _ => {
            eprintln!("Invalid log level: {}. Using 'warn'", log_level);
            EnvFilter::new("warn")
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    Ok(())
}

/// Build ServerConfig from CLI arguments.
fn build_server_config(args: &Args) -> anyhow::Result<ServerConfig> {
    Ok(ServerConfig {
        data_dir: PathBuf::from(&args.data_dir),
        cache_size_mb: args.cache_size_mb,
        auto_compaction_mode: AutoCompactionMode::from_str(&args.auto_compaction_mode)?,
        auto_compaction_retention: args.auto_compaction_retention.clone(),
        retain_revisions: args.retain_revisions,
        max_chunk_size: args.max_chunk_size,
        remaining_item_count: args.remaining_item_count,
    })
}
