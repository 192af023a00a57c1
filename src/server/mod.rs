//! Server bootstrap that wires the subsystems together.
//!
//! This module coordinates the initialization of:
//! - Persistent storage backend (sled-based key-value store)
//! - MVCC store (multi-version concurrency control)
//! - Background compactor
//! - Chunked list service

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::list::{ChunkedListService, ListConfig};
use crate::storage::backend::{Backend, BackendConfig};
use crate::storage::compaction::{CompactionMode, Compactor};
use crate::storage::mvcc::MvccStore;

/// How often revision-mode compaction checks the retained window.
const REVISION_COMPACTION_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// A chunkd instance: one store and the list service reading from it.
pub struct ChunkdServer {
    config: ServerConfig,
    backend: Arc<Backend>,
    store: Arc<MvccStore>,
    list_service: Arc<ChunkedListService>,
    background_tasks: Vec<JoinHandle<()>>,
}

/// Configuration for a chunkd instance.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Path to the data directory.
    pub data_dir: PathBuf,

    /// Backend page cache size in megabytes.
    pub cache_size_mb: u64,

    /// Auto compaction mode (periodic or revision).
    pub auto_compaction_mode: AutoCompactionMode,

    /// Auto compaction retention: a duration like "10m" for periodic mode, a revision
    /// count for revision mode. "0" disables auto compaction.
    pub auto_compaction_retention: String,

    /// Revisions kept readable by periodic compaction.
    pub retain_revisions: i64,

    /// Largest single store read while filtering with a selector.
    pub max_chunk_size: usize,

    /// Report `remaining_item_count` on list pages.
    pub remaining_item_count: bool,
}

/// Auto compaction mode.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AutoCompactionMode {
    /// Periodic compaction.
    Periodic,
    /// Compaction by revision.
    Revision,
}

impl AutoCompactionMode {
    /// Parse from string (etcd-compatible).
    pub fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.to_lowercase().as_str() {
            "periodic" => Ok(AutoCompactionMode::Periodic),
            "revision" => Ok(AutoCompactionMode::Revision),
            _ => Err(anyhow::anyhow!(
                "Invalid compaction mode: {}. Must be 'periodic' or 'revision'",
                s
            )),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("default.chunkd"),
            cache_size_mb: 256,
            auto_compaction_mode: AutoCompactionMode::Periodic,
            auto_compaction_retention: "0".to_string(),
            retain_revisions: 1000,
            max_chunk_size: ListConfig::default().max_chunk_size,
            remaining_item_count: true,
        }
    }
}

impl ChunkdServer {
    /// Opens the store under `config.data_dir` and starts auto compaction if enabled.
    ///
    /// Must be called from within a tokio runtime when auto compaction is on.
    pub fn new(config: ServerConfig) -> anyhow::Result<Self> {
        info!(
            data_dir = %config.data_dir.display(),
            "Initializing chunkd"
        );

        let backend_config = BackendConfig {
            data_dir: config.data_dir.clone(),
            cache_size_mb: config.cache_size_mb,
            flush_interval_ms: 1000,
            temporary: false,
        };
        let backend = Backend::new(backend_config)
            .map_err(|e| anyhow::anyhow!("Failed to initialize backend: {}", e))?;

        let store = MvccStore::new(backend.clone())
            .map_err(|e| anyhow::anyhow!("Failed to initialize MVCC store: {}", e))?;
        info!(
            current_revision = store.current_revision(),
            compact_revision = store.compact_revision(),
            "MVCC store initialized"
        );

        let list_service = Arc::new(ChunkedListService::new(
            store.clone(),
            ListConfig {
                max_chunk_size: config.max_chunk_size,
                remaining_item_count: config.remaining_item_count,
            },
        ));

        let mut server = Self {
            config,
            backend,
            store,
            list_service,
            background_tasks: Vec::new(),
        };

        if let Some((mode, retain)) = compaction_plan(
            &server.config.auto_compaction_mode,
            &server.config.auto_compaction_retention,
            server.config.retain_revisions,
        )? {
            info!(mode = ?mode, retain_revisions = retain, "Starting auto compaction");
            let handle = Compactor::new(server.store.clone(), mode, retain).run();
            server.background_tasks.push(handle);
        }

        Ok(server)
    }

    /// Get reference to the MVCC store.
    pub fn store(&self) -> Arc<MvccStore> {
        self.store.clone()
    }

    /// Get reference to the list service.
    pub fn list_service(&self) -> Arc<ChunkedListService> {
        self.list_service.clone()
    }

    /// Get the server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Stops background tasks and flushes the backend to disk.
    pub fn shutdown(self) -> anyhow::Result<()> {
        for task in &self.background_tasks {
            task.abort();
        }
        self.backend
            .flush()
            .map_err(|e| anyhow::anyhow!("Failed to flush backend: {}", e))?;
        info!("chunkd shut down");
        Ok(())
    }
}

/// Turns the auto compaction flags into a compactor mode and retained window.
///
/// Periodic mode ticks at the retention duration; revision mode keeps the newest
/// `retention` revisions and checks on a fixed interval.
fn compaction_plan(
    mode: &AutoCompactionMode,
    retention: &str,
    retain_revisions: i64,
) -> anyhow::Result<Option<(CompactionMode, i64)>> {
    let retention = retention.trim();
    if retention.is_empty() || retention == "0" {
        return Ok(None);
    }

    match mode {
        AutoCompactionMode::Periodic => {
            let interval = parse_retention_duration(retention)?;
            if interval.is_zero() {
                return Ok(None);
            }
            Ok(Some((CompactionMode::Periodic(interval), retain_revisions)))
        }
        AutoCompactionMode::Revision => {
            let keep: i64 = retention.parse().map_err(|_| {
                anyhow::anyhow!("Invalid revision retention: {}", retention)
            })?;
            if keep < 0 {
                return Err(anyhow::anyhow!("Revision retention must not be negative"));
            }
            Ok(Some((
                CompactionMode::Periodic(REVISION_COMPACTION_INTERVAL),
                keep,
            )))
        }
    }
}

/// Parses a retention duration such as "30s", "10m" or "1h". A bare number is hours.
pub fn parse_retention_duration(s: &str) -> anyhow::Result<Duration> {
    let s = s.trim();
    let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (number, unit) = s.split_at(split);

    let value: u64 = number
        .parse()
        .map_err(|_| anyhow::anyhow!("Invalid retention duration: {}", s))?;

    let multiplier = match unit {
        "" | "h" => 3600,
        "m" => 60,
        "s" => 1,
        _ => {
            warn!(retention = s, "Unknown retention unit");
            return Err(anyhow::anyhow!(
                "Invalid retention unit in {}. Use 's', 'm' or 'h'",
                s
            ));
        }
    };

    let seconds = value
        .checked_mul(multiplier)
        .ok_or_else(|| anyhow::anyhow!("Retention duration {} is too large", s))?;
    Ok(Duration::from_secs(seconds))
}
