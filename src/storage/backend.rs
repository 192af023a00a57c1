//! Sled-backed persistent storage backend.
//!
//! The backend is a thin layer over sled trees. It knows nothing about revisions; the MVCC
//! layer above decides what goes where:
//!
//! - `kv`: latest value per key (used to derive versions and previous values on write)
//! - `kv_rev`: revision-indexed history, key format `{revision_be_bytes}{key_bytes}`
//! - `meta`: revision counters persisted across restarts

use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

/// Backend storage errors.
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("Sled error: {0}")]
    SledError(#[from] sled::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Tree not found: {0}")]
    TreeNotFound(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

pub type BackendResult<T> = Result<T, BackendError>;

/// Configuration for the backend storage.
#[derive(Clone, Debug)]
pub struct BackendConfig {
    /// Path to the data directory where sled stores all files.
    pub data_dir: PathBuf,

    /// Maximum page cache size in megabytes.
    pub cache_size_mb: u64,

    /// Flush interval in milliseconds. How often sled flushes dirty pages to disk.
    pub flush_interval_ms: u64,

    /// Run sled in temporary mode (data removed on drop). Used by tests and benches.
    pub temporary: bool,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            cache_size_mb: 256,
            flush_interval_ms: 1000,
            temporary: false,
        }
    }
}

/// The persistent storage backend using sled.
pub struct Backend {
    db: sled::Db,

    /// Latest value per key
    kv_tree: sled::Tree,

    /// Revision-indexed history for point-in-time reads
    kv_rev_tree: sled::Tree,

    /// Revision counters
    meta_tree: sled::Tree,
}

impl Backend {
    /// Opens (or creates) the backend at the configured data directory.
    pub fn new(config: BackendConfig) -> BackendResult<Arc<Self>> {
        debug!("Initializing storage backend at {:?}", config.data_dir);

        std::fs::create_dir_all(&config.data_dir)?;

        let db = sled::Config::new()
            .path(&config.data_dir)
            .cache_capacity(config.cache_size_mb * 1024 * 1024)
            .flush_every_ms(Some(config.flush_interval_ms))
            .temporary(config.temporary)
            .open()
            .map_err(|e| {
                BackendError::ConfigError(format!("Failed to open sled database: {}", e))
            })?;

        let kv_tree = db.open_tree("kv")?;
        let kv_rev_tree = db.open_tree("kv_rev")?;
        let meta_tree = db.open_tree("meta")?;

        info!(
            "Storage backend initialized with cache_size={}MB, flush_interval={}ms",
            config.cache_size_mb, config.flush_interval_ms
        );

        Ok(Arc::new(Self {
            db,
            kv_tree,
            kv_rev_tree,
            meta_tree,
        }))
    }

    fn get_tree(&self, tree_name: &str) -> BackendResult<&sled::Tree> {
        match tree_name {
            "kv" => Ok(&self.kv_tree),
            "kv_rev" => Ok(&self.kv_rev_tree),
            "meta" => Ok(&self.meta_tree),
            _ => Err(BackendError::TreeNotFound(tree_name.to_string())),
        }
    }

    /// Stores a key-value pair in the specified tree.
    pub fn put(&self, tree_name: &str, key: &[u8], value: &[u8]) -> BackendResult<()> {
        let tree = self.get_tree(tree_name)?;
        tree.insert(key, value)?;
        Ok(())
    }

    /// Retrieves a value by key from the specified tree.
    pub fn get(&self, tree_name: &str, key: &[u8]) -> BackendResult<Option<Vec<u8>>> {
        let tree = self.get_tree(tree_name)?;
        Ok(tree.get(key)?.map(|v| v.to_vec()))
    }

    /// Deletes a key from the specified tree.
    pub fn delete(&self, tree_name: &str, key: &[u8]) -> BackendResult<()> {
        let tree = self.get_tree(tree_name)?;
        tree.remove(key)?;
        Ok(())
    }

    /// Performs a batch delete of multiple keys atomically.
    pub fn batch_delete(&self, tree_name: &str, keys: &[Vec<u8>]) -> BackendResult<()> {
        let tree = self.get_tree(tree_name)?;
        let mut batch = sled::Batch::default();

        for key in keys {
            batch.remove(key.as_slice());
        }

        tree.apply_batch(batch)?;
        Ok(())
    }

    /// Returns every key-value pair of a tree in key order.
    pub fn scan_all(&self, tree_name: &str) -> BackendResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let tree = self.get_tree(tree_name)?;
        let mut results = Vec::new();

        for item in tree.iter() {
            let (k, v) = item?;
            results.push((k.to_vec(), v.to_vec()));
        }

        Ok(results)
    }

    /// Reads a persisted i64 counter from the meta tree.
    pub fn get_counter(&self, name: &str) -> BackendResult<Option<i64>> {
        Ok(self.meta_tree.get(name.as_bytes())?.and_then(|v| {
            let bytes: [u8; 8] = v.as_ref().try_into().ok()?;
            Some(i64::from_be_bytes(bytes))
        }))
    }

    /// Persists an i64 counter to the meta tree.
    pub fn set_counter(&self, name: &str, value: i64) -> BackendResult<()> {
        self.meta_tree.insert(name.as_bytes(), &value.to_be_bytes())?;
        Ok(())
    }

    /// Returns the approximate total size of the database in bytes.
    pub fn size(&self) -> u64 {
        self.db.size_on_disk().unwrap_or(0)
    }

    /// Flushes all pending writes to disk.
    pub fn flush(&self) -> BackendResult<()> {
        self.db.flush()?;
        Ok(())
    }
}
