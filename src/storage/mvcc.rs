//! Multi-Version Concurrency Control (MVCC) store.
//!
//! Every write operation increments the global revision counter, enabling:
//!
//! - Point-in-time reads at any revision that has not been compacted
//! - Stable snapshots: reading revision R always returns the same content
//! - Non-blocking concurrent reads
//!
//! The MVCC store maintains:
//! 1. The key-value data in sled, latest values in `kv` and history in `kv_rev`
//! 2. An in-memory index mapping keys to their revision history
//! 3. Current and compact revision counters, persisted in `meta`
//!
//! Writers and compaction are serialized by a single write lock. A write publishes its
//! revision only after the index has been updated, so a reader at the current revision
//! never observes a half-applied write.

use crate::storage::{Backend, KeyIndex, Revision, StorageError, StorageResult};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

const CURRENT_REVISION_KEY: &str = "current_revision";
const COMPACT_REVISION_KEY: &str = "compact_revision";

/// A key-value pair with MVCC metadata.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyValue {
    /// The actual key
    pub key: Vec<u8>,

    /// The revision when this key was created
    pub create_revision: i64,

    /// The revision when this key was last modified
    pub mod_revision: i64,

    /// Version is the number of times this key has been modified (0 marks a tombstone)
    pub version: i64,

    /// The actual value
    pub value: Vec<u8>,
}

fn read_i64(data: &[u8], offset: usize) -> StorageResult<i64> {
    data.get(offset..offset + 8)
        .and_then(|bytes| bytes.try_into().ok())
        .map(i64::from_le_bytes)
        .ok_or_else(|| StorageError::Mvcc("Invalid KeyValue encoding (truncated)".to_string()))
}

fn read_len(data: &[u8], offset: usize) -> StorageResult<usize> {
    data.get(offset..offset + 4)
        .and_then(|bytes| bytes.try_into().ok())
        .map(|bytes| u32::from_le_bytes(bytes) as usize)
        .ok_or_else(|| StorageError::Mvcc("Invalid KeyValue encoding (truncated)".to_string()))
}

impl KeyValue {
    fn is_tombstone(&self) -> bool {
        self.version == 0
    }

    /// Serializes the KeyValue for the `kv` tree (key is the tree key).
    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(28 + self.value.len());

        buf.extend_from_slice(&self.create_revision.to_le_bytes());
        buf.extend_from_slice(&self.mod_revision.to_le_bytes());
        buf.extend_from_slice(&self.version.to_le_bytes());

        buf.extend_from_slice(&(self.value.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.value);

        buf
    }

    /// Encodes the KeyValue with key included, for kv_rev tree storage.
    fn encode_with_key(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(32 + self.key.len() + self.value.len());

        buf.extend_from_slice(&self.create_revision.to_le_bytes());
        buf.extend_from_slice(&self.mod_revision.to_le_bytes());
        buf.extend_from_slice(&self.version.to_le_bytes());

        buf.extend_from_slice(&(self.key.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.key);

        buf.extend_from_slice(&(self.value.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.value);

        buf
    }

    /// Deserializes a KeyValue from kv_rev tree bytes (key embedded in value).
    fn decode_with_key(data: &[u8]) -> StorageResult<Self> {
        let create_revision = read_i64(data, 0)?;
        let mod_revision = read_i64(data, 8)?;
        let version = read_i64(data, 16)?;

        let key_len = read_len(data, 24)?;
        let key = data
            .get(28..28 + key_len)
            .ok_or_else(|| StorageError::Mvcc("Invalid KeyValue encoding (key too long)".to_string()))?
            .to_vec();

        let val_offset = 28 + key_len;
        let value_len = read_len(data, val_offset)?;
        let value = data
            .get(val_offset + 4..val_offset + 4 + value_len)
            .ok_or_else(|| {
                StorageError::Mvcc("Invalid KeyValue encoding (value too long)".to_string())
            })?
            .to_vec();

        Ok(KeyValue {
            key,
            create_revision,
            mod_revision,
            version,
            value,
        })
    }

    /// Deserializes a KeyValue from `kv` tree bytes.
    fn decode(key: Vec<u8>, data: &[u8]) -> StorageResult<Self> {
        let create_revision = read_i64(data, 0)?;
        let mod_revision = read_i64(data, 8)?;
        let version = read_i64(data, 16)?;

        let value_len = read_len(data, 24)?;
        let value = data
            .get(28..28 + value_len)
            .ok_or_else(|| StorageError::Mvcc("Invalid KeyValue encoding".to_string()))?
            .to_vec();

        Ok(KeyValue {
            key,
            create_revision,
            mod_revision,
            version,
            value,
        })
    }
}

/// The MVCC Store - the core storage engine.
pub struct MvccStore {
    backend: Arc<Backend>,

    /// Latest published revision (monotonically increasing)
    current_revision: AtomicI64,

    /// Reads below this revision fail with `StorageError::Compacted`
    compact_revision: AtomicI64,

    key_index: RwLock<KeyIndex>,

    /// Serializes writers and compaction
    write_lock: Mutex<()>,
}

impl MvccStore {
    /// Creates a new MVCC store, rebuilding the key index from the backend history.
    pub fn new(backend: Arc<Backend>) -> StorageResult<Arc<Self>> {
        info!("Initializing MVCC store");

        let mut index = KeyIndex::new();
        let mut current_revision = backend.get_counter(CURRENT_REVISION_KEY)?.unwrap_or(1);
        let compact_revision = backend.get_counter(COMPACT_REVISION_KEY)?.unwrap_or(0);

        // kv_rev keys sort by big-endian revision, so history replays in commit order.
        let history = backend.scan_all("kv_rev")?;
        for (_, data) in &history {
            let kv = KeyValue::decode_with_key(data)?;
            let revision = Revision::new(kv.mod_revision, 0);
            if kv.is_tombstone() {
                index.tombstone(&kv.key, revision);
            } else {
                index.put(&kv.key, revision);
            }
            current_revision = current_revision.max(kv.mod_revision);
        }

        let store = Arc::new(Self {
            backend,
            current_revision: AtomicI64::new(current_revision),
            compact_revision: AtomicI64::new(compact_revision),
            key_index: RwLock::new(index),
            write_lock: Mutex::new(()),
        });

        info!(
            "MVCC store initialized with revision={} compact_revision={} history_records={}",
            current_revision,
            compact_revision,
            history.len()
        );

        Ok(store)
    }

    /// Gets the current global revision.
    pub fn current_revision(&self) -> i64 {
        self.current_revision.load(Ordering::SeqCst)
    }

    /// Gets the compact revision (oldest revision still readable).
    pub fn compact_revision(&self) -> i64 {
        self.compact_revision.load(Ordering::SeqCst)
    }

    /// Builds a kv_rev tree key: `{revision_be_bytes}{key_bytes}`.
    /// Big-endian ensures natural sort order by revision.
    fn rev_key(revision: i64, key: &[u8]) -> Vec<u8> {
        let mut rk = Vec::with_capacity(8 + key.len());
        rk.extend_from_slice(&revision.to_be_bytes());
        rk.extend_from_slice(key);
        rk
    }

    /// Resolves a requested read revision (`<= 0` means current) and checks that it is
    /// servable. Must be called while holding the index read lock so compaction cannot
    /// slip in between the check and the index lookup.
    fn check_read_revision(&self, revision: i64) -> StorageResult<i64> {
        let current = self.current_revision();
        if revision <= 0 {
            return Ok(current);
        }
        if revision > current {
            return Err(StorageError::FutureRevision {
                requested: revision,
                current,
            });
        }
        let compacted = self.compact_revision();
        if revision < compacted {
            return Err(StorageError::Compacted {
                requested: revision,
                compacted,
            });
        }
        Ok(revision)
    }

    fn publish(&self, revision: i64) -> StorageResult<()> {
        self.backend.set_counter(CURRENT_REVISION_KEY, revision)?;
        self.current_revision.store(revision, Ordering::SeqCst);
        Ok(())
    }

    /// Stores a single key-value pair, returning (revision, new_kv, prev_kv).
    pub fn put(&self, key: &[u8], value: &[u8]) -> StorageResult<(i64, KeyValue, Option<KeyValue>)> {
        if key.is_empty() {
            return Err(StorageError::InvalidArgument("key must not be empty".to_string()));
        }

        let _guard = self.write_lock.lock();
        let new_revision = self.current_revision() + 1;

        let prev_kv = self
            .backend
            .get("kv", key)?
            .map(|data| KeyValue::decode(key.to_vec(), &data))
            .transpose()?;

        let kv = KeyValue {
            key: key.to_vec(),
            create_revision: prev_kv
                .as_ref()
                .map(|kv| kv.create_revision)
                .unwrap_or(new_revision),
            mod_revision: new_revision,
            version: prev_kv.as_ref().map(|kv| kv.version + 1).unwrap_or(1),
            value: value.to_vec(),
        };

        self.backend.put("kv", key, &kv.encode())?;
        self.backend
            .put("kv_rev", &Self::rev_key(new_revision, key), &kv.encode_with_key())?;

        self.key_index
            .write()
            .put(key, Revision::new(new_revision, 0));
        self.publish(new_revision)?;

        debug!("Put key {:?} at revision {}", String::from_utf8_lossy(key), new_revision);

        Ok((new_revision, kv, prev_kv))
    }

    /// Deletes the keys in `[start, end)` (empty end means unbounded), returning the
    /// revision and the deleted KeyValues. Deleting nothing does not consume a revision.
    pub fn delete_range(&self, start: &[u8], end: &[u8]) -> StorageResult<(i64, Vec<KeyValue>)> {
        let _guard = self.write_lock.lock();
        let current = self.current_revision();

        let range_keys = self.key_index.read().range(start, end, current);
        if range_keys.is_empty() {
            return Ok((current, Vec::new()));
        }

        let new_revision = current + 1;
        let mut deleted = Vec::with_capacity(range_keys.len());

        for (key, _rev) in &range_keys {
            if let Some(data) = self.backend.get("kv", key)? {
                deleted.push(KeyValue::decode(key.clone(), &data)?);
            }
            self.backend.delete("kv", key)?;

            let tombstone = KeyValue {
                key: key.clone(),
                create_revision: 0,
                mod_revision: new_revision,
                version: 0,
                value: Vec::new(),
            };
            self.backend.put(
                "kv_rev",
                &Self::rev_key(new_revision, key),
                &tombstone.encode_with_key(),
            )?;
        }

        {
            let mut index = self.key_index.write();
            for (key, _rev) in &range_keys {
                index.tombstone(key, Revision::new(new_revision, 0));
            }
        }
        self.publish(new_revision)?;

        debug!("Deleted {} keys at revision {}", deleted.len(), new_revision);

        Ok((new_revision, deleted))
    }

    /// Loads the history records for index hits read at `revision`.
    fn load(&self, revision: i64, hits: Vec<(Vec<u8>, Revision)>) -> StorageResult<Vec<KeyValue>> {
        hits.into_iter()
            .map(|(key, rev)| match self.backend.get("kv_rev", &Self::rev_key(rev.main, &key))? {
                Some(data) => KeyValue::decode_with_key(&data),
                None => {
                    // Compaction removed the record after the index lookup.
                    let compacted = self.compact_revision();
                    if revision < compacted {
                        Err(StorageError::Compacted {
                            requested: revision,
                            compacted,
                        })
                    } else {
                        Err(StorageError::Mvcc(format!(
                            "missing history record for key {:?} at revision {}",
                            String::from_utf8_lossy(&key),
                            rev.main
                        )))
                    }
                }
            })
            .collect()
    }

    /// Reads a single key as of `revision` (`<= 0` = current).
    pub fn get(&self, key: &[u8], revision: i64) -> StorageResult<Option<KeyValue>> {
        let (query_revision, hit) = {
            let index = self.key_index.read();
            let query_revision = self.check_read_revision(revision)?;
            (query_revision, index.get(key, query_revision))
        };

        let Some(rev) = hit else {
            return Ok(None);
        };
        Ok(self.load(query_revision, vec![(key.to_vec(), rev)])?.pop())
    }

    /// Reads up to `limit` keys strictly after `start_after` as of `revision`.
    ///
    /// Returns the entries in ascending key order and whether more keys exist.
    pub fn read_after(
        &self,
        start_after: &[u8],
        revision: i64,
        limit: Option<usize>,
    ) -> StorageResult<(Vec<KeyValue>, bool)> {
        let (query_revision, hits, more) = {
            let index = self.key_index.read();
            let query_revision = self.check_read_revision(revision)?;
            let (hits, more) = index.range_after(start_after, query_revision, limit);
            (query_revision, hits, more)
        };

        Ok((self.load(query_revision, hits)?, more))
    }

    /// Counts keys strictly after `start_after` as of `revision`.
    pub fn count_after(&self, start_after: &[u8], revision: i64) -> StorageResult<usize> {
        let index = self.key_index.read();
        let query_revision = self.check_read_revision(revision)?;
        Ok(index.count_after(start_after, query_revision))
    }

    /// Compacts the store: reads below `revision` become impossible and the history they
    /// alone needed is deleted. The compact revision only ever moves forward.
    pub fn compact(&self, revision: i64) -> StorageResult<usize> {
        let _guard = self.write_lock.lock();

        let current = self.current_revision();
        if revision > current {
            return Err(StorageError::FutureRevision {
                requested: revision,
                current,
            });
        }
        let compacted = self.compact_revision();
        if revision <= compacted {
            return Err(StorageError::Compacted {
                requested: revision,
                compacted,
            });
        }

        let obsolete = {
            let mut index = self.key_index.write();
            self.compact_revision.store(revision, Ordering::SeqCst);
            index.compact(revision)
        };
        self.backend.set_counter(COMPACT_REVISION_KEY, revision)?;

        let doomed: Vec<Vec<u8>> = obsolete
            .iter()
            .map(|(key, rev)| Self::rev_key(rev.main, key))
            .collect();
        self.backend.batch_delete("kv_rev", &doomed)?;

        info!(
            "Compacted MVCC store to revision {} ({} history records removed)",
            revision,
            doomed.len()
        );

        Ok(doomed.len())
    }

    /// Flushes pending writes to disk.
    pub fn flush(&self) -> StorageResult<()> {
        self.backend.flush()?;
        Ok(())
    }

    /// Number of keys the index tracks, including keys deleted after the compact point.
    pub fn key_count(&self) -> usize {
        self.key_index.read().len()
    }

    /// Approximate on-disk size of the backend in bytes.
    pub fn db_size(&self) -> u64 {
        self.backend.size()
    }
}
