//! The store contract consumed by the list engine.
//!
//! `VersionedStore` is the narrow seam between pagination logic and the storage engine:
//! point-in-time reads that resume strictly after a key, plus the two revision
//! accessors. Compaction is only observable through `oldest_revision` and
//! `StoreError::RevisionTooOld`.

use async_trait::async_trait;
use thiserror::Error;

use crate::storage::{KeyValue, MvccStore, StorageError};

/// Errors a `VersionedStore` may return.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The requested revision has been compacted away.
    #[error("revision {requested} is too old (oldest available revision {oldest})")]
    RevisionTooOld { requested: i64, oldest: i64 },

    /// The requested revision is ahead of the latest committed revision.
    #[error("revision {requested} is not yet visible (latest revision {latest})")]
    RevisionNotYetVisible { requested: i64, latest: i64 },

    /// The store could not serve the read right now.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("storage failure: {0}")]
    Storage(StorageError),
}

impl From<StorageError> for StoreError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Compacted {
                requested,
                compacted,
            } => StoreError::RevisionTooOld {
                requested,
                oldest: compacted,
            },
            StorageError::FutureRevision { requested, current } => {
                StoreError::RevisionNotYetVisible {
                    requested,
                    latest: current,
                }
            }
            other => StoreError::Storage(other),
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// One bounded read from the store.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RangePage {
    /// Entries in ascending key order, all strictly after the requested start key.
    pub entries: Vec<KeyValue>,

    /// Whether more entries exist after the last returned one.
    pub has_more: bool,
}

/// A multi-version ordered key space readable at historical revisions.
#[async_trait]
pub trait VersionedStore: Send + Sync {
    /// Oldest revision still readable. Never decreases.
    fn oldest_revision(&self) -> i64;

    /// Most recently committed revision.
    fn latest_revision(&self) -> i64;

    /// Reads up to `limit` entries strictly after `start_after` as of `revision`.
    ///
    /// An empty `start_after` reads from the first key; `None` reads to the end.
    async fn read_range(
        &self,
        revision: i64,
        start_after: &[u8],
        limit: Option<usize>,
    ) -> StoreResult<RangePage>;

    /// Number of entries strictly after `start_after` as of `revision`, when the store can
    /// compute it cheaply. `None` means unknown.
    async fn count_after(&self, _revision: i64, _start_after: &[u8]) -> StoreResult<Option<i64>> {
        Ok(None)
    }
}

#[async_trait]
impl VersionedStore for MvccStore {
    fn oldest_revision(&self) -> i64 {
        self.compact_revision()
    }

    fn latest_revision(&self) -> i64 {
        self.current_revision()
    }

    async fn read_range(
        &self,
        revision: i64,
        start_after: &[u8],
        limit: Option<usize>,
    ) -> StoreResult<RangePage> {
        // Revision 0 would mean "current" to the MVCC layer; callers always pass an anchor.
        if revision <= 0 {
            return Err(StoreError::Storage(StorageError::InvalidArgument(format!(
                "read revision must be positive, got {}",
                revision
            ))));
        }

        let (entries, has_more) = self.read_after(start_after, revision, limit)?;
        Ok(RangePage { entries, has_more })
    }

    async fn count_after(&self, revision: i64, start_after: &[u8]) -> StoreResult<Option<i64>> {
        if revision <= 0 {
            return Ok(None);
        }
        let count = MvccStore::count_after(self, start_after, revision)?;
        Ok(Some(count as i64))
    }
}
