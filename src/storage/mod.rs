//! Storage engine module providing MVCC (Multi-Version Concurrency Control) semantics.
//!
//! The storage module implements an etcd-style versioning and consistency model using sled
//! as the underlying key-value store:
//!
//! - Every write creates a monotonically increasing revision number
//! - Point-in-time reads at any revision not yet compacted
//! - Range reads resuming strictly after a given key, for paginated listing
//! - Background compaction that only ever moves the oldest readable revision forward
//!
//! The list engine talks to storage exclusively through the [`VersionedStore`] trait.

pub mod backend;
pub mod compaction;
pub mod index;
pub mod mvcc;
pub mod versioned;

pub use backend::{Backend, BackendConfig, BackendError, BackendResult};
pub use compaction::{CompactionMode, Compactor};
pub use index::{KeyIndex, Revision};
pub use mvcc::{KeyValue, MvccStore};
pub use versioned::{RangePage, StoreError, StoreResult, VersionedStore};

use thiserror::Error;

/// Storage engine errors.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("MVCC error: {0}")]
    Mvcc(String),

    #[error("required revision {requested} has been compacted (compact revision {compacted})")]
    Compacted { requested: i64, compacted: i64 },

    #[error("required revision {requested} is a future revision (current revision {current})")]
    FutureRevision { requested: i64, current: i64 },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

pub type StorageResult<T> = Result<T, StorageError>;
