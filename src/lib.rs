//! # chunkd: chunked listing over an MVCC key-value store
//!
//! chunkd serves large key ranges in bounded pages. Each page comes with an opaque
//! continuation token that pins the listing to one revision of the store, so a client
//! walking thousands of keys sees a single consistent snapshot. It provides:
//!
//! - **MVCC storage**: sled-backed store with point-in-time reads and compaction
//! - **Continuation tokens**: versioned, self-contained resume positions
//! - **Inconsistent resume**: listings survive compaction of their snapshot
//!
//! # Usage
//!
//! ```bash
//! chunkd --data-dir ./data seed --count 400
//! chunkd --data-dir ./data list --limit 40 --all
//! ```

pub mod list;
pub mod server;
pub mod storage;

// Re-export main types at crate root for convenience
pub use list::{
    ChunkedListService, ConsistencyMode, ListConfig, ListError, ListRequest, ListResponse,
    PageStatus,
};
pub use server::{ChunkdServer, ServerConfig};
pub use storage::{Backend, KeyValue, MvccStore, VersionedStore};
