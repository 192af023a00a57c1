//! Background compaction worker for the MVCC store.
//!
//! Compaction removes old revisions that are no longer needed, reclaiming disk and memory
//! space. Its only effect visible to readers is that `MvccStore::compact_revision` moves
//! forward, after which reads below it fail with `StorageError::Compacted`.
//!
//! Compaction modes:
//! - Periodic: every interval, compact everything older than the retained revision window
//! - Revision: compact once to a specific revision

use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::storage::{MvccStore, StorageError, StorageResult};

/// Compaction strategy.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CompactionMode {
    /// Periodically compact at a fixed interval
    Periodic(Duration),

    /// Compact to a specific revision (one-shot)
    Revision(i64),
}

/// Background compactor that advances the oldest readable revision.
pub struct Compactor {
    store: Arc<MvccStore>,

    mode: CompactionMode,

    /// For periodic mode: how many of the most recent revisions stay readable
    retain_revisions: i64,
}

impl Compactor {
    /// Creates a new compactor.
    pub fn new(store: Arc<MvccStore>, mode: CompactionMode, retain_revisions: i64) -> Self {
        Self {
            store,
            mode,
            retain_revisions: retain_revisions.max(0),
        }
    }

    /// Spawns a background tokio task that performs compaction.
    ///
    /// Returns a JoinHandle that can be awaited or aborted.
    pub fn run(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            match self.mode {
                CompactionMode::Periodic(interval_duration) => {
                    self.run_periodic(interval_duration).await;
                }
                CompactionMode::Revision(target_revision) => {
                    self.run_once(target_revision);
                }
            }
        })
    }

    /// The revision a periodic tick would compact to, if it would move the floor forward.
    fn periodic_target(&self) -> Option<i64> {
        let current_rev = self.store.current_revision();
        let compact_rev = self.store.compact_revision();
        let target = current_rev - self.retain_revisions;

        (target > compact_rev).then_some(target)
    }

    async fn run_periodic(&self, interval_duration: Duration) {
        let mut ticker = interval(interval_duration);

        info!(
            "Starting periodic compactor with interval: {:?}, retaining {} revisions",
            interval_duration, self.retain_revisions
        );

        loop {
            ticker.tick().await;

            let Some(target) = self.periodic_target() else {
                continue;
            };

            debug!(
                "Periodic compaction: current_rev={}, compact_rev={}, target={}",
                self.store.current_revision(),
                self.store.compact_revision(),
                target
            );

            match self.advance(target) {
                Ok(removed) => {
                    info!(
                        "Periodic compaction completed to revision {} ({} records removed)",
                        target, removed
                    );
                }
                Err(e) => {
                    warn!("Periodic compaction failed: {}", e);
                }
            }
        }
    }

    fn run_once(&self, target_revision: i64) {
        debug!("Starting one-time compaction to revision {}", target_revision);

        match self.advance(target_revision) {
            Ok(_) => {
                info!("One-time compaction completed to revision {}", target_revision);
            }
            Err(e) => {
                warn!("One-time compaction failed: {}", e);
            }
        }
    }

    /// Moves the oldest readable revision forward to `revision`.
    ///
    /// Fails with `StorageError::Compacted` unless `revision` is strictly newer than the
    /// current compact revision, and with `StorageError::FutureRevision` when it is ahead
    /// of the latest committed revision. Returns the number of history records removed.
    pub fn advance(&self, revision: i64) -> StorageResult<usize> {
        let result = self.store.compact(revision);
        if let Err(StorageError::Compacted { compacted, .. }) = &result {
            debug!(
                "Compaction to {} skipped: already compacted to {}",
                revision, compacted
            );
        }
        result
    }
}
