//! In-memory key index for MVCC (equivalent to etcd's treeIndex).
//!
//! The KeyIndex maintains a BTreeMap of all keys to their revision history.
//! This allows efficient point-in-time reads and range queries at specific revisions.
//!
//! Key design:
//! - Uses generations to track the lifecycle of keys (created, updated, deleted)
//! - Each generation contains a list of revisions where modifications occurred
//! - Supports fast lookups of "key at revision N"
//! - Compaction removes revisions no longer visible at or after the compact point and
//!   reports them so the backend can drop the matching history records

use std::collections::BTreeMap;
use std::ops::Bound;
use tracing::debug;

/// Represents a specific revision (main, sub).
/// In etcd, main is the global revision counter, sub is the operation within that revision.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Revision {
    /// Main revision number (global counter)
    pub main: i64,
    /// Sub-revision (operation index within a main revision)
    pub sub: i64,
}

impl Revision {
    pub fn new(main: i64, sub: i64) -> Self {
        Self { main, sub }
    }
}

/// A single generation of a key's lifecycle.
///
/// A generation starts when a key is created and ends when it's deleted.
#[derive(Clone, Debug)]
struct Generation {
    created: Revision,

    /// All revisions where this key was modified (including creation)
    revisions: Vec<Revision>,

    /// The revision when this generation was deleted (None if still alive)
    deleted: Option<Revision>,
}

impl Generation {
    fn is_alive_at(&self, revision: i64) -> bool {
        self.created.main <= revision && self.deleted.map_or(true, |del| del.main > revision)
    }
}

#[derive(Clone, Debug, Default)]
struct KeyIndexEntry {
    generations: Vec<Generation>,
}

impl KeyIndexEntry {
    /// Gets the revision of this key visible at the given revision, if the key was alive.
    fn visible_at(&self, revision: i64) -> Option<Revision> {
        let gen = self.generations.iter().find(|gen| gen.is_alive_at(revision))?;
        gen.revisions.iter().rfind(|r| r.main <= revision).copied()
    }

    fn live_generation_mut(&mut self) -> Option<&mut Generation> {
        self.generations
            .last_mut()
            .filter(|gen| gen.deleted.is_none())
    }
}

/// The in-memory key index for MVCC operations.
pub struct KeyIndex {
    tree: BTreeMap<Vec<u8>, KeyIndexEntry>,
}

impl KeyIndex {
    /// Creates a new empty key index.
    pub fn new() -> Self {
        Self {
            tree: BTreeMap::new(),
        }
    }

    /// Gets the revision of a key at a specific point in time.
    ///
    /// Returns None if the key didn't exist at that revision.
    pub fn get(&self, key: &[u8], revision: i64) -> Option<Revision> {
        self.tree.get(key)?.visible_at(revision)
    }

    /// Records a new modification (write) of a key.
    ///
    /// If the key has no live generation, a new one is started.
    pub fn put(&mut self, key: &[u8], revision: Revision) {
        let entry = self.tree.entry(key.to_vec()).or_default();

        match entry.live_generation_mut() {
            Some(gen) => gen.revisions.push(revision),
            None => entry.generations.push(Generation {
                created: revision,
                revisions: vec![revision],
                deleted: None,
            }),
        }

        debug!(
            "Index: put key {:?} at revision {:?}",
            String::from_utf8_lossy(key),
            revision
        );
    }

    /// Records a deletion of a key. Keys without a live generation are left untouched.
    pub fn tombstone(&mut self, key: &[u8], revision: Revision) {
        if let Some(gen) = self
            .tree
            .get_mut(key)
            .and_then(KeyIndexEntry::live_generation_mut)
        {
            gen.deleted = Some(revision);
            debug!(
                "Index: tombstone key {:?} at revision {:?}",
                String::from_utf8_lossy(key),
                revision
            );
        }
    }

    /// Returns all keys (and their revisions) with `start <= key < end` alive at `revision`.
    ///
    /// An empty `end` means unbounded.
    pub fn range(&self, start: &[u8], end: &[u8], revision: i64) -> Vec<(Vec<u8>, Revision)> {
        let range_iter = if end.is_empty() {
            self.tree.range(start.to_vec()..)
        } else {
            self.tree.range(start.to_vec()..end.to_vec())
        };

        range_iter
            .filter_map(|(key, entry)| entry.visible_at(revision).map(|rev| (key.clone(), rev)))
            .collect()
    }

    fn alive_after<'a>(
        &'a self,
        start_after: &[u8],
        revision: i64,
    ) -> impl Iterator<Item = (&'a Vec<u8>, Revision)> + 'a {
        let lower = if start_after.is_empty() {
            Bound::Unbounded
        } else {
            Bound::Excluded(start_after.to_vec())
        };

        self.tree
            .range((lower, Bound::Unbounded))
            .filter_map(move |(key, entry)| entry.visible_at(revision).map(|rev| (key, rev)))
    }

    /// Returns up to `limit` keys strictly after `start_after` that were alive at `revision`,
    /// plus whether at least one more such key exists.
    ///
    /// An empty `start_after` starts from the first key. A `None` limit reads to the end.
    pub fn range_after(
        &self,
        start_after: &[u8],
        revision: i64,
        limit: Option<usize>,
    ) -> (Vec<(Vec<u8>, Revision)>, bool) {
        let mut results = Vec::new();

        for (key, rev) in self.alive_after(start_after, revision) {
            if limit.map_or(false, |limit| results.len() >= limit) {
                return (results, true);
            }
            results.push((key.clone(), rev));
        }

        (results, false)
    }

    /// Counts the keys strictly after `start_after` that were alive at `revision`.
    pub fn count_after(&self, start_after: &[u8], revision: i64) -> usize {
        self.alive_after(start_after, revision).count()
    }

    /// Compacts the index at `compact_revision`.
    ///
    /// Afterwards every read at a revision `>= compact_revision` still resolves, while
    /// revisions that were only visible below that point are removed. Returns the removed
    /// `(key, revision)` pairs, including tombstones of generations that ended at or before
    /// the compact point.
    pub fn compact(&mut self, compact_revision: i64) -> Vec<(Vec<u8>, Revision)> {
        let mut obsolete = Vec::new();

        self.tree.retain(|key, entry| {
            entry.generations.retain_mut(|gen| {
                if let Some(deleted) = gen.deleted.filter(|del| del.main <= compact_revision) {
                    obsolete.extend(gen.revisions.iter().map(|rev| (key.clone(), *rev)));
                    obsolete.push((key.clone(), deleted));
                    return false;
                }

                // Keep the newest revision at or below the compact point; it is still the
                // visible value for reads at the compact revision.
                let below = gen
                    .revisions
                    .iter()
                    .filter(|rev| rev.main <= compact_revision)
                    .count();
                if below > 1 {
                    obsolete.extend(
                        gen.revisions
                            .drain(..below - 1)
                            .map(|rev| (key.clone(), rev)),
                    );
                }
                true
            });

            !entry.generations.is_empty()
        });

        debug!(
            "Index: compacted at revision {} ({} obsolete revisions)",
            compact_revision,
            obsolete.len()
        );

        obsolete
    }

    /// Returns the total number of keys tracked by the index, live or not.
    pub fn len(&self) -> usize {
        self.tree.len()
    }

    /// Checks if the index is empty.
    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }
}

impl Default for KeyIndex {
    fn default() -> Self {
        Self::new()
    }
}
