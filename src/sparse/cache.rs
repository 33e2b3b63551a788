//! Bounded grain cache with pinning (`spec.md` §4.E).
//!
//! The teacher has no equivalent: `read_sparse_extent` decompresses a grain
//! fresh on every access. This cache keeps at most one decompressed grain
//! buffer per `(extent_id, grain_index)` key, evicting least-recently-used
//! entries first, and refuses to evict an entry that is currently pinned
//! (held open by an in-flight read) so a read never observes a buffer being
//! evicted out from under it.

use std::collections::HashSet;
use std::num::NonZeroUsize;

use lru::LruCache;

use crate::error::{Error, RuntimeError};

pub type GrainKey = (u32, u64);

/// An LRU cache of decompressed grain buffers, guaranteeing at most one
/// decompression per access and never evicting a pinned entry.
pub struct GrainCache {
    entries: LruCache<GrainKey, Vec<u8>>,
    pinned: HashSet<GrainKey>,
}

impl GrainCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: LruCache::new(NonZeroUsize::new(capacity.max(1)).unwrap()),
            pinned: HashSet::new(),
        }
    }

    /// Returns the cached grain for `key`, if present, without affecting
    /// pin state.
    pub fn peek(&mut self, key: GrainKey) -> Option<&Vec<u8>> {
        self.entries.get(&key)
    }

    /// Inserts a freshly decompressed grain, evicting the least-recently
    /// used unpinned entry if the cache is full.
    ///
    /// Errors if the cache is full and every resident entry is pinned —
    /// the caller asked for more concurrent grain access than the cache's
    /// capacity allows.
    pub fn insert(&mut self, key: GrainKey, grain: Vec<u8>) -> Result<(), Error> {
        if self.entries.len() >= self.entries.cap().get() && !self.entries.contains(&key) {
            self.evict_one_unpinned()?;
        }
        self.entries.put(key, grain);
        Ok(())
    }

    /// Marks `key` as pinned, preventing its eviction until [`Self::unpin`]
    /// is called. No-op if the key isn't resident.
    pub fn pin(&mut self, key: GrainKey) {
        self.pinned.insert(key);
    }

    pub fn unpin(&mut self, key: GrainKey) {
        self.pinned.remove(&key);
    }

    fn evict_one_unpinned(&mut self) -> Result<(), Error> {
        let victim = self
            .entries
            .iter()
            .rev()
            .map(|(k, _)| *k)
            .find(|k| !self.pinned.contains(k));
        match victim {
            Some(key) => {
                self.entries.pop(&key);
                Ok(())
            }
            None => Err(Error::runtime(RuntimeError::ResizeFailed)),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
