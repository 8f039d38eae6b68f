//! Cache of tokenized media, keyed by media identity.
//!
//! Loading and encoding an image is expensive, and the same image usually
//! appears in every turn once it enters the conversation. The cache keeps
//! the encoded chunk group around so later renders reuse the exact same
//! [`ChunkRef`]s.
//!
//! Eviction is coarse: when an insert would exceed capacity the whole cache
//! is cleared first. Entries are also released explicitly when the message
//! that referenced them is pruned.

use super::ChunkRef;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Default number of media identities kept.
pub const DEFAULT_MEDIA_CACHE_CAPACITY: usize = 16;

/// The ordered chunks a single media reference expands into (delimiter text
/// plus the media unit itself).
pub type MediaGroup = Arc<[ChunkRef]>;

/// Identity-keyed store of encoded media.
#[derive(Debug)]
pub struct MediaChunkCache {
    entries: HashMap<String, MediaGroup>,
    capacity: usize,
    hits: u64,
    misses: u64,
    clears: u64,
}

impl MediaChunkCache {
    /// Create a cache holding at most `capacity` identities (minimum 1).
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            capacity: capacity.max(1),
            hits: 0,
            misses: 0,
            clears: 0,
        }
    }

    /// Return the cached group for `identity`, or run `producer` and store
    /// its result.
    ///
    /// This is the only way entries get added. Producer errors are returned
    /// untouched and leave the cache unchanged.
    pub fn lookup_or_insert_media<E>(
        &mut self,
        identity: &str,
        producer: impl FnOnce() -> Result<Vec<ChunkRef>, E>,
    ) -> Result<MediaGroup, E> {
        if let Some(group) = self.entries.get(identity) {
            self.hits += 1;
            return Ok(Arc::clone(group));
        }
        self.misses += 1;

        let group: MediaGroup = producer()?.into();

        if self.entries.len() >= self.capacity {
            debug!(
                "Media cache full ({} entries), clearing before inserting '{identity}'",
                self.entries.len()
            );
            self.entries.clear();
            self.clears += 1;
        }
        self.entries.insert(identity.to_string(), Arc::clone(&group));
        Ok(group)
    }

    pub fn contains(&self, identity: &str) -> bool {
        self.entries.contains_key(identity)
    }

    /// Drop the entry for `identity`. Returns whether one existed.
    ///
    /// Chunks still referenced by a live sequence stay alive until that
    /// sequence is dropped.
    pub fn release(&mut self, identity: &str) -> bool {
        self.entries.remove(identity).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn hits(&self) -> u64 {
        self.hits
    }

    pub fn misses(&self) -> u64 {
        self.misses
    }

    /// Number of full clears caused by overflow.
    pub fn overflow_clears(&self) -> u64 {
        self.clears
    }

    /// Hit rate as a fraction (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

impl Default for MediaChunkCache {
    fn default() -> Self {
        Self::new(DEFAULT_MEDIA_CACHE_CAPACITY)
    }
}
