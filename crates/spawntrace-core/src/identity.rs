//! External thread identity ↔ dense [`ThreadIndex`] map.
//!
//! Entries are never removed: an index stays valid for the whole run.

use std::sync::atomic::{AtomicU32, Ordering};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::{ExternalId, Result, ThreadIndex, TrackerError};

pub struct IdentityMap {
    forward: DashMap<ExternalId, ThreadIndex>,
    reverse: DashMap<ThreadIndex, ExternalId>,
    next: AtomicU32,
    capacity: usize,
}

impl IdentityMap {
    /// `capacity` bounds the number of indices handed out; it matches the
    /// counter bank so every index has a counter slot.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            forward: DashMap::new(),
            reverse: DashMap::new(),
            next: AtomicU32::new(0),
            capacity,
        }
    }

    /// Assign a fresh index the first time `id` is seen; return the same
    /// index on every later call.
    pub fn register(&self, id: ExternalId) -> Result<ThreadIndex> {
        // The vacant entry holds its shard's write lock, so two threads
        // registering the same id cannot both allocate.
        match self.forward.entry(id) {
            Entry::Occupied(e) => Ok(*e.get()),
            Entry::Vacant(v) => {
                let capacity = self.capacity;
                let raw = self
                    .next
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                        ((n as usize) < capacity).then_some(n + 1)
                    })
                    .map_err(|_| TrackerError::CapacityExceeded { capacity })?;
                let index = ThreadIndex(raw);
                v.insert(index);
                self.reverse.insert(index, id);
                Ok(index)
            }
        }
    }

    #[inline]
    pub fn resolve(&self, id: ExternalId) -> Result<ThreadIndex> {
        self.forward
            .get(&id)
            .map(|r| *r.value())
            .ok_or_else(|| TrackerError::unknown_external(id))
    }

    pub fn external_of(&self, index: ThreadIndex) -> Option<ExternalId> {
        self.reverse.get(&index).map(|r| *r.value())
    }

    pub fn len(&self) -> usize {
        self.forward.len()
    }

    pub fn is_empty(&self) -> bool {
        self.forward.is_empty()
    }

    /// All registrations ordered by index.
    pub fn entries(&self) -> Vec<(ThreadIndex, ExternalId)> {
        let mut out: Vec<_> = self
            .reverse
            .iter()
            .map(|r| (*r.key(), *r.value()))
            .collect();
        out.sort_unstable_by_key(|(idx, _)| *idx);
        out
    }
}

impl Default for IdentityMap {
    fn default() -> Self {
        Self::with_capacity(1024)
    }
}
