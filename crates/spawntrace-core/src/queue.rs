//! Per-parent FIFO of outstanding spawn calls.
//!
//! A parent pushes one marker per completed spawn call, in call order. The
//! child that starts next, on whatever thread, pops the oldest one. The
//! spawn primitive is called sequentially by its parent, so call order is
//! the only reliable pairing key; the child handle value may not even be
//! written yet when the child starts running.
//!
//! Each parent's queue has its own lock. The outer map is only touched to
//! find or create that queue, so spawns by different parents never contend.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use serde::Serialize;

use crate::snapshot::PendingBacklog;
use crate::{lock, Result, ThreadIndex, TrackerError};

/// One spawn call whose child has not been seen starting yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PendingSpawnEntry {
    /// Parent's instruction count when the spawn call was entered.
    pub requested_at: u64,
    /// 0-based position of this call among the parent's spawn calls.
    pub spawn_order: u32,
    /// Value produced by the spawn primitive, display only.
    pub child_handle: Option<u64>,
}

/// Result of pairing a started child with its parent's oldest marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatchedSpawn {
    pub entry: PendingSpawnEntry,
    /// 0-based position of this child among the parent's started children.
    pub start_order: u32,
}

#[derive(Debug, Default)]
struct SpawnQueue {
    entries: VecDeque<PendingSpawnEntry>,
    issued: u32,
    started: u32,
}

#[derive(Default)]
pub struct PendingSpawns {
    queues: DashMap<ThreadIndex, Arc<Mutex<SpawnQueue>>>,
}

impl PendingSpawns {
    pub fn new() -> Self {
        Self::default()
    }

    fn queue(&self, parent: ThreadIndex) -> Arc<Mutex<SpawnQueue>> {
        // Clone the Arc out so the shard lock is released before the queue
        // lock is taken.
        Arc::clone(&self.queues.entry(parent).or_default())
    }

    fn existing(&self, parent: ThreadIndex) -> Option<Arc<Mutex<SpawnQueue>>> {
        self.queues.get(&parent).map(|q| Arc::clone(&q))
    }

    /// Append a marker for a spawn call `parent` just completed.
    pub fn push(
        &self,
        parent: ThreadIndex,
        requested_at: u64,
        child_handle: Option<u64>,
    ) -> PendingSpawnEntry {
        let queue = self.queue(parent);
        let mut q = lock(&queue);
        let entry = PendingSpawnEntry {
            requested_at,
            spawn_order: q.issued,
            child_handle,
        };
        q.issued += 1;
        q.entries.push_back(entry);
        entry
    }

    /// Remove and return `parent`'s oldest marker.
    ///
    /// Fails immediately when the queue is empty: a child cannot run before
    /// its creating call returned, so absence means a lost event.
    pub fn pop_match(&self, parent: ThreadIndex) -> Result<MatchedSpawn> {
        let queue = self
            .existing(parent)
            .ok_or(TrackerError::NoPendingSpawn { parent })?;
        let mut q = lock(&queue);
        let entry = q
            .entries
            .pop_front()
            .ok_or(TrackerError::NoPendingSpawn { parent })?;
        let start_order = q.started;
        q.started += 1;
        Ok(MatchedSpawn { entry, start_order })
    }

    /// Consume a start-order slot for a child that had no marker, so later
    /// children of the same parent keep consistent ordering.
    pub fn note_unmatched_start(&self, parent: ThreadIndex) -> u32 {
        let queue = self.queue(parent);
        let mut q = lock(&queue);
        let start_order = q.started;
        q.started += 1;
        start_order
    }

    /// Number of markers still waiting for a child.
    pub fn outstanding(&self, parent: ThreadIndex) -> usize {
        match self.existing(parent) {
            Some(queue) => {
                let q = lock(&queue);
                q.entries.len()
            }
            None => 0,
        }
    }

    /// Non-empty queues, ordered by parent.
    pub fn backlog(&self) -> Vec<PendingBacklog> {
        let queues: Vec<_> = self
            .queues
            .iter()
            .map(|r| (*r.key(), Arc::clone(r.value())))
            .collect();

        let mut out: Vec<_> = queues
            .into_iter()
            .filter_map(|(parent, queue)| {
                let q = lock(&queue);
                (!q.entries.is_empty()).then(|| PendingBacklog {
                    parent,
                    entries: q.entries.iter().copied().collect(),
                })
            })
            .collect();
        out.sort_unstable_by_key(|b| b.parent);
        out
    }
}
