//! Thread record table: one dependency record per spawned thread.
//!
//! Inserting a record takes the table's structural write lock. Updating a
//! record that already exists only needs that record's own mutex (the
//! table lock is held for reading just long enough to clone the record's
//! `Arc`), so unrelated threads finishing at the same time do not queue
//! behind one global lock.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, RwLock, TryLockError};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::queue::MatchedSpawn;
use crate::{lock, Result, ThreadIndex, TrackerError};

/// The set-once instruction-count fields of a [`ThreadRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordField {
    SpawnCallCount,
    StartCount,
    TerminateCount,
    SelfInstructionCount,
}

impl fmt::Display for RecordField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RecordField::SpawnCallCount => "spawn_call_count",
            RecordField::StartCount => "start_count",
            RecordField::TerminateCount => "terminate_count",
            RecordField::SelfInstructionCount => "self_instruction_count",
        };
        f.write_str(name)
    }
}

/// Causal linkage and instruction-count milestones of one spawned thread.
///
/// Counts prefixed with the parent's perspective (`spawn_call_count`,
/// `start_count`, `terminate_count`) are the parent's own instruction
/// count at that moment. Every count goes from `None` to `Some` once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ThreadRecord {
    pub parent: ThreadIndex,
    pub spawn_order: Option<u32>,
    pub start_order: u32,
    pub child_handle: Option<u64>,
    pub spawn_call_count: Option<u64>,
    pub start_count: Option<u64>,
    pub terminate_count: Option<u64>,
    pub self_instruction_count: Option<u64>,
}

impl ThreadRecord {
    fn empty(parent: ThreadIndex) -> Self {
        Self {
            parent,
            spawn_order: None,
            start_order: 0,
            child_handle: None,
            spawn_call_count: None,
            start_count: None,
            terminate_count: None,
            self_instruction_count: None,
        }
    }

    /// Record for a child paired with its parent's spawn marker.
    pub fn spawned(parent: ThreadIndex, matched: MatchedSpawn) -> Self {
        Self {
            spawn_order: Some(matched.entry.spawn_order),
            start_order: matched.start_order,
            child_handle: matched.entry.child_handle,
            spawn_call_count: Some(matched.entry.requested_at),
            ..Self::empty(parent)
        }
    }

    /// Record for a child whose spawn call was never observed.
    pub fn orphan(parent: ThreadIndex, start_order: u32) -> Self {
        Self {
            start_order,
            ..Self::empty(parent)
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.terminate_count.is_some()
    }

    pub fn is_complete(&self) -> bool {
        self.spawn_call_count.is_some()
            && self.start_count.is_some()
            && self.terminate_count.is_some()
            && self.self_instruction_count.is_some()
    }
}

fn check_unset(slot: &Option<u64>, thread: ThreadIndex, field: RecordField) -> Result<()> {
    match slot {
        Some(_) => Err(TrackerError::AlreadySet { thread, field }),
        None => Ok(()),
    }
}

type Slot = Arc<Mutex<ThreadRecord>>;

#[derive(Default)]
pub struct RecordTable {
    records: RwLock<BTreeMap<ThreadIndex, Slot>>,
}

impl RecordTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, child: ThreadIndex) -> Result<Slot> {
        let records = self
            .records
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        records
            .get(&child)
            .cloned()
            .ok_or_else(|| TrackerError::unknown_index(child))
    }

    /// Insert a record for `child` spawned by `parent`.
    pub fn create(
        &self,
        child: ThreadIndex,
        parent: ThreadIndex,
        spawn_call_count: u64,
    ) -> Result<()> {
        self.insert(
            child,
            ThreadRecord {
                spawn_call_count: Some(spawn_call_count),
                ..ThreadRecord::empty(parent)
            },
        )
    }

    /// Insert a prepared record. Fails if `child` already has one.
    pub fn insert(&self, child: ThreadIndex, record: ThreadRecord) -> Result<()> {
        let mut records = self
            .records
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if records.contains_key(&child) {
            return Err(TrackerError::DuplicateThread { thread: child });
        }
        records.insert(child, Arc::new(Mutex::new(record)));
        Ok(())
    }

    pub fn contains(&self, child: ThreadIndex) -> bool {
        self.records
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .contains_key(&child)
    }

    pub fn mark_started(&self, child: ThreadIndex, start_count: u64) -> Result<()> {
        let slot = self.slot(child)?;
        let mut record = lock(&slot);
        check_unset(&record.start_count, child, RecordField::StartCount)?;
        record.start_count = Some(start_count);
        Ok(())
    }

    /// Set both termination fields together; neither is written if either
    /// was already set.
    pub fn mark_terminated(
        &self,
        child: ThreadIndex,
        terminate_count: u64,
        self_count: u64,
    ) -> Result<()> {
        let slot = self.slot(child)?;
        let mut record = lock(&slot);
        check_unset(&record.terminate_count, child, RecordField::TerminateCount)?;
        check_unset(
            &record.self_instruction_count,
            child,
            RecordField::SelfInstructionCount,
        )?;
        record.terminate_count = Some(terminate_count);
        record.self_instruction_count = Some(self_count);
        Ok(())
    }

    pub fn get(&self, child: ThreadIndex) -> Option<ThreadRecord> {
        let slot = self.slot(child).ok()?;
        let record = lock(&slot).clone();
        Some(record)
    }

    pub fn parent_of(&self, child: ThreadIndex) -> Result<ThreadIndex> {
        let slot = self.slot(child)?;
        let parent = lock(&slot).parent;
        Ok(parent)
    }

    pub fn len(&self) -> usize {
        self.records
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Point-in-time copy of every record, ordered by index.
    ///
    /// Each record is copied under its own lock. A record whose lock cannot
    /// be taken within `max_wait` is skipped and its index returned in the
    /// second vector, so a wedged thread cannot stall end-of-run reporting.
    pub fn snapshot(
        &self,
        max_wait: Duration,
    ) -> (Vec<(ThreadIndex, ThreadRecord)>, Vec<ThreadIndex>) {
        let slots: Vec<(ThreadIndex, Slot)> = self
            .records
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .iter()
            .map(|(idx, slot)| (*idx, Arc::clone(slot)))
            .collect();

        let mut copied = Vec::with_capacity(slots.len());
        let mut contended = Vec::new();
        for (idx, slot) in slots {
            match try_copy(&slot, max_wait) {
                Some(record) => copied.push((idx, record)),
                None => contended.push(idx),
            }
        }
        (copied, contended)
    }
}

fn try_copy(slot: &Mutex<ThreadRecord>, max_wait: Duration) -> Option<ThreadRecord> {
    let deadline = Instant::now() + max_wait;
    loop {
        match slot.try_lock() {
            Ok(record) => return Some(record.clone()),
            Err(TryLockError::Poisoned(poisoned)) => return Some(poisoned.into_inner().clone()),
            Err(TryLockError::WouldBlock) => {
                if Instant::now() >= deadline {
                    return None;
                }
                std::thread::yield_now();
            }
        }
    }
}
