//! End-of-run view of the tracker state.

use std::fmt;

use serde::Serialize;

use crate::queue::PendingSpawnEntry;
use crate::record::ThreadRecord;
use crate::tracker::TrackerFault;
use crate::{ExternalId, ThreadIndex};

/// One reported thread: `(index, parent, spawn, start, terminate, self)`
/// plus ordering and identity annotations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SnapshotRow {
    pub index: ThreadIndex,
    pub external_id: Option<ExternalId>,
    pub parent: ThreadIndex,
    pub spawn_call_count: Option<u64>,
    pub start_count: Option<u64>,
    pub terminate_count: Option<u64>,
    pub self_instruction_count: Option<u64>,
    pub spawn_order: Option<u32>,
    pub start_order: u32,
    pub child_handle: Option<u64>,
}

impl SnapshotRow {
    pub fn new(index: ThreadIndex, record: ThreadRecord, external_id: Option<ExternalId>) -> Self {
        Self {
            index,
            external_id,
            parent: record.parent,
            spawn_call_count: record.spawn_call_count,
            start_count: record.start_count,
            terminate_count: record.terminate_count,
            self_instruction_count: record.self_instruction_count,
            spawn_order: record.spawn_order,
            start_order: record.start_order,
            child_handle: record.child_handle,
        }
    }
}

/// Spawn markers a parent pushed whose children never reported starting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingBacklog {
    pub parent: ThreadIndex,
    pub entries: Vec<PendingSpawnEntry>,
}

/// A thread that started without a parent (the initial thread).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RootSummary {
    pub index: ThreadIndex,
    pub external_id: Option<ExternalId>,
    pub self_instruction_count: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub rows: Vec<SnapshotRow>,
    pub roots: Vec<RootSummary>,
    pub identities: Vec<(ThreadIndex, ExternalId)>,
    pub pending: Vec<PendingBacklog>,
    pub contended: Vec<ThreadIndex>,
    pub faults: Vec<TrackerFault>,
    pub halted: bool,
}

/// A detectable inconsistency, usually an instrumentation gap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Gap {
    /// A spawn call completed but its child was never seen starting.
    LostStart {
        parent: ThreadIndex,
        requested_at: u64,
        spawn_order: u32,
    },
    /// A child started but was never seen finishing.
    Unterminated { thread: ThreadIndex },
    /// A child started without a queued spawn call (continue mode).
    MissingSpawnCall { thread: ThreadIndex },
    /// The record was locked for longer than the snapshot would wait.
    Unreadable { thread: ThreadIndex },
}

impl fmt::Display for Gap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Gap::LostStart {
                parent,
                requested_at,
                spawn_order,
            } => write!(
                f,
                "thread {} spawn call #{} at instruction {} has no started child",
                parent, spawn_order, requested_at
            ),
            Gap::Unterminated { thread } => write!(f, "thread {} never finished", thread),
            Gap::MissingSpawnCall { thread } => {
                write!(f, "thread {} started without an observed spawn call", thread)
            }
            Gap::Unreadable { thread } => {
                write!(f, "thread {} record was busy during the snapshot", thread)
            }
        }
    }
}

impl Snapshot {
    pub fn row(&self, index: ThreadIndex) -> Option<&SnapshotRow> {
        self.rows.iter().find(|r| r.index == index)
    }

    /// Children of `parent` in spawn-call order (orphans last).
    pub fn children_of(&self, parent: ThreadIndex) -> Vec<&SnapshotRow> {
        let mut children: Vec<_> = self.rows.iter().filter(|r| r.parent == parent).collect();
        children.sort_by_key(|r| (r.spawn_order.is_none(), r.spawn_order, r.start_order));
        children
    }

    pub fn outstanding_spawns(&self, parent: ThreadIndex) -> usize {
        self.pending
            .iter()
            .find(|b| b.parent == parent)
            .map_or(0, |b| b.entries.len())
    }

    pub fn gaps(&self) -> Vec<Gap> {
        let mut gaps = Vec::new();
        for backlog in &self.pending {
            gaps.extend(backlog.entries.iter().map(|e| Gap::LostStart {
                parent: backlog.parent,
                requested_at: e.requested_at,
                spawn_order: e.spawn_order,
            }));
        }
        for row in &self.rows {
            if row.spawn_call_count.is_none() {
                gaps.push(Gap::MissingSpawnCall { thread: row.index });
            }
            if row.terminate_count.is_none() {
                gaps.push(Gap::Unterminated { thread: row.index });
            }
        }
        gaps.extend(
            self.contended
                .iter()
                .map(|t| Gap::Unreadable { thread: *t }),
        );
        gaps
    }

    pub fn is_consistent(&self) -> bool {
        self.faults.is_empty() && self.gaps().is_empty()
    }
}
