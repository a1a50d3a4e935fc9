//! # spawntrace-core
//!
//! Online reconstruction of thread spawn/start/terminate causality for an
//! instrumented multi-threaded program, correlated with per-thread dynamic
//! instruction counts.
//!
//! The [`Tracker`] is shared by every traced thread and is driven inline
//! from their callbacks:
//!
//! ```text
//! instrumentation layer ──► Dispatcher (EventSink) ──► Tracker
//!                                                        ├── CounterBank     (per-thread counts)
//!                                                        ├── IdentityMap     (external id ↔ index)
//!                                                        ├── PendingSpawns   (per-parent FIFO)
//!                                                        └── RecordTable     (per-child records)
//!                                                                 │
//!                                                   snapshot() ◄──┘  at exit
//! ```
//!
//! A child is paired with its parent's spawn call by call order: the i-th
//! child of a parent that starts consumes the i-th spawn marker that parent
//! pushed, whatever order the children actually start in.

pub mod counter;
pub mod dispatch;
pub mod event;
pub mod identity;
pub mod probe;
pub mod queue;
pub mod record;
pub mod snapshot;
pub mod tracker;

pub use counter::{CounterBank, CounterHandle};
pub use dispatch::{CallResult, Dispatcher, EventSink};
pub use event::{replay, ReplayError, ReplayStats, TraceEvent};
pub use identity::IdentityMap;
pub use probe::{Probe, ProbeError, ThreadContext, TracedHandle};
pub use queue::{MatchedSpawn, PendingSpawnEntry, PendingSpawns};
pub use record::{RecordField, RecordTable, ThreadRecord};
pub use snapshot::{Gap, PendingBacklog, RootSummary, Snapshot, SnapshotRow};
pub use spawntrace_config::ErrorPolicy;
pub use tracker::{SpawnReturn, Tracker, TrackerFault};

use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Dense tracker-assigned thread index. The first parentless thread gets 0.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct ThreadIndex(pub u32);

impl ThreadIndex {
    pub const ROOT: ThreadIndex = ThreadIndex(0);

    #[inline]
    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ThreadIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Thread identity as assigned by the execution environment (OS tid,
/// instrumentation-layer id, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExternalId(pub u64);

impl fmt::Display for ExternalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Either side of the identity map, for error reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreadRef {
    External(ExternalId),
    Index(ThreadIndex),
}

impl fmt::Display for ThreadRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ThreadRef::External(id) => write!(f, "external id {}", id),
            ThreadRef::Index(idx) => write!(f, "thread index {}", idx),
        }
    }
}

/// Protocol-level failures. None of these are transient; each means an
/// event was missed or delivered twice.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TrackerError {
    #[error("unknown thread: {thread}")]
    UnknownThread { thread: ThreadRef },

    #[error("thread {thread} already has a dependency record")]
    DuplicateThread { thread: ThreadIndex },

    #[error("thread {parent} started a child with no outstanding spawn call")]
    NoPendingSpawn { parent: ThreadIndex },

    #[error("field {field} of thread {thread} is already set")]
    AlreadySet {
        thread: ThreadIndex,
        field: RecordField,
    },

    #[error("spawn call mismatch on thread {thread}: {reason}")]
    SpawnCallMismatch {
        thread: ThreadIndex,
        reason: &'static str,
    },

    #[error("instruction count of thread {thread} overflowed")]
    CounterOverflow { thread: ThreadIndex },

    #[error("thread capacity of {capacity} exceeded")]
    CapacityExceeded { capacity: usize },

    #[error("tracker halted after a fatal error")]
    Halted,
}

impl TrackerError {
    pub(crate) fn unknown_external(id: ExternalId) -> Self {
        TrackerError::UnknownThread {
            thread: ThreadRef::External(id),
        }
    }

    pub(crate) fn unknown_index(idx: ThreadIndex) -> Self {
        TrackerError::UnknownThread {
            thread: ThreadRef::Index(idx),
        }
    }
}

pub type Result<T> = std::result::Result<T, TrackerError>;

/// Every guarded value is left consistent between operations, so a panic
/// elsewhere does not invalidate it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
