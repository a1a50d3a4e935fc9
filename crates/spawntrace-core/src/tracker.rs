//! The dependency tracker: orchestrates counters, identities, spawn queues
//! and records in response to thread lifecycle events.
//!
//! Every handler runs inline on the traced thread that triggered it. Per
//! thread the lifecycle is
//!
//! ```text
//! Unregistered ──start──► Running ──(enter ─► return)*──► ... ──finish──► Terminated
//! ```
//!
//! Handlers return the first protocol violation they hit. What happens to
//! the trace afterwards is fixed by the [`ErrorPolicy`] chosen at
//! construction: `Abort` latches a halted flag, `Continue` logs the fault and
//! keeps whatever part of the record could still be written.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use spawntrace_config::{
    log_tracker_debug, log_tracker_error, log_tracker_info, log_tracker_warn, TrackerConfig,
};

use crate::counter::{CounterBank, CounterHandle};
use crate::identity::IdentityMap;
use crate::queue::PendingSpawns;
use crate::record::{RecordField, RecordTable, ThreadRecord};
use crate::snapshot::{RootSummary, Snapshot, SnapshotRow};
use crate::{lock, ErrorPolicy, ExternalId, Result, ThreadIndex, TrackerError};

/// A protocol violation kept for the end-of-run report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrackerFault {
    pub event: &'static str,
    pub error: TrackerError,
}

/// What the spawn primitive reported when it returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpawnReturn {
    pub succeeded: bool,
    pub child_handle: Option<u64>,
}

impl SpawnReturn {
    pub fn ok(child_handle: u64) -> Self {
        Self {
            succeeded: true,
            child_handle: Some(child_handle),
        }
    }

    pub fn failed() -> Self {
        Self {
            succeeded: false,
            child_handle: None,
        }
    }
}

pub struct Tracker {
    policy: ErrorPolicy,
    snapshot_wait: Duration,
    counters: CounterBank,
    identities: IdentityMap,
    pending: PendingSpawns,
    records: RecordTable,
    /// Instruction count captured at spawn-call entry, until the call returns.
    call_sites: DashMap<ThreadIndex, u64>,
    /// Parentless threads and their final instruction count.
    roots: DashMap<ThreadIndex, Option<u64>>,
    /// Serializes identity registration with record insertion.
    structural: Mutex<()>,
    faults: Mutex<Vec<TrackerFault>>,
    halted: AtomicBool,
}

impl Tracker {
    pub fn new(config: &TrackerConfig) -> Self {
        log_tracker_info!(
            "Tracker ready",
            max_threads = config.max_threads,
            on_error = tracing::field::display(config.on_error)
        );
        Self {
            policy: config.on_error,
            snapshot_wait: Duration::from_millis(config.snapshot_timeout_ms),
            counters: CounterBank::with_capacity(config.max_threads),
            identities: IdentityMap::with_capacity(config.max_threads),
            pending: PendingSpawns::new(),
            records: RecordTable::new(),
            call_sites: DashMap::new(),
            roots: DashMap::new(),
            structural: Mutex::new(()),
            faults: Mutex::new(Vec::new()),
            halted: AtomicBool::new(false),
        }
    }

    /// Defaults for everything except the policy.
    pub fn with_policy(policy: ErrorPolicy) -> Self {
        Self::new(&TrackerConfig {
            on_error: policy,
            ..TrackerConfig::default()
        })
    }

    pub fn policy(&self) -> ErrorPolicy {
        self.policy
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::Acquire)
    }

    pub fn thread_index(&self, id: ExternalId) -> Result<ThreadIndex> {
        self.identities.resolve(id)
    }

    /// Counter slot of an already registered thread, for callers that count
    /// instructions without going through the identity map every time.
    pub fn counter(&self, id: ExternalId) -> Result<CounterHandle<'_>> {
        self.counters.handle(self.identities.resolve(id)?)
    }

    pub fn outstanding_spawns(&self, id: ExternalId) -> Result<usize> {
        Ok(self.pending.outstanding(self.identities.resolve(id)?))
    }

    pub fn record(&self, id: ExternalId) -> Result<ThreadRecord> {
        let idx = self.identities.resolve(id)?;
        self.records
            .get(idx)
            .ok_or_else(|| TrackerError::unknown_index(idx))
    }

    fn guard<T>(&self, event: &'static str, f: impl FnOnce() -> Result<T>) -> Result<T> {
        if self.is_halted() {
            return Err(TrackerError::Halted);
        }
        f().map_err(|error| self.fault(event, error))
    }

    fn fault(&self, event: &'static str, error: TrackerError) -> TrackerError {
        match self.policy {
            ErrorPolicy::Abort => {
                if !self.halted.swap(true, Ordering::AcqRel) {
                    log_tracker_error!(
                        "Trace halted",
                        event = event,
                        error = tracing::field::display(&error)
                    );
                }
            }
            ErrorPolicy::Continue => {
                log_tracker_warn!(
                    "Protocol violation, continuing",
                    event = event,
                    error = tracing::field::display(&error)
                );
            }
        }
        lock(&self.faults).push(TrackerFault {
            event,
            error: error.clone(),
        });
        error
    }

    /// One instruction executed by `thread`. Returns the thread's new count.
    #[inline]
    pub fn on_instruction(&self, thread: ExternalId) -> Result<u64> {
        self.on_instructions(thread, 1)
    }

    /// `n` instructions executed by `thread` since the last delivery.
    #[inline]
    pub fn on_instructions(&self, thread: ExternalId, n: u64) -> Result<u64> {
        // Hot path: one relaxed load, no logging unless the lookup fails.
        if self.halted.load(Ordering::Relaxed) {
            return Err(TrackerError::Halted);
        }
        let counted = self
            .identities
            .resolve(thread)
            .and_then(|idx| self.counters.advance_by(idx, n));
        counted.map_err(|error| self.fault("instruction", error))
    }

    /// [`Tracker::on_instructions`] for a caller that already holds its
    /// thread index. Touches nothing but the thread's own counter slot.
    #[inline]
    pub fn on_instructions_at(&self, thread: ThreadIndex, n: u64) -> Result<u64> {
        if self.halted.load(Ordering::Relaxed) {
            return Err(TrackerError::Halted);
        }
        self.counters
            .advance_by(thread, n)
            .map_err(|error| self.fault("instruction", error))
    }

    /// The spawn primitive was entered by `parent`. The child's identity is
    /// not known yet, so only the parent's count is stashed.
    pub fn on_spawn_call_enter(&self, parent: ExternalId) -> Result<()> {
        self.guard("spawn_call_enter", || {
            let p = self.identities.resolve(parent)?;
            let at = self.counters.current(p)?;
            match self.call_sites.entry(p) {
                Entry::Occupied(_) => Err(TrackerError::SpawnCallMismatch {
                    thread: p,
                    reason: "spawn call entered while another is in flight",
                }),
                Entry::Vacant(v) => {
                    v.insert(at);
                    log_tracker_debug!("Spawn call entered", parent = p.0, at = at);
                    Ok(())
                }
            }
        })
    }

    /// The spawn primitive returned on `parent`. A successful call queues a
    /// marker carrying the count captured at entry.
    pub fn on_spawn_call_return(&self, parent: ExternalId, result: SpawnReturn) -> Result<()> {
        self.guard("spawn_call_return", || {
            let p = self.identities.resolve(parent)?;
            let (_, at) = self
                .call_sites
                .remove(&p)
                .ok_or(TrackerError::SpawnCallMismatch {
                    thread: p,
                    reason: "spawn call returned without a matching entry",
                })?;
            if !result.succeeded {
                log_tracker_debug!("Spawn call failed, no child expected", parent = p.0);
                return Ok(());
            }
            let entry = self.pending.push(p, at, result.child_handle);
            log_tracker_debug!(
                "Spawn queued",
                parent = p.0,
                requested_at = at,
                spawn_order = entry.spawn_order
            );
            Ok(())
        })
    }

    /// A thread ran its first instrumented instruction. `parent` is `None`
    /// for the initial thread (or any thread not created by a traced spawn
    /// call).
    pub fn on_thread_start(
        &self,
        child: ExternalId,
        parent: Option<ExternalId>,
    ) -> Result<ThreadIndex> {
        self.guard("thread_start", || {
            let _structural = lock(&self.structural);
            let c = self.identities.register(child)?;

            let Some(parent) = parent else {
                if self.records.contains(c) || self.roots.contains_key(&c) {
                    return Err(TrackerError::DuplicateThread { thread: c });
                }
                self.roots.insert(c, None);
                log_tracker_debug!("Root thread started", thread = c.0, external = child.0);
                return Ok(c);
            };

            let p = self.identities.resolve(parent)?;
            if self.records.contains(c) || self.roots.contains_key(&c) {
                return Err(TrackerError::DuplicateThread { thread: c });
            }
            let start_count = self.counters.current(p)?;

            match self.pending.pop_match(p) {
                Ok(matched) => {
                    self.records.insert(c, ThreadRecord::spawned(p, matched))?;
                    self.records.mark_started(c, start_count)?;
                    log_tracker_debug!(
                        "Thread started",
                        thread = c.0,
                        parent = p.0,
                        spawn_call_count = matched.entry.requested_at,
                        start_count = start_count
                    );
                    Ok(c)
                }
                Err(missing) if self.policy == ErrorPolicy::Continue => {
                    // Keep what is known; the spawn count stays unset.
                    let order = self.pending.note_unmatched_start(p);
                    self.records.insert(c, ThreadRecord::orphan(p, order))?;
                    self.records.mark_started(c, start_count)?;
                    Err(missing)
                }
                Err(missing) => Err(missing),
            }
        })
    }

    /// `child` reached its end of life.
    pub fn on_thread_finish(&self, child: ExternalId) -> Result<()> {
        self.guard("thread_finish", || {
            let c = self.identities.resolve(child)?;
            let own = self.counters.current(c)?;

            if let Some(mut root) = self.roots.get_mut(&c) {
                if root.is_some() {
                    return Err(TrackerError::AlreadySet {
                        thread: c,
                        field: RecordField::SelfInstructionCount,
                    });
                }
                *root = Some(own);
                log_tracker_debug!("Root thread finished", thread = c.0, instructions = own);
                return Ok(());
            }

            let parent = self.records.parent_of(c)?;
            let parent_now = self.counters.current(parent)?;
            self.records.mark_terminated(c, parent_now, own)?;
            log_tracker_debug!(
                "Thread finished",
                thread = c.0,
                parent = parent.0,
                terminate_count = parent_now,
                instructions = own
            );
            Ok(())
        })
    }

    /// Best-effort copy of everything recorded so far. Safe to call while
    /// threads are still spawning; in-flight records are reported partially
    /// populated.
    pub fn snapshot(&self) -> Snapshot {
        let (records, contended) = self.records.snapshot(self.snapshot_wait);
        let rows = records
            .into_iter()
            .map(|(idx, record)| SnapshotRow::new(idx, record, self.identities.external_of(idx)))
            .collect();

        let mut roots: Vec<_> = self
            .roots
            .iter()
            .map(|r| RootSummary {
                index: *r.key(),
                external_id: self.identities.external_of(*r.key()),
                self_instruction_count: *r.value(),
            })
            .collect();
        roots.sort_unstable_by_key(|r| r.index);

        Snapshot {
            rows,
            roots,
            identities: self.identities.entries(),
            pending: self.pending.backlog(),
            contended,
            faults: lock(&self.faults).clone(),
            halted: self.is_halted(),
        }
    }
}

impl Default for Tracker {
    fn default() -> Self {
        Self::new(&TrackerConfig::default())
    }
}
