//! In-process event source for Rust programs.
//!
//! A [`Probe`] plays the instrumentation layer for code that opts in: the
//! program counts its own work through a [`ThreadContext`] and spawns
//! through [`ThreadContext::spawn`], which emits the callbacks in the order
//! a binary instrumentation layer guarantees:
//!
//! ```text
//! parent: call_enter ─► std::thread spawn ─► call_return ─► gate.send
//! child:                     gate.recv ─► thread_start ─► f(ctx) ─► thread_finish
//! ```
//!
//! The child is held on the gate channel until the parent has delivered the
//! call return, so its start can never overtake its own spawn marker.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::bounded;
use spawntrace_config::log_probe_debug;
use thiserror::Error;

use crate::dispatch::{CallResult, Dispatcher, EventSink};
use crate::{ExternalId, ThreadIndex, TrackerError};

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("tracker rejected event: {0}")]
    Tracker(#[from] TrackerError),

    #[error("failed to spawn OS thread: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("traced thread {thread} panicked")]
    Panicked { thread: ExternalId },

    #[error("traced thread {thread} was released without a spawn marker")]
    Cancelled { thread: ExternalId },

    #[error("no spawn symbol configured")]
    NoSpawnSymbol,
}

struct ProbeInner {
    dispatcher: Arc<Dispatcher>,
    site: String,
    next_id: AtomicU64,
}

#[derive(Clone)]
pub struct Probe {
    inner: Arc<ProbeInner>,
}

impl Probe {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Result<Self, ProbeError> {
        let site = dispatcher
            .spawn_symbol()
            .ok_or(ProbeError::NoSpawnSymbol)?
            .to_string();
        Ok(Self {
            inner: Arc::new(ProbeInner {
                dispatcher,
                site,
                next_id: AtomicU64::new(1),
            }),
        })
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.inner.dispatcher
    }

    fn next_id(&self) -> ExternalId {
        ExternalId(self.inner.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Register the calling thread as a parentless root.
    pub fn attach_root(&self) -> Result<ThreadContext, ProbeError> {
        let id = self.next_id();
        let ctx = self.start(id, None)?;
        log_probe_debug!("Root attached", thread = id.0, index = ctx.index.0);
        Ok(ctx)
    }

    /// Deliver the start event and resolve the thread's index once, so its
    /// instruction path never consults the identity map again.
    fn start(
        &self,
        id: ExternalId,
        parent: Option<ExternalId>,
    ) -> Result<ThreadContext, ProbeError> {
        let dispatcher = &self.inner.dispatcher;
        dispatcher.thread_started(id, parent)?;
        let index = dispatcher.tracker().thread_index(id)?;
        Ok(ThreadContext {
            probe: self.clone(),
            id,
            index,
        })
    }
}

/// Handle a traced thread uses to report its own events.
pub struct ThreadContext {
    probe: Probe,
    id: ExternalId,
    index: ThreadIndex,
}

impl ThreadContext {
    pub fn id(&self) -> ExternalId {
        self.id
    }

    pub fn index(&self) -> ThreadIndex {
        self.index
    }

    #[inline]
    pub fn step(&self) -> Result<(), ProbeError> {
        self.run(1)
    }

    /// Account for `n` units of work at once.
    #[inline]
    pub fn run(&self, n: u64) -> Result<(), ProbeError> {
        Ok(self
            .probe
            .inner
            .dispatcher
            .instructions_executed_at(self.index, n)?)
    }

    /// Spawn `f` on a new OS thread with its own context.
    ///
    /// If `f` panics the child's finish event is never delivered and the
    /// thread shows up unterminated in the report.
    pub fn spawn<F, T>(&self, f: F) -> Result<TracedHandle<T>, ProbeError>
    where
        F: FnOnce(&ThreadContext) -> T + Send + 'static,
        T: Send + 'static,
    {
        let inner = &self.probe.inner;
        let child = self.probe.next_id();
        inner
            .dispatcher
            .intercepted_call_enter(&inner.site, self.id, &[child.0])?;

        let (gate, released) = bounded::<bool>(1);
        let probe = self.probe.clone();
        let parent = self.id;
        let spawned = std::thread::Builder::new()
            .name(format!("traced-{}", child))
            .spawn(move || -> Result<T, ProbeError> {
                if !matches!(released.recv(), Ok(true)) {
                    return Err(ProbeError::Cancelled { thread: child });
                }
                let ctx = probe.start(child, Some(parent))?;
                let out = f(&ctx);
                ctx.finish()?;
                Ok(out)
            });

        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                let status = e.raw_os_error().map_or(-1, i64::from);
                inner
                    .dispatcher
                    .intercepted_call_return(&inner.site, self.id, CallResult::failed(status))?;
                return Err(ProbeError::Spawn(e));
            }
        };

        if let Err(e) =
            inner
                .dispatcher
                .intercepted_call_return(&inner.site, self.id, CallResult::ok(child.0))
        {
            // The child exits without reporting a start.
            let _ = gate.send(false);
            return Err(e.into());
        }
        // A send only fails if the child already exited, which it cannot
        // before receiving.
        let _ = gate.send(true);
        log_probe_debug!("Spawned", parent = self.id.0, child = child.0);

        Ok(TracedHandle { handle, id: child })
    }

    /// Deliver this thread's finish event. Children spawned through
    /// [`ThreadContext::spawn`] finish on their own when `f` returns.
    pub fn finish(self) -> Result<(), ProbeError> {
        Ok(self.probe.inner.dispatcher.thread_finished(self.id)?)
    }
}

pub struct TracedHandle<T> {
    handle: JoinHandle<Result<T, ProbeError>>,
    id: ExternalId,
}

impl<T> TracedHandle<T> {
    pub fn id(&self) -> ExternalId {
        self.id
    }

    pub fn join(self) -> Result<T, ProbeError> {
        self.handle
            .join()
            .map_err(|_| ProbeError::Panicked { thread: self.id })?
    }
}
