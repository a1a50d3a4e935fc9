//! Callback surface consumed from the instrumentation layer.
//!
//! The layer delivers five callbacks per traced thread, in true temporal
//! order per thread and with no ordering guarantee across threads. The
//! [`Dispatcher`] maps them onto the [`Tracker`] handlers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use spawntrace_config::{log_dispatch_debug, log_dispatch_warn, HookConfig};

use crate::snapshot::Snapshot;
use crate::tracker::{SpawnReturn, Tracker};
use crate::{ExternalId, Result, ThreadIndex};

/// What an intercepted call returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallResult {
    /// Status code of the call; 0 means success for the spawn primitive.
    pub status: i64,
    /// Value produced through the call's output argument, read after the
    /// call returned (the child handle for a spawn call).
    pub value: Option<u64>,
}

impl CallResult {
    pub fn ok(value: u64) -> Self {
        Self {
            status: 0,
            value: Some(value),
        }
    }

    pub fn failed(status: i64) -> Self {
        Self {
            status,
            value: None,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.status == 0
    }
}

/// Receiver for instrumentation-layer callbacks.
///
/// Every method runs inline on the thread the event belongs to.
pub trait EventSink: Send + Sync {
    fn instruction_executed(&self, thread: ExternalId) -> Result<()>;

    /// Batched form of [`EventSink::instruction_executed`].
    fn instructions_executed(&self, thread: ExternalId, n: u64) -> Result<()> {
        for _ in 0..n {
            self.instruction_executed(thread)?;
        }
        Ok(())
    }

    fn thread_started(&self, child: ExternalId, parent: Option<ExternalId>) -> Result<()>;

    fn thread_finished(&self, thread: ExternalId) -> Result<()>;

    fn intercepted_call_enter(&self, site: &str, thread: ExternalId, args: &[u64]) -> Result<()>;

    fn intercepted_call_return(&self, site: &str, thread: ExternalId, result: CallResult)
        -> Result<()>;
}

pub type FatalHook = Box<dyn Fn(&Snapshot) + Send + Sync>;

/// Routes callbacks to a shared [`Tracker`].
pub struct Dispatcher {
    tracker: Arc<Tracker>,
    spawn_symbols: Vec<String>,
    on_fatal: Option<FatalHook>,
    fatal_reported: AtomicBool,
}

impl Dispatcher {
    pub fn new(tracker: Arc<Tracker>, hooks: &HookConfig) -> Self {
        Self {
            tracker,
            spawn_symbols: hooks.spawn_symbols.clone(),
            on_fatal: None,
            fatal_reported: AtomicBool::new(false),
        }
    }

    /// Called once, with the partial snapshot, on the event that halts the
    /// tracker.
    pub fn on_fatal(mut self, hook: impl Fn(&Snapshot) + Send + Sync + 'static) -> Self {
        self.on_fatal = Some(Box::new(hook));
        self
    }

    pub fn tracker(&self) -> &Arc<Tracker> {
        &self.tracker
    }

    pub fn is_spawn_site(&self, site: &str) -> bool {
        self.spawn_symbols.iter().any(|s| s == site)
    }

    /// First configured spawn symbol, used by in-process event sources.
    pub fn spawn_symbol(&self) -> Option<&str> {
        self.spawn_symbols.first().map(String::as_str)
    }

    /// Instructions from a thread that cached its index at start; skips the
    /// identity lookup on every delivery.
    #[inline]
    pub fn instructions_executed_at(&self, thread: ThreadIndex, n: u64) -> Result<()> {
        self.forward(self.tracker.on_instructions_at(thread, n))
    }

    fn forward<T>(&self, result: Result<T>) -> Result<()> {
        match result {
            Ok(_) => Ok(()),
            Err(e) => {
                if self.tracker.is_halted() && !self.fatal_reported.swap(true, Ordering::AcqRel) {
                    if let Some(hook) = &self.on_fatal {
                        hook(&self.tracker.snapshot());
                    }
                }
                Err(e)
            }
        }
    }
}

impl EventSink for Dispatcher {
    #[inline]
    fn instruction_executed(&self, thread: ExternalId) -> Result<()> {
        self.forward(self.tracker.on_instruction(thread))
    }

    #[inline]
    fn instructions_executed(&self, thread: ExternalId, n: u64) -> Result<()> {
        self.forward(self.tracker.on_instructions(thread, n))
    }

    fn thread_started(&self, child: ExternalId, parent: Option<ExternalId>) -> Result<()> {
        self.forward(self.tracker.on_thread_start(child, parent))
    }

    fn thread_finished(&self, thread: ExternalId) -> Result<()> {
        self.forward(self.tracker.on_thread_finish(thread))
    }

    fn intercepted_call_enter(&self, site: &str, thread: ExternalId, args: &[u64]) -> Result<()> {
        if !self.is_spawn_site(site) {
            log_dispatch_debug!("Ignoring call site", site = site, thread = thread.0);
            return Ok(());
        }
        log_dispatch_debug!("Spawn call", site = site, thread = thread.0, args = args.len());
        self.forward(self.tracker.on_spawn_call_enter(thread))
    }

    fn intercepted_call_return(
        &self,
        site: &str,
        thread: ExternalId,
        result: CallResult,
    ) -> Result<()> {
        if !self.is_spawn_site(site) {
            return Ok(());
        }
        let ret = if result.succeeded() {
            SpawnReturn {
                succeeded: true,
                child_handle: result.value,
            }
        } else {
            log_dispatch_warn!(
                "Spawn call failed",
                site = site,
                thread = thread.0,
                status = result.status
            );
            SpawnReturn::failed()
        };
        self.forward(self.tracker.on_spawn_call_return(thread, ret))
    }
}
