//! Serialized event stream: one JSON object per line, one line per callback.
//!
//! ```text
//! {"event":"thread_start","thread":4242}
//! {"event":"instruction","thread":4242,"count":10}
//! {"event":"call_enter","site":"pthread_create","thread":4242}
//! {"event":"call_return","site":"pthread_create","thread":4242,"status":0,"value":140213}
//! {"event":"thread_start","thread":4243,"parent":4242}
//! {"event":"thread_finish","thread":4243}
//! ```
//!
//! Blank lines and lines starting with `#` are skipped.

use std::io::BufRead;

use serde::{Deserialize, Serialize};
use spawntrace_config::log_dispatch_debug;
use thiserror::Error;

use crate::dispatch::{CallResult, Dispatcher, EventSink};
use crate::{ExternalId, TrackerError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TraceEvent {
    Instruction {
        thread: ExternalId,
        #[serde(default = "one")]
        count: u64,
    },
    ThreadStart {
        thread: ExternalId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent: Option<ExternalId>,
    },
    ThreadFinish {
        thread: ExternalId,
    },
    CallEnter {
        site: String,
        thread: ExternalId,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        args: Vec<u64>,
    },
    CallReturn {
        site: String,
        thread: ExternalId,
        #[serde(default)]
        status: i64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<u64>,
    },
}

fn one() -> u64 {
    1
}

impl TraceEvent {
    pub fn thread(&self) -> ExternalId {
        match self {
            TraceEvent::Instruction { thread, .. }
            | TraceEvent::ThreadStart { thread, .. }
            | TraceEvent::ThreadFinish { thread }
            | TraceEvent::CallEnter { thread, .. }
            | TraceEvent::CallReturn { thread, .. } => *thread,
        }
    }

    pub fn deliver(&self, sink: &dyn EventSink) -> crate::Result<()> {
        match self {
            TraceEvent::Instruction { thread, count } => sink.instructions_executed(*thread, *count),
            TraceEvent::ThreadStart { thread, parent } => sink.thread_started(*thread, *parent),
            TraceEvent::ThreadFinish { thread } => sink.thread_finished(*thread),
            TraceEvent::CallEnter { site, thread, args } => {
                sink.intercepted_call_enter(site, *thread, args)
            }
            TraceEvent::CallReturn {
                site,
                thread,
                status,
                value,
            } => sink.intercepted_call_return(
                site,
                *thread,
                CallResult {
                    status: *status,
                    value: *value,
                },
            ),
        }
    }
}

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("line {line}: {source}")]
    Parse {
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("line {line}: {source}")]
    Tracker {
        line: usize,
        #[source]
        source: TrackerError,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReplayStats {
    pub lines: usize,
    pub events: usize,
    /// Events the tracker rejected and recorded as faults.
    pub rejected: usize,
}

/// Feed every event in `reader` to `dispatcher`, in file order.
///
/// A rejected event stops the replay only once the tracker has halted;
/// under the continue policy the fault is counted and replay goes on.
pub fn replay<R: BufRead>(reader: R, dispatcher: &Dispatcher) -> Result<ReplayStats, ReplayError> {
    let mut stats = ReplayStats::default();

    for (i, line) in reader.lines().enumerate() {
        let line = line?;
        let lineno = i + 1;
        stats.lines = lineno;

        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        let event: TraceEvent =
            serde_json::from_str(trimmed).map_err(|source| ReplayError::Parse {
                line: lineno,
                source,
            })?;
        stats.events += 1;

        if let Err(source) = event.deliver(dispatcher) {
            stats.rejected += 1;
            if dispatcher.tracker().is_halted() {
                return Err(ReplayError::Tracker {
                    line: lineno,
                    source,
                });
            }
            log_dispatch_debug!("Event rejected", line = lineno, thread = event.thread().0);
        }
    }

    Ok(stats)
}
