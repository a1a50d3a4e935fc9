//! `spawntrace demo`: trace a nested spawn tree running on real threads.

use std::io;

use anyhow::{bail, Context, Result};
use clap::Args;
use spawntrace_config::{log_cli_info, Config, ErrorPolicy};
use spawntrace_core::{Probe, ProbeError, ThreadContext, TracedHandle};

use crate::report::{self, Format};

#[derive(Args, Debug)]
pub struct DemoArgs {
    /// Children spawned by every non-leaf thread [default: CPU count, at most 8]
    #[arg(short, long)]
    threads: Option<usize>,

    /// Levels of spawning below the root
    #[arg(short, long, default_value_t = 2)]
    depth: u32,

    /// Work units each thread runs
    #[arg(short, long, default_value_t = 1000)]
    work: u64,

    /// Override the configured error policy (abort | continue)
    #[arg(long)]
    on_error: Option<ErrorPolicy>,

    #[arg(long, value_enum, default_value_t = Format::Table)]
    format: Format,
}

/// Threads below the root: `fanout + fanout^2 + ... + fanout^depth`.
fn tree_size(fanout: usize, depth: u32) -> Option<usize> {
    (1..=depth).try_fold(0usize, |total, d| {
        fanout.checked_pow(d).and_then(|n| total.checked_add(n))
    })
}

/// Threads below the root, if the whole tree (root included) fits in
/// `max_threads`.
fn checked_tree_size(fanout: usize, depth: u32, max_threads: usize) -> Result<usize> {
    let Some(spawned) = tree_size(fanout, depth) else {
        bail!(
            "a tree of fanout {} and depth {} is too large for tracker.max_threads ({})",
            fanout,
            depth,
            max_threads
        );
    };
    if spawned >= max_threads {
        bail!(
            "{} threads requested but tracker.max_threads is {}",
            spawned.saturating_add(1),
            max_threads
        );
    }
    Ok(spawned)
}

pub fn run(config: &Config, args: DemoArgs) -> Result<()> {
    let fanout = args.threads.unwrap_or_else(|| num_cpus::get().min(8));
    let spawned = checked_tree_size(fanout, args.depth, config.tracker.max_threads)?;

    let dispatcher = crate::build_dispatcher(config, args.on_error);
    let probe = Probe::new(dispatcher.clone()).context("Failed to attach probe")?;
    log_cli_info!(
        "Running demo tree",
        fanout = fanout,
        depth = args.depth,
        threads = spawned
    );

    let root = probe.attach_root()?;
    let grown = grow(&root, fanout, args.depth, args.work);
    let outcome = grown.and(root.finish());

    let snapshot = dispatcher.tracker().snapshot();
    report::render(&mut io::stdout().lock(), &snapshot, &config.report, args.format)
        .context("Failed to write report")?;

    outcome.context("Traced workload failed")
}

/// Run half the work, spawn the children one by one, run the rest, then
/// wait for them. Every spawned child is joined even when an earlier step
/// failed; the first error wins.
fn grow(ctx: &ThreadContext, fanout: usize, depth: u32, work: u64) -> Result<(), ProbeError> {
    let mut children = Vec::new();
    let own = spawn_children(ctx, fanout, depth, work, &mut children);

    let mut first_err = own.err();
    for child in children {
        if let Err(e) = child.join().and_then(|grown| grown) {
            first_err.get_or_insert(e);
        }
    }
    first_err.map_or(Ok(()), Err)
}

fn spawn_children(
    ctx: &ThreadContext,
    fanout: usize,
    depth: u32,
    work: u64,
    children: &mut Vec<TracedHandle<Result<(), ProbeError>>>,
) -> Result<(), ProbeError> {
    let half = work / 2;
    ctx.run(half)?;
    if depth > 0 {
        for _ in 0..fanout {
            children.push(ctx.spawn(move |c| grow(c, fanout, depth - 1, work))?);
            ctx.step()?;
        }
    }
    ctx.run(work - half)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tree_size() {
        assert_eq!(tree_size(3, 0), Some(0));
        assert_eq!(tree_size(3, 1), Some(3));
        assert_eq!(tree_size(3, 3), Some(39));
        assert_eq!(tree_size(usize::MAX, 2), None);
    }

    #[test]
    fn test_checked_tree_size() {
        assert_eq!(checked_tree_size(2, 2, 1024).unwrap(), 6);
        // 6 children plus the root need 7 slots.
        assert!(checked_tree_size(2, 2, 7).is_ok());
        let err = checked_tree_size(2, 2, 6).unwrap_err().to_string();
        assert!(err.contains("7 threads requested"), "{}", err);
    }

    #[test]
    fn test_overflowing_tree_is_an_error() {
        let err = checked_tree_size(100_000, 8, 1024).unwrap_err().to_string();
        assert!(err.contains("too large"), "{}", err);
        assert!(checked_tree_size(usize::MAX, 1, usize::MAX).is_err());
    }

    #[test]
    fn test_failing_child_still_joins_siblings() {
        use spawntrace_config::HookConfig;
        use spawntrace_core::{Dispatcher, Tracker};
        use std::sync::Arc;

        // Room for the root and two children only: one of the three
        // children cannot register.
        let tracker = Arc::new(Tracker::new(&spawntrace_config::TrackerConfig {
            max_threads: 3,
            on_error: ErrorPolicy::Continue,
            ..Default::default()
        }));
        let dispatcher = Arc::new(Dispatcher::new(tracker, &HookConfig::default()));
        let probe = Probe::new(dispatcher.clone()).unwrap();
        let root = probe.attach_root().unwrap();

        assert!(grow(&root, 3, 1, 10).is_err());
        root.finish().unwrap();

        let snap = dispatcher.tracker().snapshot();
        let finished = snap
            .rows
            .iter()
            .filter(|r| r.self_instruction_count.is_some())
            .count();
        assert_eq!(finished, 2);
        assert_eq!(snap.roots[0].self_instruction_count, Some(13));
    }
}
