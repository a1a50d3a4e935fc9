use std::collections::HashMap;
use std::sync::{Arc, Barrier};
use std::thread;

use proptest::prelude::*;
use spawntrace_core::{
    ErrorPolicy, ExternalId, Gap, SpawnReturn, ThreadIndex, Tracker, TrackerError,
};

fn spawn_call(tracker: &Tracker, parent: ExternalId, handle: u64) {
    tracker.on_spawn_call_enter(parent).unwrap();
    tracker
        .on_spawn_call_return(parent, SpawnReturn::ok(handle))
        .unwrap();
}

#[test]
fn two_children_paired_with_their_spawn_calls() {
    let main = ExternalId(1);
    let (a, b) = (ExternalId(2), ExternalId(3));
    let tracker = Tracker::with_policy(ErrorPolicy::Abort);

    tracker.on_thread_start(main, None).unwrap();
    tracker.on_instructions(main, 10).unwrap();
    spawn_call(&tracker, main, 0xa);
    tracker.on_instructions(main, 15).unwrap();
    spawn_call(&tracker, main, 0xb);

    let ia = tracker.on_thread_start(a, Some(main)).unwrap();
    let ib = tracker.on_thread_start(b, Some(main)).unwrap();
    tracker.on_thread_finish(b).unwrap();
    tracker.on_thread_finish(a).unwrap();

    let snap = tracker.snapshot();
    assert_eq!(snap.rows.len(), 2);
    for row in &snap.rows {
        assert_eq!(row.parent, ThreadIndex::ROOT);
        assert!(row.terminate_count.is_some());
        assert!(row.self_instruction_count.is_some());
    }
    assert_eq!(snap.row(ia).unwrap().spawn_call_count, Some(10));
    assert_eq!(snap.row(ib).unwrap().spawn_call_count, Some(25));
    assert!(snap.gaps().is_empty());
}

#[test]
fn lost_start_leaves_queue_backlog() {
    let main = ExternalId(1);
    let tracker = Tracker::with_policy(ErrorPolicy::Abort);
    tracker.on_thread_start(main, None).unwrap();
    tracker.on_instructions(main, 3).unwrap();
    spawn_call(&tracker, main, 0x10);
    tracker.on_thread_finish(main).unwrap();

    let snap = tracker.snapshot();
    assert!(snap.rows.is_empty());
    assert_eq!(snap.outstanding_spawns(ThreadIndex::ROOT), 1);
    assert_eq!(
        snap.gaps(),
        vec![Gap::LostStart {
            parent: ThreadIndex::ROOT,
            requested_at: 3,
            spawn_order: 0,
        }]
    );
}

#[test]
fn unknown_index_and_double_write_rejected() {
    let main = ExternalId(1);
    let child = ExternalId(2);
    let tracker = Tracker::with_policy(ErrorPolicy::Continue);
    tracker.on_thread_start(main, None).unwrap();
    spawn_call(&tracker, main, 1);

    assert!(matches!(
        tracker.on_thread_finish(child),
        Err(TrackerError::UnknownThread { .. })
    ));
    tracker.on_thread_start(child, Some(main)).unwrap();
    tracker.on_thread_finish(child).unwrap();
    let before = tracker.record(child).unwrap();

    tracker.on_instructions(main, 100).unwrap();
    assert!(matches!(
        tracker.on_thread_finish(child),
        Err(TrackerError::AlreadySet { .. })
    ));
    assert_eq!(tracker.record(child).unwrap(), before);
}

#[test]
fn concurrent_parents_spawn_and_children_start_from_many_threads() {
    const PARENTS: u64 = 8;
    const CHILDREN: u64 = 16;

    let tracker = Arc::new(Tracker::with_policy(ErrorPolicy::Abort));
    let root = ExternalId(0);
    tracker.on_thread_start(root, None).unwrap();

    // Root spawns every parent.
    for p in 1..=PARENTS {
        spawn_call(&tracker, root, p);
        tracker.on_thread_start(ExternalId(p), Some(root)).unwrap();
    }

    // Each parent issues its spawn calls on its own OS thread, concurrently.
    let barrier = Arc::new(Barrier::new(PARENTS as usize));
    let parents: Vec<_> = (1..=PARENTS)
        .map(|p| {
            let tracker = Arc::clone(&tracker);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                let id = ExternalId(p);
                for c in 0..CHILDREN {
                    tracker.on_instructions(id, c + 1).unwrap();
                    spawn_call(&tracker, id, c);
                }
            })
        })
        .collect();
    for handle in parents {
        handle.join().unwrap();
    }

    // Every child starts and finishes on its own OS thread.
    let total = (PARENTS * CHILDREN) as usize;
    let barrier = Arc::new(Barrier::new(total));
    let children: Vec<_> = (1..=PARENTS)
        .flat_map(|p| (0..CHILDREN).map(move |c| (p, c)))
        .map(|(p, c)| {
            let tracker = Arc::clone(&tracker);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let id = ExternalId(1000 + p * 100 + c);
                barrier.wait();
                tracker.on_thread_start(id, Some(ExternalId(p))).unwrap();
                tracker.on_instructions(id, 5).unwrap();
                tracker.on_thread_finish(id).unwrap();
            })
        })
        .collect();
    for handle in children {
        handle.join().unwrap();
    }

    let snap = tracker.snapshot();
    assert!(snap.faults.is_empty());
    assert!(snap.pending.is_empty());
    assert_eq!(snap.rows.len(), PARENTS as usize + total);

    // Marker k of every parent sits at triangular(k + 1).
    let marker = |k: u32| (1..=u64::from(k) + 1).sum::<u64>();
    let mut per_parent: HashMap<ThreadIndex, usize> = HashMap::new();
    for row in snap.rows.iter().filter(|r| r.parent != ThreadIndex::ROOT) {
        *per_parent.entry(row.parent).or_default() += 1;
        // The k-th child to start got the k-th spawn call.
        assert_eq!(row.spawn_order, Some(row.start_order));
        assert_eq!(row.spawn_call_count, Some(marker(row.start_order)));
        assert_eq!(row.self_instruction_count, Some(5));
    }
    assert_eq!(per_parent.len(), PARENTS as usize);
    assert!(per_parent.values().all(|n| *n == CHILDREN as usize));
}

proptest! {
    /// Whatever order the children start in, the i-th child to start is
    /// paired with the i-th spawn call.
    #[test]
    fn fifo_pairing_under_any_start_order(
        (work, order) in proptest::collection::vec(0u64..50, 1..24).prop_flat_map(|work| {
            let n = work.len();
            (Just(work), Just((0..n).collect::<Vec<_>>()).prop_shuffle())
        })
    ) {
        let main = ExternalId(1);
        let tracker = Tracker::with_policy(ErrorPolicy::Abort);
        tracker.on_thread_start(main, None).unwrap();

        let mut markers = Vec::with_capacity(work.len());
        let mut count = 0;
        for (i, w) in work.iter().enumerate() {
            count = tracker.on_instructions(main, *w).unwrap();
            markers.push(count);
            spawn_call(&tracker, main, i as u64);
        }

        for child in &order {
            tracker
                .on_thread_start(ExternalId(100 + *child as u64), Some(main))
                .unwrap();
        }

        let snap = tracker.snapshot();
        prop_assert_eq!(snap.rows.len(), work.len());
        prop_assert_eq!(snap.outstanding_spawns(ThreadIndex::ROOT), 0);
        for (nth, child) in order.iter().enumerate() {
            let idx = tracker.thread_index(ExternalId(100 + *child as u64)).unwrap();
            let row = snap.row(idx).unwrap();
            prop_assert_eq!(row.start_order as usize, nth);
            prop_assert_eq!(row.spawn_call_count, Some(markers[nth]));
            prop_assert_eq!(row.start_count, Some(count));
        }
        // Spawn counts are non-decreasing in start order.
        let mut by_start: Vec<_> = snap.rows.iter().collect();
        by_start.sort_by_key(|r| r.start_order);
        prop_assert!(by_start.windows(2).all(|w| w[0].spawn_call_count <= w[1].spawn_call_count));
    }
}
