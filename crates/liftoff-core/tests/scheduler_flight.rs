//! Scheduler lifecycle and the per-release single-flight guarantee.

mod common;

use std::sync::atomic::Ordering;

use common::*;
use liftoff_core::types::{TaskStatus, TaskType};

#[tokio::test]
async fn overlapping_ticks_for_one_release_are_dropped() {
    let h = harness();
    let release_id = make_release(&h, ReleaseOpts::default());
    start_quiet(&h, release_id).await;

    // Walk to the point where the next dispatch is the build trigger, then
    // make that trigger slow enough for the ticks to overlap.
    drive_until(&h, release_id, 20, |h| {
        h.db.find_task_by_type(release_id, TaskType::CreateTestSuite)
            .unwrap()
            .is_some_and(|t| t.status == TaskStatus::Completed)
    })
    .await;
    h.ci.trigger_delay_ms.store(300, Ordering::Relaxed);

    let (first, second) = tokio::join!(
        h.scheduler.tick_once(release_id),
        h.scheduler.tick_once(release_id),
    );
    assert!(first || second, "one tick must run");
    assert!(!(first && second), "overlapping tick must be dropped");

    // The build task was dispatched exactly once: one trigger per platform.
    assert_eq!(h.ci.triggered.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn ticks_for_different_releases_run_concurrently() {
    let h = harness();
    let first = make_release(&h, ReleaseOpts::default());
    let second = make_release(&h, ReleaseOpts::default());
    start_quiet(&h, first).await;
    start_quiet(&h, second).await;

    let (a, b) = tokio::join!(h.scheduler.tick_once(first), h.scheduler.tick_once(second));
    assert!(a && b, "independent releases must not block each other");
}

#[tokio::test]
async fn stop_is_a_no_op_for_unknown_releases() {
    let h = harness();
    h.scheduler.stop(4242).await;
    assert!(!h.scheduler.is_running(4242).await);
}

#[tokio::test]
async fn start_stop_round_trip() {
    let h = harness();
    let release_id = make_release(&h, ReleaseOpts::default());

    assert!(h.scheduler.start(release_id).await);
    assert!(h.scheduler.is_running(release_id).await);
    // A second start while running is refused.
    assert!(!h.scheduler.start(release_id).await);

    h.scheduler.stop(release_id).await;
    assert!(!h.scheduler.is_running(release_id).await);
    // After a stop, the release can be started again.
    assert!(h.scheduler.start(release_id).await);
    h.scheduler.stop(release_id).await;
}
