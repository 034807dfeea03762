//! End-to-end state machine scenarios driven tick-by-tick with mock
//! providers and a fixed clock.

mod common;

use common::*;
use liftoff_core::types::{
    CronStatus, CronToggles, CycleStatus, PauseType, Platform, ReleaseStatus, StageStatus,
    TaskStatus, TaskType, UploadStage,
};

fn no_test_flight() -> CronToggles {
    CronToggles {
        test_flight_builds: false,
        ..CronToggles::default()
    }
}

// ── S1: automatic full flow, CI/CD mode ──────────────────────────────────

#[tokio::test]
async fn automatic_full_flow_reaches_completed() {
    let h = harness();
    let release_id = make_release(
        &h,
        ReleaseOpts {
            toggles: Some(no_test_flight()),
            ..ReleaseOpts::default()
        },
    );
    start_quiet(&h, release_id).await;

    drive_until(&h, release_id, 60, |h| {
        cron_status(h, release_id) == CronStatus::Completed
    })
    .await;

    let cron = h.db.get_cron_job(release_id).unwrap().unwrap();
    assert_eq!(cron.stage1_status, StageStatus::Completed);
    assert_eq!(cron.stage2_status, StageStatus::Completed);
    assert_eq!(cron.stage3_status, StageStatus::Completed);

    let release = h.db.get_release(release_id).unwrap().unwrap();
    assert_eq!(release.status, ReleaseStatus::Completed);
    assert!(release.release_date.is_some());

    let cycles = h.db.list_cycles(release_id).unwrap();
    assert!(!cycles.is_empty());
    assert!(cycles.iter().all(|c| c.status == CycleStatus::Done));

    // Kickoff side effects: branch forked, ticket and suite created.
    assert_eq!(h.scm.forked.lock().unwrap().len(), 1);
    assert_eq!(h.project_mgmt.tickets.lock().unwrap().len(), 1);
    assert_eq!(h.test_mgmt.suites.lock().unwrap().len(), 1);
    // Pre-regression + regression builds for both platforms.
    assert!(h.ci.triggered.lock().unwrap().len() >= 4);
    // The AAB landed in the Play Store.
    let uploads = h.store.uploads.lock().unwrap();
    assert!(uploads.iter().any(|(p, _)| *p == Platform::Android));
}

#[tokio::test]
async fn release_tag_recorded_with_version_string() {
    let h = harness();
    let release_id = make_release(
        &h,
        ReleaseOpts {
            toggles: Some(no_test_flight()),
            ..ReleaseOpts::default()
        },
    );
    start_quiet(&h, release_id).await;

    drive_until(&h, release_id, 60, |h| {
        cron_status(h, release_id) == CronStatus::Completed
    })
    .await;

    let tags = h.scm.tags.lock().unwrap();
    assert_eq!(tags.as_slice(), ["release-7.0.0_android_6.7.0_ios"]);
    let tag_task = h
        .db
        .find_task_by_type(release_id, TaskType::CreateReleaseTag)
        .unwrap()
        .unwrap();
    assert_eq!(tag_task.external_id.as_deref(), Some("release-7.0.0_android_6.7.0_ios"));
}

// ── S2: manual build upload ──────────────────────────────────────────────

#[tokio::test]
async fn manual_upload_flow_completes_build_task() {
    let h = harness();
    let release_id = make_release(
        &h,
        ReleaseOpts {
            manual_builds: true,
            auto_stage2: false,
            toggles: Some(CronToggles {
                pre_regression_builds: false,
                test_flight_builds: false,
                ..CronToggles::default()
            }),
            ..ReleaseOpts::default()
        },
    );
    start_quiet(&h, release_id).await;

    // Stage 1 finishes, then the release parks awaiting the stage trigger.
    drive_until(&h, release_id, 30, |h| {
        let cron = h.db.get_cron_job(release_id).unwrap().unwrap();
        cron.stage1_status == StageStatus::Completed
    })
    .await;
    let cron = h.db.get_cron_job(release_id).unwrap().unwrap();
    assert_eq!(cron.stage2_status, StageStatus::Pending);
    assert_eq!(cron.cron_status, CronStatus::Paused);
    assert_eq!(cron.pause_type, PauseType::AwaitingStageTrigger);

    h.service
        .trigger_stage2(release_id, TENANT)
        .await
        .expect("trigger stage 2");
    quiesce(&h, release_id).await;
    let cron = h.db.get_cron_job(release_id).unwrap().unwrap();
    assert_eq!(cron.cron_status, CronStatus::Running);
    assert_eq!(cron.stage2_status, StageStatus::InProgress);

    // The regression build task parks awaiting manual artifacts.
    drive_until(&h, release_id, 20, |h| {
        h.db.find_task_by_type(release_id, TaskType::TriggerRegressionBuilds)
            .unwrap()
            .is_some_and(|t| t.status == TaskStatus::AwaitingManualBuild)
    })
    .await;
    let task = h
        .db
        .find_task_by_type(release_id, TaskType::TriggerRegressionBuilds)
        .unwrap()
        .unwrap();
    // CI/CD must never have been called in manual mode.
    assert!(h.ci.triggered.lock().unwrap().is_empty());

    // One platform staged: the task keeps waiting.
    h.service
        .upload_artifact(
            release_id,
            TENANT,
            Platform::Android,
            UploadStage::Regression,
            "s3://artifacts/app-7.0.0.apk",
        )
        .expect("upload android");
    let task_after_one = h.db.get_task(task.id).unwrap().unwrap();
    assert_eq!(task_after_one.status, TaskStatus::AwaitingManualBuild);

    // Second platform completes the set and the task.
    h.service
        .upload_artifact(
            release_id,
            TENANT,
            Platform::Ios,
            UploadStage::Regression,
            "s3://artifacts/app-6.7.0.ipa",
        )
        .expect("upload ios");
    let task_after_two = h.db.get_task(task.id).unwrap().unwrap();
    assert_eq!(task_after_two.status, TaskStatus::Completed);

    let builds = h.db.list_builds_for_task(task.id).unwrap();
    assert_eq!(builds.len(), 2);
    assert!(builds.iter().all(|b| b.artifact_path.is_some()));

    drive_until(&h, release_id, 30, |h| {
        h.db.get_cron_job(release_id).unwrap().unwrap().stage2_status == StageStatus::Completed
    })
    .await;
}

// ── S3: multiple cycles ──────────────────────────────────────────────────

#[tokio::test]
async fn two_slots_produce_two_cycles() {
    let h = harness();
    let release_id = make_release(
        &h,
        ReleaseOpts {
            slot_offsets_secs: vec![-5, -3],
            toggles: Some(no_test_flight()),
            ..ReleaseOpts::default()
        },
    );
    start_quiet(&h, release_id).await;

    drive_until(&h, release_id, 80, |h| {
        h.db.get_cron_job(release_id).unwrap().unwrap().stage2_status == StageStatus::Completed
    })
    .await;

    let cycles = h.db.list_cycles(release_id).unwrap();
    assert_eq!(cycles.len(), 2);
    assert!(cycles.iter().all(|c| c.status == CycleStatus::Done));
    assert_eq!(cycles[0].cycle_tag, 1);
    assert_eq!(cycles[1].cycle_tag, 2);

    // At most one latest cycle, and it is the newest.
    let latest: Vec<_> = cycles.iter().filter(|c| c.is_latest).collect();
    assert_eq!(latest.len(), 1);
    assert_eq!(latest[0].cycle_tag, 2);
}

// ── S4: task failure and retry ───────────────────────────────────────────

#[tokio::test]
async fn fork_failure_pauses_release_and_retry_rearms_it() {
    let h = harness();
    let release_id = make_release(&h, ReleaseOpts::default());
    *h.scm.fail_fork.lock().unwrap() = true;
    start_quiet(&h, release_id).await;

    drive_until(&h, release_id, 20, |h| {
        h.db.find_task_by_type(release_id, TaskType::ForkBranch)
            .unwrap()
            .is_some_and(|t| t.status == TaskStatus::Failed)
    })
    .await;

    let release = h.db.get_release(release_id).unwrap().unwrap();
    assert_eq!(release.status, ReleaseStatus::Paused);
    let cron = h.db.get_cron_job(release_id).unwrap().unwrap();
    assert_eq!(cron.pause_type, PauseType::TaskFailure);

    // Paused means no transitions: further ticks change nothing.
    let task = h
        .db
        .find_task_by_type(release_id, TaskType::ForkBranch)
        .unwrap()
        .unwrap();
    tick(&h, release_id).await;
    assert_eq!(
        h.db.get_task(task.id).unwrap().unwrap().status,
        TaskStatus::Failed
    );

    *h.scm.fail_fork.lock().unwrap() = false;
    h.service.retry_task(task.id, "pilot@acme.dev").await.expect("retry");
    quiesce(&h, release_id).await;

    let retried = h.db.get_task(task.id).unwrap().unwrap();
    assert_eq!(retried.status, TaskStatus::Pending);
    let release = h.db.get_release(release_id).unwrap().unwrap();
    assert_eq!(release.status, ReleaseStatus::InProgress);
    let cron = h.db.get_cron_job(release_id).unwrap().unwrap();
    assert_eq!(cron.pause_type, PauseType::None);

    drive_until(&h, release_id, 10, |h| {
        h.db.get_task(task.id).unwrap().unwrap().status == TaskStatus::Completed
    })
    .await;
    assert_eq!(h.scm.forked.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn build_failure_retry_clears_failed_builds_and_retriggers() {
    let h = harness();
    let release_id = make_release(
        &h,
        ReleaseOpts {
            toggles: Some(no_test_flight()),
            ..ReleaseOpts::default()
        },
    );
    *h.ci.queue_state.lock().unwrap() = liftoff_core::providers::QueueState::Failed;
    start_quiet(&h, release_id).await;

    drive_until(&h, release_id, 20, |h| {
        h.db.find_task_by_type(release_id, TaskType::TriggerPreRegressionBuilds)
            .unwrap()
            .is_some_and(|t| t.status == TaskStatus::Failed)
    })
    .await;
    let task = h
        .db
        .find_task_by_type(release_id, TaskType::TriggerPreRegressionBuilds)
        .unwrap()
        .unwrap();
    assert_eq!(h.db.list_builds_for_task(task.id).unwrap().len(), 2);

    *h.ci.queue_state.lock().unwrap() = liftoff_core::providers::QueueState::Running;
    h.service.retry_task(task.id, "pilot@acme.dev").await.expect("retry");
    quiesce(&h, release_id).await;

    // Failed rows are cleared exactly once; the retried tick re-triggers.
    assert!(h.db.list_builds_for_task(task.id).unwrap().is_empty());

    drive_until(&h, release_id, 20, |h| {
        h.db.get_task(task.id).unwrap().unwrap().status == TaskStatus::Completed
    })
    .await;
    let builds = h.db.list_builds_for_task(task.id).unwrap();
    assert_eq!(builds.len(), 2);
}

// ── Approval gate ────────────────────────────────────────────────────────

#[tokio::test]
async fn testflight_verification_holds_stage3_until_approved() {
    let h = harness();
    let release_id = make_release(&h, ReleaseOpts::default());
    start_quiet(&h, release_id).await;

    drive_until(&h, release_id, 60, |h| {
        h.db.find_task_by_type(release_id, TaskType::TestflightBuildVerified)
            .unwrap()
            .is_some_and(|t| t.status == TaskStatus::InProgress)
    })
    .await;

    // Sign-off was requested in the release channel.
    assert!(h
        .notifier
        .messages
        .lock()
        .unwrap()
        .iter()
        .any(|(_, key)| key == "approval_requested"));

    // The stage holds while approval is outstanding.
    tick(&h, release_id).await;
    tick(&h, release_id).await;
    let cron = h.db.get_cron_job(release_id).unwrap().unwrap();
    assert_eq!(cron.stage3_status, StageStatus::InProgress);

    let task = h
        .db
        .find_task_by_type(release_id, TaskType::TestflightBuildVerified)
        .unwrap()
        .unwrap();
    h.service.approve_task(task.id, "pilot@acme.dev").expect("approve");

    drive_until(&h, release_id, 30, |h| {
        cron_status(h, release_id) == CronStatus::Completed
    })
    .await;

    // Both store-bound platforms were submitted.
    let uploads = h.store.uploads.lock().unwrap();
    assert!(uploads.iter().any(|(p, _)| *p == Platform::Ios));
    assert!(uploads.iter().any(|(p, _)| *p == Platform::Android));
}
