//! Repository behaviour that the state machine depends on.

mod common;

use chrono::Utc;
use common::*;
use liftoff_core::db::new_build;
use liftoff_core::types::{
    BuildType, CiRunType, CycleStatus, Platform, ReleaseStatus, ReleaseTask, ReleaseUpload, Stage,
    TaskStatus, TaskType, UploadStage, WorkflowStatus,
};

#[tokio::test]
async fn release_round_trips_through_sqlite() {
    let h = harness();
    let release_id = make_release(&h, ReleaseOpts::default());

    let release = h.db.get_release(release_id).unwrap().unwrap();
    assert_eq!(release.tenant_id, TENANT);
    assert_eq!(release.release_branch, "release/7.0.0");
    assert_eq!(release.base_branch, "main");
    assert_eq!(release.status, ReleaseStatus::InProgress);
    assert!(!release.has_manual_build_upload);
    assert!(release.release_config_id.is_some());
    assert_eq!(release.kick_off_date, epoch() - chrono::Duration::hours(2));
}

#[tokio::test]
async fn cron_job_json_columns_round_trip() {
    let h = harness();
    let release_id = make_release(
        &h,
        ReleaseOpts {
            slot_offsets_secs: vec![-5, 30],
            ..ReleaseOpts::default()
        },
    );

    let cron = h.db.get_cron_job(release_id).unwrap().unwrap();
    assert_eq!(cron.upcoming_regressions.len(), 2);
    assert!(cron.toggles.automation_builds);
    assert!(cron.auto_transition_to_stage2);

    let remaining = &cron.upcoming_regressions[1..];
    h.db.set_upcoming_regressions(release_id, remaining).unwrap();
    let cron = h.db.get_cron_job(release_id).unwrap().unwrap();
    assert_eq!(cron.upcoming_regressions.len(), 1);
}

#[tokio::test]
async fn only_one_cycle_is_latest() {
    let h = harness();
    let release_id = make_release(&h, ReleaseOpts::default());

    let first = h.db.insert_cycle(release_id, 1).unwrap();
    let second = h.db.insert_cycle(release_id, 2).unwrap();

    let cycles = h.db.list_cycles(release_id).unwrap();
    assert_eq!(cycles.len(), 2);
    let latest: Vec<_> = cycles.iter().filter(|c| c.is_latest).collect();
    assert_eq!(latest.len(), 1);
    assert_eq!(latest[0].id, second);

    // New cycles start IN_PROGRESS; finished ones stay queryable.
    h.db.update_cycle_status(first, CycleStatus::Done).unwrap();
    assert_eq!(h.db.active_cycle_count(release_id).unwrap(), 1);
}

#[tokio::test]
async fn upload_upsert_is_last_write_wins() {
    let h = harness();
    let release_id = make_release(&h, ReleaseOpts::default());

    let upload = ReleaseUpload {
        id: 0,
        tenant_id: TENANT.into(),
        release_id,
        platform: Platform::Android,
        stage: UploadStage::Regression,
        artifact_path: "s3://artifacts/v1.apk".into(),
        is_used: false,
        created_at: Utc::now(),
    };
    h.db.upsert_upload(&upload).unwrap();

    let staged = h
        .db
        .list_unused_uploads(release_id, UploadStage::Regression)
        .unwrap();
    assert_eq!(staged.len(), 1);
    h.db.mark_upload_used(staged[0].id).unwrap();
    assert!(h
        .db
        .list_unused_uploads(release_id, UploadStage::Regression)
        .unwrap()
        .is_empty());

    // Re-uploading the same slot replaces the artifact and re-arms it.
    h.db.upsert_upload(&ReleaseUpload {
        artifact_path: "s3://artifacts/v2.apk".into(),
        ..upload
    })
    .unwrap();
    let staged = h
        .db
        .list_unused_uploads(release_id, UploadStage::Regression)
        .unwrap();
    assert_eq!(staged.len(), 1);
    assert_eq!(staged[0].artifact_path, "s3://artifacts/v2.apk");
}

#[tokio::test]
async fn stage_task_queries_scope_by_cycle() {
    let h = harness();
    let release_id = make_release(&h, ReleaseOpts::default());
    let cycle_id = h.db.insert_cycle(release_id, 1).unwrap();

    let mut task = ReleaseTask {
        id: 0,
        release_id,
        cycle_id: Some(cycle_id),
        task_type: TaskType::TriggerRegressionBuilds,
        stage: Stage::Regression,
        status: TaskStatus::Pending,
        external_id: None,
        external_data: serde_json::json!({}),
        account_id: String::new(),
        created_at: Utc::now(),
        updated_at: Utc::now(),
    };
    h.db.insert_task(&task).unwrap();
    task.cycle_id = None;
    task.task_type = TaskType::CreateReleaseTag;
    task.stage = Stage::PostRegression;
    h.db.insert_task(&task).unwrap();

    let cycle_tasks = h
        .db
        .list_tasks_for_stage(release_id, Stage::Regression, Some(cycle_id))
        .unwrap();
    assert_eq!(cycle_tasks.len(), 1);
    assert_eq!(cycle_tasks[0].task_type, TaskType::TriggerRegressionBuilds);

    let release_level = h
        .db
        .list_tasks_for_stage(release_id, Stage::PostRegression, None)
        .unwrap();
    assert_eq!(release_level.len(), 1);
    assert_eq!(release_level[0].task_type, TaskType::CreateReleaseTag);
}

#[tokio::test]
async fn reset_failed_builds_deletes_only_failed_rows() {
    let h = harness();
    let release_id = make_release(&h, ReleaseOpts::default());
    let task = ReleaseTask {
        id: 0,
        release_id,
        cycle_id: None,
        task_type: TaskType::TriggerPreRegressionBuilds,
        stage: Stage::Kickoff,
        status: TaskStatus::Failed,
        external_id: None,
        external_data: serde_json::json!({}),
        account_id: String::new(),
        created_at: Utc::now(),
        updated_at: Utc::now(),
    };
    let task_id = h.db.insert_task(&task).unwrap();

    let failed = h
        .db
        .insert_build(&new_build(release_id, task_id, Platform::Android, BuildType::Cicd, Some(CiRunType::Jenkins)))
        .unwrap();
    h.db.update_build_workflow(failed, WorkflowStatus::Failed, None).unwrap();
    let healthy = h
        .db
        .insert_build(&new_build(release_id, task_id, Platform::Ios, BuildType::Cicd, Some(CiRunType::Jenkins)))
        .unwrap();
    h.db.update_build_workflow(healthy, WorkflowStatus::Completed, None).unwrap();

    let cleared = h.db.reset_failed_builds_for_task(task_id).unwrap();
    assert_eq!(cleared, 1);
    let remaining = h.db.list_builds_for_task(task_id).unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].id, healthy);
}

#[tokio::test]
async fn database_persists_across_reopen() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("liftoff.db");
    let path = path.to_str().expect("utf8 path");

    let release_id = {
        let mut db = liftoff_core::db::Db::open(path).expect("open");
        db.migrate().expect("migrate");
        db.insert_release(&liftoff_core::types::Release {
            id: 0,
            tenant_id: TENANT.into(),
            name: "durable".into(),
            release_branch: "release/1.0.0".into(),
            base_branch: "main".into(),
            release_type: liftoff_core::types::ReleaseType::Hotfix,
            status: ReleaseStatus::InProgress,
            kick_off_date: epoch(),
            target_release_date: epoch(),
            release_date: None,
            has_manual_build_upload: false,
            release_config_id: None,
            created_by: String::new(),
            release_pilot: String::new(),
            last_updated_by: String::new(),
            created_at: epoch(),
        })
        .expect("insert")
    };

    let mut db = liftoff_core::db::Db::open(path).expect("reopen");
    db.migrate().expect("migrate is idempotent");
    let release = db.get_release(release_id).expect("get").expect("exists");
    assert_eq!(release.name, "durable");
    assert_eq!(release.release_type, liftoff_core::types::ReleaseType::Hotfix);
}

#[tokio::test]
async fn task_external_id_survives_data_updates() {
    let h = harness();
    let release_id = make_release(&h, ReleaseOpts::default());
    let task_id = h
        .db
        .insert_task(&ReleaseTask {
            id: 0,
            release_id,
            cycle_id: None,
            task_type: TaskType::CreateTestSuiteRun,
            stage: Stage::Regression,
            status: TaskStatus::AwaitingCallback,
            external_id: None,
            external_data: serde_json::json!({}),
            account_id: String::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        })
        .unwrap();

    h.db.update_task_external(task_id, Some("run-9"), &serde_json::json!({"suite": "s1"}))
        .unwrap();
    // A later data-only update must not clear the provider id.
    h.db.update_task_external(task_id, None, &serde_json::json!({"pass_percent": 97.0}))
        .unwrap();

    let task = h.db.get_task(task_id).unwrap().unwrap();
    assert_eq!(task.external_id.as_deref(), Some("run-9"));
    assert_eq!(task.external_data["pass_percent"], 97.0);
}
