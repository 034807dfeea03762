use anyhow::Result;
use chrono::Utc;
use tracing::warn;

use crate::db::Db;
use crate::types::{
    CiRunType, CronToggles, Platform, PlatformTarget, Release, ReleaseConfig, ReleaseTask,
    SlotToggles, Stage, TaskStatus, TaskType,
};

/// Resolves the integration config bound to a release, falling back to a
/// bare config on the default CI provider when none is bound.
pub fn resolve_config(
    db: &Db,
    release: &Release,
    default_ci_provider: CiRunType,
) -> Result<ReleaseConfig> {
    if let Some(config_id) = release.release_config_id {
        if let Some(config) = db.get_release_config(config_id)? {
            return Ok(config);
        }
        warn!(
            "release #{}: config {config_id} missing, using bare defaults",
            release.id
        );
    }
    Ok(ReleaseConfig::bare(&release.tenant_id, default_ci_provider))
}

/// A task to create for a stage group, already resolved to PENDING or
/// SKIPPED. Toggle-disabled tasks are skipped at creation time, never at
/// execution.
#[derive(Debug, Clone, Copy)]
pub struct TaskSeed {
    pub task_type: TaskType,
    pub status: TaskStatus,
}

fn seed(task_type: TaskType, enabled: bool) -> TaskSeed {
    TaskSeed {
        task_type,
        status: if enabled { TaskStatus::Pending } else { TaskStatus::Skipped },
    }
}

fn has_platform(targets: &[PlatformTarget], platform: Platform) -> bool {
    targets.iter().any(|t| t.platform == platform)
}

// ── Stage task sets ──────────────────────────────────────────────────────

/// Kickoff tasks in execution order.
pub fn kickoff_tasks(
    toggles: &CronToggles,
    config: &ReleaseConfig,
    targets: &[PlatformTarget],
) -> Vec<TaskSeed> {
    vec![
        seed(
            TaskType::PreKickOffReminder,
            toggles.kick_off_reminder && !config.notification_channel.is_empty(),
        ),
        seed(TaskType::ForkBranch, true),
        seed(
            TaskType::CreateProjectManagementTicket,
            !config.pm_project_key.is_empty(),
        ),
        seed(TaskType::CreateTestSuite, !config.test_mgmt_project.is_empty()),
        seed(
            TaskType::TriggerPreRegressionBuilds,
            toggles.pre_regression_builds && !targets.is_empty(),
        ),
    ]
}

/// Per-cycle regression tasks in execution order.
pub fn cycle_tasks(
    toggles: &CronToggles,
    slot: &SlotToggles,
    config: &ReleaseConfig,
    targets: &[PlatformTarget],
) -> Vec<TaskSeed> {
    let mut seeds = vec![
        seed(
            TaskType::TriggerRegressionBuilds,
            toggles.automation_builds && slot.regression_builds && !targets.is_empty(),
        ),
        seed(
            TaskType::CreateTestSuiteRun,
            toggles.automation_runs && slot.automation_runs && !config.test_mgmt_project.is_empty(),
        ),
    ];
    // Cycle sign-off is an opt-in gate; when off the task is not emitted at all.
    if toggles.regression_approval {
        seeds.push(seed(TaskType::RegressionStageApproval, true));
    }
    seeds
}

/// Pre-release tasks in execution order.
pub fn pre_release_tasks(
    toggles: &CronToggles,
    config: &ReleaseConfig,
    targets: &[PlatformTarget],
) -> Vec<TaskSeed> {
    let test_flight = toggles.test_flight_builds && has_platform(targets, Platform::Ios);
    vec![
        seed(TaskType::CreateReleaseTag, true),
        seed(TaskType::TriggerTestFlightBuild, test_flight),
        seed(TaskType::CreateAabBuild, has_platform(targets, Platform::Android)),
        seed(TaskType::TestflightBuildVerified, test_flight),
        seed(
            TaskType::AdHocNotification,
            toggles.ad_hoc_notifications && !config.notification_channel.is_empty(),
        ),
    ]
}

/// Platforms a build task must produce artifacts for.
pub fn required_platforms(task_type: TaskType, targets: &[PlatformTarget]) -> Vec<Platform> {
    let mut platforms: Vec<Platform> = match task_type {
        TaskType::TriggerTestFlightBuild => {
            if has_platform(targets, Platform::Ios) {
                vec![Platform::Ios]
            } else {
                vec![]
            }
        }
        TaskType::CreateAabBuild => {
            if has_platform(targets, Platform::Android) {
                vec![Platform::Android]
            } else {
                vec![]
            }
        }
        t if t.is_build_task() => targets.iter().map(|t| t.platform).collect(),
        _ => vec![],
    };
    platforms.sort_by_key(|p| p.as_str());
    platforms.dedup();
    platforms
}

// ── Persistence ──────────────────────────────────────────────────────────

/// Inserts a stage/cycle task group. No-op for seeds already present in the
/// group (idempotent reissue after restart).
pub fn insert_task_group(
    db: &Db,
    release_id: i64,
    stage: Stage,
    cycle_id: Option<i64>,
    seeds: &[TaskSeed],
) -> Result<()> {
    let existing = db.list_tasks_for_stage(release_id, stage, cycle_id)?;
    for s in seeds {
        if existing.iter().any(|t| t.task_type == s.task_type) {
            continue;
        }
        db.insert_task(&ReleaseTask {
            id: 0,
            release_id,
            cycle_id,
            task_type: s.task_type,
            stage,
            status: s.status,
            external_id: None,
            external_data: serde_json::json!({}),
            account_id: String::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        })?;
    }
    Ok(())
}

// ── Tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CiRunType, TargetStore};

    fn targets(platforms: &[Platform]) -> Vec<PlatformTarget> {
        platforms
            .iter()
            .map(|&p| PlatformTarget {
                id: 0,
                release_id: 1,
                platform: p,
                target: match p {
                    Platform::Android => TargetStore::PlayStore,
                    Platform::Ios => TargetStore::AppStore,
                    Platform::Web => TargetStore::Web,
                },
                version: "1.0.0".into(),
            })
            .collect()
    }

    fn full_config() -> ReleaseConfig {
        ReleaseConfig {
            pm_project_key: "REL".into(),
            test_mgmt_project: "suite".into(),
            notification_channel: "#releases".into(),
            ..ReleaseConfig::bare("t1", CiRunType::Jenkins)
        }
    }

    #[test]
    fn kickoff_order_is_stable() {
        let seeds = kickoff_tasks(
            &CronToggles::default(),
            &full_config(),
            &targets(&[Platform::Android, Platform::Ios]),
        );
        let types: Vec<TaskType> = seeds.iter().map(|s| s.task_type).collect();
        assert_eq!(
            types,
            vec![
                TaskType::PreKickOffReminder,
                TaskType::ForkBranch,
                TaskType::CreateProjectManagementTicket,
                TaskType::CreateTestSuite,
                TaskType::TriggerPreRegressionBuilds,
            ]
        );
        assert!(seeds.iter().all(|s| s.status == TaskStatus::Pending));
    }

    #[test]
    fn disabled_toggles_skip_at_creation() {
        let toggles = CronToggles {
            kick_off_reminder: false,
            pre_regression_builds: false,
            ..CronToggles::default()
        };
        let seeds = kickoff_tasks(&toggles, &full_config(), &targets(&[Platform::Android]));
        assert_eq!(seeds[0].status, TaskStatus::Skipped);
        assert_eq!(seeds[1].status, TaskStatus::Pending);
        assert_eq!(seeds[4].status, TaskStatus::Skipped);
    }

    #[test]
    fn test_flight_requires_ios_and_toggle() {
        let android_only = pre_release_tasks(
            &CronToggles::default(),
            &full_config(),
            &targets(&[Platform::Android]),
        );
        let tf = android_only
            .iter()
            .find(|s| s.task_type == TaskType::TriggerTestFlightBuild)
            .unwrap();
        assert_eq!(tf.status, TaskStatus::Skipped);
        let verified = android_only
            .iter()
            .find(|s| s.task_type == TaskType::TestflightBuildVerified)
            .unwrap();
        assert_eq!(verified.status, TaskStatus::Skipped);

        let both = pre_release_tasks(
            &CronToggles::default(),
            &full_config(),
            &targets(&[Platform::Android, Platform::Ios]),
        );
        let tf = both
            .iter()
            .find(|s| s.task_type == TaskType::TriggerTestFlightBuild)
            .unwrap();
        assert_eq!(tf.status, TaskStatus::Pending);
    }

    #[test]
    fn aab_requires_android() {
        let ios_only = pre_release_tasks(
            &CronToggles::default(),
            &full_config(),
            &targets(&[Platform::Ios]),
        );
        let aab = ios_only
            .iter()
            .find(|s| s.task_type == TaskType::CreateAabBuild)
            .unwrap();
        assert_eq!(aab.status, TaskStatus::Skipped);
    }

    #[test]
    fn regression_approval_not_emitted_by_default() {
        let seeds = cycle_tasks(
            &CronToggles::default(),
            &SlotToggles::default(),
            &full_config(),
            &targets(&[Platform::Android]),
        );
        assert!(seeds.iter().all(|s| s.task_type != TaskType::RegressionStageApproval));
    }

    #[test]
    fn required_platforms_narrow_for_store_builds() {
        let ts = targets(&[Platform::Android, Platform::Ios]);
        assert_eq!(
            required_platforms(TaskType::TriggerRegressionBuilds, &ts),
            vec![Platform::Android, Platform::Ios]
        );
        assert_eq!(
            required_platforms(TaskType::TriggerTestFlightBuild, &ts),
            vec![Platform::Ios]
        );
        assert_eq!(
            required_platforms(TaskType::CreateAabBuild, &ts),
            vec![Platform::Android]
        );
        assert!(required_platforms(TaskType::ForkBranch, &ts).is_empty());
    }
}
