use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, info, warn};

use crate::catalog::required_platforms;
use crate::db::{new_build, Db};
use crate::types::{
    Build, BuildType, BuildUploadStatus, CronStatus, PauseType, ReleaseStatus, TaskBuildStatus,
    TaskStatus, UploadStage, WorkflowStatus,
};

/// Aggregate status of one task's builds. FAILED dominates, then the most
/// conservative in-flight state; COMPLETED requires every workflow finished
/// AND every artifact uploaded.
pub fn aggregate_build_status(builds: &[Build]) -> TaskBuildStatus {
    if builds.is_empty() {
        return TaskBuildStatus::NoBuilds;
    }
    if builds.iter().any(|b| {
        b.workflow_status == WorkflowStatus::Failed
            || b.build_upload_status == BuildUploadStatus::Failed
    }) {
        return TaskBuildStatus::Failed;
    }
    if builds.iter().any(|b| b.workflow_status == WorkflowStatus::Pending) {
        return TaskBuildStatus::Pending;
    }
    if builds.iter().any(|b| b.workflow_status == WorkflowStatus::Running) {
        return TaskBuildStatus::Running;
    }
    if builds.iter().all(|b| {
        b.workflow_status == WorkflowStatus::Completed
            && b.build_upload_status == BuildUploadStatus::Uploaded
    }) {
        return TaskBuildStatus::Completed;
    }
    // Workflows done but an artifact has not landed yet (manual mode).
    TaskBuildStatus::Pending
}

/// Sole author of post-trigger task status changes. Pollers and upload
/// intake mutate Build rows, then funnel through here.
pub struct CallbackAggregator {
    db: Arc<Db>,
}

impl CallbackAggregator {
    pub fn new(db: Arc<Db>) -> Self {
        Self { db }
    }

    /// Re-reads the task and applies the aggregate of its builds. A task
    /// that already reached a terminal state is never reopened.
    pub fn process_callback(&self, task_id: i64) -> Result<()> {
        let Some(task) = self.db.get_task(task_id)? else {
            warn!("process_callback: task #{task_id} not found");
            return Ok(());
        };
        if task.status.is_terminal() {
            return Ok(());
        }

        let builds = self.db.list_builds_for_task(task_id)?;
        match aggregate_build_status(&builds) {
            TaskBuildStatus::Completed => {
                self.db.update_task_status(task_id, TaskStatus::Completed)?;
                info!("task #{task_id} [{}]: all builds completed", task.task_type);
            }
            TaskBuildStatus::Failed => {
                self.db.update_task_status(task_id, TaskStatus::Failed)?;
                self.db
                    .update_release_status(task.release_id, ReleaseStatus::Paused, "system")?;
                self.db.update_cron_status(task.release_id, CronStatus::Paused)?;
                self.db.update_pause_type(task.release_id, PauseType::TaskFailure)?;
                warn!(
                    "task #{task_id} [{}]: build failed, release #{} paused",
                    task.task_type, task.release_id
                );
            }
            status => {
                debug!("task #{task_id}: waiting for builds ({status})");
            }
        }
        Ok(())
    }

    /// Matches staged manual uploads against the platforms a build task
    /// requires. Only once every required platform has an artifact are the
    /// builds flipped to COMPLETED/UPLOADED and the uploads consumed.
    /// Returns true when the task's build set became complete.
    pub fn consume_staged_uploads(&self, task_id: i64) -> Result<bool> {
        let Some(task) = self.db.get_task(task_id)? else {
            return Ok(false);
        };
        if task.status != TaskStatus::AwaitingManualBuild {
            return Ok(false);
        }
        let Some(release) = self.db.get_release(task.release_id)? else {
            return Ok(false);
        };

        let targets = self.db.list_platform_targets(release.id)?;
        let required = required_platforms(task.task_type, &targets);
        if required.is_empty() {
            return Ok(false);
        }

        for platform in &required {
            if self.db.find_build(task.id, *platform)?.is_none() {
                self.db.insert_build(&new_build(
                    release.id,
                    task.id,
                    *platform,
                    BuildType::Manual,
                    None,
                ))?;
            }
        }

        let stage = UploadStage::for_stage(task.stage);
        let uploads = self.db.list_unused_uploads(release.id, stage)?;
        let mut matched = Vec::new();
        for platform in &required {
            match uploads.iter().find(|u| u.platform == *platform) {
                Some(upload) => matched.push(upload.clone()),
                None => {
                    debug!(
                        "task #{}: awaiting manual {} artifact",
                        task.id,
                        platform.as_str().to_lowercase()
                    );
                    return Ok(false);
                }
            }
        }

        for upload in matched {
            if let Some(build) = self.db.find_build(task.id, upload.platform)? {
                self.db
                    .update_build_workflow(build.id, WorkflowStatus::Completed, None)?;
                self.db.update_build_upload(
                    build.id,
                    BuildUploadStatus::Uploaded,
                    Some(&upload.artifact_path),
                )?;
            }
            self.db.mark_upload_used(upload.id)?;
        }
        info!("task #{}: all manual artifacts uploaded", task.id);
        Ok(true)
    }
}

// ── Tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CiRunType, Platform};
    use chrono::Utc;

    fn build(workflow: WorkflowStatus, upload: BuildUploadStatus) -> Build {
        Build {
            id: 0,
            release_id: 1,
            task_id: 1,
            platform: Platform::Android,
            build_type: BuildType::Cicd,
            ci_run_type: Some(CiRunType::Jenkins),
            queue_location: Some("q/1".into()),
            ci_run_id: None,
            workflow_status: workflow,
            build_upload_status: upload,
            artifact_path: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn no_builds() {
        assert_eq!(aggregate_build_status(&[]), TaskBuildStatus::NoBuilds);
    }

    #[test]
    fn any_failure_dominates() {
        let builds = vec![
            build(WorkflowStatus::Completed, BuildUploadStatus::Uploaded),
            build(WorkflowStatus::Failed, BuildUploadStatus::Failed),
        ];
        assert_eq!(aggregate_build_status(&builds), TaskBuildStatus::Failed);
    }

    #[test]
    fn pending_before_running() {
        let builds = vec![
            build(WorkflowStatus::Pending, BuildUploadStatus::Pending),
            build(WorkflowStatus::Running, BuildUploadStatus::Pending),
        ];
        assert_eq!(aggregate_build_status(&builds), TaskBuildStatus::Pending);
    }

    #[test]
    fn completed_requires_uploads() {
        let waiting = vec![build(WorkflowStatus::Completed, BuildUploadStatus::Pending)];
        assert_eq!(aggregate_build_status(&waiting), TaskBuildStatus::Pending);

        let done = vec![
            build(WorkflowStatus::Completed, BuildUploadStatus::Uploaded),
            build(WorkflowStatus::Completed, BuildUploadStatus::Uploaded),
        ];
        assert_eq!(aggregate_build_status(&done), TaskBuildStatus::Completed);
    }

    #[test]
    fn upload_failure_alone_fails() {
        let builds = vec![build(WorkflowStatus::Completed, BuildUploadStatus::Failed)];
        assert_eq!(aggregate_build_status(&builds), TaskBuildStatus::Failed);
    }
}
