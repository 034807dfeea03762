use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{info, warn};

use crate::callback::CallbackAggregator;
use crate::catalog;
use crate::clock::Clock;
use crate::config::Config;
use crate::db::Db;
use crate::polling::PollingManager;
use crate::scheduler::Scheduler;
use crate::types::{
    CronJob, CronStatus, CronToggles, PauseType, Platform, PlatformTarget, RegressionSlot,
    Release, ReleaseStatus, ReleaseType, ReleaseUpload, Stage, StageStatus, TargetStore,
    TaskStatus, UploadStage,
};

// ── Result type at the service boundary ──────────────────────────────────

/// Boundary errors carry an HTTP-equivalent status; transports map them
/// directly. Internal faults are folded into a 500 without leaking detail.
#[derive(Debug)]
pub struct ServiceError {
    pub status: u16,
    pub message: String,
}

impl ServiceError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self { status: 400, message: message.into() }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self { status: 404, message: message.into() }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self { status: 409, message: message.into() }
    }
}

impl std::fmt::Display for ServiceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.status)
    }
}

impl From<anyhow::Error> for ServiceError {
    fn from(e: anyhow::Error) -> Self {
        warn!("service internal error: {e}");
        Self { status: 500, message: "internal error".into() }
    }
}

pub type ServiceResult<T> = Result<T, ServiceError>;

// ── External collaborator ────────────────────────────────────────────────

/// Cherry-pick bookkeeping lives outside the orchestration core; stage-3
/// approval only needs this one predicate.
#[async_trait]
pub trait ReleaseStatusCheck: Send + Sync {
    async fn cherry_picks_pending(&self, release_id: i64) -> Result<bool>;
}

/// Default collaborator for deployments without cherry-pick tracking.
pub struct NoPendingCherryPicks;

#[async_trait]
impl ReleaseStatusCheck for NoPendingCherryPicks {
    async fn cherry_picks_pending(&self, _release_id: i64) -> Result<bool> {
        Ok(false)
    }
}

// ── Request payloads ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct NewPlatformTarget {
    pub platform: Platform,
    pub target: TargetStore,
    pub version: String,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewReleaseRequest {
    pub tenant_id: String,
    #[serde(default)]
    pub name: String,
    pub release_branch: String,
    pub base_branch: String,
    pub release_type: ReleaseType,
    pub kick_off_date: DateTime<Utc>,
    pub target_release_date: DateTime<Utc>,
    #[serde(default)]
    pub has_manual_build_upload: bool,
    #[serde(default)]
    pub release_config_id: Option<i64>,
    #[serde(default)]
    pub created_by: String,
    #[serde(default)]
    pub release_pilot: String,
    #[serde(default = "default_true")]
    pub auto_transition_to_stage2: bool,
    #[serde(default = "default_true")]
    pub auto_transition_to_stage3: bool,
    #[serde(default)]
    pub upcoming_regressions: Vec<RegressionSlot>,
    #[serde(default)]
    pub toggles: Option<CronToggles>,
    #[serde(default)]
    pub targets: Vec<NewPlatformTarget>,
}

// ── Service façade ───────────────────────────────────────────────────────

/// Thin operations over the repositories, scheduler and pollers. All state
/// transitions the HTTP surface can cause go through here.
pub struct ReleaseService {
    db: Arc<Db>,
    scheduler: Arc<Scheduler>,
    polling: Arc<PollingManager>,
    callback: Arc<CallbackAggregator>,
    status_check: Arc<dyn ReleaseStatusCheck>,
    clock: Arc<dyn Clock>,
    config: Arc<Config>,
}

impl ReleaseService {
    pub fn new(
        db: Arc<Db>,
        scheduler: Arc<Scheduler>,
        polling: Arc<PollingManager>,
        callback: Arc<CallbackAggregator>,
        status_check: Arc<dyn ReleaseStatusCheck>,
        clock: Arc<dyn Clock>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            db,
            scheduler,
            polling,
            callback,
            status_check,
            clock,
            config,
        }
    }

    // ── Creation ─────────────────────────────────────────────────────────

    pub fn create_release(&self, req: NewReleaseRequest) -> ServiceResult<Release> {
        if req.release_branch.is_empty() || req.base_branch.is_empty() {
            return Err(ServiceError::bad_request("release and base branches are required"));
        }
        if req.tenant_id.is_empty() {
            return Err(ServiceError::bad_request("tenant is required"));
        }

        let toggles = match req.toggles.clone() {
            Some(t) => t,
            None => match req.release_config_id {
                Some(id) => self
                    .db
                    .get_release_config(id)?
                    .map(|c| c.default_toggles)
                    .unwrap_or_default(),
                None => CronToggles::default(),
            },
        };

        let now = self.clock.now();
        let release_id = self.db.insert_release(&Release {
            id: 0,
            tenant_id: req.tenant_id.clone(),
            name: req.name.clone(),
            release_branch: req.release_branch.clone(),
            base_branch: req.base_branch.clone(),
            release_type: req.release_type,
            status: ReleaseStatus::InProgress,
            kick_off_date: req.kick_off_date,
            target_release_date: req.target_release_date,
            release_date: None,
            has_manual_build_upload: req.has_manual_build_upload,
            release_config_id: req.release_config_id,
            created_by: req.created_by.clone(),
            release_pilot: req.release_pilot.clone(),
            last_updated_by: req.created_by.clone(),
            created_at: now,
        })?;

        self.db.insert_cron_job(&CronJob {
            id: 0,
            release_id,
            cron_status: CronStatus::Pending,
            stage1_status: StageStatus::Pending,
            stage2_status: StageStatus::Pending,
            stage3_status: StageStatus::Pending,
            toggles,
            upcoming_regressions: req.upcoming_regressions.clone(),
            auto_transition_to_stage2: req.auto_transition_to_stage2,
            auto_transition_to_stage3: req.auto_transition_to_stage3,
            pause_type: PauseType::None,
            cron_stopped_at: None,
        })?;

        for target in &req.targets {
            self.db.insert_platform_target(&PlatformTarget {
                id: 0,
                release_id,
                platform: target.platform,
                target: target.target,
                version: target.version.clone(),
            })?;
        }

        let release = self
            .db
            .get_release(release_id)?
            .ok_or_else(|| ServiceError::not_found("release not found"))?;
        info!("created release #{release_id} ({})", release.release_branch);
        Ok(release)
    }

    // ── Cron lifecycle ───────────────────────────────────────────────────

    pub async fn start_cron_job(&self, release_id: i64) -> ServiceResult<()> {
        let release = self.load_release(release_id, None)?;
        if release.status.is_terminal() {
            return Err(ServiceError::bad_request("release is already finished"));
        }
        if self.scheduler.is_running(release_id).await {
            return Err(ServiceError::conflict("cron already running for release"));
        }
        let cron = self.load_cron(release_id)?;

        let config =
            catalog::resolve_config(&self.db, &release, self.config.default_ci_provider)?;
        let targets = self.db.list_platform_targets(release_id)?;
        catalog::insert_task_group(
            &self.db,
            release_id,
            Stage::Kickoff,
            None,
            &catalog::kickoff_tasks(&cron.toggles, &config, &targets),
        )?;

        if cron.stage1_status == StageStatus::Pending {
            self.db
                .update_stage_status(release_id, Stage::Kickoff, StageStatus::InProgress)?;
        }
        self.db.update_cron_status(release_id, CronStatus::Running)?;
        self.db.update_pause_type(release_id, PauseType::None)?;
        self.db.set_cron_stopped_at(release_id, None)?;

        self.scheduler.start(release_id).await;
        // Best-effort: a failure to create pollers must not block the start.
        self.polling.create_jobs(release_id).await;
        info!("started cron job for release #{release_id}");
        Ok(())
    }

    pub async fn stop_cron_job(&self, release_id: i64) -> ServiceResult<()> {
        self.load_release(release_id, None)?;
        self.scheduler.stop(release_id).await;
        self.db.set_cron_stopped_at(release_id, Some(self.clock.now()))?;
        info!("stopped cron job for release #{release_id}");
        Ok(())
    }

    // ── Stage triggers ───────────────────────────────────────────────────

    pub async fn trigger_stage2(&self, release_id: i64, tenant_id: &str) -> ServiceResult<()> {
        let _release = self.load_release(release_id, Some(tenant_id))?;
        let cron = self.load_cron(release_id)?;
        if cron.stage1_status != StageStatus::Completed
            || cron.stage2_status != StageStatus::Pending
        {
            return Err(ServiceError::bad_request(
                "stage 2 requires stage 1 completed and stage 2 pending",
            ));
        }

        self.db
            .update_stage_status(release_id, Stage::Regression, StageStatus::InProgress)?;
        self.db.update_cron_status(release_id, CronStatus::Running)?;
        self.db.update_pause_type(release_id, PauseType::None)?;
        self.ensure_runner(release_id).await;
        info!("release #{release_id}: stage 2 triggered");
        Ok(())
    }

    pub async fn trigger_stage3(
        &self,
        release_id: i64,
        tenant_id: &str,
        approved_by: &str,
        comments: Option<&str>,
        force_approve: bool,
    ) -> ServiceResult<()> {
        let release = self.load_release(release_id, Some(tenant_id))?;
        let cron = self.load_cron(release_id)?;
        if cron.stage2_status != StageStatus::Completed
            || cron.stage3_status != StageStatus::Pending
        {
            return Err(ServiceError::bad_request(
                "stage 3 requires stage 2 completed and stage 3 pending",
            ));
        }

        if !force_approve {
            if self.status_check.cherry_picks_pending(release_id).await? {
                return Err(ServiceError::bad_request("Cherry pick status check failed"));
            }
            let cycles_open = self.db.active_cycle_count(release_id)? > 0
                || !cron.upcoming_regressions.is_empty();
            if cycles_open {
                return Err(ServiceError::bad_request("Cycles not completed"));
            }
        }

        let config =
            catalog::resolve_config(&self.db, &release, self.config.default_ci_provider)?;
        let targets = self.db.list_platform_targets(release_id)?;
        self.db
            .update_stage_status(release_id, Stage::PostRegression, StageStatus::InProgress)?;
        catalog::insert_task_group(
            &self.db,
            release_id,
            Stage::PostRegression,
            None,
            &catalog::pre_release_tasks(&cron.toggles, &config, &targets),
        )?;
        self.db.update_cron_status(release_id, CronStatus::Running)?;
        self.db.update_pause_type(release_id, PauseType::None)?;
        self.db
            .update_release_status(release_id, release.status, approved_by)?;
        self.ensure_runner(release_id).await;
        info!(
            "release #{release_id}: stage 3 triggered by {approved_by}{}",
            comments.map(|c| format!(" ({c})")).unwrap_or_default()
        );
        Ok(())
    }

    // ── Pause / resume ───────────────────────────────────────────────────

    pub async fn pause_release(&self, release_id: i64, tenant_id: &str) -> ServiceResult<()> {
        let release = self.load_release(release_id, Some(tenant_id))?;
        if release.status.is_terminal() {
            return Err(ServiceError::bad_request("release is already finished"));
        }
        let cron = self.load_cron(release_id)?;
        match cron.pause_type {
            PauseType::UserRequested => return Ok(()),
            PauseType::TaskFailure => {
                return Err(ServiceError::bad_request(
                    "release is paused by a task failure; retry the failed task",
                ));
            }
            PauseType::None | PauseType::AwaitingStageTrigger | PauseType::AwaitingManualBuild => {}
        }

        self.db
            .update_release_status(release_id, ReleaseStatus::Paused, tenant_id)?;
        self.db.update_cron_status(release_id, CronStatus::Paused)?;
        self.db.update_pause_type(release_id, PauseType::UserRequested)?;
        info!("release #{release_id}: paused by user");
        Ok(())
    }

    pub async fn resume_release(&self, release_id: i64, tenant_id: &str) -> ServiceResult<()> {
        let _release = self.load_release(release_id, Some(tenant_id))?;
        let cron = self.load_cron(release_id)?;
        match cron.pause_type {
            PauseType::UserRequested => {}
            PauseType::None => {
                return Err(ServiceError::bad_request("release is not paused"));
            }
            PauseType::TaskFailure => {
                return Err(ServiceError::bad_request(
                    "a failed task must be retried before resuming",
                ));
            }
            PauseType::AwaitingStageTrigger => {
                return Err(ServiceError::bad_request(
                    "release is awaiting a stage trigger",
                ));
            }
            PauseType::AwaitingManualBuild => {
                return Err(ServiceError::bad_request(
                    "release is awaiting a manual build upload",
                ));
            }
        }

        self.db
            .update_release_status(release_id, ReleaseStatus::InProgress, tenant_id)?;
        self.db.update_cron_status(release_id, CronStatus::Running)?;
        self.db.update_pause_type(release_id, PauseType::None)?;
        self.ensure_runner(release_id).await;
        info!("release #{release_id}: resumed");
        Ok(())
    }

    // ── Task retry / approval ────────────────────────────────────────────

    pub async fn retry_task(&self, task_id: i64, account_id: &str) -> ServiceResult<()> {
        let task = self
            .db
            .get_task(task_id)?
            .ok_or_else(|| ServiceError::not_found("task not found"))?;
        if task.status != TaskStatus::Failed {
            return Err(ServiceError::bad_request("only failed tasks can be retried"));
        }

        self.db.update_task_status(task_id, TaskStatus::Pending)?;
        if task.task_type.is_build_task() {
            let cleared = self.db.reset_failed_builds_for_task(task_id)?;
            if cleared > 0 {
                info!("task #{task_id}: cleared {cleared} failed build rows");
            }
        }

        let release = self.load_release(task.release_id, None)?;
        let cron = self.load_cron(task.release_id)?;
        if release.status == ReleaseStatus::Paused && cron.pause_type == PauseType::TaskFailure {
            self.db
                .update_release_status(task.release_id, ReleaseStatus::InProgress, account_id)?;
            self.db
                .update_cron_status(task.release_id, CronStatus::Running)?;
            self.db.update_pause_type(task.release_id, PauseType::None)?;
        }
        self.ensure_runner(task.release_id).await;
        info!("task #{task_id}: reset to pending by {account_id}");
        Ok(())
    }

    pub fn approve_task(&self, task_id: i64, approved_by: &str) -> ServiceResult<()> {
        let task = self
            .db
            .get_task(task_id)?
            .ok_or_else(|| ServiceError::not_found("task not found"))?;
        if !task.task_type.is_approval_task() {
            return Err(ServiceError::bad_request("task does not require approval"));
        }
        if task.status == TaskStatus::Completed {
            return Ok(());
        }
        if task.status != TaskStatus::InProgress {
            return Err(ServiceError::bad_request("task is not awaiting approval"));
        }
        self.db.update_task_status(task_id, TaskStatus::Completed)?;
        info!("task #{task_id} [{}]: approved by {approved_by}", task.task_type);
        Ok(())
    }

    // ── Archive ──────────────────────────────────────────────────────────

    pub async fn archive_release(&self, release_id: i64, account_id: &str) -> ServiceResult<()> {
        let release = self.load_release(release_id, None)?;
        if release.status == ReleaseStatus::Archived {
            return Ok(());
        }

        self.db
            .update_release_status(release_id, ReleaseStatus::Archived, account_id)?;
        if let Some(cron) = self.db.get_cron_job(release_id)? {
            if cron.cron_status == CronStatus::Running {
                self.db.update_cron_status(release_id, CronStatus::Paused)?;
            }
        }
        self.db.set_cron_stopped_at(release_id, Some(self.clock.now()))?;
        self.scheduler.stop(release_id).await;
        self.polling.delete_jobs(release_id).await;
        info!("release #{release_id}: archived by {account_id}");
        Ok(())
    }

    // ── Manual upload intake ─────────────────────────────────────────────

    /// Upserts a manual artifact and, when the active build task's platform
    /// set becomes fully covered, completes it through the aggregator.
    pub fn upload_artifact(
        &self,
        release_id: i64,
        tenant_id: &str,
        platform: Platform,
        stage: UploadStage,
        artifact_path: &str,
    ) -> ServiceResult<()> {
        let release = self.load_release(release_id, Some(tenant_id))?;
        if release.status.is_terminal() {
            return Err(ServiceError::bad_request("release is already finished"));
        }
        if artifact_path.is_empty() {
            return Err(ServiceError::bad_request("artifact path is required"));
        }

        self.db.upsert_upload(&ReleaseUpload {
            id: 0,
            tenant_id: tenant_id.to_string(),
            release_id,
            platform,
            stage,
            artifact_path: artifact_path.to_string(),
            is_used: false,
            created_at: self.clock.now(),
        })?;
        info!(
            "release #{release_id}: staged manual {} artifact for {}",
            platform.as_str().to_lowercase(),
            stage
        );

        let awaiting = self
            .db
            .list_tasks_by_status(release_id, TaskStatus::AwaitingManualBuild)?;
        for task in awaiting {
            if UploadStage::for_stage(task.stage) != stage {
                continue;
            }
            if self.callback.consume_staged_uploads(task.id)? {
                self.callback.process_callback(task.id)?;
            }
            break;
        }
        Ok(())
    }

    // ── Helpers ──────────────────────────────────────────────────────────

    fn load_release(&self, release_id: i64, tenant_id: Option<&str>) -> ServiceResult<Release> {
        let release = self
            .db
            .get_release(release_id)?
            .ok_or_else(|| ServiceError::not_found("release not found"))?;
        // Ownership mismatches read as not-found to the caller.
        if let Some(tenant) = tenant_id {
            if release.tenant_id != tenant {
                return Err(ServiceError::not_found("release not found"));
            }
        }
        Ok(release)
    }

    fn load_cron(&self, release_id: i64) -> ServiceResult<CronJob> {
        self.db
            .get_cron_job(release_id)?
            .ok_or_else(|| ServiceError::not_found("cron job not found"))
    }

    async fn ensure_runner(&self, release_id: i64) {
        if !self.scheduler.is_running(release_id).await {
            self.scheduler.start(release_id).await;
        }
        self.polling.create_jobs(release_id).await;
    }
}
