use std::sync::Arc;

use anyhow::Result;
use chrono::Duration;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::callback::CallbackAggregator;
use crate::catalog;
use crate::clock::{is_slot_due, Clock};
use crate::config::Config;
use crate::db::Db;
use crate::executor::{TaskContext, TaskDisposition, TaskExecutor};
use crate::polling::PollingManager;
use crate::providers::ProviderSet;
use crate::types::{
    CronJob, CronStatus, CycleStatus, PauseType, Platform, PlatformTarget, RegressionCycle,
    Release, ReleaseConfig, ReleaseStatus, ReleaseTask, Stage, StageStatus, TargetStore,
    TaskStatus, TaskType,
};

/// Result of walking one stage/cycle task group on a tick.
enum StageProgress {
    /// Every non-skipped task is COMPLETED; the group is done.
    AllSettled,
    /// A task was dispatched this tick.
    Advanced,
    /// Blocked on time gating, callbacks, manual builds or approval.
    Waiting,
}

/// Per-release state machine. `execute` is invoked by the scheduler on each
/// tick and performs at most one task dispatch, plus any stage/cycle
/// bookkeeping that became due.
pub struct Engine {
    db: Arc<Db>,
    executor: TaskExecutor,
    providers: Arc<ProviderSet>,
    callback: Arc<CallbackAggregator>,
    polling: Arc<PollingManager>,
    clock: Arc<dyn Clock>,
    config: Arc<Config>,
}

impl Engine {
    pub fn new(
        db: Arc<Db>,
        providers: Arc<ProviderSet>,
        callback: Arc<CallbackAggregator>,
        polling: Arc<PollingManager>,
        clock: Arc<dyn Clock>,
        config: Arc<Config>,
    ) -> Self {
        let executor = TaskExecutor::new(Arc::clone(&db), Arc::clone(&providers));
        Self {
            db,
            executor,
            providers,
            callback,
            polling,
            clock,
            config,
        }
    }

    // ── Tick entry point ─────────────────────────────────────────────────

    pub async fn execute(&self, release_id: i64) -> Result<()> {
        let Some(release) = self.db.get_release(release_id)? else {
            warn!("engine: release #{release_id} not found");
            return Ok(());
        };
        if release.status.is_terminal() {
            return Ok(());
        }
        let Some(cron) = self.db.get_cron_job(release_id)? else {
            warn!("engine: release #{release_id} has no cron job");
            return Ok(());
        };
        if cron.pause_type != PauseType::None {
            debug!("release #{release_id}: paused ({}), skipping tick", cron.pause_type);
            return Ok(());
        }

        let config =
            catalog::resolve_config(&self.db, &release, self.config.default_ci_provider)?;
        let targets = self.db.list_platform_targets(release_id)?;

        if cron.stage1_status == StageStatus::InProgress {
            self.run_stage1(&release, &cron, &config, &targets).await
        } else if cron.stage2_status == StageStatus::InProgress {
            self.run_stage2(&release, &cron, &config, &targets).await
        } else if cron.stage3_status == StageStatus::InProgress {
            self.run_stage3(&release, &cron, &config, &targets).await
        } else {
            self.decide_transition(&release, &cron, &config, &targets).await
        }
    }

    // ── Stage 1: kickoff ─────────────────────────────────────────────────

    async fn run_stage1(
        &self,
        release: &Release,
        cron: &CronJob,
        config: &ReleaseConfig,
        targets: &[PlatformTarget],
    ) -> Result<()> {
        let tasks = ordered(self.db.list_tasks_for_stage(release.id, Stage::Kickoff, None)?);
        if let StageProgress::AllSettled =
            self.step_tasks(release, cron, config, targets, None, &tasks).await?
        {
            self.db
                .update_stage_status(release.id, Stage::Kickoff, StageStatus::Completed)?;
            info!("release #{}: kickoff stage completed", release.id);
            if cron.auto_transition_to_stage2 {
                self.db
                    .update_stage_status(release.id, Stage::Regression, StageStatus::InProgress)?;
                info!("release #{}: regression stage started", release.id);
            } else {
                self.pause_for_stage_trigger(release.id)?;
            }
        }
        Ok(())
    }

    // ── Stage 2: regression cycles ───────────────────────────────────────

    async fn run_stage2(
        &self,
        release: &Release,
        cron: &CronJob,
        config: &ReleaseConfig,
        targets: &[PlatformTarget],
    ) -> Result<()> {
        let latest = self.db.latest_cycle(release.id)?;
        if let Some(cycle) = latest.filter(|c| c.status != CycleStatus::Done) {
            if cycle.status == CycleStatus::NotStarted {
                self.db.update_cycle_status(cycle.id, CycleStatus::InProgress)?;
            }
            let tasks = ordered(self.db.list_tasks_for_stage(
                release.id,
                Stage::Regression,
                Some(cycle.id),
            )?);
            if let StageProgress::AllSettled = self
                .step_tasks(release, cron, config, targets, Some(&cycle), &tasks)
                .await?
            {
                self.db.update_cycle_status(cycle.id, CycleStatus::Done)?;
                info!(
                    "release #{}: regression cycle {} done",
                    release.id, cycle.cycle_tag
                );
            }
            return Ok(());
        }

        if let Some(first) = cron.upcoming_regressions.first() {
            if is_slot_due(first.slot_time, self.clock.now(), self.config.slot_window_mins) {
                self.start_cycle(release, cron, config, targets).await?;
            }
            return Ok(());
        }

        // No cycle in flight, no slots remaining: the stage is done.
        self.db
            .update_stage_status(release.id, Stage::Regression, StageStatus::Completed)?;
        info!("release #{}: regression stage completed", release.id);
        if cron.auto_transition_to_stage3 {
            self.enter_stage3(release, cron, config, targets)?;
        } else {
            self.pause_for_stage_trigger(release.id)?;
        }
        Ok(())
    }

    async fn start_cycle(
        &self,
        release: &Release,
        cron: &CronJob,
        config: &ReleaseConfig,
        targets: &[PlatformTarget],
    ) -> Result<()> {
        let mut slots = cron.upcoming_regressions.clone();
        let slot = slots.remove(0);
        self.db.set_upcoming_regressions(release.id, &slots)?;

        let cycle_tag = self
            .db
            .list_cycles(release.id)?
            .last()
            .map(|c| c.cycle_tag)
            .unwrap_or(0)
            + 1;
        let cycle_id = self.db.insert_cycle(release.id, cycle_tag)?;
        catalog::insert_task_group(
            &self.db,
            release.id,
            Stage::Regression,
            Some(cycle_id),
            &catalog::cycle_tasks(&cron.toggles, &slot.config, config, targets),
        )?;
        info!(
            "release #{}: created regression cycle {cycle_tag} (slot {})",
            release.id, slot.slot_time
        );
        Ok(())
    }

    // ── Stage 3: pre-release ─────────────────────────────────────────────

    async fn run_stage3(
        &self,
        release: &Release,
        cron: &CronJob,
        config: &ReleaseConfig,
        targets: &[PlatformTarget],
    ) -> Result<()> {
        // Stage entry normally seeds the group; recover if it did not.
        let mut tasks = ordered(self.db.list_tasks_for_stage(
            release.id,
            Stage::PostRegression,
            None,
        )?);
        if tasks.is_empty() {
            catalog::insert_task_group(
                &self.db,
                release.id,
                Stage::PostRegression,
                None,
                &catalog::pre_release_tasks(&cron.toggles, config, targets),
            )?;
            tasks = ordered(self.db.list_tasks_for_stage(
                release.id,
                Stage::PostRegression,
                None,
            )?);
        }

        // Store submissions sit between build verification and the final
        // notification, so they run before the remaining tasks are stepped.
        if !self.maybe_upload_store_builds(release, config, targets, &tasks).await? {
            return Ok(());
        }

        if let StageProgress::AllSettled =
            self.step_tasks(release, cron, config, targets, None, &tasks).await?
        {
            self.finalize_release(release).await?;
        }
        Ok(())
    }

    fn enter_stage3(
        &self,
        release: &Release,
        cron: &CronJob,
        config: &ReleaseConfig,
        targets: &[PlatformTarget],
    ) -> Result<()> {
        self.db
            .update_stage_status(release.id, Stage::PostRegression, StageStatus::InProgress)?;
        catalog::insert_task_group(
            &self.db,
            release.id,
            Stage::PostRegression,
            None,
            &catalog::pre_release_tasks(&cron.toggles, config, targets),
        )?;
        info!("release #{}: pre-release stage started", release.id);
        Ok(())
    }

    /// Uploads completed store-bound builds once their build and
    /// verification tasks have settled. Returns false when the release was
    /// paused by an upload failure.
    async fn maybe_upload_store_builds(
        &self,
        release: &Release,
        config: &ReleaseConfig,
        targets: &[PlatformTarget],
        tasks: &[ReleaseTask],
    ) -> Result<bool> {
        let gate_settled = |task_type: TaskType| {
            tasks
                .iter()
                .filter(|t| t.task_type == task_type)
                .all(|t| t.status.is_settled())
        };
        if !gate_settled(TaskType::TriggerTestFlightBuild)
            || !gate_settled(TaskType::CreateAabBuild)
            || !gate_settled(TaskType::TestflightBuildVerified)
        {
            return Ok(true);
        }

        for target in targets {
            let task_type = match (target.platform, target.target) {
                (Platform::Ios, TargetStore::AppStore) => TaskType::TriggerTestFlightBuild,
                (Platform::Android, TargetStore::PlayStore) => TaskType::CreateAabBuild,
                _ => continue,
            };
            let Some(task) = tasks.iter().find(|t| t.task_type == task_type) else {
                continue;
            };
            if task.status != TaskStatus::Completed {
                continue;
            }
            if task.external_data.get("submission_id").is_some() {
                continue;
            }
            let Some(build) = self.db.find_build(task.id, target.platform)? else {
                continue;
            };
            let artifact = build
                .artifact_path
                .clone()
                .or(build.ci_run_id.clone())
                .unwrap_or_default();

            let upload = async {
                self.providers.store.verify_credentials(target.platform).await?;
                self.providers
                    .store
                    .upload_build(
                        target.platform,
                        &artifact,
                        &json!({ "version": target.version }),
                    )
                    .await
            };
            match upload.await {
                Ok(submission_id) => {
                    let mut data = task.external_data.clone();
                    if let Some(obj) = data.as_object_mut() {
                        obj.insert("submission_id".into(), json!(submission_id));
                    } else {
                        data = json!({ "submission_id": submission_id });
                    }
                    self.db.update_task_external(task.id, None, &data)?;
                    info!(
                        "release #{}: uploaded {} build to {}",
                        release.id,
                        target.platform.as_str().to_lowercase(),
                        target.target
                    );
                }
                Err(e) => {
                    warn!(
                        "release #{}: store upload for {} failed: {e}",
                        release.id,
                        target.platform.as_str().to_lowercase()
                    );
                    self.fail_task(release.id, task.id)?;
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    async fn finalize_release(&self, release: &Release) -> Result<()> {
        self.db
            .update_stage_status(release.id, Stage::PostRegression, StageStatus::Completed)?;
        self.db.update_cron_status(release.id, CronStatus::Completed)?;
        self.db
            .update_release_status(release.id, ReleaseStatus::Completed, "system")?;
        self.db.set_release_date(release.id, self.clock.now())?;
        self.polling.delete_jobs(release.id).await;
        info!("release #{}: completed", release.id);
        Ok(())
    }

    // ── Stage transitions outside a running stage ────────────────────────

    async fn decide_transition(
        &self,
        release: &Release,
        cron: &CronJob,
        config: &ReleaseConfig,
        targets: &[PlatformTarget],
    ) -> Result<()> {
        if cron.stage1_status == StageStatus::Pending {
            self.db
                .update_stage_status(release.id, Stage::Kickoff, StageStatus::InProgress)?;
        } else if cron.stage1_status == StageStatus::Completed
            && cron.stage2_status == StageStatus::Pending
        {
            if cron.auto_transition_to_stage2 {
                self.db
                    .update_stage_status(release.id, Stage::Regression, StageStatus::InProgress)?;
            } else {
                self.pause_for_stage_trigger(release.id)?;
            }
        } else if cron.stage2_status == StageStatus::Completed
            && cron.stage3_status == StageStatus::Pending
        {
            if cron.auto_transition_to_stage3 {
                self.enter_stage3(release, cron, config, targets)?;
            } else {
                self.pause_for_stage_trigger(release.id)?;
            }
        } else if cron.stage3_status == StageStatus::Completed
            && cron.cron_status != CronStatus::Completed
        {
            self.finalize_release(release).await?;
        }
        Ok(())
    }

    fn pause_for_stage_trigger(&self, release_id: i64) -> Result<()> {
        self.db.update_cron_status(release_id, CronStatus::Paused)?;
        self.db
            .update_pause_type(release_id, PauseType::AwaitingStageTrigger)?;
        info!("release #{release_id}: awaiting stage trigger");
        Ok(())
    }

    // ── Shared stage-task walk ───────────────────────────────────────────

    /// Walks a task group in order. Dispatches the first PENDING task whose
    /// predecessors are all settled; any earlier unsettled task blocks the
    /// group for this tick.
    async fn step_tasks(
        &self,
        release: &Release,
        cron: &CronJob,
        config: &ReleaseConfig,
        targets: &[PlatformTarget],
        cycle: Option<&RegressionCycle>,
        tasks: &[ReleaseTask],
    ) -> Result<StageProgress> {
        for task in tasks {
            match task.status {
                TaskStatus::Completed | TaskStatus::Skipped => continue,
                TaskStatus::Failed => return Ok(StageProgress::Waiting),
                TaskStatus::AwaitingCallback => {
                    if task.task_type == TaskType::CreateTestSuiteRun {
                        self.check_test_run(task).await?;
                    } else if task.task_type.is_build_task() {
                        // A missed callback is re-derived from the build rows.
                        self.callback.process_callback(task.id)?;
                    }
                    return Ok(StageProgress::Waiting);
                }
                TaskStatus::AwaitingManualBuild => {
                    // Uploads staged before this tick may already satisfy it.
                    if self.callback.consume_staged_uploads(task.id)? {
                        self.callback.process_callback(task.id)?;
                    }
                    return Ok(StageProgress::Waiting);
                }
                TaskStatus::InProgress => return Ok(StageProgress::Waiting),
                TaskStatus::Pending => {
                    if !self.task_due(release, task) {
                        debug!(
                            "task #{} [{}]: not yet due",
                            task.id, task.task_type
                        );
                        return Ok(StageProgress::Waiting);
                    }
                    self.run_task(release, cron, config, targets, cycle, task).await?;
                    return Ok(StageProgress::Advanced);
                }
            }
        }
        Ok(StageProgress::AllSettled)
    }

    /// Wall-clock gating for the kickoff tasks; everything else is due as
    /// soon as its predecessors settle.
    fn task_due(&self, release: &Release, task: &ReleaseTask) -> bool {
        let now = self.clock.now();
        let window = self.config.slot_window_mins;
        match task.task_type {
            TaskType::PreKickOffReminder => {
                let reminder_slot =
                    release.kick_off_date - Duration::minutes(self.config.reminder_lead_mins);
                is_slot_due(reminder_slot, now, window)
            }
            TaskType::ForkBranch => is_slot_due(release.kick_off_date, now, window),
            _ => true,
        }
    }

    async fn run_task(
        &self,
        release: &Release,
        _cron: &CronJob,
        config: &ReleaseConfig,
        targets: &[PlatformTarget],
        cycle: Option<&RegressionCycle>,
        task: &ReleaseTask,
    ) -> Result<()> {
        self.db.update_task_status(task.id, TaskStatus::InProgress)?;
        info!(
            "release #{}: dispatching task #{} [{}]",
            release.id, task.id, task.task_type
        );

        let ctx = TaskContext {
            release,
            task,
            cycle,
            config,
            targets,
        };
        let outcome = self.executor.execute(&ctx).await?;

        if outcome.external_id.is_some() || outcome.external_data.is_some() {
            let data = outcome
                .external_data
                .clone()
                .unwrap_or_else(|| task.external_data.clone());
            self.db
                .update_task_external(task.id, outcome.external_id.as_deref(), &data)?;
        }

        match outcome.disposition {
            TaskDisposition::Completed => {
                self.db.update_task_status(task.id, TaskStatus::Completed)?;
                info!("task #{} [{}] completed", task.id, task.task_type);
            }
            TaskDisposition::AwaitingCallback => {
                self.db
                    .update_task_status(task.id, TaskStatus::AwaitingCallback)?;
            }
            TaskDisposition::AwaitingManualBuild => {
                self.db
                    .update_task_status(task.id, TaskStatus::AwaitingManualBuild)?;
                if self.callback.consume_staged_uploads(task.id)? {
                    self.callback.process_callback(task.id)?;
                }
            }
            TaskDisposition::AwaitingApproval => {
                // Parked IN_PROGRESS until approve_task.
            }
            TaskDisposition::Failed => {
                warn!(
                    "task #{} [{}] failed: {}",
                    task.id,
                    task.task_type,
                    outcome.error.as_deref().unwrap_or("unknown error")
                );
                self.fail_task(release.id, task.id)?;
            }
        }
        Ok(())
    }

    fn fail_task(&self, release_id: i64, task_id: i64) -> Result<()> {
        self.db.update_task_status(task_id, TaskStatus::Failed)?;
        self.db
            .update_release_status(release_id, ReleaseStatus::Paused, "system")?;
        self.db.update_cron_status(release_id, CronStatus::Paused)?;
        self.db.update_pause_type(release_id, PauseType::TaskFailure)?;
        Ok(())
    }

    /// Test runs have no Build rows, so the engine itself probes the run
    /// until it reports done.
    async fn check_test_run(&self, task: &ReleaseTask) -> Result<()> {
        let Some(run_id) = task.external_id.as_deref() else {
            return Ok(());
        };
        match self.providers.test_mgmt.get_run_status(run_id).await {
            Ok(status) if status.done => {
                let mut data = task.external_data.clone();
                if let Some(obj) = data.as_object_mut() {
                    obj.insert("pass_percent".into(), json!(status.pass_percent));
                }
                self.db.update_task_external(task.id, None, &data)?;
                self.db.update_task_status(task.id, TaskStatus::Completed)?;
                info!(
                    "task #{}: test run {run_id} done ({:.1}% passing)",
                    task.id, status.pass_percent
                );
            }
            Ok(_) => debug!("task #{}: test run {run_id} still executing", task.id),
            Err(e) => warn!("task #{}: test run status: {e}", task.id),
        }
        Ok(())
    }
}

fn ordered(mut tasks: Vec<ReleaseTask>) -> Vec<ReleaseTask> {
    tasks.sort_by_key(|t| (t.task_type.order(), t.id));
    tasks
}
