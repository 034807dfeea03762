use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use serde_json::json;
use tracing::info;

use crate::catalog::required_platforms;
use crate::db::{new_build, Db};
use crate::providers::ProviderSet;
use crate::types::{
    BuildType, Platform, PlatformTarget, RegressionCycle, Release, ReleaseConfig, ReleaseTask,
    TaskType, WorkflowStatus,
};

// ── Outcome ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskDisposition {
    /// Work finished synchronously.
    Completed,
    /// Remote work launched; the callback aggregator (or the engine's test
    /// run probe) asserts completion later.
    AwaitingCallback,
    /// Build task in manual mode; completion comes from upload intake.
    AwaitingManualBuild,
    /// Human sign-off required; completion comes from `approve_task`.
    AwaitingApproval,
    /// Terminal provider error; the engine pauses the release.
    Failed,
}

#[derive(Debug, Clone)]
pub struct TaskOutcome {
    pub disposition: TaskDisposition,
    pub external_id: Option<String>,
    pub external_data: Option<serde_json::Value>,
    pub error: Option<String>,
}

impl TaskOutcome {
    fn new(disposition: TaskDisposition) -> Self {
        Self {
            disposition,
            external_id: None,
            external_data: None,
            error: None,
        }
    }

    pub fn completed() -> Self {
        Self::new(TaskDisposition::Completed)
    }

    pub fn awaiting_callback() -> Self {
        Self::new(TaskDisposition::AwaitingCallback)
    }

    pub fn awaiting_manual_build() -> Self {
        Self::new(TaskDisposition::AwaitingManualBuild)
    }

    pub fn awaiting_approval() -> Self {
        Self::new(TaskDisposition::AwaitingApproval)
    }

    pub fn failed(error: impl Into<String>) -> Self {
        let mut o = Self::new(TaskDisposition::Failed);
        o.error = Some(error.into());
        o
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.external_id = Some(id.into());
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.external_data = Some(data);
        self
    }
}

/// Everything the executor needs about the task's surroundings, loaded by
/// the engine at the top of the tick.
pub struct TaskContext<'a> {
    pub release: &'a Release,
    pub task: &'a ReleaseTask,
    pub cycle: Option<&'a RegressionCycle>,
    pub config: &'a ReleaseConfig,
    pub targets: &'a [PlatformTarget],
}

// ── Version string ───────────────────────────────────────────────────────

/// Stable `version_platform` pairs joined by `_`, in platform-alphabetical
/// order: `[{IOS,6.7.0},{ANDROID,7.0.0}]` → `"7.0.0_android_6.7.0_ios"`.
/// Empty input yields `"unknown"`.
pub fn platform_version_string(targets: &[PlatformTarget]) -> String {
    if targets.is_empty() {
        return "unknown".to_string();
    }
    let mut pairs: Vec<(String, String)> = targets
        .iter()
        .map(|t| (t.platform.as_str().to_lowercase(), t.version.clone()))
        .collect();
    pairs.sort();
    pairs.dedup();
    pairs
        .into_iter()
        .map(|(platform, version)| format!("{version}_{platform}"))
        .collect::<Vec<_>>()
        .join("_")
}

// ── Executor ─────────────────────────────────────────────────────────────

/// Binds abstract task types to concrete provider operations and persists
/// build rows. Provider failures come back as a FAILED outcome, never as
/// an Err; Err is reserved for repository faults.
pub struct TaskExecutor {
    db: Arc<Db>,
    providers: Arc<ProviderSet>,
}

impl TaskExecutor {
    pub fn new(db: Arc<Db>, providers: Arc<ProviderSet>) -> Self {
        Self { db, providers }
    }

    pub async fn execute(&self, ctx: &TaskContext<'_>) -> Result<TaskOutcome> {
        let outcome = match ctx.task.task_type {
            TaskType::PreKickOffReminder => self.pre_kick_off_reminder(ctx).await,
            TaskType::ForkBranch => self.fork_branch(ctx).await,
            TaskType::CreateProjectManagementTicket => self.create_pm_ticket(ctx).await,
            TaskType::CreateTestSuite => self.create_test_suite(ctx).await,
            TaskType::CreateTestSuiteRun => self.create_test_suite_run(ctx).await?,
            TaskType::CreateReleaseTag => self.create_release_tag(ctx).await,
            TaskType::TriggerPreRegressionBuilds
            | TaskType::TriggerRegressionBuilds
            | TaskType::TriggerTestFlightBuild
            | TaskType::CreateAabBuild => self.run_build_task(ctx).await?,
            TaskType::TestflightBuildVerified | TaskType::RegressionStageApproval => {
                self.request_approval(ctx).await
            }
            TaskType::AdHocNotification => self.ad_hoc_notification(ctx).await,
        };
        Ok(outcome)
    }

    // ── Notifications ────────────────────────────────────────────────────

    async fn pre_kick_off_reminder(&self, ctx: &TaskContext<'_>) -> TaskOutcome {
        let vars = self.common_vars(ctx);
        match self
            .providers
            .notifier
            .post_message(&ctx.config.notification_channel, "pre_kick_off_reminder", &vars)
            .await
        {
            Ok(()) => TaskOutcome::completed(),
            Err(e) => TaskOutcome::failed(format!("kick-off reminder: {e}")),
        }
    }

    async fn request_approval(&self, ctx: &TaskContext<'_>) -> TaskOutcome {
        if !ctx.config.notification_channel.is_empty() {
            let vars = self.common_vars(ctx);
            if let Err(e) = self
                .providers
                .notifier
                .post_message(&ctx.config.notification_channel, "approval_requested", &vars)
                .await
            {
                return TaskOutcome::failed(format!("approval notification: {e}"));
            }
        }
        TaskOutcome::awaiting_approval()
    }

    async fn ad_hoc_notification(&self, ctx: &TaskContext<'_>) -> TaskOutcome {
        let vars = self.common_vars(ctx);
        match self
            .providers
            .notifier
            .post_message(&ctx.config.notification_channel, "release_summary", &vars)
            .await
        {
            Ok(()) => TaskOutcome::completed(),
            Err(e) => TaskOutcome::failed(format!("release notification: {e}")),
        }
    }

    // ── Source control ───────────────────────────────────────────────────

    async fn fork_branch(&self, ctx: &TaskContext<'_>) -> TaskOutcome {
        let release = ctx.release;
        match self
            .providers
            .scm
            .fork_branch(&release.tenant_id, &release.release_branch, &release.base_branch)
            .await
        {
            Ok(()) => {
                info!(
                    "release #{}: forked {} from {}",
                    release.id, release.release_branch, release.base_branch
                );
                TaskOutcome::completed().with_data(json!({ "branch": release.release_branch }))
            }
            Err(e) => TaskOutcome::failed(format!("fork branch: {e}")),
        }
    }

    async fn create_release_tag(&self, ctx: &TaskContext<'_>) -> TaskOutcome {
        // Re-execution must reuse an existing tag, not cut a second one.
        if let Some(ref tag) = ctx.task.external_id {
            info!("release #{}: reusing tag {tag}", ctx.release.id);
            return TaskOutcome::completed();
        }
        let version = platform_version_string(ctx.targets);
        let tag = format!("release-{version}");
        match self
            .providers
            .scm
            .create_release_tag(&ctx.release.tenant_id, &ctx.release.release_branch, &tag, &version)
            .await
        {
            Ok(tag_url) => TaskOutcome::completed()
                .with_id(tag)
                .with_data(json!({ "tag_url": tag_url, "version": version })),
            Err(e) => TaskOutcome::failed(format!("create release tag: {e}")),
        }
    }

    // ── Project management ───────────────────────────────────────────────

    async fn create_pm_ticket(&self, ctx: &TaskContext<'_>) -> TaskOutcome {
        if let Some(ref ticket) = ctx.task.external_id {
            info!("release #{}: reusing ticket {ticket}", ctx.release.id);
            return TaskOutcome::completed();
        }
        let version = platform_version_string(ctx.targets);
        match self
            .providers
            .project_mgmt
            .create_ticket(&ctx.config.pm_project_key, None, &version)
            .await
        {
            Ok(ticket_id) => TaskOutcome::completed()
                .with_id(ticket_id.clone())
                .with_data(json!({ "ticket": ticket_id })),
            Err(e) => TaskOutcome::failed(format!("create ticket: {e}")),
        }
    }

    // ── Test management ──────────────────────────────────────────────────

    async fn create_test_suite(&self, ctx: &TaskContext<'_>) -> TaskOutcome {
        if let Some(ref suite) = ctx.task.external_id {
            info!("release #{}: reusing test suite {suite}", ctx.release.id);
            return TaskOutcome::completed();
        }
        let version = platform_version_string(ctx.targets);
        match self
            .providers
            .test_mgmt
            .create_suite(&ctx.config.test_mgmt_project, &version)
            .await
        {
            Ok(suite_id) => TaskOutcome::completed().with_id(suite_id),
            Err(e) => TaskOutcome::failed(format!("create test suite: {e}")),
        }
    }

    async fn create_test_suite_run(&self, ctx: &TaskContext<'_>) -> Result<TaskOutcome> {
        // Run already created on a previous tick; keep waiting for it.
        if ctx.task.external_id.is_some() {
            return Ok(TaskOutcome::awaiting_callback());
        }
        let suite_id = self
            .db
            .find_task_by_type(ctx.release.id, TaskType::CreateTestSuite)?
            .and_then(|t| t.external_id);
        let Some(suite_id) = suite_id else {
            return Ok(TaskOutcome::failed("no test suite available for run creation"));
        };
        let filters = json!({
            "cycle_tag": ctx.cycle.map(|c| c.cycle_tag),
            "branch": ctx.release.release_branch,
        });
        match self.providers.test_mgmt.create_run(&suite_id, &filters).await {
            Ok(run_id) => Ok(TaskOutcome::awaiting_callback()
                .with_id(run_id)
                .with_data(json!({ "suite": suite_id }))),
            Err(e) => Ok(TaskOutcome::failed(format!("create test run: {e}"))),
        }
    }

    // ── Builds ───────────────────────────────────────────────────────────

    async fn run_build_task(&self, ctx: &TaskContext<'_>) -> Result<TaskOutcome> {
        let platforms = required_platforms(ctx.task.task_type, ctx.targets);
        if platforms.is_empty() {
            return Ok(TaskOutcome::completed());
        }

        if ctx.release.has_manual_build_upload {
            // Manual mode: materialize pending build rows, never call CI/CD.
            for platform in platforms {
                if self.db.find_build(ctx.task.id, platform)?.is_none() {
                    self.db.insert_build(&new_build(
                        ctx.release.id,
                        ctx.task.id,
                        platform,
                        BuildType::Manual,
                        None,
                    ))?;
                }
            }
            return Ok(TaskOutcome::awaiting_manual_build());
        }

        let kind = ctx.config.ci_provider;
        let ci = match self.providers.cicd(kind) {
            Ok(ci) => ci,
            Err(e) => return Ok(TaskOutcome::failed(e.to_string())),
        };

        for platform in platforms {
            // A row with a queue location is an already-issued trigger;
            // failed rows were cleared by retry before we got here.
            if let Some(existing) = self.db.find_build(ctx.task.id, platform)? {
                if existing.queue_location.is_some()
                    && existing.workflow_status != WorkflowStatus::Failed
                {
                    continue;
                }
            }

            let params = self.build_params(ctx, platform);
            match ci
                .trigger_job(&ctx.release.tenant_id, &ctx.config.ci_workflow_id, &params)
                .await
            {
                Ok(job) => {
                    let build_id = self.db.insert_build(&new_build(
                        ctx.release.id,
                        ctx.task.id,
                        platform,
                        BuildType::Cicd,
                        Some(kind),
                    ))?;
                    self.db.update_build_queue(build_id, &job.queue_location, kind)?;
                    info!(
                        "task #{}: triggered {} build, queued at {}",
                        ctx.task.id,
                        platform.as_str().to_lowercase(),
                        job.queue_location
                    );
                }
                Err(e) => {
                    return Ok(TaskOutcome::failed(format!(
                        "trigger {} build: {e}",
                        platform.as_str().to_lowercase()
                    )));
                }
            }
        }

        Ok(TaskOutcome::awaiting_callback())
    }

    fn build_params(&self, ctx: &TaskContext<'_>, platform: Platform) -> HashMap<String, String> {
        let version = ctx
            .targets
            .iter()
            .find(|t| t.platform == platform)
            .map(|t| t.version.clone())
            .unwrap_or_default();
        let mut params = HashMap::new();
        params.insert("platform".into(), platform.as_str().to_lowercase());
        params.insert("branch".into(), ctx.release.release_branch.clone());
        params.insert("version".into(), version);
        if let Some(cycle) = ctx.cycle {
            params.insert("cycle_tag".into(), cycle.cycle_tag.to_string());
        }
        params
    }

    fn common_vars(&self, ctx: &TaskContext<'_>) -> HashMap<String, String> {
        let mut vars = HashMap::new();
        vars.insert("release".into(), ctx.release.name.clone());
        vars.insert("branch".into(), ctx.release.release_branch.clone());
        vars.insert("version".into(), platform_version_string(ctx.targets));
        vars.insert(
            "kick_off".into(),
            ctx.release.kick_off_date.format("%Y-%m-%d %H:%M").to_string(),
        );
        vars
    }
}

// ── Tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TargetStore;

    fn target(platform: Platform, version: &str) -> PlatformTarget {
        PlatformTarget {
            id: 0,
            release_id: 1,
            platform,
            target: TargetStore::Web,
            version: version.into(),
        }
    }

    #[test]
    fn version_string_sorts_platform_alphabetically() {
        let targets = vec![target(Platform::Ios, "6.7.0"), target(Platform::Android, "7.0.0")];
        assert_eq!(platform_version_string(&targets), "7.0.0_android_6.7.0_ios");
    }

    #[test]
    fn version_string_is_order_invariant() {
        let a = vec![target(Platform::Ios, "6.7.0"), target(Platform::Android, "7.0.0")];
        let b = vec![target(Platform::Android, "7.0.0"), target(Platform::Ios, "6.7.0")];
        assert_eq!(platform_version_string(&a), platform_version_string(&b));
    }

    #[test]
    fn version_string_empty_is_unknown() {
        assert_eq!(platform_version_string(&[]), "unknown");
    }

    #[test]
    fn version_string_dedups_repeated_targets() {
        let targets = vec![target(Platform::Web, "2.0"), target(Platform::Web, "2.0")];
        assert_eq!(platform_version_string(&targets), "2.0_web");
    }
}
