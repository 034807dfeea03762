use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Declares an enum whose variants carry wire-stable string values, used
/// both in API payloads and as TEXT columns in the database.
macro_rules! wire_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $wire:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $( #[serde(rename = $wire)] $variant, )+
        }

        impl $name {
            pub fn as_str(self) -> &'static str {
                match self { $( Self::$variant => $wire, )+ }
            }
        }

        impl std::str::FromStr for $name {
            type Err = anyhow::Error;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $( $wire => Ok(Self::$variant), )+
                    _ => anyhow::bail!("unknown {} value: {s}", stringify!($name)),
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

// ── Status enums ─────────────────────────────────────────────────────────

wire_enum! {
    ReleaseType {
        Planned => "PLANNED",
        Hotfix => "HOTFIX",
        Major => "MAJOR",
        Minor => "MINOR",
    }
}

wire_enum! {
    ReleaseStatus {
        InProgress => "IN_PROGRESS",
        Paused => "PAUSED",
        Completed => "COMPLETED",
        Archived => "ARCHIVED",
    }
}

impl ReleaseStatus {
    /// ARCHIVED and COMPLETED releases never advance again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Archived)
    }
}

wire_enum! {
    CronStatus {
        Pending => "PENDING",
        Running => "RUNNING",
        Paused => "PAUSED",
        Completed => "COMPLETED",
    }
}

wire_enum! {
    StageStatus {
        Pending => "PENDING",
        InProgress => "IN_PROGRESS",
        Completed => "COMPLETED",
    }
}

wire_enum! {
    Stage {
        Kickoff => "KICKOFF",
        Regression => "REGRESSION",
        PostRegression => "POST_REGRESSION",
    }
}

wire_enum! {
    TaskStatus {
        Pending => "PENDING",
        InProgress => "IN_PROGRESS",
        AwaitingCallback => "AWAITING_CALLBACK",
        AwaitingManualBuild => "AWAITING_MANUAL_BUILD",
        Completed => "COMPLETED",
        Failed => "FAILED",
        Skipped => "SKIPPED",
    }
}

impl TaskStatus {
    /// Terminal task states must never be reopened by a poller update.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }

    /// Counts toward stage completion.
    pub fn is_settled(self) -> bool {
        matches!(self, Self::Completed | Self::Skipped)
    }
}

wire_enum! {
    PauseType {
        None => "NONE",
        UserRequested => "USER_REQUESTED",
        TaskFailure => "TASK_FAILURE",
        AwaitingStageTrigger => "AWAITING_STAGE_TRIGGER",
        AwaitingManualBuild => "AWAITING_MANUAL_BUILD",
    }
}

wire_enum! {
    TaskType {
        PreKickOffReminder => "PRE_KICK_OFF_REMINDER",
        ForkBranch => "FORK_BRANCH",
        CreateProjectManagementTicket => "CREATE_PROJECT_MANAGEMENT_TICKET",
        CreateTestSuite => "CREATE_TEST_SUITE",
        TriggerPreRegressionBuilds => "TRIGGER_PRE_REGRESSION_BUILDS",
        TriggerRegressionBuilds => "TRIGGER_REGRESSION_BUILDS",
        CreateTestSuiteRun => "CREATE_TEST_SUITE_RUN",
        RegressionStageApproval => "REGRESSION_STAGE_APPROVAL",
        CreateReleaseTag => "CREATE_RELEASE_TAG",
        TriggerTestFlightBuild => "TRIGGER_TEST_FLIGHT_BUILD",
        CreateAabBuild => "CREATE_AAB_BUILD",
        TestflightBuildVerified => "TESTFLIGHT_BUILD_VERIFIED",
        AdHocNotification => "AD_HOC_NOTIFICATION",
    }
}

impl TaskType {
    pub fn stage(self) -> Stage {
        match self {
            Self::PreKickOffReminder
            | Self::ForkBranch
            | Self::CreateProjectManagementTicket
            | Self::CreateTestSuite
            | Self::TriggerPreRegressionBuilds => Stage::Kickoff,
            Self::TriggerRegressionBuilds
            | Self::CreateTestSuiteRun
            | Self::RegressionStageApproval => Stage::Regression,
            Self::CreateReleaseTag
            | Self::TriggerTestFlightBuild
            | Self::CreateAabBuild
            | Self::TestflightBuildVerified
            | Self::AdHocNotification => Stage::PostRegression,
        }
    }

    /// Position within the task's stage group; lower runs first.
    pub fn order(self) -> u8 {
        match self {
            Self::PreKickOffReminder => 0,
            Self::ForkBranch => 1,
            Self::CreateProjectManagementTicket => 2,
            Self::CreateTestSuite => 3,
            Self::TriggerPreRegressionBuilds => 4,
            Self::TriggerRegressionBuilds => 0,
            Self::CreateTestSuiteRun => 1,
            Self::RegressionStageApproval => 2,
            Self::CreateReleaseTag => 0,
            Self::TriggerTestFlightBuild => 1,
            Self::CreateAabBuild => 2,
            Self::TestflightBuildVerified => 3,
            Self::AdHocNotification => 4,
        }
    }

    /// Build tasks fan out one Build row per required platform.
    pub fn is_build_task(self) -> bool {
        matches!(
            self,
            Self::TriggerPreRegressionBuilds
                | Self::TriggerRegressionBuilds
                | Self::TriggerTestFlightBuild
                | Self::CreateAabBuild
        )
    }

    /// Approval tasks hold their stage until `approve_task` is called.
    pub fn is_approval_task(self) -> bool {
        matches!(self, Self::TestflightBuildVerified | Self::RegressionStageApproval)
    }
}

wire_enum! {
    CycleStatus {
        NotStarted => "NOT_STARTED",
        InProgress => "IN_PROGRESS",
        Done => "DONE",
    }
}

wire_enum! {
    Platform {
        Android => "ANDROID",
        Ios => "IOS",
        Web => "WEB",
    }
}

wire_enum! {
    TargetStore {
        AppStore => "APP_STORE",
        PlayStore => "PLAY_STORE",
        Web => "WEB",
    }
}

wire_enum! {
    BuildType {
        Cicd => "CICD",
        Manual => "MANUAL",
    }
}

wire_enum! {
    CiRunType {
        Jenkins => "JENKINS",
        GithubActions => "GITHUB_ACTIONS",
        CircleCi => "CIRCLE_CI",
        GitlabCi => "GITLAB_CI",
    }
}

wire_enum! {
    WorkflowStatus {
        Pending => "PENDING",
        Running => "RUNNING",
        Completed => "COMPLETED",
        Failed => "FAILED",
    }
}

wire_enum! {
    BuildUploadStatus {
        Pending => "PENDING",
        Uploaded => "UPLOADED",
        Failed => "FAILED",
    }
}

wire_enum! {
    UploadStage {
        KickOff => "KICK_OFF",
        Regression => "REGRESSION",
        PreRelease => "PRE_RELEASE",
    }
}

impl UploadStage {
    pub fn for_stage(stage: Stage) -> Self {
        match stage {
            Stage::Kickoff => Self::KickOff,
            Stage::Regression => Self::Regression,
            Stage::PostRegression => Self::PreRelease,
        }
    }
}

wire_enum! {
    /// Aggregate status of all builds belonging to one task.
    TaskBuildStatus {
        NoBuilds => "NO_BUILDS",
        Failed => "FAILED",
        Pending => "PENDING",
        Running => "RUNNING",
        Completed => "COMPLETED",
    }
}

// ── Cron configuration ───────────────────────────────────────────────────

fn default_true() -> bool {
    true
}

/// Feature toggles carried on the cron job. Disabled toggles cause the
/// corresponding tasks to be created SKIPPED.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronToggles {
    #[serde(default = "default_true")]
    pub kick_off_reminder: bool,
    #[serde(default = "default_true")]
    pub pre_regression_builds: bool,
    /// Regression-cycle build triggering.
    #[serde(default = "default_true")]
    pub automation_builds: bool,
    /// Regression-cycle test suite runs.
    #[serde(default = "default_true")]
    pub automation_runs: bool,
    #[serde(default = "default_true")]
    pub test_flight_builds: bool,
    /// Manual sign-off task at the end of each regression cycle. Off by default.
    #[serde(default)]
    pub regression_approval: bool,
    #[serde(default = "default_true")]
    pub ad_hoc_notifications: bool,
}

impl Default for CronToggles {
    fn default() -> Self {
        Self {
            kick_off_reminder: true,
            pre_regression_builds: true,
            automation_builds: true,
            automation_runs: true,
            test_flight_builds: true,
            regression_approval: false,
            ad_hoc_notifications: true,
        }
    }
}

/// Per-slot overrides for a scheduled regression cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlotToggles {
    #[serde(default = "default_true")]
    pub regression_builds: bool,
    #[serde(default = "default_true")]
    pub automation_runs: bool,
}

impl Default for SlotToggles {
    fn default() -> Self {
        Self { regression_builds: true, automation_runs: true }
    }
}

/// One scheduled regression cycle slot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegressionSlot {
    pub slot_time: DateTime<Utc>,
    #[serde(default)]
    pub config: SlotToggles,
}

// ── Records ──────────────────────────────────────────────────────────────

/// The unit of work: a named software delivery effort.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Release {
    pub id: i64,
    pub tenant_id: String,
    pub name: String,
    pub release_branch: String,
    pub base_branch: String,
    pub release_type: ReleaseType,
    pub status: ReleaseStatus,
    pub kick_off_date: DateTime<Utc>,
    pub target_release_date: DateTime<Utc>,
    pub release_date: Option<DateTime<Utc>>,
    pub has_manual_build_upload: bool,
    pub release_config_id: Option<i64>,
    pub created_by: String,
    pub release_pilot: String,
    pub last_updated_by: String,
    pub created_at: DateTime<Utc>,
}

/// Runtime control block for a release: stage statuses, pause semantics,
/// and the regression schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronJob {
    pub id: i64,
    pub release_id: i64,
    pub cron_status: CronStatus,
    pub stage1_status: StageStatus,
    pub stage2_status: StageStatus,
    pub stage3_status: StageStatus,
    pub toggles: CronToggles,
    pub upcoming_regressions: Vec<RegressionSlot>,
    pub auto_transition_to_stage2: bool,
    pub auto_transition_to_stage3: bool,
    pub pause_type: PauseType,
    pub cron_stopped_at: Option<DateTime<Utc>>,
}

/// One ordered unit of work within a stage (and optionally a cycle).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseTask {
    pub id: i64,
    pub release_id: i64,
    pub cycle_id: Option<i64>,
    pub task_type: TaskType,
    pub stage: Stage,
    pub status: TaskStatus,
    /// Opaque provider id (ticket key, suite id, tag name, run id).
    pub external_id: Option<String>,
    /// Opaque provider payload: URLs, version strings, submission ids.
    pub external_data: serde_json::Value,
    pub account_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A batch of regression work within stage 2.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegressionCycle {
    pub id: i64,
    pub release_id: i64,
    pub cycle_tag: i64,
    pub status: CycleStatus,
    pub is_latest: bool,
    pub created_at: DateTime<Utc>,
}

/// A CI/CD or manual build attempt tied to a task and platform.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Build {
    pub id: i64,
    pub release_id: i64,
    pub task_id: i64,
    pub platform: Platform,
    pub build_type: BuildType,
    pub ci_run_type: Option<CiRunType>,
    pub queue_location: Option<String>,
    pub ci_run_id: Option<String>,
    pub workflow_status: WorkflowStatus,
    pub build_upload_status: BuildUploadStatus,
    pub artifact_path: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A staged manual artifact awaiting consumption by a build task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseUpload {
    pub id: i64,
    pub tenant_id: String,
    pub release_id: i64,
    pub platform: Platform,
    pub stage: UploadStage,
    pub artifact_path: String,
    pub is_used: bool,
    pub created_at: DateTime<Utc>,
}

/// Per-release platform / store target / version triple.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformTarget {
    pub id: i64,
    pub release_id: i64,
    pub platform: Platform,
    pub target: TargetStore,
    pub version: String,
}

/// Reusable integration template bound to a release.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseConfig {
    pub id: i64,
    pub tenant_id: String,
    pub name: String,
    pub ci_provider: CiRunType,
    pub ci_workflow_id: String,
    pub pm_project_key: String,
    pub test_mgmt_project: String,
    pub notification_channel: String,
    pub default_toggles: CronToggles,
}

impl ReleaseConfig {
    /// Fallback config for releases created without a template.
    pub fn bare(tenant_id: &str, ci_provider: CiRunType) -> Self {
        Self {
            id: 0,
            tenant_id: tenant_id.to_string(),
            name: String::new(),
            ci_provider,
            ci_workflow_id: String::new(),
            pm_project_key: String::new(),
            test_mgmt_project: String::new(),
            notification_channel: String::new(),
            default_toggles: CronToggles::default(),
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────────
