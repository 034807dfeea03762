//! Shared fixtures: in-memory database, scriptable mock providers, and a
//! fully wired harness driven tick-by-tick from the tests.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};

use liftoff_core::callback::CallbackAggregator;
use liftoff_core::clock::FixedClock;
use liftoff_core::config::Config;
use liftoff_core::db::Db;
use liftoff_core::engine::Engine;
use liftoff_core::polling::PollingManager;
use liftoff_core::providers::{
    CiCd, Notifier, ProjectMgmt, ProviderSet, QueueState, QueueStatus, RunState, Scm, Store,
    TestMgmt, TestRunStatus, TriggeredJob,
};
use liftoff_core::scheduler::Scheduler;
use liftoff_core::service::{
    NewPlatformTarget, NewReleaseRequest, ReleaseService, ReleaseStatusCheck,
};
use liftoff_core::types::{
    CiRunType, CronStatus, CronToggles, Platform, RegressionSlot, ReleaseConfig, ReleaseType,
    SlotToggles, TargetStore,
};

// ── Mock providers ────────────────────────────────────────────────────────

#[derive(Default)]
pub struct MockScm {
    pub fail_fork: Mutex<bool>,
    pub forked: Mutex<Vec<(String, String)>>,
    pub tags: Mutex<Vec<String>>,
}

#[async_trait]
impl Scm for MockScm {
    async fn fork_branch(&self, _tenant: &str, new_branch: &str, base_branch: &str) -> Result<()> {
        if *self.fail_fork.lock().unwrap() {
            anyhow::bail!("git server unavailable");
        }
        self.forked
            .lock()
            .unwrap()
            .push((new_branch.to_string(), base_branch.to_string()));
        Ok(())
    }

    async fn create_release_tag(
        &self,
        _tenant: &str,
        _branch: &str,
        tag: &str,
        _version: &str,
    ) -> Result<String> {
        self.tags.lock().unwrap().push(tag.to_string());
        Ok(format!("https://git.example.com/tags/{tag}"))
    }
}

pub struct MockCi {
    pub triggered: Mutex<Vec<HashMap<String, String>>>,
    /// State every queue probe reports (default: Running).
    pub queue_state: Mutex<QueueState>,
    /// State every run probe reports (default: Completed).
    pub run_state: Mutex<RunState>,
    pub fail_trigger: Mutex<bool>,
    pub trigger_delay_ms: AtomicU64,
    counter: AtomicUsize,
}

impl Default for MockCi {
    fn default() -> Self {
        Self {
            triggered: Mutex::new(Vec::new()),
            queue_state: Mutex::new(QueueState::Running),
            run_state: Mutex::new(RunState::Completed),
            fail_trigger: Mutex::new(false),
            trigger_delay_ms: AtomicU64::new(0),
            counter: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl CiCd for MockCi {
    async fn trigger_job(
        &self,
        _tenant: &str,
        _workflow_id: &str,
        params: &HashMap<String, String>,
    ) -> Result<TriggeredJob> {
        let delay = self.trigger_delay_ms.load(Ordering::Relaxed);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if *self.fail_trigger.lock().unwrap() {
            anyhow::bail!("ci rejected the trigger");
        }
        self.triggered.lock().unwrap().push(params.clone());
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        Ok(TriggeredJob {
            queue_location: format!("queue/{n}"),
        })
    }

    async fn re_trigger_job(&self, tenant: &str, _ci_run_id: &str) -> Result<TriggeredJob> {
        self.trigger_job(tenant, "retrigger", &HashMap::new()).await
    }

    async fn get_queue_status(&self, _tenant: &str, queue_location: &str) -> Result<QueueStatus> {
        let state = *self.queue_state.lock().unwrap();
        let executable_url = match state {
            QueueState::Pending => None,
            _ => Some(format!("run/{queue_location}")),
        };
        Ok(QueueStatus {
            state,
            executable_url,
        })
    }

    async fn get_build_status(&self, _tenant: &str, _ci_run_id: &str) -> Result<RunState> {
        Ok(*self.run_state.lock().unwrap())
    }

    async fn fetch_job_parameters(&self, _tenant: &str, _url: &str) -> Result<serde_json::Value> {
        Ok(serde_json::json!({}))
    }
}

#[derive(Default)]
pub struct MockProjectMgmt {
    pub tickets: Mutex<Vec<String>>,
    counter: AtomicUsize,
}

#[async_trait]
impl ProjectMgmt for MockProjectMgmt {
    async fn create_ticket(
        &self,
        project_key: &str,
        _platform: Option<Platform>,
        _version: &str,
    ) -> Result<String> {
        let n = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        let key = format!("{project_key}-{n}");
        self.tickets.lock().unwrap().push(key.clone());
        Ok(key)
    }

    async fn update_ticket(&self, _ticket_id: &str, _patch: &serde_json::Value) -> Result<()> {
        Ok(())
    }

    async fn transition_ticket(&self, _ticket_id: &str, _state: &str) -> Result<()> {
        Ok(())
    }
}

pub struct MockTestMgmt {
    pub suites: Mutex<Vec<String>>,
    pub runs: Mutex<Vec<String>>,
    pub run_done: Mutex<bool>,
    counter: AtomicUsize,
}

impl Default for MockTestMgmt {
    fn default() -> Self {
        Self {
            suites: Mutex::new(Vec::new()),
            runs: Mutex::new(Vec::new()),
            run_done: Mutex::new(true),
            counter: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl TestMgmt for MockTestMgmt {
    async fn create_suite(&self, _project: &str, version: &str) -> Result<String> {
        let suite = format!("suite-{version}");
        self.suites.lock().unwrap().push(suite.clone());
        Ok(suite)
    }

    async fn create_run(&self, suite_id: &str, _filters: &serde_json::Value) -> Result<String> {
        let n = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        let run = format!("{suite_id}/run-{n}");
        self.runs.lock().unwrap().push(run.clone());
        Ok(run)
    }

    async fn get_run_status(&self, _run_id: &str) -> Result<TestRunStatus> {
        Ok(TestRunStatus {
            pass_percent: 98.5,
            done: *self.run_done.lock().unwrap(),
        })
    }
}

#[derive(Default)]
pub struct MockNotifier {
    pub messages: Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl Notifier for MockNotifier {
    async fn post_message(
        &self,
        channel: &str,
        template_key: &str,
        _vars: &HashMap<String, String>,
    ) -> Result<()> {
        self.messages
            .lock()
            .unwrap()
            .push((channel.to_string(), template_key.to_string()));
        Ok(())
    }
}

#[derive(Default)]
pub struct MockStore {
    pub uploads: Mutex<Vec<(Platform, String)>>,
    pub fail_upload: Mutex<bool>,
    counter: AtomicUsize,
}

#[async_trait]
impl Store for MockStore {
    async fn verify_credentials(&self, _platform: Platform) -> Result<()> {
        Ok(())
    }

    async fn upload_build(
        &self,
        platform: Platform,
        artifact_path: &str,
        _metadata: &serde_json::Value,
    ) -> Result<String> {
        if *self.fail_upload.lock().unwrap() {
            anyhow::bail!("store rejected the artifact");
        }
        self.uploads
            .lock()
            .unwrap()
            .push((platform, artifact_path.to_string()));
        let n = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        Ok(format!("submission-{n}"))
    }
}

#[derive(Default)]
pub struct MockStatusCheck {
    pub cherry_picks: Mutex<bool>,
}

#[async_trait]
impl ReleaseStatusCheck for MockStatusCheck {
    async fn cherry_picks_pending(&self, _release_id: i64) -> Result<bool> {
        Ok(*self.cherry_picks.lock().unwrap())
    }
}

// ── Harness ───────────────────────────────────────────────────────────────

pub struct Harness {
    pub db: Arc<Db>,
    pub clock: Arc<FixedClock>,
    pub scheduler: Arc<Scheduler>,
    pub polling: Arc<PollingManager>,
    pub callback: Arc<CallbackAggregator>,
    pub service: Arc<ReleaseService>,
    pub scm: Arc<MockScm>,
    pub ci: Arc<MockCi>,
    pub project_mgmt: Arc<MockProjectMgmt>,
    pub test_mgmt: Arc<MockTestMgmt>,
    pub notifier: Arc<MockNotifier>,
    pub store: Arc<MockStore>,
    pub status_check: Arc<MockStatusCheck>,
}

pub fn epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
}

pub fn harness() -> Harness {
    let mut db = Db::open(":memory:").expect("open in-memory db");
    db.migrate().expect("migrate");
    let db = Arc::new(db);

    // Long intervals keep any spawned runner quiet after its first tick,
    // so tests stay in control of the tick cadence.
    let mut config = Config::for_tests();
    config.tick_secs = 3600;
    config.pending_poll_secs = 3600;
    config.running_poll_secs = 3600;
    let config = Arc::new(config);

    let scm = Arc::new(MockScm::default());
    let ci = Arc::new(MockCi::default());
    let project_mgmt = Arc::new(MockProjectMgmt::default());
    let test_mgmt = Arc::new(MockTestMgmt::default());
    let notifier = Arc::new(MockNotifier::default());
    let store = Arc::new(MockStore::default());
    let status_check = Arc::new(MockStatusCheck::default());

    let providers = Arc::new(
        ProviderSet::new(
            Arc::clone(&scm) as Arc<dyn Scm>,
            Arc::clone(&project_mgmt) as Arc<dyn ProjectMgmt>,
            Arc::clone(&test_mgmt) as Arc<dyn TestMgmt>,
            Arc::clone(&notifier) as Arc<dyn Notifier>,
            Arc::clone(&store) as Arc<dyn Store>,
        )
        .with_cicd(CiRunType::Jenkins, Arc::clone(&ci) as Arc<dyn CiCd>),
    );

    let clock = Arc::new(FixedClock::new(epoch()));
    let callback = Arc::new(CallbackAggregator::new(Arc::clone(&db)));
    let polling = Arc::new(PollingManager::new(
        Arc::clone(&db),
        Arc::clone(&providers),
        Arc::clone(&callback),
        Duration::from_secs(config.pending_poll_secs),
        Duration::from_secs(config.running_poll_secs),
    ));
    let engine = Arc::new(Engine::new(
        Arc::clone(&db),
        Arc::clone(&providers),
        Arc::clone(&callback),
        Arc::clone(&polling),
        Arc::clone(&clock) as Arc<dyn liftoff_core::clock::Clock>,
        Arc::clone(&config),
    ));
    let scheduler = Arc::new(Scheduler::new(
        Arc::clone(&db),
        engine,
        Duration::from_secs(config.tick_secs),
    ));
    let service = Arc::new(ReleaseService::new(
        Arc::clone(&db),
        Arc::clone(&scheduler),
        Arc::clone(&polling),
        Arc::clone(&callback),
        Arc::clone(&status_check) as Arc<dyn ReleaseStatusCheck>,
        Arc::clone(&clock) as Arc<dyn liftoff_core::clock::Clock>,
        Arc::clone(&config),
    ));

    Harness {
        db,
        clock,
        scheduler,
        polling,
        callback,
        service,
        scm,
        ci,
        project_mgmt,
        test_mgmt,
        notifier,
        store,
        status_check,
    }
}

// ── Release fixtures ──────────────────────────────────────────────────────

pub const TENANT: &str = "acme-app";

pub fn standard_config(h: &Harness) -> i64 {
    h.db.insert_release_config(&ReleaseConfig {
        id: 0,
        tenant_id: TENANT.into(),
        name: "standard".into(),
        ci_provider: CiRunType::Jenkins,
        ci_workflow_id: "app-build".into(),
        pm_project_key: "REL".into(),
        test_mgmt_project: "regression".into(),
        notification_channel: "#releases".into(),
        default_toggles: CronToggles::default(),
    })
    .expect("insert release config")
}

pub struct ReleaseOpts {
    pub manual_builds: bool,
    pub auto_stage2: bool,
    pub auto_stage3: bool,
    pub slot_offsets_secs: Vec<i64>,
    pub toggles: Option<CronToggles>,
}

impl Default for ReleaseOpts {
    fn default() -> Self {
        Self {
            manual_builds: false,
            auto_stage2: true,
            auto_stage3: true,
            slot_offsets_secs: vec![-5],
            toggles: None,
        }
    }
}

pub fn make_release(h: &Harness, opts: ReleaseOpts) -> i64 {
    let config_id = standard_config(h);
    let slots = opts
        .slot_offsets_secs
        .iter()
        .map(|&offset| RegressionSlot {
            slot_time: epoch() + chrono::Duration::seconds(offset),
            config: SlotToggles::default(),
        })
        .collect();
    let release = h
        .service
        .create_release(NewReleaseRequest {
            tenant_id: TENANT.into(),
            name: "spring release".into(),
            release_branch: "release/7.0.0".into(),
            base_branch: "main".into(),
            release_type: ReleaseType::Planned,
            kick_off_date: epoch() - chrono::Duration::hours(2),
            target_release_date: epoch() + chrono::Duration::days(7),
            has_manual_build_upload: opts.manual_builds,
            release_config_id: Some(config_id),
            created_by: "pilot@acme.dev".into(),
            release_pilot: "pilot@acme.dev".into(),
            auto_transition_to_stage2: opts.auto_stage2,
            auto_transition_to_stage3: opts.auto_stage3,
            upcoming_regressions: slots,
            toggles: opts.toggles,
            targets: vec![
                NewPlatformTarget {
                    platform: Platform::Android,
                    target: TargetStore::PlayStore,
                    version: "7.0.0".into(),
                },
                NewPlatformTarget {
                    platform: Platform::Ios,
                    target: TargetStore::AppStore,
                    version: "6.7.0".into(),
                },
            ],
        })
        .expect("create release");
    release.id
}

/// Starts the cron through the service, then silences the spawned runner
/// and pollers so the test drives every tick explicitly.
pub async fn start_quiet(h: &Harness, release_id: i64) {
    h.service
        .start_cron_job(release_id)
        .await
        .expect("start cron job");
    h.scheduler.stop(release_id).await;
    h.polling.delete_jobs(release_id).await;
}

/// Silences runners spawned by a service call (trigger / resume / retry).
pub async fn quiesce(h: &Harness, release_id: i64) {
    h.scheduler.stop(release_id).await;
    h.polling.delete_jobs(release_id).await;
}

/// One scheduler tick followed by both poll passes.
pub async fn tick(h: &Harness, release_id: i64) {
    h.scheduler.tick_once(release_id).await;
    h.polling
        .run_pending_pass(release_id)
        .await
        .expect("pending pass");
    h.polling
        .run_running_pass(release_id)
        .await
        .expect("running pass");
}

/// Ticks until the predicate holds, panicking after `max` rounds.
pub async fn drive_until<F>(h: &Harness, release_id: i64, max: usize, mut predicate: F)
where
    F: FnMut(&Harness) -> bool,
{
    for _ in 0..max {
        if predicate(h) {
            return;
        }
        tick(h, release_id).await;
    }
    assert!(predicate(h), "predicate not reached after {max} ticks");
}

pub fn cron_status(h: &Harness, release_id: i64) -> CronStatus {
    h.db.get_cron_job(release_id)
        .expect("get cron job")
        .expect("cron job exists")
        .cron_status
}
