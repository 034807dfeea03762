use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::types::{CiRunType, Platform};

// ── Value types ──────────────────────────────────────────────────────────

/// Where a triggered CI job can be found before it has a run id.
#[derive(Debug, Clone)]
pub struct TriggeredJob {
    pub queue_location: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueState {
    Pending,
    Running,
    Completed,
    Cancelled,
    Failed,
}

#[derive(Debug, Clone)]
pub struct QueueStatus {
    pub state: QueueState,
    /// URL / id of the started run, available once the queue item executes.
    pub executable_url: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone)]
pub struct TestRunStatus {
    pub pass_percent: f64,
    pub done: bool,
}

// ── Capability traits ────────────────────────────────────────────────────

/// Source control operations.
#[async_trait]
pub trait Scm: Send + Sync {
    async fn fork_branch(&self, tenant: &str, new_branch: &str, base_branch: &str) -> Result<()>;

    /// Tags `branch` and returns the tag URL.
    async fn create_release_tag(
        &self,
        tenant: &str,
        branch: &str,
        tag: &str,
        version: &str,
    ) -> Result<String>;
}

/// CI/CD build operations. One implementation per `CiRunType`.
#[async_trait]
pub trait CiCd: Send + Sync {
    async fn trigger_job(
        &self,
        tenant: &str,
        workflow_id: &str,
        params: &HashMap<String, String>,
    ) -> Result<TriggeredJob>;

    async fn re_trigger_job(&self, tenant: &str, ci_run_id: &str) -> Result<TriggeredJob>;

    async fn get_queue_status(&self, tenant: &str, queue_location: &str) -> Result<QueueStatus>;

    async fn get_build_status(&self, tenant: &str, ci_run_id: &str) -> Result<RunState>;

    async fn fetch_job_parameters(&self, tenant: &str, url: &str) -> Result<serde_json::Value>;
}

/// Project management (ticketing) operations.
#[async_trait]
pub trait ProjectMgmt: Send + Sync {
    async fn create_ticket(
        &self,
        project_key: &str,
        platform: Option<Platform>,
        version: &str,
    ) -> Result<String>;

    async fn update_ticket(&self, ticket_id: &str, patch: &serde_json::Value) -> Result<()>;

    async fn transition_ticket(&self, ticket_id: &str, state: &str) -> Result<()>;
}

/// Test management operations.
#[async_trait]
pub trait TestMgmt: Send + Sync {
    async fn create_suite(&self, project: &str, version: &str) -> Result<String>;

    async fn create_run(&self, suite_id: &str, filters: &serde_json::Value) -> Result<String>;

    async fn get_run_status(&self, run_id: &str) -> Result<TestRunStatus>;
}

/// Chat notification operations.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn post_message(
        &self,
        channel: &str,
        template_key: &str,
        vars: &HashMap<String, String>,
    ) -> Result<()>;
}

/// App / Play store operations.
#[async_trait]
pub trait Store: Send + Sync {
    async fn verify_credentials(&self, platform: Platform) -> Result<()>;

    /// Uploads an artifact and returns the store submission id.
    async fn upload_build(
        &self,
        platform: Platform,
        artifact_path: &str,
        metadata: &serde_json::Value,
    ) -> Result<String>;
}

// ── Provider set ─────────────────────────────────────────────────────────

/// One implementation per capability, wired at the composition root. CI/CD
/// is keyed by provider kind; an unregistered kind is an explicit error,
/// never a silent skip.
pub struct ProviderSet {
    pub scm: Arc<dyn Scm>,
    pub project_mgmt: Arc<dyn ProjectMgmt>,
    pub test_mgmt: Arc<dyn TestMgmt>,
    pub notifier: Arc<dyn Notifier>,
    pub store: Arc<dyn Store>,
    cicd: HashMap<CiRunType, Arc<dyn CiCd>>,
}

impl ProviderSet {
    pub fn new(
        scm: Arc<dyn Scm>,
        project_mgmt: Arc<dyn ProjectMgmt>,
        test_mgmt: Arc<dyn TestMgmt>,
        notifier: Arc<dyn Notifier>,
        store: Arc<dyn Store>,
    ) -> Self {
        Self {
            scm,
            project_mgmt,
            test_mgmt,
            notifier,
            store,
            cicd: HashMap::new(),
        }
    }

    pub fn with_cicd(mut self, kind: CiRunType, provider: Arc<dyn CiCd>) -> Self {
        self.cicd.insert(kind, provider);
        self
    }

    pub fn cicd(&self, kind: CiRunType) -> Result<Arc<dyn CiCd>> {
        self.cicd
            .get(&kind)
            .map(Arc::clone)
            .ok_or_else(|| anyhow::anyhow!("no CI/CD provider registered for {kind}"))
    }
}
