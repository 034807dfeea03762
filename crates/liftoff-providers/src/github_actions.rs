use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};

use liftoff_core::providers::{CiCd, QueueState, QueueStatus, RunState, TriggeredJob};

/// GitHub Actions CI adapter. Workflow dispatch returns no run id, so the
/// queue location is the branch-filtered runs listing for the workflow;
/// `get_queue_status` resolves it to the newest run.
pub struct GithubActionsCi {
    client: Client,
    token: String,
    owner: String,
    verify_timeout: Duration,
}

impl GithubActionsCi {
    pub fn new(
        token: impl Into<String>,
        owner: impl Into<String>,
        verify_timeout: Duration,
    ) -> Self {
        Self {
            client: Client::new(),
            token: token.into(),
            owner: owner.into(),
            verify_timeout,
        }
    }

    fn api_url(&self, repo: &str, path: &str) -> String {
        format!("https://api.github.com/repos/{}/{repo}/{path}", self.owner)
    }

    fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        builder
            .bearer_auth(&self.token)
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", "liftoff")
            .timeout(self.verify_timeout)
    }

    async fn get_json(&self, url: &str) -> Result<Value> {
        self.request(self.client.get(url))
            .send()
            .await
            .with_context(|| format!("GET {url}"))?
            .error_for_status()
            .with_context(|| format!("GET {url}"))?
            .json()
            .await
            .with_context(|| format!("parse {url}"))
    }

    fn run_status(run: &Value) -> QueueStatus {
        let url = run["url"].as_str().map(str::to_string);
        match run["status"].as_str() {
            Some("queued") | Some("waiting") | Some("requested") | Some("pending") => QueueStatus {
                state: QueueState::Pending,
                executable_url: url,
            },
            Some("in_progress") => QueueStatus {
                state: QueueState::Running,
                executable_url: url,
            },
            Some("completed") => match run["conclusion"].as_str() {
                Some("success") => QueueStatus {
                    state: QueueState::Completed,
                    executable_url: url,
                },
                Some("cancelled") => QueueStatus {
                    state: QueueState::Cancelled,
                    executable_url: url,
                },
                _ => QueueStatus {
                    state: QueueState::Failed,
                    executable_url: url,
                },
            },
            _ => QueueStatus {
                state: QueueState::Pending,
                executable_url: url,
            },
        }
    }
}

#[async_trait]
impl CiCd for GithubActionsCi {
    async fn trigger_job(
        &self,
        tenant: &str,
        workflow_id: &str,
        params: &HashMap<String, String>,
    ) -> Result<TriggeredJob> {
        let branch = params
            .get("branch")
            .cloned()
            .unwrap_or_else(|| "main".to_string());
        let url = self.api_url(tenant, &format!("actions/workflows/{workflow_id}/dispatches"));
        self.request(self.client.post(&url))
            .json(&json!({ "ref": branch, "inputs": params }))
            .send()
            .await
            .context("workflow dispatch")?
            .error_for_status()
            .context("workflow dispatch")?;

        let queue_location = self.api_url(
            tenant,
            &format!(
                "actions/workflows/{workflow_id}/runs?branch={branch}&event=workflow_dispatch&per_page=1"
            ),
        );
        Ok(TriggeredJob { queue_location })
    }

    async fn re_trigger_job(&self, _tenant: &str, ci_run_id: &str) -> Result<TriggeredJob> {
        self.request(self.client.post(format!("{ci_run_id}/rerun")))
            .send()
            .await
            .context("workflow rerun")?
            .error_for_status()
            .context("workflow rerun")?;
        // A rerun keeps its run URL; poll it directly.
        Ok(TriggeredJob {
            queue_location: ci_run_id.to_string(),
        })
    }

    async fn get_queue_status(&self, _tenant: &str, queue_location: &str) -> Result<QueueStatus> {
        let body = self.get_json(queue_location).await?;
        // The location is either a runs listing or a single run URL.
        let run = if let Some(runs) = body["workflow_runs"].as_array() {
            match runs.first() {
                Some(run) => run.clone(),
                None => {
                    return Ok(QueueStatus {
                        state: QueueState::Pending,
                        executable_url: None,
                    });
                }
            }
        } else {
            body
        };
        Ok(Self::run_status(&run))
    }

    async fn get_build_status(&self, _tenant: &str, ci_run_id: &str) -> Result<RunState> {
        let run = self.get_json(ci_run_id).await?;
        match Self::run_status(&run).state {
            QueueState::Pending | QueueState::Running => Ok(RunState::Running),
            QueueState::Completed => Ok(RunState::Completed),
            QueueState::Cancelled | QueueState::Failed => Ok(RunState::Failed),
        }
    }

    async fn fetch_job_parameters(&self, _tenant: &str, url: &str) -> Result<Value> {
        self.get_json(url).await
    }
}
