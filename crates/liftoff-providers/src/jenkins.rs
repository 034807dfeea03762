use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;

use liftoff_core::providers::{CiCd, QueueState, QueueStatus, RunState, TriggeredJob};

/// Jenkins CI adapter. Queue locations are the queue-item URLs Jenkins
/// returns in the `Location` header; run ids are build URLs.
pub struct JenkinsCi {
    client: Client,
    base_url: String,
    user: String,
    token: String,
    probe_timeout: Duration,
}

impl JenkinsCi {
    pub fn new(
        base_url: impl Into<String>,
        user: impl Into<String>,
        token: impl Into<String>,
        probe_timeout: Duration,
    ) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            user: user.into(),
            token: token.into(),
            probe_timeout,
        }
    }

    fn authed(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        builder
            .basic_auth(&self.user, Some(&self.token))
            .timeout(self.probe_timeout)
    }

    async fn get_json(&self, url: &str) -> Result<Value> {
        self.authed(self.client.get(format!("{url}/api/json")))
            .send()
            .await
            .with_context(|| format!("GET {url}"))?
            .error_for_status()
            .with_context(|| format!("GET {url}"))?
            .json()
            .await
            .with_context(|| format!("parse {url}"))
    }
}

#[async_trait]
impl CiCd for JenkinsCi {
    async fn trigger_job(
        &self,
        _tenant: &str,
        workflow_id: &str,
        params: &HashMap<String, String>,
    ) -> Result<TriggeredJob> {
        let url = format!("{}/job/{workflow_id}/buildWithParameters", self.base_url);
        let resp = self
            .authed(self.client.post(&url))
            .query(&params.iter().collect::<Vec<_>>())
            .send()
            .await
            .context("jenkins buildWithParameters")?
            .error_for_status()
            .context("jenkins buildWithParameters")?;

        let queue_location = resp
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.trim_end_matches('/').to_string())
            .ok_or_else(|| anyhow::anyhow!("jenkins did not return a queue location"))?;
        Ok(TriggeredJob { queue_location })
    }

    async fn re_trigger_job(&self, _tenant: &str, ci_run_id: &str) -> Result<TriggeredJob> {
        let resp = self
            .authed(self.client.post(format!("{ci_run_id}/rebuild")))
            .send()
            .await
            .context("jenkins rebuild")?
            .error_for_status()
            .context("jenkins rebuild")?;
        let queue_location = resp
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.trim_end_matches('/').to_string())
            .ok_or_else(|| anyhow::anyhow!("jenkins rebuild did not return a queue location"))?;
        Ok(TriggeredJob { queue_location })
    }

    async fn get_queue_status(&self, _tenant: &str, queue_location: &str) -> Result<QueueStatus> {
        let item = self.get_json(queue_location).await?;

        if item["cancelled"].as_bool().unwrap_or(false) {
            return Ok(QueueStatus {
                state: QueueState::Cancelled,
                executable_url: None,
            });
        }
        // Once the queue item has an executable, the build has started.
        if let Some(url) = item["executable"]["url"].as_str() {
            return Ok(QueueStatus {
                state: QueueState::Running,
                executable_url: Some(url.trim_end_matches('/').to_string()),
            });
        }
        Ok(QueueStatus {
            state: QueueState::Pending,
            executable_url: None,
        })
    }

    async fn get_build_status(&self, _tenant: &str, ci_run_id: &str) -> Result<RunState> {
        let build = self.get_json(ci_run_id).await?;
        if build["building"].as_bool().unwrap_or(false) {
            return Ok(RunState::Running);
        }
        match build["result"].as_str() {
            Some("SUCCESS") => Ok(RunState::Completed),
            Some(_) => Ok(RunState::Failed),
            // Not building and no result yet: still settling.
            None => Ok(RunState::Running),
        }
    }

    async fn fetch_job_parameters(&self, _tenant: &str, url: &str) -> Result<Value> {
        let build = self.get_json(url).await?;
        let params = build["actions"]
            .as_array()
            .and_then(|actions| {
                actions
                    .iter()
                    .find(|a| a["parameters"].is_array())
                    .map(|a| a["parameters"].clone())
            })
            .unwrap_or(Value::Null);
        Ok(params)
    }
}
