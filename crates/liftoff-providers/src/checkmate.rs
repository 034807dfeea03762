use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};

use liftoff_core::providers::{TestMgmt, TestRunStatus};

/// Checkmate test-management adapter.
pub struct CheckmateTestMgmt {
    client: Client,
    base_url: String,
    token: String,
}

impl CheckmateTestMgmt {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        }
    }

    fn api_url(&self, path: &str) -> String {
        format!("{}/api/{path}", self.base_url)
    }

    fn authed(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        builder.bearer_auth(&self.token)
    }
}

#[async_trait]
impl TestMgmt for CheckmateTestMgmt {
    async fn create_suite(&self, project: &str, version: &str) -> Result<String> {
        let resp: Value = self
            .authed(self.client.post(self.api_url("suites")))
            .json(&json!({
                "project": project,
                "name": format!("Regression {version}"),
            }))
            .send()
            .await
            .context("checkmate create suite")?
            .error_for_status()
            .context("checkmate create suite")?
            .json()
            .await
            .context("parse checkmate suite")?;

        resp["id"]
            .as_str()
            .map(str::to_string)
            .or_else(|| resp["id"].as_i64().map(|v| v.to_string()))
            .ok_or_else(|| anyhow::anyhow!("checkmate suite response has no id"))
    }

    async fn create_run(&self, suite_id: &str, filters: &Value) -> Result<String> {
        let resp: Value = self
            .authed(self.client.post(self.api_url(&format!("suites/{suite_id}/runs"))))
            .json(&json!({ "filters": filters }))
            .send()
            .await
            .context("checkmate create run")?
            .error_for_status()
            .context("checkmate create run")?
            .json()
            .await
            .context("parse checkmate run")?;

        resp["id"]
            .as_str()
            .map(str::to_string)
            .or_else(|| resp["id"].as_i64().map(|v| v.to_string()))
            .ok_or_else(|| anyhow::anyhow!("checkmate run response has no id"))
    }

    async fn get_run_status(&self, run_id: &str) -> Result<TestRunStatus> {
        let resp: Value = self
            .authed(self.client.get(self.api_url(&format!("runs/{run_id}"))))
            .send()
            .await
            .context("checkmate run status")?
            .error_for_status()
            .context("checkmate run status")?
            .json()
            .await
            .context("parse checkmate run status")?;

        Ok(TestRunStatus {
            pass_percent: resp["pass_percent"].as_f64().unwrap_or(0.0),
            done: resp["done"].as_bool().unwrap_or_else(|| {
                resp["status"].as_str().is_some_and(|s| s == "completed")
            }),
        })
    }
}
