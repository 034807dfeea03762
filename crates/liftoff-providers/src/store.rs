use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use tracing::info;

use liftoff_core::providers::Store;
use liftoff_core::types::Platform;

/// Store gateway covering App Store Connect (iOS) and the Play Console
/// publisher API (Android). Web targets have no store.
pub struct StoreGateway {
    client: Client,
    app_store_url: String,
    play_store_url: String,
    api_key: String,
    timeout: Duration,
}

impl StoreGateway {
    pub fn new(
        app_store_url: impl Into<String>,
        play_store_url: impl Into<String>,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            client: Client::new(),
            app_store_url: app_store_url.into().trim_end_matches('/').to_string(),
            play_store_url: play_store_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            timeout,
        }
    }

    fn base_url(&self, platform: Platform) -> Result<&str> {
        match platform {
            Platform::Ios => Ok(&self.app_store_url),
            Platform::Android => Ok(&self.play_store_url),
            Platform::Web => anyhow::bail!("web targets have no store"),
        }
    }
}

#[async_trait]
impl Store for StoreGateway {
    async fn verify_credentials(&self, platform: Platform) -> Result<()> {
        let base = self.base_url(platform)?;
        self.client
            .get(format!("{base}/v1/session"))
            .bearer_auth(&self.api_key)
            .timeout(self.timeout)
            .send()
            .await
            .context("store credentials probe")?
            .error_for_status()
            .context("store credentials rejected")?;
        Ok(())
    }

    async fn upload_build(
        &self,
        platform: Platform,
        artifact_path: &str,
        metadata: &Value,
    ) -> Result<String> {
        let base = self.base_url(platform)?;
        let resp: Value = self
            .client
            .post(format!("{base}/v1/builds"))
            .bearer_auth(&self.api_key)
            .timeout(self.timeout)
            .json(&json!({ "artifact": artifact_path, "metadata": metadata }))
            .send()
            .await
            .context("store upload")?
            .error_for_status()
            .context("store upload")?
            .json()
            .await
            .context("parse store upload response")?;

        let submission_id = resp["id"]
            .as_str()
            .map(str::to_string)
            .or_else(|| resp["id"].as_i64().map(|v| v.to_string()))
            .ok_or_else(|| anyhow::anyhow!("store upload response has no id"))?;
        info!(
            "uploaded {} build, submission {submission_id}",
            platform.as_str().to_lowercase()
        );
        Ok(submission_id)
    }
}
