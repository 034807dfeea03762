use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};

use liftoff_core::providers::ProjectMgmt;
use liftoff_core::types::Platform;

/// Jira project-management adapter (REST API v3, basic auth).
pub struct JiraProjectMgmt {
    client: Client,
    base_url: String,
    email: String,
    token: String,
}

impl JiraProjectMgmt {
    pub fn new(
        base_url: impl Into<String>,
        email: impl Into<String>,
        token: impl Into<String>,
    ) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            email: email.into(),
            token: token.into(),
        }
    }

    fn api_url(&self, path: &str) -> String {
        format!("{}/rest/api/3/{path}", self.base_url)
    }

    fn authed(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        builder.basic_auth(&self.email, Some(&self.token))
    }
}

#[async_trait]
impl ProjectMgmt for JiraProjectMgmt {
    async fn create_ticket(
        &self,
        project_key: &str,
        platform: Option<Platform>,
        version: &str,
    ) -> Result<String> {
        let summary = match platform {
            Some(p) => format!("Release {version} ({})", p.as_str().to_lowercase()),
            None => format!("Release {version}"),
        };
        let resp: Value = self
            .authed(self.client.post(self.api_url("issue")))
            .json(&json!({
                "fields": {
                    "project": { "key": project_key },
                    "summary": summary,
                    "issuetype": { "name": "Task" },
                }
            }))
            .send()
            .await
            .context("jira create issue")?
            .error_for_status()
            .context("jira create issue")?
            .json()
            .await
            .context("parse jira issue")?;

        resp["key"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| anyhow::anyhow!("jira issue response has no key"))
    }

    async fn update_ticket(&self, ticket_id: &str, patch: &Value) -> Result<()> {
        self.authed(self.client.put(self.api_url(&format!("issue/{ticket_id}"))))
            .json(&json!({ "fields": patch }))
            .send()
            .await
            .context("jira update issue")?
            .error_for_status()
            .context("jira update issue")?;
        Ok(())
    }

    async fn transition_ticket(&self, ticket_id: &str, state: &str) -> Result<()> {
        let transitions: Value = self
            .authed(
                self.client
                    .get(self.api_url(&format!("issue/{ticket_id}/transitions"))),
            )
            .send()
            .await
            .context("jira list transitions")?
            .error_for_status()
            .context("jira list transitions")?
            .json()
            .await
            .context("parse jira transitions")?;

        let transition_id = transitions["transitions"]
            .as_array()
            .and_then(|ts| {
                ts.iter()
                    .find(|t| t["name"].as_str().is_some_and(|n| n.eq_ignore_ascii_case(state)))
            })
            .and_then(|t| t["id"].as_str())
            .ok_or_else(|| anyhow::anyhow!("jira has no transition to '{state}'"))?
            .to_string();

        self.authed(
            self.client
                .post(self.api_url(&format!("issue/{ticket_id}/transitions"))),
        )
        .json(&json!({ "transition": { "id": transition_id } }))
        .send()
        .await
        .context("jira transition issue")?
        .error_for_status()
        .context("jira transition issue")?;
        Ok(())
    }
}
