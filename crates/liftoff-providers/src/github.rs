use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use tracing::info;

use liftoff_core::providers::Scm;

/// GitHub source-control adapter. The tenant id doubles as the repository
/// slug under the configured owner.
pub struct GithubScm {
    client: Client,
    token: String,
    owner: String,
}

impl GithubScm {
    pub fn new(token: impl Into<String>, owner: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            token: token.into(),
            owner: owner.into(),
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
    }

    async fn branch_sha(&self, repo: &str, branch: &str) -> Result<String> {
        let resp: Value = self
            .request(self.client.get(self.api_url(repo, &format!("git/ref/heads/{branch}"))))
            .send()
            .await
            .context("get base branch ref")?
            .error_for_status()
            .context("base branch lookup")?
            .json()
            .await
            .context("parse base branch ref")?;
        resp["object"]["sha"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| anyhow::anyhow!("base branch {branch} has no sha"))
    }
}

#[async_trait]
impl Scm for GithubScm {
    async fn fork_branch(&self, tenant: &str, new_branch: &str, base_branch: &str) -> Result<()> {
        let sha = self.branch_sha(tenant, base_branch).await?;
        let resp = self
            .request(self.client.post(self.api_url(tenant, "git/refs")))
            .json(&json!({
                "ref": format!("refs/heads/{new_branch}"),
                "sha": sha,
            }))
            .send()
            .await
            .context("create branch ref")?;

        // A pre-existing ref means a previous attempt already landed.
        if resp.status() == reqwest::StatusCode::UNPROCESSABLE_ENTITY {
            info!("branch {new_branch} already exists in {tenant}, reusing");
            return Ok(());
        }
        resp.error_for_status().context("create branch ref")?;
        Ok(())
    }

    async fn create_release_tag(
        &self,
        tenant: &str,
        branch: &str,
        tag: &str,
        version: &str,
    ) -> Result<String> {
        let resp = self
            .request(self.client.post(self.api_url(tenant, "releases")))
            .json(&json!({
                "tag_name": tag,
                "target_commitish": branch,
                "name": version,
                "generate_release_notes": true,
            }))
            .send()
            .await
            .context("create release")?;

        if resp.status() == reqwest::StatusCode::UNPROCESSABLE_ENTITY {
            // Tag already cut; fetch the existing release URL.
            let existing: Value = self
                .request(self.client.get(self.api_url(tenant, &format!("releases/tags/{tag}"))))
                .send()
                .await
                .context("get existing release")?
                .json()
                .await
                .context("parse existing release")?;
            if let Some(url) = existing["html_url"].as_str() {
                return Ok(url.to_string());
            }
        }

        let body: Value = resp
            .error_for_status()
            .context("create release")?
            .json()
            .await
            .context("parse release")?;
        body["html_url"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| anyhow::anyhow!("release {tag} has no html_url"))
    }
}
