use std::collections::HashMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use tracing::info;

use liftoff_core::providers::Notifier;

/// Slack chat adapter. Message bodies are built from a small template
/// table with `{var}` substitution.
pub struct SlackNotifier {
    client: Client,
    token: String,
}

const TEMPLATES: &[(&str, &str)] = &[
    (
        "pre_kick_off_reminder",
        ":calendar: Release *{release}* kicks off at {kick_off} (branch `{branch}`, version {version}).",
    ),
    (
        "approval_requested",
        ":white_check_mark: Release *{release}* ({version}) needs a manual sign-off before it can continue.",
    ),
    (
        "release_summary",
        ":rocket: Release *{release}* ({version}) has finished its pre-release run on `{branch}`.",
    ),
];

fn render(template_key: &str, vars: &HashMap<String, String>) -> String {
    let raw = TEMPLATES
        .iter()
        .find(|(key, _)| *key == template_key)
        .map(|(_, body)| (*body).to_string())
        .unwrap_or_else(|| template_key.to_string());
    let mut text = raw;
    for (key, value) in vars {
        text = text.replace(&format!("{{{key}}}"), value);
    }
    text
}

impl SlackNotifier {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            token: token.into(),
        }
    }
}

#[async_trait]
impl Notifier for SlackNotifier {
    async fn post_message(
        &self,
        channel: &str,
        template_key: &str,
        vars: &HashMap<String, String>,
    ) -> Result<()> {
        let text = render(template_key, vars);
        let resp: Value = self
            .client
            .post("https://slack.com/api/chat.postMessage")
            .bearer_auth(&self.token)
            .json(&json!({ "channel": channel, "text": text }))
            .send()
            .await
            .context("slack postMessage")?
            .json()
            .await
            .context("parse slack response")?;

        if resp["ok"] != true {
            anyhow::bail!(
                "slack postMessage failed: {}",
                resp["error"].as_str().unwrap_or("unknown")
            );
        }
        info!("posted {template_key} to {channel}");
        Ok(())
    }
}

// ── Tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_substitutes_vars() {
        let mut vars = HashMap::new();
        vars.insert("release".to_string(), "Q3".to_string());
        vars.insert("version".to_string(), "7.0.0_android".to_string());
        let text = render("approval_requested", &vars);
        assert!(text.contains("*Q3*"));
        assert!(text.contains("7.0.0_android"));
        assert!(!text.contains("{release}"));
    }

    #[test]
    fn render_unknown_key_falls_back_to_key() {
        assert_eq!(render("no_such_template", &HashMap::new()), "no_such_template");
    }
}
