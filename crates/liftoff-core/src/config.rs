use std::collections::HashMap;

use anyhow::Result;

use crate::types::CiRunType;

/// Full application configuration loaded from environment / .env file.
#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: String,

    // Web surface
    pub web_bind: String,
    pub web_port: u16,

    // Scheduler / pollers
    pub tick_secs: u64,
    pub pending_poll_secs: u64,
    pub running_poll_secs: u64,

    // Time gating
    pub slot_window_mins: i64,
    pub reminder_lead_mins: i64,

    // Provider timeouts
    pub gha_verify_timeout_ms: u64,
    pub jenkins_probe_timeout_ms: u64,
    pub store_timeout_ms: u64,

    pub default_ci_provider: CiRunType,

    // SCM (GitHub)
    pub github_token: String,
    pub github_owner: String,

    // CI/CD
    pub jenkins_url: String,
    pub jenkins_user: String,
    pub jenkins_token: String,

    // Project management (Jira)
    pub jira_url: String,
    pub jira_email: String,
    pub jira_token: String,

    // Test management (Checkmate)
    pub checkmate_url: String,
    pub checkmate_token: String,

    // Chat (Slack)
    pub slack_token: String,

    // Stores
    pub app_store_api_url: String,
    pub play_store_api_url: String,
    pub store_api_key: String,
}

fn parse_dotenv() -> HashMap<String, String> {
    let mut map = HashMap::new();
    let Ok(contents) = std::fs::read_to_string(".env") else {
        return map;
    };
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((k, v)) = line.split_once('=') {
            map.insert(k.trim().to_string(), v.trim().to_string());
        }
    }
    map
}

fn get(key: &str, dotenv: &HashMap<String, String>) -> Option<String> {
    std::env::var(key).ok().or_else(|| dotenv.get(key).cloned())
}

fn get_str(key: &str, dotenv: &HashMap<String, String>, default: &str) -> String {
    get(key, dotenv).unwrap_or_else(|| default.to_string())
}

fn get_i64(key: &str, dotenv: &HashMap<String, String>, default: i64) -> i64 {
    get(key, dotenv)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn get_u64(key: &str, dotenv: &HashMap<String, String>, default: u64) -> u64 {
    get(key, dotenv)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn get_u16(key: &str, dotenv: &HashMap<String, String>, default: u16) -> u16 {
    get(key, dotenv)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let dotenv = parse_dotenv();

        let default_ci_provider = get_str("DEFAULT_CI_PROVIDER", &dotenv, "JENKINS")
            .parse()
            .unwrap_or(CiRunType::Jenkins);

        Ok(Config {
            data_dir: get_str("DATA_DIR", &dotenv, "store"),
            web_bind: get_str("WEB_BIND", &dotenv, "127.0.0.1"),
            web_port: get_u16("WEB_PORT", &dotenv, 3141),
            tick_secs: get_u64("TICK_S", &dotenv, 15),
            pending_poll_secs: get_u64("PENDING_POLL_S", &dotenv, 20),
            running_poll_secs: get_u64("RUNNING_POLL_S", &dotenv, 30),
            slot_window_mins: get_i64("SLOT_WINDOW_MINS", &dotenv, 5),
            reminder_lead_mins: get_i64("REMINDER_LEAD_MINS", &dotenv, 60),
            gha_verify_timeout_ms: get_u64("GHA_VERIFY_TIMEOUT_MS", &dotenv, 8000),
            jenkins_probe_timeout_ms: get_u64("JENKINS_PROBE_TIMEOUT_MS", &dotenv, 8000),
            store_timeout_ms: get_u64("STORE_TIMEOUT_MS", &dotenv, 8000),
            default_ci_provider,
            github_token: get_str("GITHUB_TOKEN", &dotenv, ""),
            github_owner: get_str("GITHUB_OWNER", &dotenv, ""),
            jenkins_url: get_str("JENKINS_URL", &dotenv, ""),
            jenkins_user: get_str("JENKINS_USER", &dotenv, ""),
            jenkins_token: get_str("JENKINS_TOKEN", &dotenv, ""),
            jira_url: get_str("JIRA_URL", &dotenv, ""),
            jira_email: get_str("JIRA_EMAIL", &dotenv, ""),
            jira_token: get_str("JIRA_TOKEN", &dotenv, ""),
            checkmate_url: get_str("CHECKMATE_URL", &dotenv, ""),
            checkmate_token: get_str("CHECKMATE_TOKEN", &dotenv, ""),
            slack_token: get_str("SLACK_BOT_TOKEN", &dotenv, ""),
            app_store_api_url: get_str(
                "APP_STORE_API_URL",
                &dotenv,
                "https://api.appstoreconnect.apple.com",
            ),
            play_store_api_url: get_str(
                "PLAY_STORE_API_URL",
                &dotenv,
                "https://androidpublisher.googleapis.com",
            ),
            store_api_key: get_str("STORE_API_KEY", &dotenv, ""),
        })
    }

    /// Defaults suitable for tests: short intervals, no provider credentials.
    pub fn for_tests() -> Self {
        Self {
            data_dir: "store".into(),
            web_bind: "127.0.0.1".into(),
            web_port: 0,
            tick_secs: 3,
            pending_poll_secs: 1,
            running_poll_secs: 1,
            slot_window_mins: 5,
            reminder_lead_mins: 60,
            gha_verify_timeout_ms: 8000,
            jenkins_probe_timeout_ms: 8000,
            store_timeout_ms: 8000,
            default_ci_provider: CiRunType::Jenkins,
            github_token: String::new(),
            github_owner: String::new(),
            jenkins_url: String::new(),
            jenkins_user: String::new(),
            jenkins_token: String::new(),
            jira_url: String::new(),
            jira_email: String::new(),
            jira_token: String::new(),
            checkmate_url: String::new(),
            checkmate_token: String::new(),
            slack_token: String::new(),
            app_store_api_url: String::new(),
            play_store_api_url: String::new(),
            store_api_key: String::new(),
        }
    }
}
