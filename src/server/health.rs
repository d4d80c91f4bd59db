//! Connectivity checks for the agent CLI and the external services.

use std::process::Stdio;

use chrono::{SecondsFormat, Utc};
use serde::Serialize;

use crate::agent::ClaudeRunner;
use crate::config::Config;
use crate::integrations::GitHubClient;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IntegrationHealth {
    pub name: &'static str,
    pub ok: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub detail: String,
    /// `api` or `mcp` for the tracker and document host.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub mode: String,
    pub checked_at: String,
}

impl IntegrationHealth {
    fn new(name: &'static str, checked_at: &str) -> Self {
        Self {
            name,
            ok: false,
            detail: String::new(),
            mode: String::new(),
            checked_at: checked_at.to_string(),
        }
    }

    fn ok(mut self, mode: &str, detail: impl Into<String>) -> Self {
        self.ok = true;
        self.mode = mode.to_string();
        self.detail = detail.into();
        self
    }

    fn failed(mut self, detail: impl Into<String>) -> Self {
        self.detail = detail.into();
        self
    }
}

/// Check claude, github, linear and notion, in that order.
pub async fn check_all(config: &Config, github: &GitHubClient) -> Vec<IntegrationHealth> {
    let now = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
    let claude = ClaudeRunner::from_command_line(&config.claude_cmd);

    let (version, gh, mcp) = tokio::join!(
        claude_output(&claude, &["--version"]),
        github.auth_status(),
        claude_output(&claude, &["mcp", "list"]),
    );

    let claude_health = match version {
        Some(v) => IntegrationHealth::new("claude", &now).ok("", v),
        None => IntegrationHealth::new("claude", &now).failed("claude CLI not found"),
    };

    let github_health = match gh {
        Ok(detail) => IntegrationHealth::new("github", &now).ok("", detail),
        Err(e) => IntegrationHealth::new("github", &now).failed(format!("{:#}", e)),
    };

    let mcp = mcp.unwrap_or_default();
    vec![
        claude_health,
        github_health,
        keyed("linear", "LINEAR_API_KEY", config.linear_api_key.is_some(), &mcp, &now),
        keyed("notion", "NOTION_API_KEY", config.notion_api_key.is_some(), &mcp, &now),
    ]
}

/// An API key wins; otherwise a matching entry in `claude mcp list` counts.
fn keyed(name: &'static str, env: &str, has_key: bool, mcp_list: &str, now: &str) -> IntegrationHealth {
    let health = IntegrationHealth::new(name, now);
    if has_key {
        health.ok("api", format!("{} set", env))
    } else if mcp_list.to_lowercase().contains(name) {
        health.ok("mcp", "via Claude MCP")
    } else {
        health.failed(format!("no {} and no MCP connection", env))
    }
}

/// Trimmed combined output of a successful agent CLI invocation.
async fn claude_output(claude: &ClaudeRunner, args: &[&str]) -> Option<String> {
    let output = claude
        .command()
        .args(args)
        .stdin(Stdio::null())
        .output()
        .await
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&output.stderr));
    Some(text.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keyed_prefers_api_key() {
        let h = keyed("linear", "LINEAR_API_KEY", true, "linear: connected", "t");
        assert_eq!((h.ok, h.mode.as_str(), h.detail.as_str()), (true, "api", "LINEAR_API_KEY set"));

        let h = keyed("notion", "NOTION_API_KEY", false, "plugin:Notion:notion - ✓ Connected", "t");
        assert_eq!((h.ok, h.mode.as_str()), (true, "mcp"));

        let h = keyed("linear", "LINEAR_API_KEY", false, "", "t");
        assert!(!h.ok);
        assert_eq!(h.detail, "no LINEAR_API_KEY and no MCP connection");
    }

    #[tokio::test]
    async fn test_check_all_without_tools() {
        let config = Config {
            claude_cmd: "/nonexistent/claude".into(),
            notion_api_key: Some("secret".into()),
            ..Config::default()
        };
        let results = check_all(&config, &GitHubClient::new("/nonexistent/gh")).await;

        let names: Vec<_> = results.iter().map(|h| h.name).collect();
        assert_eq!(names, ["claude", "github", "linear", "notion"]);
        assert_eq!(results[0].detail, "claude CLI not found");
        assert!(!results[1].ok);
        assert!(!results[2].ok);
        assert_eq!(results[3].mode, "api");

        let json = serde_json::to_value(&results[3]).unwrap();
        assert!(json["checked_at"].as_str().unwrap().ends_with('Z'));
    }
}
