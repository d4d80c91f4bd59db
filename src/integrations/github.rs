use std::path::Path;
use std::process::Stdio;

use anyhow::{Context, Result};
use tokio::process::Command;

/// Pull-request operations through the `gh` CLI.
#[derive(Debug, Clone)]
pub struct GitHubClient {
    program: String,
}

impl Default for GitHubClient {
    fn default() -> Self {
        Self::new("gh")
    }
}

impl GitHubClient {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Open a PR for the checked-out branch and return its URL.
    pub async fn create_pr(&self, cwd: &Path, title: &str, body: &str, base: &str) -> Result<String> {
        let base = if base.is_empty() { "main" } else { base };
        let output = Command::new(&self.program)
            .args(["pr", "create", "--title", title, "--body", body, "--base", base])
            .current_dir(cwd)
            .stdin(Stdio::null())
            .output()
            .await
            .context("Failed to run gh pr create")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("create PR: {}", stderr.trim());
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(stdout
            .lines()
            .rev()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .unwrap_or_default()
            .to_string())
    }

    /// URL of the PR already open for the checked-out branch, if any.
    pub async fn pr_url(&self, cwd: &Path) -> Option<String> {
        let output = Command::new(&self.program)
            .args(["pr", "view", "--json", "url", "--jq", ".url"])
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .output()
            .await
            .ok()?;
        if !output.status.success() {
            return None;
        }
        let url = String::from_utf8_lossy(&output.stdout).trim().to_string();
        (!url.is_empty()).then_some(url)
    }

    /// `gh auth status`; on success returns the line naming the account.
    pub async fn auth_status(&self) -> Result<String> {
        let output = Command::new(&self.program)
            .args(["auth", "status"])
            .stdin(Stdio::null())
            .output()
            .await
            .context("gh not available")?;

        // gh has printed its status to either stream depending on version.
        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        if !output.status.success() {
            anyhow::bail!("not authenticated: {}", text.trim());
        }
        Ok(auth_detail(&text))
    }
}

fn auth_detail(status_output: &str) -> String {
    status_output
        .lines()
        .map(str::trim)
        .find(|l| l.contains("Logged in") || l.contains("account"))
        .map(|l| l.trim_start_matches(['✓', '-', ' ']).to_string())
        .unwrap_or_else(|| "authenticated".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_detail_picks_account_line() {
        let out = "github.com\n  ✓ Logged in to github.com account octocat (keyring)\n  - Token: gho_***\n";
        assert_eq!(auth_detail(out), "Logged in to github.com account octocat (keyring)");
        assert_eq!(auth_detail("all good"), "authenticated");
    }

    #[tokio::test]
    async fn test_missing_binary() {
        let gh = GitHubClient::new("/nonexistent/gh");
        let dir = tempfile::TempDir::new().unwrap();
        assert!(gh.pr_url(dir.path()).await.is_none());
        assert!(gh.auth_status().await.is_err());
        assert!(gh.create_pr(dir.path(), "t", "b", "").await.is_err());
    }
}
