//! Git worktree and branch helpers, driven through the `git` binary.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{Context, Result};
use tokio::process::Command;
use tracing::{debug, info};

/// Worktrees live under `<root>/.sdlc/worktrees/<repo>/<slug>`.
pub const WORKTREE_BASE: &str = ".sdlc/worktrees";

/// Branch name used for an issue's worktree.
pub fn branch_for(slug: &str) -> String {
    format!("feat/{}", slug)
}

/// Creates one isolated worktree per issue.
#[derive(Debug, Clone)]
pub struct WorktreeManager {
    root: PathBuf,
}

impl WorktreeManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Where the worktree for `slug` in `repo_path` lives.
    pub fn worktree_path(&self, repo_path: &Path, slug: &str) -> PathBuf {
        let repo_name = repo_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "repo".to_string());
        self.root.join(WORKTREE_BASE).join(repo_name).join(slug)
    }

    /// Create (or reuse) the worktree for `slug` on branch `feat/<slug>`,
    /// returning its absolute path.
    ///
    /// An existing directory is reused only when it carries a `.git` marker;
    /// anything else at that path is removed first. The branch is cut from
    /// `origin/main`, falling back to checking out an existing branch.
    pub async fn create(&self, repo_path: &Path, slug: &str) -> Result<PathBuf> {
        let wt_path = absolute(&self.worktree_path(repo_path, slug))?;

        if wt_path.exists() {
            if wt_path.join(".git").exists() {
                debug!(path = %wt_path.display(), "Reusing existing worktree");
                return Ok(wt_path);
            }
            tokio::fs::remove_dir_all(&wt_path)
                .await
                .with_context(|| format!("remove orphaned worktree dir {}", wt_path.display()))?;
        }

        if let Some(parent) = wt_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .context("create worktree dir")?;
        }

        let repo = absolute(repo_path).context("resolve repo path")?;
        let branch = branch_for(slug);
        let wt = wt_path.to_string_lossy().into_owned();

        // Best effort: stale metadata and a missing remote are both fine.
        let _ = git(&repo, &["worktree", "prune"]).await;
        let _ = git(&repo, &["fetch", "origin", "main"]).await;

        let first = git(&repo, &["worktree", "add", &wt, "-b", &branch, "origin/main"]).await?;
        if !first.status.success() {
            let second = git(&repo, &["worktree", "add", &wt, &branch]).await?;
            if !second.status.success() {
                anyhow::bail!(
                    "create worktree: {}\n{}",
                    combined(&first).trim(),
                    combined(&second).trim()
                );
            }
        }

        info!(path = %wt_path.display(), branch = %branch, "Created worktree");
        Ok(wt_path)
    }

    /// Remove a worktree, optionally deleting its branch (best effort).
    pub async fn remove(&self, repo_path: &Path, slug: &str, delete_branch: bool) -> Result<()> {
        let repo = absolute(repo_path).context("resolve repo path")?;
        let wt = self.worktree_path(repo_path, slug);
        let wt = wt.to_string_lossy();

        let out = git(&repo, &["worktree", "remove", &wt, "--force"]).await?;
        if !out.status.success() {
            anyhow::bail!("remove worktree: {}", combined(&out).trim());
        }
        if delete_branch {
            let _ = git(&repo, &["branch", "-d", &branch_for(slug)]).await;
        }
        Ok(())
    }
}

/// `git push -u origin HEAD` from inside a worktree.
pub async fn push_branch(worktree: &Path) -> Result<()> {
    let output = Command::new("git")
        .args(["push", "-u", "origin", "HEAD"])
        .current_dir(worktree)
        .stdin(Stdio::null())
        .output()
        .await
        .context("Failed to run git push")?;

    if !output.status.success() {
        anyhow::bail!("push branch: {}", combined(&output).trim());
    }
    Ok(())
}

async fn git(repo: &Path, args: &[&str]) -> Result<std::process::Output> {
    Command::new("git")
        .arg("-C")
        .arg(repo)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .await
        .with_context(|| format!("Failed to run git {}", args.first().unwrap_or(&"")))
}

fn combined(output: &std::process::Output) -> String {
    let mut s = String::from_utf8_lossy(&output.stdout).into_owned();
    s.push_str(&String::from_utf8_lossy(&output.stderr));
    s
}

fn absolute(path: &Path) -> Result<PathBuf> {
    std::path::absolute(path).with_context(|| format!("resolve path {}", path.display()))
}
