//! Executing: dependency-ordered, bounded-parallel implementation of issues.
//!
//! Issues are grouped into batches by dependency level ([`compute_batches`]).
//! Within a batch every `ready` issue gets its own worktree and goes through
//! coder, then up to [`MAX_REVIEW_ITERATIONS`] review rounds, then a pushed
//! branch and an open PR. After each batch, blocked issues whose
//! dependencies have settled are promoted to `ready`.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::future::join_all;
use serde_json::json;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

use super::bootstrap::detect_language;
use super::{AgentCall, LINEAR_MCP_TOOLS, PhaseRunner, param};
use crate::agent::RunConfig;
use crate::engine::events::EventType;
use crate::engine::state::{IssueState, IssueStatus, Phase, RepoConfig};
use crate::engine::{Engine, Params};
use crate::git::{self, WorktreeManager, branch_for};
use crate::integrations::{GitHubClient, LinearClient};
use crate::prompts::Prompts;

pub const MAX_REVIEW_ITERATIONS: u32 = 3;
const MAX_SLUG_LEN: usize = 60;

const CODER_TOOLS: &[&str] = &["Read", "Write", "Edit", "Glob", "Grep", "Bash"];
const REVIEWER_TOOLS: &[&str] = &["Read", "Glob", "Grep", "Bash"];
const FEEDBACK_TOOLS: &[&str] = &["Bash"];

const APPROVAL_SIGNALS: &[&str] = &[
    "approved",
    "lgtm",
    "looks good",
    "no issues found",
    "all checks pass",
];

/// Where an issue's code is prepared and published.
#[async_trait]
pub trait Workspace: Send + Sync {
    /// Create or reuse an isolated checkout for `slug`; returns its path.
    async fn prepare(&self, repo_path: &Path, slug: &str) -> Result<PathBuf>;

    /// Push the checkout and make sure a PR exists; returns the PR URL.
    async fn publish(&self, worktree: &Path, title: &str, body: &str) -> Result<String>;
}

/// Git worktrees plus `gh` pull requests.
pub struct GitWorkspace {
    worktrees: WorktreeManager,
    github: GitHubClient,
}

impl GitWorkspace {
    pub fn new(worktrees: WorktreeManager, github: GitHubClient) -> Self {
        Self { worktrees, github }
    }
}

#[async_trait]
impl Workspace for GitWorkspace {
    async fn prepare(&self, repo_path: &Path, slug: &str) -> Result<PathBuf> {
        self.worktrees.create(repo_path, slug).await
    }

    async fn publish(&self, worktree: &Path, title: &str, body: &str) -> Result<String> {
        git::push_branch(worktree).await.context("push branch")?;
        if let Some(url) = self.github.pr_url(worktree).await {
            return Ok(url);
        }
        self.github
            .create_pr(worktree, title, body, "main")
            .await
            .context("create PR")
    }
}

/// Branch-safe slug: lower-case ASCII letters, digits and `-`. Spaces,
/// underscores and slashes become a single `-`; anything else is dropped.
pub fn slugify(s: &str) -> String {
    let mut slug = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            'a'..='z' | '0'..='9' | '-' => slug.push(c),
            'A'..='Z' => slug.push(c.to_ascii_lowercase()),
            ' ' | '_' | '/' => {
                if !slug.is_empty() && !slug.ends_with('-') {
                    slug.push('-');
                }
            }
            _ => {}
        }
    }
    slug.truncate(MAX_SLUG_LEN);
    slug
}

/// Case-insensitive check for any approval phrase in a review.
pub fn is_approved(review: &str) -> bool {
    let lower = review.to_lowercase();
    APPROVAL_SIGNALS.iter().any(|s| lower.contains(s))
}

/// Group issues into dependency levels (Kahn's algorithm, sorted batches).
///
/// Issues already `done` or `awaiting_human` are left out, and only
/// dependencies on issues still in the graph count toward ordering. A cycle ends the walk with all
/// remaining issues in one final batch. A non-empty `single_issue` yields
/// just that issue, or nothing when it does not exist.
pub fn compute_batches(issues: &BTreeMap<String, IssueState>, single_issue: &str) -> Vec<Vec<String>> {
    if !single_issue.is_empty() {
        return if issues.contains_key(single_issue) {
            vec![vec![single_issue.to_string()]]
        } else {
            Vec::new()
        };
    }

    let mut in_degree: BTreeMap<&str, usize> = BTreeMap::new();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();

    for (id, issue) in issues {
        if issue.status.is_settled() {
            continue;
        }
        let degree = in_degree.entry(id.as_str()).or_insert(0);
        for dep in &issue.depends_on {
            if issues.get(dep).is_some_and(|d| !d.status.is_settled()) {
                *degree += 1;
                dependents.entry(dep.as_str()).or_default().push(id.as_str());
            }
        }
    }

    let mut batches = Vec::new();
    while !in_degree.is_empty() {
        // BTreeMap iteration keeps each batch sorted.
        let batch: Vec<&str> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(id, _)| *id)
            .collect();

        if batch.is_empty() {
            batches.push(in_degree.keys().map(|id| id.to_string()).collect());
            break;
        }

        for id in &batch {
            in_degree.remove(id);
            for dependent in dependents.get(id).into_iter().flatten() {
                if let Some(d) = in_degree.get_mut(dependent) {
                    *d = d.saturating_sub(1);
                }
            }
        }
        batches.push(batch.into_iter().map(str::to_string).collect());
    }
    batches
}

/// Implements issues batch by batch.
pub struct Executing {
    prompts: Prompts,
    linear: LinearClient,
    workspace: Arc<dyn Workspace>,
}

impl Executing {
    pub fn new(prompts: Prompts, linear: LinearClient, workspace: Arc<dyn Workspace>) -> Self {
        Self {
            prompts,
            linear,
            workspace,
        }
    }

    /// Persist the issue and announce its status.
    async fn update_issue(&self, engine: &Engine, issue: &IssueState) {
        engine.save_issue(issue.clone()).await;
        engine.events().emit(
            EventType::IssueStatusChanged,
            json!({ "issue_id": issue.id, "status": issue.status }),
        );
    }

    /// Promote blocked issues whose dependencies are all `done` or
    /// `awaiting_human`. Unknown dependencies count as satisfied.
    async fn update_blocked_issues(&self, engine: &Engine) {
        let promoted: Vec<IssueState> = engine.with_state(|s| {
            s.issues
                .values()
                .filter(|i| i.status == IssueStatus::Blocked)
                .filter(|i| {
                    i.depends_on
                        .iter()
                        .all(|d| s.issues.get(d).is_none_or(|dep| dep.status.is_settled()))
                })
                .cloned()
                .collect()
        });
        for mut issue in promoted {
            issue.status = IssueStatus::Ready;
            info!(issue_id = %issue.id, "Dependencies settled, issue ready");
            self.update_issue(engine, &issue).await;
        }
    }

    /// Coder prompt and tools. The description comes from the tracker API
    /// when configured; otherwise the coder is pointed at the Linear MCP.
    async fn coder_prompt(&self, issue: &IssueState, language: &str) -> (String, Vec<&'static str>) {
        let mut tools = CODER_TOOLS.to_vec();
        let Some(linear_id) = issue.linear_id.as_deref() else {
            return (self.prompts.coder(&issue.title, &issue.id, language, ""), tools);
        };
        if !self.linear.is_configured() {
            tools.push(LINEAR_MCP_TOOLS);
            let prompt = self
                .prompts
                .coder_from_linear(&issue.title, &issue.id, linear_id, language);
            return (prompt, tools);
        }
        let description = match self.linear.get_issue(linear_id).await {
            Ok(details) => details.description.unwrap_or_default(),
            Err(e) => {
                warn!(issue_id = %issue.id, "Failed to fetch Linear issue {}: {:#}", linear_id, e);
                String::new()
            }
        };
        let prompt = self
            .prompts
            .coder(&issue.title, &issue.id, language, &description);
        (prompt, tools)
    }

    async fn execute_issue(&self, engine: &Engine, mut issue: IssueState, repo: RepoConfig) -> Result<()> {
        let slug = slugify(&format!("{}-{}", issue.id, issue.title));
        issue.branch = Some(branch_for(&slug));
        issue.status = IssueStatus::Implementing;
        self.update_issue(engine, &issue).await;

        println!("  [{}] Creating worktree...", issue.id);
        let worktree = self
            .workspace
            .prepare(Path::new(&repo.path), &slug)
            .await
            .context("create worktree")?;
        issue.worktree = Some(worktree.to_string_lossy().into_owned());
        self.update_issue(engine, &issue).await;

        let language = if repo.language.is_empty() {
            detect_language(Path::new(&repo.path)).to_string()
        } else {
            repo.language.clone()
        };

        println!("  [{}] Running coder agent...", issue.id);
        let (prompt, tools) = self.coder_prompt(&issue, &language).await;
        let cfg = RunConfig::new(prompt, "sonnet", &tools).in_dir(&worktree);
        AgentCall::new("coder", Phase::Executing)
            .for_issue(&issue.id)
            .run(engine, &cfg)
            .await
            .context("coder failed")?;

        for iteration in 1..=MAX_REVIEW_ITERATIONS {
            issue.iterations = iteration;
            issue.status = IssueStatus::Reviewing;
            self.update_issue(engine, &issue).await;
            println!(
                "  [{}] Review iteration {}/{}...",
                issue.id, iteration, MAX_REVIEW_ITERATIONS
            );

            let cfg = RunConfig::new(
                self.prompts.quality_reviewer(&issue.title, &language),
                "opus",
                REVIEWER_TOOLS,
            )
            .in_dir(&worktree);
            let review = AgentCall::new("quality-reviewer", Phase::Executing)
                .for_issue(&issue.id)
                .run(engine, &cfg)
                .await
                .context("reviewer failed")?;

            if is_approved(&review.output) {
                println!("  [{}] Review approved!", issue.id);
                break;
            }
            if iteration == MAX_REVIEW_ITERATIONS {
                println!("  [{}] Max review iterations reached, escalating to human", issue.id);
                break;
            }

            println!("  [{}] Applying reviewer feedback...", issue.id);
            let cfg = RunConfig::new(
                self.prompts.feedback_writer(&review.output),
                "sonnet",
                FEEDBACK_TOOLS,
            )
            .in_dir(&worktree);
            if let Err(e) = AgentCall::new("feedback-writer", Phase::Executing)
                .for_issue(&issue.id)
                .run(engine, &cfg)
                .await
            {
                warn!(issue_id = %issue.id, "Feedback application failed: {:#}", e);
                break;
            }
        }

        println!("  [{}] Pushing branch and creating PR...", issue.id);
        let body = format!("Resolves {}\n\nGenerated by Agentic SDLC", issue.id);
        let pr_url = self.workspace.publish(&worktree, &issue.title, &body).await?;
        issue.pr_url = Some(pr_url.clone());
        issue.status = IssueStatus::AwaitingHuman;
        self.update_issue(engine, &issue).await;

        info!(issue_id = %issue.id, pr_url = %pr_url, "Issue awaiting human review");
        println!("  [{}] PR created: {}", issue.id, pr_url);
        Ok(())
    }
}

#[async_trait]
impl PhaseRunner for Executing {
    fn name(&self) -> Phase {
        Phase::Executing
    }

    async fn run(&self, engine: &Engine, params: &Params) -> Result<()> {
        let single = param(params, "issue").unwrap_or_default();
        let batches = engine.with_state(|s| compute_batches(&s.issues, single));
        if batches.is_empty() {
            println!("No issues ready for execution");
            return Ok(());
        }

        let semaphore = Semaphore::new(engine.parallel());
        for (idx, batch) in batches.iter().enumerate() {
            println!(
                "\n--- Batch {}/{} ({} issues) ---",
                idx + 1,
                batches.len(),
                batch.len()
            );

            let work: Vec<(IssueState, RepoConfig)> = engine.with_state(|s| {
                batch
                    .iter()
                    .filter_map(|id| s.issues.get(id))
                    .filter(|i| i.status == IssueStatus::Ready)
                    .filter_map(|i| s.repo_or_first(&i.repo).map(|r| (i.clone(), r.clone())))
                    .collect()
            });

            let results = join_all(work.into_iter().map(|(issue, repo)| {
                let semaphore = &semaphore;
                async move {
                    let _permit = semaphore.acquire().await;
                    let id = issue.id.clone();
                    self.execute_issue(engine, issue, repo)
                        .await
                        .with_context(|| format!("issue {}", id))
                }
            }))
            .await;

            for err in results.into_iter().filter_map(Result::err) {
                error!("{:#}", err);
                println!("  Warning: {:#}", err);
            }

            self.update_blocked_issues(engine).await;
        }
        Ok(())
    }
}
