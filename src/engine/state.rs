use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Pipeline phase. `Init` and `Completed` bracket the five runnable phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Init,
    Bootstrap,
    Design,
    Planning,
    Tracking,
    Executing,
    Completed,
}

/// The runnable phases in pipeline order, paired with whether each one
/// pauses at an approval gate after it succeeds.
pub const PIPELINE: [(Phase, bool); 5] = [
    (Phase::Bootstrap, false),
    (Phase::Design, true),
    (Phase::Planning, true),
    (Phase::Tracking, false),
    (Phase::Executing, false),
];

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Bootstrap => "bootstrap",
            Self::Design => "design",
            Self::Planning => "planning",
            Self::Tracking => "tracking",
            Self::Executing => "executing",
            Self::Completed => "completed",
        }
    }

    pub fn is_gate(&self) -> bool {
        matches!(self, Self::Design | Self::Planning)
    }

    /// Position within the full lifecycle, `Init` = 0 through `Completed` = 6.
    pub fn ordinal(&self) -> usize {
        match self {
            Self::Init => 0,
            Self::Bootstrap => 1,
            Self::Design => 2,
            Self::Planning => 3,
            Self::Tracking => 4,
            Self::Executing => 5,
            Self::Completed => 6,
        }
    }

    /// The runnable phase that follows this one, if any.
    pub fn next(&self) -> Option<Phase> {
        let idx = PIPELINE.iter().position(|(p, _)| p == self)?;
        PIPELINE.get(idx + 1).map(|(p, _)| *p)
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "init" => Ok(Self::Init),
            "bootstrap" => Ok(Self::Bootstrap),
            "design" => Ok(Self::Design),
            "planning" => Ok(Self::Planning),
            "tracking" => Ok(Self::Tracking),
            "executing" => Ok(Self::Executing),
            "completed" => Ok(Self::Completed),
            _ => Err(format!("Invalid phase: {}", s)),
        }
    }
}

/// Progress within the current phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Pending,
    Running,
    Gate,
    Completed,
    Failed,
}

impl PhaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Gate => "gate",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for PhaseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PhaseStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "gate" => Ok(Self::Gate),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid phase status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueStatus {
    Blocked,
    Ready,
    Implementing,
    Reviewing,
    AwaitingHuman,
    Done,
}

impl IssueStatus {
    pub const ALL: [IssueStatus; 6] = [
        Self::Blocked,
        Self::Ready,
        Self::Implementing,
        Self::Reviewing,
        Self::AwaitingHuman,
        Self::Done,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Blocked => "blocked",
            Self::Ready => "ready",
            Self::Implementing => "implementing",
            Self::Reviewing => "reviewing",
            Self::AwaitingHuman => "awaiting_human",
            Self::Done => "done",
        }
    }

    /// Done or handed to a human: satisfies dependents.
    pub fn is_settled(&self) -> bool {
        matches!(self, Self::Done | Self::AwaitingHuman)
    }
}

impl std::fmt::Display for IssueStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IssueStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "blocked" => Ok(Self::Blocked),
            "ready" => Ok(Self::Ready),
            "implementing" => Ok(Self::Implementing),
            "reviewing" => Ok(Self::Reviewing),
            "awaiting_human" => Ok(Self::AwaitingHuman),
            "done" => Ok(Self::Done),
            _ => Err(format!("Invalid issue status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepoConfig {
    pub name: String,
    pub path: String,
    pub team: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub language: String,
}

/// Which bootstrap documents exist for a repo.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RepoState {
    pub claude_md: bool,
    pub architecture_md: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IssueState {
    pub id: String,
    pub title: String,
    pub repo: String,
    pub status: IssueStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub linear_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worktree: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_url: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub iterations: u32,
}

impl IssueState {
    pub fn new(id: impl Into<String>, title: impl Into<String>, repo: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            repo: repo.into(),
            status: IssueStatus::Ready,
            linear_id: None,
            branch: None,
            worktree: None,
            pr_url: None,
            depends_on: Vec::new(),
            iterations: 0,
        }
    }
}

/// Token and cost totals for one agent label.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub tokens_in: i64,
    pub tokens_out: i64,
    pub cost: f64,
    pub calls: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsState {
    pub tokens_in: i64,
    pub tokens_out: i64,
    pub total_cost: f64,
    #[serde(default)]
    pub by_agent: BTreeMap<String, Usage>,
    #[serde(default)]
    pub phase_timings: BTreeMap<String, i64>,
}

/// Full runtime state of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct State {
    pub run_id: String,
    #[serde(default)]
    pub prd_url: String,
    pub phase: Phase,
    pub phase_status: PhaseStatus,
    #[serde(default)]
    pub repos: Vec<RepoConfig>,
    #[serde(default)]
    pub bootstrap: BTreeMap<String, RepoState>,
    #[serde(default)]
    pub artifacts: BTreeMap<String, String>,
    #[serde(default)]
    pub issues: BTreeMap<String, IssueState>,
    #[serde(default)]
    pub metrics: MetricsState,
    pub updated_at: DateTime<Utc>,
}

impl State {
    /// A fresh run sits at `init` with status `completed`.
    pub fn new(run_id: impl Into<String>, prd_url: impl Into<String>, repos: Vec<RepoConfig>) -> Self {
        Self {
            run_id: run_id.into(),
            prd_url: prd_url.into(),
            phase: Phase::Init,
            phase_status: PhaseStatus::Completed,
            repos,
            bootstrap: BTreeMap::new(),
            artifacts: BTreeMap::new(),
            issues: BTreeMap::new(),
            metrics: MetricsState::default(),
            updated_at: Utc::now(),
        }
    }

    /// Read a legacy `state.json` blob.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read state file {}", path.display()))?;
        serde_json::from_str(&data)
            .with_context(|| format!("Failed to parse state file {}", path.display()))
    }

    /// Look up a repo by name, falling back to the first configured repo.
    pub fn repo_or_first(&self, name: &str) -> Option<&RepoConfig> {
        self.repos
            .iter()
            .find(|r| r.name == name)
            .or_else(|| self.repos.first())
    }

    /// Issue counts keyed by status label.
    pub fn issue_counts(&self) -> HashMap<IssueStatus, usize> {
        let mut counts = HashMap::new();
        for issue in self.issues.values() {
            *counts.entry(issue.status).or_insert(0) += 1;
        }
        counts
    }
}
