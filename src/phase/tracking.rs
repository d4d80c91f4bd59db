use std::collections::HashMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use super::{AgentCall, LINEAR_MCP_TOOLS, PhaseRunner, is_non_interactive, param};
use crate::agent::RunConfig;
use crate::agent::extract::extract_json;
use crate::engine::artifacts::PERT;
use crate::engine::events::EventType;
use crate::engine::state::{IssueState, IssueStatus, Phase};
use crate::engine::{Engine, Params};
use crate::integrations::LinearClient;
use crate::integrations::linear::NewIssue;
use crate::prompts::Prompts;


/// A task from the PERT document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PertTask {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub repo: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub estimate: String,
}

impl PertTask {
    fn to_issue(&self) -> IssueState {
        let mut issue = IssueState::new(&self.id, &self.title, &self.repo);
        issue.depends_on = self.depends_on.clone();
        issue.status = if self.depends_on.is_empty() {
            IssueStatus::Ready
        } else {
            IssueStatus::Blocked
        };
        issue
    }
}

#[derive(Deserialize)]
struct TaskList {
    #[serde(default)]
    tasks: Vec<PertTask>,
}

/// Tasks from a PERT document: a JSON array, a `{"tasks": [...]}` object,
/// or failing both, markdown bullets numbered `TASK-001` onwards.
pub fn parse_pert_tasks(content: &str) -> Result<Vec<PertTask>> {
    if let Some(json) = extract_json(content) {
        if let Ok(tasks) = serde_json::from_str::<Vec<PertTask>>(json) {
            return Ok(tasks);
        }
        if let Ok(list) = serde_json::from_str::<TaskList>(json)
            && !list.tasks.is_empty()
        {
            return Ok(list.tasks);
        }
    }

    let tasks: Vec<PertTask> = content
        .lines()
        .map(str::trim)
        .filter(|l| l.starts_with("- ") || l.starts_with("* "))
        .map(|l| l.trim_start_matches(['-', '*', ' ']))
        .filter(|t| !t.is_empty())
        .enumerate()
        .map(|(i, title)| PertTask {
            id: format!("TASK-{:03}", i + 1),
            title: title.to_string(),
            ..Default::default()
        })
        .collect();

    if tasks.is_empty() {
        anyhow::bail!("no tasks found in PERT document");
    }
    Ok(tasks)
}

/// Creates tracker issues for each PERT task and records them in the run.
pub struct Tracking {
    prompts: Prompts,
    linear: LinearClient,
}

impl Tracking {
    pub fn new(prompts: Prompts, linear: LinearClient) -> Self {
        Self { prompts, linear }
    }

    async fn save_new_issue(&self, engine: &Engine, issue: IssueState) {
        let data = json!({
            "issue_id": issue.id,
            "status": issue.status,
            "title": issue.title,
        });
        engine.save_issue(issue).await;
        engine.events().emit(EventType::IssueStatusChanged, data);
    }

    async fn create_via_api(&self, engine: &Engine, tasks: &[PertTask], team: &str) {
        let repos = engine.with_state(|s| s.repos.clone());
        for task in tasks {
            println!("  Creating issue: {}", task.title);
            let mut issue = task.to_issue();
            let task_team = repos
                .iter()
                .find(|r| r.name == task.repo)
                .map(|r| r.team.as_str())
                .unwrap_or(team);

            let created = self
                .linear
                .create_issue(&NewIssue {
                    title: task.title.clone(),
                    description: task.description.clone(),
                    team: task_team.to_string(),
                })
                .await;
            match created {
                Ok(linear_id) => {
                    println!("    Created Linear issue: {}", linear_id);
                    issue.linear_id = Some(linear_id);
                }
                Err(e) => warn!(issue_id = %task.id, "Failed to create Linear issue: {:#}", e),
            }
            self.save_new_issue(engine, issue).await;
        }

        let issues = engine.with_state(|s| s.issues.clone());
        for task in tasks {
            let Some(blocked) = issues.get(&task.id).and_then(|i| i.linear_id.as_deref()) else {
                continue;
            };
            for dep in &task.depends_on {
                let Some(blocking) = issues.get(dep).and_then(|i| i.linear_id.as_deref()) else {
                    continue;
                };
                if let Err(e) = self.linear.create_relation(blocking, blocked).await {
                    warn!(issue_id = %task.id, depends_on = %dep, "Failed to create Linear relation: {:#}", e);
                }
            }
        }
    }

    /// Ask the agent to create the issues through its Linear tools and
    /// return the `{task_id: tracker_id}` mapping it reports.
    async fn create_via_agent(
        &self,
        engine: &Engine,
        tasks: &[PertTask],
        team: &str,
    ) -> Result<HashMap<String, String>> {
        let tasks_json = serde_json::to_string_pretty(tasks).context("marshal tasks")?;
        let cfg = RunConfig::new(
            self.prompts.linear_issue_creator(&tasks_json, team),
            "sonnet",
            &[LINEAR_MCP_TOOLS],
        );
        let result = AgentCall::new("linear-issue-creator", Phase::Tracking)
            .run(engine, &cfg)
            .await
            .context("claude linear creator failed")?;

        let mapping = match extract_json(&result.output) {
            Some(json) => serde_json::from_str(json).unwrap_or_else(|e| {
                warn!("Could not parse Linear ID mapping: {}", e);
                HashMap::new()
            }),
            None => {
                warn!("No JSON mapping found in agent response");
                HashMap::new()
            }
        };
        Ok(mapping)
    }
}

#[async_trait]
impl PhaseRunner for Tracking {
    fn name(&self) -> Phase {
        Phase::Tracking
    }

    async fn run(&self, engine: &Engine, params: &Params) -> Result<()> {
        let (stored, first_team, existing) = engine.with_state(|s| {
            (
                s.artifacts.get(PERT).cloned(),
                s.repos.first().map(|r| r.team.clone()).unwrap_or_default(),
                s.issues.keys().cloned().collect::<Vec<_>>(),
            )
        });
        let pert_path = param(params, PERT)
            .map(str::to_string)
            .or(stored.filter(|p| !p.is_empty()))
            .context("no PERT document available (run planning phase first)")?;
        let content = tokio::fs::read_to_string(&pert_path)
            .await
            .with_context(|| format!("read PERT {}", pert_path))?;

        let tasks = parse_pert_tasks(&content).context("parse PERT tasks")?;
        println!("Found {} tasks in PERT", tasks.len());

        let team = param(params, "team").map(str::to_string).unwrap_or(first_team);

        if !self.linear.is_configured() && is_non_interactive(params) {
            anyhow::bail!(
                "LINEAR_API_KEY is not set. \
                 Configure LINEAR_API_KEY in your environment to create Linear issues from the web UI"
            );
        }

        let new_tasks: Vec<PertTask> = tasks
            .iter()
            .filter(|t| {
                let tracked = existing.contains(&t.id);
                if tracked {
                    println!("  Issue {} already tracked, skipping", t.id);
                }
                !tracked
            })
            .cloned()
            .collect();

        if self.linear.is_configured() {
            self.create_via_api(engine, &new_tasks, &team).await;
        } else if !new_tasks.is_empty() {
            println!("LINEAR_API_KEY not set, using Claude MCP fallback for Linear");
            let mapping = self
                .create_via_agent(engine, &new_tasks, &team)
                .await
                .unwrap_or_else(|e| {
                    warn!("Linear MCP fallback failed: {:#}", e);
                    HashMap::new()
                });
            for task in &new_tasks {
                let mut issue = task.to_issue();
                issue.linear_id = mapping.get(&task.id).cloned();
                self.save_new_issue(engine, issue).await;
            }
        }

        info!(tasks = tasks.len(), created = new_tasks.len(), "Tracking complete");
        println!("Created {} issues", new_tasks.len());
        Ok(())
    }
}
