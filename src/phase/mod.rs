//! The five pipeline phase runners and the helpers they share.

pub mod bootstrap;
pub mod design;
pub mod executing;
pub mod planning;
pub mod tracking;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{Value, json};

use crate::agent::{AgentOutput, RunConfig};
use crate::config::Config;
use crate::engine::artifacts::ARTIFACTS_DIR;
use crate::engine::events::EventType;
use crate::engine::metrics::MetricsEntry;
use crate::engine::state::{Phase, State};
use crate::engine::{Engine, PARAM_NON_INTERACTIVE, Params};
use crate::git::WorktreeManager;
use crate::integrations::{GitHubClient, LinearClient, NotionClient};
use crate::prompts::Prompts;

pub use bootstrap::Bootstrap;
pub use design::Design;
pub use executing::{Executing, GitWorkspace, Workspace};
pub use planning::Planning;
pub use tracking::Tracking;

/// Tool pattern granting an agent the Linear MCP server.
pub(crate) const LINEAR_MCP_TOOLS: &str = "mcp__plugin_linear_linear__*";
/// Tool pattern granting an agent the Notion MCP server.
pub(crate) const NOTION_MCP_TOOLS: &str = "mcp__plugin_Notion_notion__*";

/// One step of the pipeline.
#[async_trait]
pub trait PhaseRunner: Send + Sync {
    fn name(&self) -> Phase;

    /// Run the phase. Mutations go through the engine's `save_*` methods.
    async fn run(&self, engine: &Engine, params: &Params) -> Result<()>;
}

/// Register the standard runners, wired to the configured integrations.
pub fn register_all(engine: &Engine, config: &Config) {
    let prompts = Prompts::default();
    let linear = LinearClient::new(config.linear_api_key.clone());
    let notion = NotionClient::new(config.notion_api_key.clone());

    engine.register_phase(Arc::new(Bootstrap::new(prompts.clone())));
    engine.register_phase(Arc::new(Design::new(prompts.clone(), notion)));
    engine.register_phase(Arc::new(Planning::new(prompts.clone())));
    engine.register_phase(Arc::new(Tracking::new(prompts.clone(), linear.clone())));
    let workspace = GitWorkspace::new(WorktreeManager::new("."), GitHubClient::default());
    engine.register_phase(Arc::new(Executing::new(prompts, linear, Arc::new(workspace))));
}

/// `Repositories:` followed by one line per configured repo.
pub fn repo_summary(state: &State) -> String {
    let mut out = String::from("Repositories:\n");
    for r in &state.repos {
        out.push_str(&format!(
            "- {} ({}) at {}, team: {}\n",
            r.name, r.language, r.path, r.team
        ));
    }
    out
}

pub(crate) fn is_non_interactive(params: &Params) -> bool {
    params.get(PARAM_NON_INTERACTIVE).map(String::as_str) == Some("true")
}

pub(crate) fn param<'a>(params: &'a Params, key: &str) -> Option<&'a str> {
    params.get(key).map(String::as_str).filter(|v| !v.is_empty())
}

/// Output path for an artifact: `params.output` or the run's default file,
/// creating the artifacts directory in the latter case.
pub(crate) async fn artifact_output_path(params: &Params, run_id: &str, file: &str) -> Result<PathBuf> {
    if let Some(out) = param(params, "output") {
        return Ok(PathBuf::from(out));
    }
    tokio::fs::create_dir_all(ARTIFACTS_DIR)
        .await
        .context("create artifacts dir")?;
    Ok(Path::new(ARTIFACTS_DIR).join(format!("{}-{}", run_id, file)))
}

/// Describes one agent invocation made on behalf of a phase.
pub(crate) struct AgentCall<'a> {
    pub agent: &'a str,
    pub phase: Phase,
    pub issue_id: Option<&'a str>,
    /// Extra fields for the `agent.spawned` / `agent.completed` events.
    pub event: Value,
}

impl<'a> AgentCall<'a> {
    pub fn new(agent: &'a str, phase: Phase) -> Self {
        Self {
            agent,
            phase,
            issue_id: None,
            event: json!({}),
        }
    }

    pub fn for_issue(mut self, issue_id: &'a str) -> Self {
        self.issue_id = Some(issue_id);
        self.event["issue"] = json!(issue_id);
        self
    }

    pub fn with(mut self, key: &str, value: &str) -> Self {
        self.event[key] = json!(value);
        self
    }

    fn event_data(&self) -> Value {
        let mut data = self.event.clone();
        data["agent"] = json!(self.agent);
        data
    }

    /// Announce, run and meter one agent invocation.
    pub async fn run(self, engine: &Engine, cfg: &RunConfig) -> Result<AgentOutput> {
        engine
            .events()
            .emit(EventType::AgentSpawned, self.event_data());

        let start = Instant::now();
        let result = engine
            .agent()
            .run(cfg, engine.events(), self.issue_id.unwrap_or_default())
            .await
            .with_context(|| format!("{} agent", self.agent))?;

        let mut entry = MetricsEntry::new(self.agent, &cfg.model, self.phase);
        entry.tokens_in = result.tokens_in;
        entry.tokens_out = result.tokens_out;
        entry.duration_ms = start.elapsed().as_millis() as i64;
        entry.issue_id = self.issue_id.map(str::to_string);
        engine.metrics().record(entry).await;

        engine
            .events()
            .emit(EventType::AgentCompleted, self.event_data());
        Ok(result)
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::agent::fake::FakeRunner;

    #[tokio::test]
    async fn test_repo_summary_lists_every_repo() {
        let eng = engine(
            vec![repo("api", "../api"), repo("web", "../web")],
            Arc::new(FakeRunner::replying("")),
        )
        .await;
        let summary = eng.with_state(repo_summary);
        assert_eq!(
            summary,
            "Repositories:\n- api (go) at ../api, team: Core\n- web (go) at ../web, team: Core\n"
        );
    }

    #[tokio::test]
    async fn test_agent_call_records_metrics_and_events() {
        let fake = Arc::new(FakeRunner::replying("done"));
        let eng = engine(vec![repo("api", "../api")], fake.clone()).await;
        let mut sub = eng.events().subscribe();

        let out = AgentCall::new("coder", Phase::Executing)
            .for_issue("TASK-001")
            .run(&eng, &RunConfig::new("p", "sonnet", &["Read"]))
            .await
            .unwrap();
        assert_eq!(out.output, "done");

        let metrics = eng.state().metrics;
        assert_eq!(metrics.tokens_in, 10);
        assert_eq!(metrics.by_agent["coder"].calls, 1);

        let spawned = sub.rx.recv().await.unwrap();
        assert_eq!(spawned.kind, EventType::AgentSpawned);
        assert_eq!(spawned.data["agent"], "coder");
        assert_eq!(spawned.data["issue"], "TASK-001");
    }

    #[test]
    fn test_param_helpers() {
        let p = params(&[("output", ""), (PARAM_NON_INTERACTIVE, "true"), ("repo", "api")]);
        assert_eq!(param(&p, "output"), None);
        assert_eq!(param(&p, "repo"), Some("api"));
        assert!(is_non_interactive(&p));
        assert!(!is_non_interactive(&Params::new()));
    }
}
