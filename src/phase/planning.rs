use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::info;

use super::{AgentCall, PhaseRunner, artifact_output_path, param, repo_summary};
use crate::agent::RunConfig;
use crate::engine::artifacts::{PERT, SCOPING_DOC};
use crate::engine::state::Phase;
use crate::engine::{Engine, Params};
use crate::prompts::Prompts;

/// Decomposes the scoping document into a PERT task graph.
pub struct Planning {
    prompts: Prompts,
}

impl Planning {
    pub fn new(prompts: Prompts) -> Self {
        Self { prompts }
    }
}

#[async_trait]
impl PhaseRunner for Planning {
    fn name(&self) -> Phase {
        Phase::Planning
    }

    async fn run(&self, engine: &Engine, params: &Params) -> Result<()> {
        let (run_id, stored, summary) = engine.with_state(|s| {
            (
                s.run_id.clone(),
                s.artifacts.get(SCOPING_DOC).cloned(),
                repo_summary(s),
            )
        });

        let scoping_path = param(params, SCOPING_DOC)
            .map(str::to_string)
            .or(stored.filter(|p| !p.is_empty()))
            .context("no scoping document available (run design phase first)")?;
        let scoping = tokio::fs::read_to_string(&scoping_path)
            .await
            .with_context(|| format!("read scoping doc {}", scoping_path))?;

        println!("Running task decomposer...");
        let cfg = RunConfig::new(
            self.prompts.task_decomposer(&scoping, &summary),
            "opus",
            &["Read"],
        );
        let result = AgentCall::new("task-decomposer", Phase::Planning)
            .run(engine, &cfg)
            .await
            .context("task decomposer failed")?;

        let output = artifact_output_path(params, &run_id, "pert.md").await?;
        tokio::fs::write(&output, &result.output)
            .await
            .with_context(|| format!("write PERT {}", output.display()))?;
        let output = output.to_string_lossy().into_owned();
        engine.save_artifact(PERT, &output).await;
        info!(path = %output, "PERT written");
        println!("PERT written to {}", output);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::fake::FakeRunner;
    use crate::phase::test_support::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_requires_scoping_doc() {
        let eng = engine(vec![repo("api", "../api")], Arc::new(FakeRunner::replying(""))).await;
        let err = Planning::new(Prompts::new("/nonexistent"))
            .run(&eng, &Params::new())
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "no scoping document available (run design phase first)"
        );
    }

    #[tokio::test]
    async fn test_artifact_path_feeds_decomposer() {
        let dir = TempDir::new().unwrap();
        let scope = dir.path().join("scope.md");
        std::fs::write(&scope, "Scope: payments").unwrap();
        let out = dir.path().join("pert.md");

        let fake = Arc::new(FakeRunner::replying("[{\"id\":\"TASK-001\"}]"));
        let eng = engine(vec![repo("api", "../api")], fake.clone()).await;
        eng.save_artifact(SCOPING_DOC, scope.to_str().unwrap()).await;

        Planning::new(Prompts::new("/nonexistent"))
            .run(&eng, &params(&[("output", out.to_str().unwrap())]))
            .await
            .unwrap();

        let call = fake.calls.lock().unwrap()[0].clone();
        assert!(call.prompt.contains("## Scoping Document\nScope: payments"));
        assert_eq!(call.model, "opus");
        assert_eq!(std::fs::read_to_string(&out).unwrap(), "[{\"id\":\"TASK-001\"}]");
        assert_eq!(eng.state().artifacts[PERT], out.to_str().unwrap());
    }

    #[tokio::test]
    async fn test_scoping_doc_param_overrides_artifact() {
        let dir = TempDir::new().unwrap();
        let scope = dir.path().join("s.md");
        std::fs::write(&scope, "from param").unwrap();
        let out = dir.path().join("pert.md");
        let fake = Arc::new(FakeRunner::replying("pert"));
        let eng = engine(vec![repo("api", "../api")], fake.clone()).await;

        Planning::new(Prompts::new("/nonexistent"))
            .run(
                &eng,
                &params(&[
                    ("scoping_doc", scope.to_str().unwrap()),
                    ("output", out.to_str().unwrap()),
                ]),
            )
            .await
            .unwrap();
        assert!(fake.calls.lock().unwrap()[0].prompt.contains("from param"));
    }
}
