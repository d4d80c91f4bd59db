use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::info;

use super::{AgentCall, PhaseRunner, param};
use crate::agent::RunConfig;
use crate::engine::state::{Phase, RepoState};
use crate::engine::{Engine, Params};
use crate::prompts::Prompts;

const DOC_TOOLS: &[&str] = &["Read", "Write", "Glob", "Grep", "Bash"];

/// Marker files checked in order; the first one present names the language.
const LANGUAGE_MARKERS: &[(&str, &str)] = &[
    ("go.mod", "go"),
    ("package.json", "typescript"),
    ("pyproject.toml", "python"),
    ("Cargo.toml", "rust"),
    ("pom.xml", "java"),
];

pub fn detect_language(repo: &Path) -> &'static str {
    LANGUAGE_MARKERS
        .iter()
        .find(|(file, _)| repo.join(file).exists())
        .map(|(_, lang)| *lang)
        .unwrap_or("unknown")
}

/// Generates `CLAUDE.md` and `ARCHITECTURE.md` for repos missing them.
pub struct Bootstrap {
    prompts: Prompts,
}

impl Bootstrap {
    pub fn new(prompts: Prompts) -> Self {
        Self { prompts }
    }

    async fn generate(
        &self,
        engine: &Engine,
        repo: &str,
        root: &Path,
        language: &str,
        target: &str,
    ) -> Result<()> {
        if root.join(target).exists() {
            return Ok(());
        }
        println!("  Generating {} for {} ({})...", target, repo, language);
        let cfg = RunConfig::new(
            self.prompts.doc_generator(repo, language, target),
            "sonnet",
            DOC_TOOLS,
        )
        .in_dir(root);
        AgentCall::new("doc-generator", Phase::Bootstrap)
            .with("repo", repo)
            .with("target", target)
            .run(engine, &cfg)
            .await
            .with_context(|| format!("generate {} for {}", target, repo))?;
        Ok(())
    }
}

#[async_trait]
impl PhaseRunner for Bootstrap {
    fn name(&self) -> Phase {
        Phase::Bootstrap
    }

    async fn run(&self, engine: &Engine, params: &Params) -> Result<()> {
        let target_repo = param(params, "repo");
        let (repos, bootstrap) = engine.with_state(|s| (s.repos.clone(), s.bootstrap.clone()));

        for repo in repos {
            if target_repo.is_some_and(|t| t != repo.name) {
                continue;
            }
            println!("Bootstrapping {}...", repo.name);
            let root = std::path::absolute(&repo.path)
                .with_context(|| format!("resolve path for {}", repo.name))?;

            let language = if repo.language.is_empty() {
                detect_language(&root).to_string()
            } else {
                repo.language.clone()
            };

            let mut rs: RepoState = bootstrap.get(&repo.name).copied().unwrap_or_default();
            if !rs.claude_md {
                self.generate(engine, &repo.name, &root, &language, "CLAUDE.md").await?;
                rs.claude_md = true;
            }
            if !rs.architecture_md {
                self.generate(engine, &repo.name, &root, &language, "ARCHITECTURE.md").await?;
                rs.architecture_md = true;
            }

            info!(repo = %repo.name, language = %language, "Bootstrapped repo");
            engine.save_bootstrap_state(&repo.name, rs).await;
        }
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

    #[test]
    fn test_detect_language() {
        let dir = TempDir::new().unwrap();
        assert_eq!(detect_language(dir.path()), "unknown");
        std::fs::write(dir.path().join("Cargo.toml"), "").unwrap();
        assert_eq!(detect_language(dir.path()), "rust");
        // go.mod is checked first.
        std::fs::write(dir.path().join("go.mod"), "").unwrap();
        assert_eq!(detect_language(dir.path()), "go");
    }

    #[tokio::test]
    async fn test_generates_only_missing_docs() {
        let api = TempDir::new().unwrap();
        std::fs::write(api.path().join("CLAUDE.md"), "exists").unwrap();
        let fake = Arc::new(FakeRunner::replying("ok"));
        let eng = engine(
            vec![repo("api", api.path().to_str().unwrap())],
            fake.clone(),
        )
        .await;

        Bootstrap::new(Prompts::new("/nonexistent"))
            .run(&eng, &Params::new())
            .await
            .unwrap();

        let calls = fake.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].prompt.contains("ARCHITECTURE.md"));
        assert_eq!(calls[0].cwd.as_deref(), Some(api.path()));
        assert_eq!(calls[0].model, "sonnet");
        drop(calls);

        let rs = eng.state().bootstrap["api"];
        assert!(rs.claude_md && rs.architecture_md);
        assert_eq!(eng.state().metrics.by_agent["doc-generator"].calls, 1);
    }

    #[tokio::test]
    async fn test_repo_filter_and_already_bootstrapped() {
        let api = TempDir::new().unwrap();
        let web = TempDir::new().unwrap();
        let fake = Arc::new(FakeRunner::replying("ok"));
        let eng = engine(
            vec![
                repo("api", api.path().to_str().unwrap()),
                repo("web", web.path().to_str().unwrap()),
            ],
            fake.clone(),
        )
        .await;
        eng.save_bootstrap_state(
            "web",
            RepoState {
                claude_md: true,
                architecture_md: true,
            },
        )
        .await;

        let runner = Bootstrap::new(Prompts::new("/nonexistent"));
        runner.run(&eng, &params(&[("repo", "web")])).await.unwrap();
        assert_eq!(fake.call_count(), 0);

        runner.run(&eng, &Params::new()).await.unwrap();
        assert_eq!(fake.call_count(), 2);
        assert!(eng.state().bootstrap["api"].claude_md);
    }

    #[tokio::test]
    async fn test_agent_failure_aborts() {
        let api = TempDir::new().unwrap();
        let fake = Arc::new(FakeRunner::new(|_| anyhow::bail!("spawn failed")));
        let eng = engine(vec![repo("api", api.path().to_str().unwrap())], fake).await;
        let err = Bootstrap::new(Prompts::new("/nonexistent"))
            .run(&eng, &Params::new())
            .await
            .unwrap_err();
        assert!(format!("{:#}", err).starts_with("generate CLAUDE.md for api"));
        assert!(!eng.state().bootstrap.contains_key("api"));
    }
}
