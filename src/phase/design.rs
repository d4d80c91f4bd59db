use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{info, warn};

use super::{
    AgentCall, NOTION_MCP_TOOLS, PhaseRunner, artifact_output_path, is_non_interactive, param, repo_summary,
};
use crate::agent::RunConfig;
use crate::engine::artifacts::{self, SCOPING_DOC, SCOPING_DOC_NOTION};
use crate::engine::state::Phase;
use crate::engine::{Engine, Params};
use crate::integrations::NotionClient;
use crate::integrations::notion::is_notion_url;
use crate::prompts::Prompts;

/// Turns the PRD into a scoping document.
pub struct Design {
    prompts: Prompts,
    notion: NotionClient,
}

/// The PRD as a Notion URL, from `params.prd` when given, else the run's PRD.
pub(crate) fn resolve_notion_url(prd_url: &str, params: &Params) -> Option<String> {
    let candidate = param(params, "prd").unwrap_or(prd_url);
    is_notion_url(candidate).then(|| candidate.to_string())
}

/// PRD text for a local file, or a pointer to a non-Notion URL.
fn load_document(prd_url: &str, params: &Params) -> Result<String> {
    let source = param(params, "prd").unwrap_or(prd_url);
    if source.is_empty() {
        anyhow::bail!("no PRD URL or path specified");
    }
    match std::fs::read_to_string(source) {
        Ok(content) => Ok(content),
        Err(_) => Ok(format!(
            "PRD URL: {}\n(Content should be fetched from the URL above)",
            source
        )),
    }
}

impl Design {
    pub fn new(prompts: Prompts, notion: NotionClient) -> Self {
        Self { prompts, notion }
    }

    /// Build the designer prompt and its tool list for the PRD source.
    async fn prompt_for(
        &self,
        prd_url: &str,
        notion_url: Option<&str>,
        summary: &str,
        params: &Params,
    ) -> Result<(String, Vec<&'static str>)> {
        let mut tools = vec!["Read"];
        let prompt = match notion_url {
            Some(url) if self.notion.is_configured() => {
                println!("Pre-fetching PRD via Notion API...");
                let prd = self
                    .notion
                    .read_page(url)
                    .await
                    .context("fetch PRD from Notion")?;
                self.prompts.solution_designer(&prd, summary)
            }
            Some(url) => {
                if is_non_interactive(params) {
                    anyhow::bail!(
                        "PRD is a Notion URL but NOTION_API_KEY is not set. \
                         Configure NOTION_API_KEY in your environment to read Notion pages from the web UI"
                    );
                }
                println!("PRD is a Notion URL, will use Notion MCP tools (NOTION_API_KEY not set)");
                tools.push(NOTION_MCP_TOOLS);
                self.prompts.solution_designer_from_notion(url, summary)
            }
            None => {
                let prd = load_document(prd_url, params).context("load PRD")?;
                self.prompts.solution_designer(&prd, summary)
            }
        };
        Ok((prompt, tools))
    }
}

#[async_trait]
impl PhaseRunner for Design {
    fn name(&self) -> Phase {
        Phase::Design
    }

    async fn run(&self, engine: &Engine, params: &Params) -> Result<()> {
        let (run_id, prd_url, summary) =
            engine.with_state(|s| (s.run_id.clone(), s.prd_url.clone(), repo_summary(s)));
        let notion_url = resolve_notion_url(&prd_url, params);

        let (prompt, tools) = self
            .prompt_for(&prd_url, notion_url.as_deref(), &summary, params)
            .await?;

        println!("Running solution designer...");
        let result = AgentCall::new("solution-designer", Phase::Design)
            .run(engine, &RunConfig::new(prompt, "opus", &tools))
            .await
            .context("solution designer failed")?;

        let output = artifact_output_path(params, &run_id, "scoping-doc.md").await?;
        tokio::fs::write(&output, &result.output)
            .await
            .with_context(|| format!("write scoping doc {}", output.display()))?;
        let output = output.to_string_lossy().into_owned();
        engine.save_artifact(SCOPING_DOC, &output).await;
        info!(path = %output, "Scoping document written");
        println!("Scoping document written to {}", output);

        if let Some(url) = notion_url.filter(|_| self.notion.is_configured()) {
            let title = artifacts::artifact_def(SCOPING_DOC)
                .map(|d| d.notion_title)
                .unwrap_or_default();
            match self.notion.create_page(&url, title, &result.output).await {
                Ok(page_url) => {
                    engine.save_artifact(SCOPING_DOC_NOTION, &page_url).await;
                    println!("Scoping document published to Notion: {}", page_url);
                }
                Err(e) => warn!("Failed to write scoping doc to Notion: {:#}", e),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::fake::FakeRunner;
    use crate::engine::PARAM_NON_INTERACTIVE;
    use crate::phase::test_support::*;
    use axum::extract::Path as UrlPath;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use serde_json::{Value, json};
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;

    const NOTION_PRD: &str = "https://www.notion.so/acme/PRD-0123456789abcdef0123456789abcdef";

    fn design() -> Design {
        Design::new(Prompts::new("/nonexistent"), NotionClient::new(None))
    }

    #[test]
    fn test_resolve_notion_url_prefers_param() {
        assert_eq!(
            resolve_notion_url(NOTION_PRD, &Params::new()).as_deref(),
            Some(NOTION_PRD)
        );
        assert_eq!(resolve_notion_url(NOTION_PRD, &params(&[("prd", "local.md")])), None);
        assert_eq!(resolve_notion_url("docs/prd.md", &Params::new()), None);
    }

    #[test]
    fn test_load_document() {
        let dir = TempDir::new().unwrap();
        let prd = dir.path().join("prd.md");
        std::fs::write(&prd, "# Checkout").unwrap();
        assert_eq!(load_document(prd.to_str().unwrap(), &Params::new()).unwrap(), "# Checkout");
        assert_eq!(
            load_document("", &params(&[("prd", "https://example.com/prd")])).unwrap(),
            "PRD URL: https://example.com/prd\n(Content should be fetched from the URL above)"
        );
        assert_eq!(
            load_document("", &Params::new()).unwrap_err().to_string(),
            "no PRD URL or path specified"
        );
    }

    #[tokio::test]
    async fn test_local_prd_writes_scoping_doc() {
        let dir = TempDir::new().unwrap();
        let prd = dir.path().join("prd.md");
        std::fs::write(&prd, "Build a checkout flow").unwrap();
        let out = dir.path().join("scope.md");

        let fake = Arc::new(FakeRunner::replying("# Scoping\nplan"));
        let eng = engine(vec![repo("api", "../api")], fake.clone()).await;
        design()
            .run(
                &eng,
                &params(&[("prd", prd.to_str().unwrap()), ("output", out.to_str().unwrap())]),
            )
            .await
            .unwrap();

        assert_eq!(std::fs::read_to_string(&out).unwrap(), "# Scoping\nplan");
        assert_eq!(eng.state().artifacts[SCOPING_DOC], out.to_str().unwrap());
        let call = fake.calls.lock().unwrap()[0].clone();
        assert_eq!(call.model, "opus");
        assert_eq!(call.allowed_tools, vec!["Read"]);
        assert!(call.prompt.contains("Build a checkout flow"));
        assert!(call.prompt.contains("- api (go) at ../api, team: Core"));
    }

    #[tokio::test]
    async fn test_notion_without_key_non_interactive_fails() {
        let fake = Arc::new(FakeRunner::replying("x"));
        let eng = engine(vec![repo("api", "../api")], fake.clone()).await;
        let err = design()
            .run(
                &eng,
                &params(&[("prd", NOTION_PRD), (PARAM_NON_INTERACTIVE, "true")]),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().starts_with("PRD is a Notion URL but NOTION_API_KEY is not set"));
        assert_eq!(fake.call_count(), 0);
    }

    #[tokio::test]
    async fn test_notion_without_key_interactive_uses_mcp() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("scope.md");
        let fake = Arc::new(FakeRunner::replying("doc"));
        let eng = engine(vec![repo("api", "../api")], fake.clone()).await;
        design()
            .run(&eng, &params(&[("prd", NOTION_PRD), ("output", out.to_str().unwrap())]))
            .await
            .unwrap();

        let call = fake.calls.lock().unwrap()[0].clone();
        assert_eq!(call.allowed_tools, vec!["Read", NOTION_MCP_TOOLS]);
        assert!(call.prompt.starts_with("IMPORTANT: The PRD is stored in Notion."));
        assert!(!eng.state().artifacts.contains_key(SCOPING_DOC_NOTION));
    }

    #[tokio::test]
    async fn test_notion_with_key_prefetches_and_writes_back() {
        let created = Arc::new(Mutex::new(Vec::<Value>::new()));
        let seen = created.clone();
        let app = Router::new()
            .route(
                "/blocks/{id}/children",
                get(|UrlPath(id): UrlPath<String>| async move {
                    assert_eq!(id, "0123456789abcdef0123456789abcdef");
                    Json(json!({
                        "results": [{
                            "type": "paragraph",
                            "paragraph": {"rich_text": [{"plain_text": "Users can pay"}]}
                        }],
                        "has_more": false
                    }))
                }),
            )
            .route(
                "/pages",
                post(move |Json(body): Json<Value>| {
                    let seen = seen.clone();
                    async move {
                        seen.lock().unwrap().push(body);
                        Json(json!({"id": "p1", "url": "https://notion.so/p1"}))
                    }
                }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        let dir = TempDir::new().unwrap();
        let out = dir.path().join("scope.md");
        let fake = Arc::new(FakeRunner::replying("# Scope"));
        let eng = engine(vec![repo("api", "../api")], fake.clone()).await;
        let runner = Design::new(
            Prompts::new("/nonexistent"),
            NotionClient::new(Some("secret".into())).with_base_url(base),
        );
        runner
            .run(&eng, &params(&[("prd", NOTION_PRD), ("output", out.to_str().unwrap())]))
            .await
            .unwrap();

        let call = fake.calls.lock().unwrap()[0].clone();
        assert!(call.prompt.contains("Users can pay"));
        assert_eq!(eng.state().artifacts[SCOPING_DOC_NOTION], "https://notion.so/p1");
        let created = created.lock().unwrap();
        assert_eq!(
            created[0]["properties"]["title"][0]["text"]["content"],
            "1. Scoping Document"
        );
    }
}
