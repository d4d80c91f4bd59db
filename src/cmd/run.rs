//! Pipeline commands: `sdlc init`, `sdlc run`, `sdlc phase <name>` and
//! `sdlc approve`.

use std::path::Path;

use anyhow::{Context, Result};
use sdlc::config::Config;
use sdlc::engine::{Engine, Params};
use sdlc::manifest::Manifest;

use super::{agent, load_latest, open_store};

/// Parse a `key=value` pair given to `--param`.
pub fn parse_param(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("invalid param '{}': expected key=value", raw)),
    }
}

pub async fn cmd_init(config: &Config, manifest_path: &Path) -> Result<()> {
    let manifest = Manifest::load(manifest_path)?;
    manifest
        .validate()
        .with_context(|| format!("invalid manifest {}", manifest_path.display()))?;

    let engine = Engine::create(&manifest, open_store(config)?, agent(config)).await?;
    println!("Created run {}", engine.run_id());
    println!("  PRD:   {}", manifest.prd);
    println!("  Repos: {}", manifest.repos.len());
    println!();
    println!("Run 'sdlc run' to start the pipeline.");
    Ok(())
}

pub async fn cmd_run(config: &Config) -> Result<()> {
    let engine = load_latest(config).await?;
    engine.run_all().await
}

pub async fn cmd_phase(config: &Config, name: &str, params: Vec<(String, String)>) -> Result<()> {
    let engine = load_latest(config).await?;
    let params: Params = params.into_iter().collect();
    engine.run_phase(name, &params).await
}

pub async fn cmd_approve(config: &Config) -> Result<()> {
    let engine = load_latest(config).await?;
    engine.approve().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_param() {
        assert_eq!(parse_param("repo=api"), Ok(("repo".into(), "api".into())));
        assert_eq!(parse_param("prd=a=b"), Ok(("prd".into(), "a=b".into())));
        assert_eq!(parse_param("output="), Ok(("output".into(), String::new())));
        assert!(parse_param("repo").is_err());
        assert!(parse_param("=api").is_err());
    }
}
