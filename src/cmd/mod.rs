//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module   | Commands handled                     |
//! |----------|--------------------------------------|
//! | `serve`  | `Serve`                              |
//! | `run`    | `Init`, `Run`, `Phase`, `Approve`    |
//! | `status` | `Status`, `Runs`                     |

pub mod run;
pub mod serve;
pub mod status;

use std::sync::Arc;

use anyhow::{Context, Result};
use sdlc::agent::{AgentRunner, ClaudeRunner};
use sdlc::config::Config;
use sdlc::engine::Engine;
use sdlc::errors::StoreError;
use sdlc::store::StoreHandle;

pub use run::{cmd_approve, cmd_init, cmd_phase, cmd_run};
pub use serve::cmd_serve;
pub use status::{cmd_runs, cmd_status};

pub(crate) fn open_store(config: &Config) -> Result<StoreHandle> {
    StoreHandle::open(&config.db_path)
        .with_context(|| format!("Failed to open database {}", config.db_path.display()))
}

pub(crate) fn agent(config: &Config) -> Arc<dyn AgentRunner> {
    Arc::new(ClaudeRunner::from_command_line(&config.claude_cmd))
}

/// Load the most recent run with the standard phases registered.
pub(crate) async fn load_latest(config: &Config) -> Result<Engine> {
    let store = open_store(config)?;
    let engine = match Engine::load(store, agent(config), None).await {
        Ok(engine) => engine,
        Err(e) if matches!(e.downcast_ref::<StoreError>(), Some(StoreError::RunNotFound)) => {
            anyhow::bail!("No runs found. Run 'sdlc init <manifest>' first.");
        }
        Err(e) => return Err(e),
    };
    sdlc::phase::register_all(&engine, config);
    Ok(engine)
}
