//! Dashboard server command: `sdlc serve`.

use std::path::Path;

use anyhow::{Context, Result};
use sdlc::config::Config;
use sdlc::engine::Engine;
use sdlc::engine::state::State;
use sdlc::server::{AppState, start_server};
use sdlc::store::Store;
use tracing::{info, warn};

use super::{agent, open_store};

/// Pre-database state file imported on first start.
const LEGACY_STATE_FILE: &str = "state.json";
const MIGRATED_SUFFIX: &str = ".migrated";

pub async fn cmd_serve(config: Config) -> Result<()> {
    let store = open_store(&config)?;
    {
        let guard = store.lock_sync()?;
        migrate_if_needed(&guard, Path::new(LEGACY_STATE_FILE));
    }

    let agent = agent(&config);
    let engine = Engine::new_empty(store.clone(), agent.clone()).await;
    info!(run_id = %engine.run_id(), db = %config.db_path.display(), "Loaded run");

    let port = config.port;
    let state = AppState::new(engine, store, config, agent, sdlc::phase::register_all);
    start_server(state, port).await
}

/// Import a legacy state file into an empty database, then rename it so the
/// import happens once. Returns whether an import took place.
pub fn migrate_if_needed(store: &Store, path: &Path) -> bool {
    match store.list_runs() {
        Ok(runs) if runs.is_empty() => {}
        _ => return false,
    }
    if !path.exists() {
        return false;
    }

    let imported = State::load_from_file(path).and_then(|state| {
        store
            .import_state(&state)
            .with_context(|| format!("import run {}", state.run_id))
    });
    if let Err(e) = imported {
        warn!("Failed to migrate {}: {:#}", path.display(), e);
        eprintln!("Warning: failed to migrate {}: {:#}", path.display(), e);
        return false;
    }

    let mut migrated = path.as_os_str().to_owned();
    migrated.push(MIGRATED_SUFFIX);
    match std::fs::rename(path, &migrated) {
        Ok(()) => println!(
            "Migrated {} -> {}",
            path.display(),
            Path::new(&migrated).display()
        ),
        Err(e) => eprintln!("Warning: failed to rename {}: {}", path.display(), e),
    }
    true
}
