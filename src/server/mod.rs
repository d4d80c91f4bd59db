//! HTTP + WebSocket gateway over the loaded runs.
//!
//! The server keeps one [`Engine`] per loaded run, each with its own
//! "something is running" flag, plus the id of the run the UI has selected.
//! Interactive executions publish on a separate bus that outlives any run.

pub mod api;
pub mod executions;
pub mod health;
pub mod ws;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use anyhow::{Context, Result};
use axum::Json;
use axum::Router;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::agent::AgentRunner;
use crate::config::Config;
use crate::engine::Engine;
use crate::engine::events::EventBus;
use crate::engine::execution::ExecutionManager;
use crate::errors::ExecutionError;
use crate::integrations::{GitHubClient, LinearClient, NotionClient};
use crate::manifest::MANIFEST_FILE;
use crate::prompts::Prompts;
use crate::store::StoreHandle;
use ws::WsHub;

/// Hub key of the execution bus. Its events carry their own `run_id`.
const SESSION_BUS: &str = "";

/// Installs phase runners on a freshly loaded engine.
pub type PhaseRegistrar = fn(&Engine, &Config);

// ── Engines ───────────────────────────────────────────────────────────

pub struct EngineEntry {
    pub engine: Arc<Engine>,
    running: AtomicBool,
}

/// Holds an entry's running flag; clears it on drop.
pub struct RunGuard(Arc<EngineEntry>);

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.0.running.store(false, Ordering::SeqCst);
    }
}

impl EngineEntry {
    fn new(engine: Engine) -> Arc<Self> {
        Arc::new(Self {
            engine: Arc::new(engine),
            running: AtomicBool::new(false),
        })
    }

    /// Claim the entry for a background run. `None` if one is in flight.
    pub fn try_start(self: &Arc<Self>) -> Option<RunGuard> {
        self.running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| RunGuard(self.clone()))
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    engines: RwLock<HashMap<String, Arc<EngineEntry>>>,
    active_run: RwLock<String>,
    pub store: StoreHandle,
    /// Bus for interactive executions, forwarded untagged.
    pub events: Arc<EventBus>,
    pub executions: ExecutionManager,
    pub hub: WsHub,
    pub config: Config,
    pub agent: Arc<dyn AgentRunner>,
    pub prompts: Prompts,
    pub linear: LinearClient,
    pub notion: NotionClient,
    pub github: GitHubClient,
    pub manifest_path: PathBuf,
    registrar: PhaseRegistrar,
}

impl AppState {
    /// Wrap the initial engine and make it the active run.
    pub fn new(
        engine: Engine,
        store: StoreHandle,
        config: Config,
        agent: Arc<dyn AgentRunner>,
        registrar: PhaseRegistrar,
    ) -> Arc<Self> {
        let events = Arc::new(EventBus::new());
        let hub = WsHub::new();
        hub.add_event_bus(SESSION_BUS, events.clone());
        let state = Arc::new(Self {
            engines: RwLock::new(HashMap::new()),
            active_run: RwLock::new(String::new()),
            store,
            executions: ExecutionManager::new(events.clone()),
            events,
            hub,
            linear: LinearClient::new(config.linear_api_key.clone()),
            notion: NotionClient::new(config.notion_api_key.clone()),
            github: GitHubClient::default(),
            prompts: Prompts::default(),
            manifest_path: PathBuf::from(MANIFEST_FILE),
            config,
            agent,
            registrar,
        });
        state.adopt(engine);
        state
    }

    /// Register phases, subscribe the hub, and make `engine` the active run.
    pub fn adopt(&self, engine: Engine) -> Arc<EngineEntry> {
        (self.registrar)(&engine, &self.config);
        let run_id = engine.run_id();
        self.hub.add_event_bus(&run_id, engine.events().clone());
        let entry = EngineEntry::new(engine);
        self.engines
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(run_id.clone(), entry.clone());
        self.set_active(&run_id);
        entry
    }

    /// Make an already-loaded run active. Returns false if it is not loaded.
    pub fn select(&self, run_id: &str) -> bool {
        if self.entry(run_id).is_none() {
            return false;
        }
        self.set_active(run_id);
        true
    }

    /// Drop a loaded run from memory and stop forwarding its events.
    pub fn unload(&self, run_id: &str) {
        self.engines
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(run_id);
        self.hub.remove_event_bus(run_id);
    }

    pub fn entry(&self, run_id: &str) -> Option<Arc<EngineEntry>> {
        self.engines
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(run_id)
            .cloned()
    }

    pub fn active_run_id(&self) -> String {
        self.active_run
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn active_entry(&self) -> Result<Arc<EngineEntry>, ApiError> {
        self.entry(&self.active_run_id())
            .ok_or_else(|| ApiError::NotFound("no active run".into()))
    }

    pub fn active_engine(&self) -> Result<Arc<Engine>, ApiError> {
        self.active_entry().map(|e| e.engine.clone())
    }

    fn set_active(&self, run_id: &str) {
        *self
            .active_run
            .write()
            .unwrap_or_else(PoisonError::into_inner) = run_id.to_string();
    }
}

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

impl From<ExecutionError> for ApiError {
    fn from(err: ExecutionError) -> Self {
        match err {
            ExecutionError::NotFound(_) => ApiError::NotFound("execution not found".into()),
            ExecutionError::Busy => ApiError::Conflict(err.to_string()),
            ExecutionError::NoCancel(_) | ExecutionError::Terminal(_) => {
                ApiError::BadRequest(err.to_string())
            }
        }
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn build_router(state: Arc<AppState>) -> Router {
    api::api_router()
        .merge(executions::executions_router())
        .route("/ws/events", get(ws::ws_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve until Ctrl-C.
pub async fn start_server(state: Arc<AppState>, port: u16) -> Result<()> {
    let addr = format!("0.0.0.0:{}", port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    info!(port, run_id = %state.active_run_id(), "Server listening");
    println!("Dashboard running at http://localhost:{}", port);

    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    println!("Server shut down gracefully.");
    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_err() {
        // No signal handler: serve until the process is killed.
        std::future::pending::<()>().await;
    }
    println!("\nShutting down...");
}
