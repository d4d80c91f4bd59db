use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post},
};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::{error, info};

use super::health;
use super::{ApiError, AppState};
use crate::engine::artifacts::{ARTIFACT_DEFS, phase_artifact};
use crate::engine::execution::ExecutionRecord;
use crate::engine::state::{IssueState, PIPELINE, Phase, RepoConfig};
use crate::engine::{Engine, PARAM_NON_INTERACTIVE, PIPELINE_LABEL, Params};
use crate::errors::StoreError;
use crate::manifest::Manifest;

type SharedState = Arc<AppState>;

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
struct ApproveRequest {
    #[serde(default)]
    action: String,
    #[serde(default)]
    comment: String,
}

#[derive(Deserialize, Default)]
struct RunPhaseRequest {
    #[serde(default)]
    params: Params,
}

#[derive(Deserialize)]
struct SelectRunRequest {
    #[serde(default)]
    run_id: String,
}

#[derive(Deserialize)]
struct ManifestRequest {
    #[serde(default)]
    prd: String,
    #[serde(default)]
    repos: Vec<RepoConfig>,
}

impl From<ManifestRequest> for Manifest {
    fn from(req: ManifestRequest) -> Self {
        Manifest::new(req.prd, req.repos)
    }
}

/// Decode a JSON body, reporting any failure as a 400.
pub(crate) fn parse_body<T: DeserializeOwned>(body: &Bytes) -> Result<T, ApiError> {
    serde_json::from_slice(body).map_err(|_| ApiError::BadRequest("invalid request body".into()))
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/status", get(status))
        .route("/api/issues", get(issues))
        .route("/api/metrics", get(metrics))
        .route("/api/approve", post(approve))
        .route("/api/phases", get(phases))
        .route("/api/phases/{name}/run", post(run_phase))
        .route("/api/run", post(run_all))
        .route("/api/manifest", get(get_manifest).post(save_manifest))
        .route("/api/runs", get(list_runs))
        .route("/api/runs/select", post(select_run))
        .route("/api/runs/{id}", delete(delete_run))
        .route("/api/init", post(init_run))
        .route("/api/artifacts/config", get(artifact_config))
        .route("/api/artifacts/{key}", get(get_artifact))
        .route("/api/health/integrations", get(health_integrations))
}

// ── Run state ─────────────────────────────────────────────────────────

async fn status(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    let s = state.active_engine()?.state();
    Ok(Json(json!({
        "run_id": s.run_id,
        "phase": s.phase,
        "phase_status": s.phase_status,
        "prd_url": s.prd_url,
        "repos": s.repos,
        "issue_count": s.issues.len(),
        "artifacts": s.artifacts,
        "updated_at": s.updated_at,
    })))
}

/// Issues keyed by id, plus the same issues grouped by status for the board.
async fn issues(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    let s = state.active_engine()?.state();
    let mut grouped: BTreeMap<&str, Vec<&IssueState>> = BTreeMap::new();
    for issue in s.issues.values() {
        grouped.entry(issue.status.as_str()).or_default().push(issue);
    }
    Ok(Json(json!({ "issues": s.issues, "grouped": grouped })))
}

async fn metrics(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.active_engine()?.metrics().snapshot()))
}

/// Approve the pending gate and continue the pipeline in the background,
/// or record a rejection.
async fn approve(State(state): State<SharedState>, body: Bytes) -> Result<impl IntoResponse, ApiError> {
    let entry = state.active_entry()?;
    let req: ApproveRequest = parse_body(&body)?;

    if req.action != "approve" {
        info!(comment = %req.comment, "Gate rejected");
        return Ok(Json(json!({ "status": "rejected", "comment": req.comment })));
    }

    let guard = entry
        .try_start()
        .ok_or_else(|| ApiError::Conflict("phase already running".into()))?;
    let next = entry
        .engine
        .approve_gate()
        .await
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;

    if let Some(next) = next {
        let engine = entry.engine.clone();
        tokio::spawn(async move {
            let _guard = guard;
            if let Err(e) = engine.run_from(next).await {
                error!(phase = %next, "Pipeline failed after approval: {:#}", e);
            }
        });
    }
    Ok(Json(json!({ "status": "approved" })))
}

/// Latest non-pipeline execution per phase.
fn latest_by_phase(records: Vec<ExecutionRecord>) -> BTreeMap<String, ExecutionRecord> {
    let mut latest: BTreeMap<String, ExecutionRecord> = BTreeMap::new();
    for rec in records.into_iter().filter(|r| r.phase != PIPELINE_LABEL) {
        match latest.get(&rec.phase) {
            Some(existing) if existing.created_at >= rec.created_at => {}
            _ => {
                latest.insert(rec.phase.clone(), rec);
            }
        }
    }
    latest
}

/// Phase timeline. Uses stored execution records when the run has any,
/// otherwise infers status from the current phase.
async fn phases(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    let engine = state.active_engine()?;
    let (run_id, current, current_status) =
        engine.with_state(|s| (s.run_id.clone(), s.phase, s.phase_status));

    let records = state
        .store
        .call(move |s| s.list_executions(&run_id))
        .await
        .unwrap_or_default();
    let latest = latest_by_phase(records);

    let list: Vec<Value> = PIPELINE
        .iter()
        .enumerate()
        .map(|(idx, (phase, gate))| {
            let mut item = json!({ "name": phase.as_str(), "order": idx + 1 });
            if *gate {
                item["gate"] = json!(true);
            }
            if latest.is_empty() {
                if *phase == current {
                    item["status"] = json!(current_status);
                    item["current"] = json!(true);
                } else if phase.ordinal() < current.ordinal() {
                    item["status"] = json!("completed");
                } else {
                    item["status"] = json!("pending");
                }
            } else if let Some(rec) = latest.get(phase.as_str()) {
                item["status"] = json!(rec.status);
                item["execution_id"] = json!(rec.id);
                item["tokens_in"] = json!(rec.tokens_in);
                item["tokens_out"] = json!(rec.tokens_out);
                item["started_at"] = json!(rec.created_at);
                item["updated_at"] = json!(rec.updated_at);
                if *phase == current {
                    item["current"] = json!(true);
                }
            } else {
                item["status"] = json!("pending");
            }
            item
        })
        .collect();
    Ok(Json(list))
}

// ── Running phases ────────────────────────────────────────────────────

async fn run_phase(
    State(state): State<SharedState>,
    Path(name): Path<String>,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let phase = name
        .parse::<Phase>()
        .ok()
        .filter(|p| PIPELINE.iter().any(|(q, _)| q == p))
        .ok_or_else(|| ApiError::BadRequest(format!("unknown phase: {}", name)))?;

    let entry = state.active_entry()?;
    let guard = entry
        .try_start()
        .ok_or_else(|| ApiError::Conflict("phase already running".into()))?;

    // The body is optional.
    let mut params = if body.is_empty() {
        Params::new()
    } else {
        parse_body::<RunPhaseRequest>(&body).unwrap_or_default().params
    };
    params.insert(PARAM_NON_INTERACTIVE.to_string(), "true".to_string());

    let engine = entry.engine.clone();
    tokio::spawn(async move {
        let _guard = guard;
        if let Err(e) = engine.run_phase(phase.as_str(), &params).await {
            error!(phase = %phase, "Phase failed: {:#}", e);
        }
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "status": "started", "phase": phase.as_str() })),
    ))
}

async fn run_all(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    let entry = state.active_entry()?;
    let guard = entry
        .try_start()
        .ok_or_else(|| ApiError::Conflict("phase already running".into()))?;

    let engine = entry.engine.clone();
    tokio::spawn(async move {
        let _guard = guard;
        if let Err(e) = engine.run_all().await {
            error!("Pipeline failed: {:#}", e);
        }
    });

    Ok((StatusCode::ACCEPTED, Json(json!({ "status": "started" }))))
}

// ── Manifest and runs ─────────────────────────────────────────────────

async fn get_manifest(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    let manifest = match tokio::fs::read_to_string(&state.manifest_path).await {
        Ok(data) => serde_yaml::from_str::<Manifest>(&data)
            .map_err(|_| ApiError::Internal("invalid manifest yaml".into()))?,
        Err(_) => match state.active_engine() {
            Ok(engine) => engine.with_state(|s| Manifest::new(s.prd_url.clone(), s.repos.clone())),
            Err(_) => Manifest::default(),
        },
    };
    Ok(Json(json!({ "prd": manifest.prd, "repos": manifest.repos })))
}

/// Validate a submitted manifest and write it to disk.
fn write_manifest(state: &AppState, body: &Bytes) -> Result<Manifest, ApiError> {
    let manifest: Manifest = parse_body::<ManifestRequest>(body)?.into();
    manifest
        .validate()
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    manifest
        .save(&state.manifest_path)
        .map_err(|_| ApiError::Internal("failed to write manifest".into()))?;
    Ok(manifest)
}

async fn save_manifest(State(state): State<SharedState>, body: Bytes) -> Result<impl IntoResponse, ApiError> {
    write_manifest(&state, &body)?;
    Ok(Json(json!({ "status": "ok" })))
}

/// Stored runs, newest first, with the active run prepended when it has not
/// been persisted (the placeholder run of an empty database).
async fn list_runs(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    let mut runs = state
        .store
        .call(|s| s.list_runs())
        .await
        .map_err(|e| ApiError::Internal(format!("failed to list runs: {:#}", e)))?;

    if let Ok(engine) = state.active_engine() {
        let s = engine.state();
        if !runs.iter().any(|r| r.id == s.run_id) {
            runs.insert(
                0,
                crate::store::RunSummary {
                    id: s.run_id.clone(),
                    phase: s.phase.to_string(),
                    phase_status: s.phase_status.to_string(),
                    prd_url: s.prd_url.clone(),
                    issue_count: s.issues.len() as i64,
                    created_at: s.updated_at,
                    updated_at: s.updated_at,
                },
            );
        }
    }
    Ok(Json(runs))
}

async fn select_run(State(state): State<SharedState>, body: Bytes) -> Result<impl IntoResponse, ApiError> {
    let req: SelectRunRequest = parse_body(&body)?;
    if req.run_id.is_empty() {
        return Err(ApiError::BadRequest("run_id is required".into()));
    }

    if !state.select(&req.run_id) {
        let engine = Engine::load(state.store.clone(), state.agent.clone(), Some(&req.run_id))
            .await
            .map_err(|e| ApiError::BadRequest(e.to_string()))?;
        state.adopt(engine);
    }
    info!(run_id = %req.run_id, "Selected run");
    Ok(Json(json!({ "status": "ok", "run_id": req.run_id })))
}

/// Delete a stored run. The active run cannot be deleted.
async fn delete_run(State(state): State<SharedState>, Path(id): Path<String>) -> Result<impl IntoResponse, ApiError> {
    if id == state.active_run_id() {
        return Err(ApiError::BadRequest("cannot delete the active run".into()));
    }
    if state.entry(&id).is_some_and(|e| e.is_running()) {
        return Err(ApiError::Conflict("phase already running".into()));
    }

    let run_id = id.clone();
    state
        .store
        .call(move |s| s.delete_run(&run_id))
        .await
        .map_err(|e| match e.downcast_ref::<StoreError>() {
            Some(StoreError::RunNotFound) => ApiError::NotFound(format!("run not found: {}", id)),
            _ => ApiError::Internal(format!("{:#}", e)),
        })?;
    state.unload(&id);
    info!(run_id = %id, "Deleted run");
    Ok(Json(json!({ "status": "deleted", "run_id": id })))
}

/// Write the manifest, start a new run from it and make it active.
async fn init_run(State(state): State<SharedState>, body: Bytes) -> Result<impl IntoResponse, ApiError> {
    let manifest = write_manifest(&state, &body)?;
    let engine = Engine::create(&manifest, state.store.clone(), state.agent.clone())
        .await
        .map_err(|e| ApiError::Internal(format!("init failed: {:#}", e)))?;
    let run_id = engine.run_id();
    state.adopt(engine);
    Ok(Json(json!({ "status": "created", "run_id": run_id })))
}

// ── Artifacts and health ──────────────────────────────────────────────

async fn artifact_config() -> impl IntoResponse {
    let phase_map: BTreeMap<&str, &str> = PIPELINE
        .iter()
        .filter_map(|(p, _)| phase_artifact(*p).map(|key| (p.as_str(), key)))
        .collect();
    Json(json!({ "artifacts": ARTIFACT_DEFS, "phase_artifact": phase_map }))
}

async fn get_artifact(State(state): State<SharedState>, Path(key): Path<String>) -> Result<impl IntoResponse, ApiError> {
    let engine = state.active_engine()?;
    let path = engine
        .with_state(|s| s.artifacts.get(&key).cloned())
        .filter(|p| !p.is_empty())
        .ok_or_else(|| ApiError::NotFound(format!("artifact not found: {}", key)))?;

    let content = tokio::fs::read_to_string(&path)
        .await
        .map_err(|e| ApiError::Internal(format!("failed to read artifact: {}", e)))?;
    Ok(Json(json!({ "key": key, "path": path, "content": content })))
}

async fn health_integrations(State(state): State<SharedState>) -> impl IntoResponse {
    Json(health::check_all(&state.config, &state.github).await)
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use crate::agent::fake::FakeRunner;
    use crate::config::Config;
    use crate::engine::artifacts::SCOPING_DOC;
    use crate::engine::state::{IssueStatus, PhaseStatus};
    use crate::phase::PhaseRunner;
    use std::time::Duration;
    use tempfile::TempDir;

    /// Sleeps briefly so a second request sees the run in flight.
    struct SlowPhase(Phase);

    #[async_trait::async_trait]
    impl PhaseRunner for SlowPhase {
        fn name(&self) -> Phase {
            self.0
        }

        async fn run(&self, _engine: &Engine, _params: &Params) -> anyhow::Result<()> {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok(())
        }
    }

    fn slow_phases(engine: &Engine, _: &Config) {
        for (phase, _) in PIPELINE {
            engine.register_phase(Arc::new(SlowPhase(phase)));
        }
    }

    fn repos_json() -> Value {
        json!([{ "name": "api", "path": "../api", "team": "Core" }])
    }

    async fn state_in(dir: &TempDir, registrar: super::super::PhaseRegistrar) -> SharedState {
        let state = app_state(Arc::new(FakeRunner::replying("")), registrar).await;
        let mut state = Arc::into_inner(state).unwrap();
        state.manifest_path = dir.path().join("manifest.yaml");
        Arc::new(state)
    }

    /// State whose active run is stored, so executions persist.
    async fn state_with_run(dir: &TempDir, registrar: super::super::PhaseRegistrar) -> SharedState {
        let state = state_in(dir, registrar).await;
        let (status, _) = send(&state, "POST", "/api/init", Some(json!({ "prd": "p.md", "repos": repos_json() }))).await;
        assert_eq!(status, StatusCode::OK);
        state
    }

    async fn wait_idle(state: &SharedState) {
        let entry = state.active_entry().unwrap();
        for _ in 0..200 {
            if !entry.is_running() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("run did not finish");
    }

    #[tokio::test]
    async fn test_status_of_placeholder_run() {
        let state = app_state(Arc::new(FakeRunner::replying("")), no_phases).await;
        let (status, body) = send(&state, "GET", "/api/status", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["run_id"], "empty");
        assert_eq!(body["phase"], "init");
        assert_eq!(body["issue_count"], 0);
    }

    #[tokio::test]
    async fn test_init_validates_and_creates_run() {
        let dir = TempDir::new().unwrap();
        let state = state_in(&dir, no_phases).await;

        let (status, body) = send(&state, "POST", "/api/init", Some(json!({ "repos": repos_json() }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "prd is required");

        let bad = json!({ "prd": "p.md", "repos": [{ "name": "api", "path": "" , "team": "Core" }] });
        let (status, body) = send(&state, "POST", "/api/init", Some(bad)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "repo 0: name, path, and team are required");

        let (status, body) = send(&state, "POST", "/api/init", Some(json!({ "prd": "p.md", "repos": repos_json() }))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "created");
        let run_id = body["run_id"].as_str().unwrap().to_string();
        assert_eq!(state.active_run_id(), run_id);
        assert!(dir.path().join("manifest.yaml").exists());

        let (_, manifest) = send(&state, "GET", "/api/manifest", None).await;
        assert_eq!(manifest["prd"], "p.md");
        assert_eq!(manifest["repos"][0]["name"], "api");

        let (_, runs) = send(&state, "GET", "/api/runs", None).await;
        assert_eq!(runs[0]["id"], run_id.as_str());
    }

    #[tokio::test]
    async fn test_manifest_falls_back_to_engine_state() {
        let dir = TempDir::new().unwrap();
        let state = state_in(&dir, no_phases).await;
        let (status, body) = send(&state, "GET", "/api/manifest", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["prd"], "");
        assert_eq!(body["repos"], json!([]));
    }

    #[tokio::test]
    async fn test_runs_include_unsaved_placeholder() {
        let state = app_state(Arc::new(FakeRunner::replying("")), no_phases).await;
        let (status, body) = send(&state, "GET", "/api/runs", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 1);
        assert_eq!(body[0]["id"], "empty");
    }

    #[tokio::test]
    async fn test_select_and_delete_runs() {
        let dir = TempDir::new().unwrap();
        let state = state_in(&dir, no_phases).await;
        let (_, first) = send(&state, "POST", "/api/init", Some(json!({ "prd": "a.md", "repos": repos_json() }))).await;
        let (_, second) = send(&state, "POST", "/api/init", Some(json!({ "prd": "b.md", "repos": repos_json() }))).await;
        let first = first["run_id"].as_str().unwrap().to_string();
        let second = second["run_id"].as_str().unwrap().to_string();

        let (status, body) = send(&state, "POST", "/api/runs/select", Some(json!({}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "run_id is required");

        let (status, _) = send(&state, "POST", "/api/runs/select", Some(json!({ "run_id": "nope" }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(&state, "POST", "/api/runs/select", Some(json!({ "run_id": first }))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(state.active_run_id(), first);

        let (status, _) = send(&state, "DELETE", &format!("/api/runs/{}", first), None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(&state, "DELETE", &format!("/api/runs/{}", second), None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(state.entry(&second).is_none());
        let (status, _) = send(&state, "DELETE", &format!("/api/runs/{}", second), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_run_phase_rejects_unknown_and_concurrent() {
        let dir = TempDir::new().unwrap();
        let state = state_with_run(&dir, slow_phases).await;

        let (status, body) = send(&state, "POST", "/api/phases/deploy/run", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "unknown phase: deploy");
        let (status, _) = send(&state, "POST", "/api/phases/init/run", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = send(&state, "POST", "/api/phases/bootstrap/run", Some(json!({ "params": { "repo": "api" } }))).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body, json!({ "status": "started", "phase": "bootstrap" }));

        let (status, body) = send(&state, "POST", "/api/run", None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "phase already running");

        wait_idle(&state).await;
        let (_, phases) = send(&state, "GET", "/api/phases", None).await;
        assert_eq!(phases[0]["name"], "bootstrap");
        assert_eq!(phases[0]["status"], "completed");
        assert!(phases[0]["execution_id"].is_string());
        assert_eq!(phases[1]["gate"], true);
        assert_eq!(phases[1]["status"], "pending");
    }

    #[tokio::test]
    async fn test_run_all_pauses_then_approve_resumes() {
        let dir = TempDir::new().unwrap();
        let state = state_with_run(&dir, slow_phases).await;

        let (status, body) = send(&state, "POST", "/api/approve", Some(json!({ "action": "approve" }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "no pending approval gate (current: init/completed)");

        let (status, _) = send(&state, "POST", "/api/run", None).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        wait_idle(&state).await;

        let engine = state.active_engine().unwrap();
        assert_eq!(engine.with_state(|s| (s.phase, s.phase_status)), (Phase::Design, PhaseStatus::Gate));

        let (status, body) = send(&state, "POST", "/api/approve", Some(json!({ "action": "reject", "comment": "redo" }))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "status": "rejected", "comment": "redo" }));

        let (status, body) = send(&state, "POST", "/api/approve", Some(json!({ "action": "approve" }))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "approved");
        wait_idle(&state).await;
        assert_eq!(engine.with_state(|s| (s.phase, s.phase_status)), (Phase::Planning, PhaseStatus::Gate));
    }

    #[tokio::test]
    async fn test_phases_infer_status_without_records() {
        let state = app_state(Arc::new(FakeRunner::replying("")), no_phases).await;
        let (_, phases) = send(&state, "GET", "/api/phases", None).await;
        let statuses: Vec<_> = phases.as_array().unwrap().iter().map(|p| p["status"].clone()).collect();
        assert_eq!(statuses, vec![json!("pending"); 5]);
    }

    #[tokio::test]
    async fn test_issues_grouped_by_status() {
        let state = app_state(Arc::new(FakeRunner::replying("")), no_phases).await;
        let engine = state.active_engine().unwrap();
        let mut done = IssueState::new("TASK-002", "Two", "api");
        done.status = IssueStatus::Done;
        engine.save_issue(IssueState::new("TASK-001", "One", "api")).await;
        engine.save_issue(done).await;

        let (_, body) = send(&state, "GET", "/api/issues", None).await;
        assert_eq!(body["issues"]["TASK-001"]["title"], "One");
        assert_eq!(body["grouped"]["ready"][0]["id"], "TASK-001");
        assert_eq!(body["grouped"]["done"][0]["id"], "TASK-002");
    }

    #[tokio::test]
    async fn test_artifacts() {
        let dir = TempDir::new().unwrap();
        let doc = dir.path().join("scope.md");
        std::fs::write(&doc, "# Scope").unwrap();
        let state = app_state(Arc::new(FakeRunner::replying("")), no_phases).await;

        let (status, body) = send(&state, "GET", "/api/artifacts/scoping_doc", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "artifact not found: scoping_doc");

        state
            .active_engine()
            .unwrap()
            .save_artifact(SCOPING_DOC, doc.to_str().unwrap())
            .await;
        let (status, body) = send(&state, "GET", "/api/artifacts/scoping_doc", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["content"], "# Scope");

        let (_, config) = send(&state, "GET", "/api/artifacts/config", None).await;
        assert_eq!(config["phase_artifact"]["design"], "scoping_doc");
        assert_eq!(config["phase_artifact"]["planning"], "pert");
        assert_eq!(config["artifacts"][1]["notion_title"], "2. PERT");
    }

    #[test]
    fn test_latest_by_phase_skips_pipeline() {
        let mut old = ExecutionRecord::phase("a", "r", "design");
        let mut new = ExecutionRecord::phase("b", "r", "design");
        old.created_at = new.created_at - chrono::Duration::seconds(5);
        new.tokens_in = 7;
        let pipe = ExecutionRecord::phase("p", "r", PIPELINE_LABEL);
        let latest = latest_by_phase(vec![new, old, pipe]);
        assert_eq!(latest.len(), 1);
        assert_eq!(latest["design"].id, "b");
    }
}
