//! Interactive agent sessions driven from the dashboard.
//!
//! A session starts with a prompt built for its phase and then waits for
//! user input between turns. Each turn runs on a background task; the
//! registry's `running` status gates concurrent sends.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use super::api::parse_body;
use super::{ApiError, AppState};
use crate::agent::RunConfig;
use crate::engine::Params;
use crate::engine::artifacts::{PERT, SCOPING_DOC};
use crate::engine::events::EventType;
use crate::engine::execution::{Execution, ExecutionStatus, ExecutionType, Message};
use crate::engine::state::State as RunState;
use crate::errors::ExecutionError;
use crate::integrations::notion::is_notion_url;
use crate::phase::design::resolve_notion_url;
use crate::phase::{LINEAR_MCP_TOOLS, NOTION_MCP_TOOLS, param, repo_summary};

type SharedState = Arc<AppState>;

const SESSION_MODEL: &str = "sonnet";
const BASE_TOOLS: [&str; 6] = ["Read", "Write", "Edit", "Glob", "Grep", "Bash"];

#[derive(Deserialize)]
struct ListQuery {
    #[serde(default)]
    run_id: String,
}

#[derive(Deserialize)]
struct CreateRequest {
    #[serde(default)]
    run_id: String,
    #[serde(default, rename = "type")]
    exec_type: String,
    #[serde(default)]
    phase: String,
    #[serde(default)]
    issue_id: String,
    #[serde(default)]
    params: Params,
}

#[derive(Deserialize)]
struct MessageRequest {
    #[serde(default)]
    content: String,
}

pub fn executions_router() -> Router<SharedState> {
    Router::new()
        .route("/api/executions", get(list_executions).post(create_execution))
        .route("/api/executions/{id}", get(get_execution))
        .route("/api/executions/{id}/message", post(send_message))
        .route("/api/executions/{id}/approve", post(approve_execution))
        .route("/api/executions/{id}/cancel", post(cancel_execution))
}

/// Live executions first, then stored ones that are no longer in memory.
async fn list_executions(
    State(state): State<SharedState>,
    Query(query): Query<ListQuery>,
) -> impl IntoResponse {
    let mut list = state.executions.list(&query.run_id);
    if !query.run_id.is_empty() {
        let seen: HashSet<String> = list.iter().map(|e| e.id.clone()).collect();
        let run_id = query.run_id.clone();
        match state.store.call(move |s| s.list_executions(&run_id)).await {
            Ok(records) => list.extend(
                records
                    .into_iter()
                    .filter(|r| !seen.contains(&r.id))
                    .map(Execution::from),
            ),
            Err(e) => warn!(run_id = %query.run_id, "Failed to list stored executions: {:#}", e),
        }
    }
    Json(list)
}

async fn create_execution(State(state): State<SharedState>, body: Bytes) -> Result<impl IntoResponse, ApiError> {
    let req: CreateRequest = parse_body(&body)?;
    if req.phase.is_empty() {
        return Err(ApiError::BadRequest("phase is required".into()));
    }
    let exec_type = if req.exec_type.is_empty() {
        ExecutionType::Phase
    } else {
        req.exec_type.parse().map_err(ApiError::BadRequest)?
    };

    let run = state.active_engine().ok().map(|e| e.state());
    let run_id = if req.run_id.is_empty() {
        run.as_ref().map(|s| s.run_id.clone()).unwrap_or_default()
    } else {
        req.run_id
    };

    let id = Uuid::new_v4().to_string();
    let session_id = Uuid::new_v4().to_string();
    let mut exec = Execution::new(&id, &run_id, exec_type, &req.phase);
    exec.issue_id = req.issue_id;
    exec.session_id = session_id.clone();
    exec.params = req.params;

    let record = exec.to_record();
    if let Err(e) = state.store.call(move |s| s.create_execution(&record)).await {
        warn!(execution_id = %id, "Failed to persist execution: {:#}", e);
    }

    let prompt = build_prompt(&state, &exec.phase, &exec.issue_id, &exec.params, run.as_ref()).await;
    let cwd = resolve_cwd(&exec.phase, &exec.issue_id, run.as_ref());
    let tools = tools_for_phase(&state, &exec.phase, &exec.params, run.as_ref());

    let cancel = CancellationToken::new();
    let phase = exec.phase.clone();
    state.executions.create(exec);
    state.executions.set_cancel(&id, cancel.clone());
    state
        .executions
        .append_message(&id, Message::system(format!("Starting {} phase...", phase)));

    info!(execution_id = %id, phase = %phase, cwd = %cwd.display(), "Creating execution");

    let mut cfg = RunConfig::new(prompt, SESSION_MODEL, &tools).in_dir(cwd);
    cfg.session_id = session_id.clone();
    tokio::spawn(drive_session(state.clone(), id.clone(), cfg, cancel));

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "id": id, "session_id": session_id, "status": "running" })),
    ))
}

async fn get_execution(State(state): State<SharedState>, Path(id): Path<String>) -> Result<impl IntoResponse, ApiError> {
    if let Some(exec) = state.executions.get(&id) {
        return Ok(Json(exec));
    }
    let lookup = id.clone();
    let stored = state
        .store
        .call(move |s| s.get_execution(&lookup))
        .await
        .ok()
        .flatten();
    stored
        .map(|rec| Json(Execution::from(rec)))
        .ok_or_else(|| ApiError::NotFound("execution not found".into()))
}

/// Resume the session with the user's message as the next turn's prompt.
async fn send_message(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    // Status is checked before the body so a busy session reports 409
    // regardless of payload.
    let exec = state
        .executions
        .get(&id)
        .ok_or_else(|| ApiError::NotFound("execution not found".into()))?;
    match exec.status {
        ExecutionStatus::Running => return Err(ExecutionError::Busy.into()),
        s if s.is_terminal() => return Err(ExecutionError::Terminal(s.as_str().to_string()).into()),
        _ => {}
    }

    let req: MessageRequest = parse_body(&body)?;
    if req.content.is_empty() {
        return Err(ApiError::BadRequest("content is required".into()));
    }

    // Another send may have won the race since the check above.
    let exec = state.executions.begin_turn(&id)?;
    state.executions.append_message(&id, Message::user(&req.content));
    state.events.emit(
        EventType::ExecutionMessage,
        json!({ "execution_id": id, "role": "user", "content": req.content }),
    );

    let run = state.active_engine().ok().map(|e| e.state());
    let cwd = resolve_cwd(&exec.phase, &exec.issue_id, run.as_ref());
    let tools = tools_for_phase(&state, &exec.phase, &exec.params, run.as_ref());

    let cancel = CancellationToken::new();
    state.executions.set_cancel(&id, cancel.clone());

    info!(execution_id = %id, bytes = req.content.len(), "Sending message");

    let mut cfg = RunConfig::new(req.content, SESSION_MODEL, &tools).in_dir(cwd);
    cfg.session_id = exec.session_id;
    cfg.resume = true;
    tokio::spawn(drive_session(state.clone(), id, cfg, cancel));

    Ok((StatusCode::ACCEPTED, Json(json!({ "status": "sent" }))))
}

async fn approve_execution(State(state): State<SharedState>, Path(id): Path<String>) -> Result<impl IntoResponse, ApiError> {
    if state.executions.get(&id).is_none() {
        return Err(ApiError::NotFound("execution not found".into()));
    }
    state.executions.update_status(&id, ExecutionStatus::Completed);
    persist_status(&state, &id, ExecutionStatus::Completed, "").await;
    Ok(Json(json!({ "status": "completed" })))
}

async fn cancel_execution(State(state): State<SharedState>, Path(id): Path<String>) -> Result<impl IntoResponse, ApiError> {
    state
        .executions
        .cancel(&id)
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    persist_status(&state, &id, ExecutionStatus::Cancelled, "").await;
    Ok(Json(json!({ "status": "cancelled" })))
}

/// Run one session turn and record its outcome. A cancelled turn leaves the
/// status set by the cancel request.
async fn drive_session(state: SharedState, id: String, cfg: RunConfig, cancel: CancellationToken) {
    let result = state
        .agent
        .run_session(&cfg, &state.events, &state.executions, &id, cancel.clone())
        .await;

    match result {
        Err(_) if cancel.is_cancelled() => {
            info!(execution_id = %id, "Session cancelled");
        }
        Err(e) => {
            let message = format!("{:#}", e);
            warn!(execution_id = %id, "Session failed: {}", message);
            state
                .executions
                .append_message(&id, Message::system(format!("Error: {}", message)));
            state.executions.update_status(&id, ExecutionStatus::Failed);
            persist_status(&state, &id, ExecutionStatus::Failed, &message).await;
        }
        Ok(out) => {
            info!(
                execution_id = %id,
                exit_code = out.exit_code,
                tokens_in = out.tokens_in,
                tokens_out = out.tokens_out,
                "Session turn finished"
            );
            state.executions.update_status(&id, ExecutionStatus::WaitingInput);
            persist_status(&state, &id, ExecutionStatus::WaitingInput, "").await;

            // Stored tokens are the session totals, not this turn's.
            if let Some(exec) = state.executions.get(&id) {
                let (tin, tout) = (exec.tokens_in, exec.tokens_out);
                if let Err(e) = state
                    .store
                    .call(move |s| s.update_execution_tokens(&exec.id, tin, tout))
                    .await
                {
                    warn!(execution_id = %id, "Failed to persist execution tokens: {:#}", e);
                }
            }
        }
    }
}

async fn persist_status(state: &AppState, id: &str, status: ExecutionStatus, message: &str) {
    let (id, message) = (id.to_string(), message.to_string());
    if let Err(e) = state
        .store
        .call(move |s| s.update_execution_status(&id, status, &message))
        .await
    {
        warn!("Failed to persist execution status: {:#}", e);
    }
}

// ── Session setup ─────────────────────────────────────────────────────

/// Split `TASK-001: Some title` into id and title. Without the separator the
/// whole string serves as both.
pub fn parse_issue_param(s: &str) -> (String, String) {
    let s = s.trim();
    match s.split_once(": ") {
        Some((id, title)) => (id.to_string(), title.to_string()),
        None => (s.to_string(), s.to_string()),
    }
}

/// The issue's worktree when executing one, else the first repo's path.
fn resolve_cwd(phase: &str, issue_id: &str, run: Option<&RunState>) -> PathBuf {
    let Some(run) = run else {
        return PathBuf::from(".");
    };
    if phase == "executing"
        && let Some(worktree) = run.issues.get(issue_id).and_then(|i| i.worktree.as_deref())
        && !worktree.is_empty()
    {
        return PathBuf::from(worktree);
    }
    run.repos
        .first()
        .filter(|r| !r.path.is_empty())
        .map(|r| PathBuf::from(&r.path))
        .unwrap_or_else(|| PathBuf::from("."))
}

fn scoping_source(params: &Params, run: Option<&RunState>) -> String {
    param(params, SCOPING_DOC)
        .map(str::to_string)
        .or_else(|| run.and_then(|s| s.artifacts.get(SCOPING_DOC).cloned()))
        .unwrap_or_default()
}

/// Tools matching what the phase runner itself would be granted.
fn tools_for_phase(state: &AppState, phase: &str, params: &Params, run: Option<&RunState>) -> Vec<&'static str> {
    let mut tools = BASE_TOOLS.to_vec();
    let needs_notion_mcp = |doc_is_notion: bool| doc_is_notion && !state.notion.is_configured();
    match phase {
        "design" => {
            let prd_url = run.map(|s| s.prd_url.as_str()).unwrap_or_default();
            if needs_notion_mcp(resolve_notion_url(prd_url, params).is_some()) {
                tools.push(NOTION_MCP_TOOLS);
            }
        }
        "planning" => {
            if needs_notion_mcp(is_notion_url(&scoping_source(params, run))) {
                tools.push(NOTION_MCP_TOOLS);
            }
        }
        "tracking" => tools.extend([LINEAR_MCP_TOOLS, NOTION_MCP_TOOLS]),
        "executing" => tools.push(LINEAR_MCP_TOOLS),
        _ => {}
    }
    tools
}

/// Initial prompt for a session. Documents hosted on Notion or Linear are
/// pre-fetched when an API key is configured; otherwise the agent is told to
/// read them through its MCP tools.
async fn build_prompt(
    state: &AppState,
    phase: &str,
    issue_id: &str,
    params: &Params,
    run: Option<&RunState>,
) -> String {
    let summary = run.map(repo_summary).unwrap_or_default();
    let prompts = &state.prompts;

    match phase {
        "design" => {
            let prd_url = run.map(|s| s.prd_url.as_str()).unwrap_or_default();
            let prd = param(params, "prd").unwrap_or(prd_url).to_string();
            if let Some(url) = resolve_notion_url(prd_url, params) {
                if state.notion.is_configured() {
                    match state.notion.read_page(&url).await {
                        Ok(content) => return prompts.solution_designer(&content, &summary),
                        Err(e) => warn!("Failed to pre-fetch PRD from Notion, falling back to MCP tools: {:#}", e),
                    }
                }
                return prompts.solution_designer_from_notion(&url, &summary);
            }
            let read = tokio::fs::read_to_string(&prd).await;
            prompts.solution_designer(&read.unwrap_or(prd), &summary)
        }
        "planning" => {
            let doc = scoping_source(params, run);
            if is_notion_url(&doc) {
                if state.notion.is_configured() {
                    match state.notion.read_page(&doc).await {
                        Ok(content) => return prompts.task_decomposer(&content, &summary),
                        Err(e) => warn!(
                            "Failed to pre-fetch scoping doc from Notion, falling back to MCP tools: {:#}",
                            e
                        ),
                    }
                }
                return prompts.task_decomposer_from_notion(&doc, &summary);
            }
            let read = tokio::fs::read_to_string(&doc).await;
            prompts.task_decomposer(&read.unwrap_or(doc), &summary)
        }
        "tracking" => {
            let pert = param(params, PERT)
                .map(str::to_string)
                .or_else(|| run.and_then(|s| s.artifacts.get(PERT).cloned()))
                .unwrap_or_default();
            format!(
                "Create Linear issues from the PERT document. PERT path: {} Team: {}",
                pert,
                param(params, "team").unwrap_or_default()
            )
        }
        "executing" => {
            let (id, title) = parse_issue_param(param(params, "issue").unwrap_or(issue_id));
            let issue = run.and_then(|s| s.issues.get(&id));
            let language = run
                .and_then(|s| {
                    let repo = issue.map(|i| i.repo.as_str()).unwrap_or_default();
                    s.repos
                        .iter()
                        .find(|r| r.name == repo && !r.language.is_empty())
                        .or_else(|| s.repos.first())
                })
                .map(|r| r.language.clone())
                .unwrap_or_default();

            let Some(linear_id) = issue.and_then(|i| i.linear_id.clone()) else {
                return prompts.coder(&title, &id, &language, "");
            };
            if state.linear.is_configured() {
                match state.linear.get_issue(&linear_id).await {
                    Ok(details) => {
                        if let Some(desc) = details.description.filter(|d| !d.is_empty()) {
                            return prompts.coder(&title, &id, &language, &desc);
                        }
                    }
                    Err(e) => warn!(linear_id = %linear_id, "Failed to pre-fetch Linear issue, falling back to MCP: {:#}", e),
                }
            }
            prompts.coder_from_linear(&title, &id, &linear_id, &language)
        }
        "bootstrap" => format!(
            "Bootstrap the repository by generating CLAUDE.md and ARCHITECTURE.md. Repo: {}",
            param(params, "repo").unwrap_or_default()
        ),
        other => format!("Execute the {} phase.", other),
    }
}
