//! Typed error hierarchy for the pipeline orchestrator.
//!
//! Orchestration code works in `anyhow::Result` and attaches context; these
//! enums sit at the seams where callers need to match on the failure kind
//! (the HTTP layer maps them to status codes).

use thiserror::Error;

/// Errors from the persistent store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no run found")]
    RunNotFound,

    #[error("Database lock poisoned")]
    LockPoisoned,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from the in-memory execution registry.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("execution not found: {0}")]
    NotFound(String),

    #[error("no cancel function for execution: {0}")]
    NoCancel(String),

    #[error("execution is already running, wait for it to finish")]
    Busy,

    #[error("execution is in terminal state: {0}")]
    Terminal(String),
}

/// Errors from the pipeline engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("unknown phase: {0}")]
    UnknownPhase(String),

    #[error("no pending approval gate (current: {phase}/{status})")]
    NoPendingGate { phase: String, status: String },

    #[error("manifest must define at least one repo")]
    EmptyManifest,

    #[error("phase {phase} failed: {source}")]
    PhaseFailed {
        phase: String,
        #[source]
        source: anyhow::Error,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Manifest validation failures, reported to API callers as 400s.
#[derive(Debug, Error, PartialEq)]
pub enum ManifestError {
    #[error("prd is required")]
    MissingPrd,

    #[error("at least one repo is required")]
    NoRepos,

    #[error("repo {0}: name, path, and team are required")]
    IncompleteRepo(usize),
}

/// Errors from an agent CLI invocation.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Failed to spawn agent process: {0}")]
    SpawnFailed(#[source] std::io::Error),

    #[error("agent run cancelled")]
    Cancelled,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
