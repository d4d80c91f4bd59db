//! The pipeline engine: one run's state machine.
//!
//! An [`Engine`] owns the active run's [`State`], its event bus, its metrics
//! collector and a handle to the store. Phase runners are looked up by name
//! and invoked with a read-only view of the engine; all mutation goes through
//! the `save_*` methods, which update memory first and then persist.
//!
//! The state lock is a plain `std::sync::RwLock` and is never held across an
//! `.await`.

pub mod artifacts;
pub mod events;
pub mod execution;
pub mod metrics;
pub mod state;

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use crate::agent::AgentRunner;
use crate::errors::EngineError;
use crate::manifest::Manifest;
use crate::phase::PhaseRunner;
use crate::store::StoreHandle;
use events::{EventBus, EventType};
use execution::{ExecutionRecord, ExecutionStatus};
use metrics::MetricsCollector;
use state::{IssueState, PIPELINE, Phase, PhaseStatus, RepoState, State};

/// Phase parameters. Keys starting with `_` are reserved for the engine.
pub type Params = HashMap<String, String>;

/// Links a phase execution to the pipeline execution that started it.
pub const PARAM_PIPELINE_EXEC_ID: &str = "_pipeline_exec_id";
/// Set by the API: fail instead of falling back to interactive agent tools.
pub const PARAM_NON_INTERACTIVE: &str = "_non_interactive";

/// Phase label used for the parent execution of a pipeline pass.
pub const PIPELINE_LABEL: &str = "pipeline";

/// Run id placeholder used when the store holds no runs.
pub const EMPTY_RUN_ID: &str = "empty";

const DEFAULT_PARALLEL: usize = 3;

/// First `len` characters of a fresh UUIDv4.
pub fn short_id(len: usize) -> String {
    let mut id = Uuid::new_v4().to_string();
    id.truncate(len);
    id
}

pub struct Engine {
    state: RwLock<State>,
    events: Arc<EventBus>,
    metrics: MetricsCollector,
    store: StoreHandle,
    agent: Arc<dyn AgentRunner>,
    phases: RwLock<HashMap<Phase, Arc<dyn PhaseRunner>>>,
    parallel: AtomicUsize,
}

impl Engine {
    fn from_state(state: State, store: StoreHandle, agent: Arc<dyn AgentRunner>) -> Self {
        let events = Arc::new(EventBus::new());
        let metrics = MetricsCollector::new(
            store.clone(),
            state.run_id.clone(),
            state.metrics.clone(),
            events.clone(),
        );
        Self {
            state: RwLock::new(state),
            events,
            metrics,
            store,
            agent,
            phases: RwLock::new(HashMap::new()),
            parallel: AtomicUsize::new(DEFAULT_PARALLEL),
        }
    }

    /// Start a new run from a manifest and persist it.
    pub async fn create(
        manifest: &Manifest,
        store: StoreHandle,
        agent: Arc<dyn AgentRunner>,
    ) -> Result<Self> {
        let state = new_run_state(manifest)?;
        let persisted = state.clone();
        store
            .call(move |s| s.create_run(&persisted))
            .await
            .context("create run in store")?;
        info!(run_id = %state.run_id, repos = state.repos.len(), "Created run");
        Ok(Self::from_state(state, store, agent))
    }

    /// Load a stored run, or the most recent one when `run_id` is `None`.
    pub async fn load(
        store: StoreHandle,
        agent: Arc<dyn AgentRunner>,
        run_id: Option<&str>,
    ) -> Result<Self> {
        let run_id = run_id.map(str::to_string);
        let state = store
            .call(move |s| match run_id {
                Some(id) => s.load_run(&id),
                None => s.latest_run(),
            })
            .await?;
        Ok(Self::from_state(state, store, agent))
    }

    /// Latest stored run, or an unsaved placeholder run when there is none.
    pub async fn new_empty(store: StoreHandle, agent: Arc<dyn AgentRunner>) -> Self {
        match Self::load(store.clone(), agent.clone(), None).await {
            Ok(engine) => engine,
            Err(_) => Self::from_state(State::new(EMPTY_RUN_ID, "", Vec::new()), store, agent),
        }
    }

    pub fn register_phase(&self, runner: Arc<dyn PhaseRunner>) {
        self.phases
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(runner.name(), runner);
    }

    /// Values below 1 are ignored.
    pub fn set_parallel(&self, n: usize) {
        if n > 0 {
            self.parallel.store(n, Ordering::Relaxed);
        }
    }

    pub fn parallel(&self) -> usize {
        self.parallel.load(Ordering::Relaxed)
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    pub fn store(&self) -> &StoreHandle {
        &self.store
    }

    pub fn agent(&self) -> &dyn AgentRunner {
        self.agent.as_ref()
    }

    fn read(&self) -> RwLockReadGuard<'_, State> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, State> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Owned copy of the state, with live metrics.
    pub fn state(&self) -> State {
        let mut state = self.read().clone();
        state.metrics = self.metrics.snapshot();
        state
    }

    /// Borrow the state for a short synchronous read.
    pub fn with_state<R>(&self, f: impl FnOnce(&State) -> R) -> R {
        f(&self.read())
    }

    pub fn run_id(&self) -> String {
        self.read().run_id.clone()
    }

    // ── Phase execution ───────────────────────────────────────────────

    /// Run one named phase, recording an execution for it.
    pub async fn run_phase(&self, name: &str, params: &Params) -> Result<()> {
        let runner = name
            .parse::<Phase>()
            .ok()
            .and_then(|p| {
                self.phases
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .get(&p)
                    .cloned()
            })
            .ok_or_else(|| EngineError::UnknownPhase(name.to_string()))?;
        let phase = runner.name();

        let exec_id = short_id(12);
        let mut record = ExecutionRecord::phase(&exec_id, self.run_id(), name);
        record.parent_id = params.get(PARAM_PIPELINE_EXEC_ID).cloned().unwrap_or_default();
        self.persist_execution(record).await;

        self.set_phase(phase, PhaseStatus::Running).await;
        info!(run_id = %self.run_id(), phase = %phase, execution_id = %exec_id, "Phase started");
        self.events.emit(
            EventType::PhaseStarted,
            json!({ "phase": name, "execution_id": exec_id }),
        );

        let start = Instant::now();
        let result = runner.run(self, params).await;
        let elapsed = start.elapsed().as_millis() as i64;
        self.metrics.record_phase_timing(phase, elapsed).await;

        match result {
            Err(e) => {
                let message = format!("{:#}", e);
                warn!(phase = %phase, execution_id = %exec_id, "Phase failed: {}", message);
                self.set_status(PhaseStatus::Failed).await;
                self.finish_execution(&exec_id, ExecutionStatus::Failed, &message).await;
                self.events.emit(
                    EventType::Error,
                    json!({ "phase": name, "error": message, "execution_id": exec_id }),
                );
                Err(e)
            }
            Ok(()) => {
                self.set_status(PhaseStatus::Completed).await;
                self.finish_execution(&exec_id, ExecutionStatus::Completed, "").await;
                info!(phase = %phase, duration_ms = elapsed, "Phase completed");
                self.events.emit(
                    EventType::PhaseCompleted,
                    json!({ "phase": name, "duration_ms": elapsed, "execution_id": exec_id }),
                );
                Ok(())
            }
        }
    }

    /// Run the pipeline from the top, pausing at the first gate.
    /// A run already waiting at a gate is left alone.
    pub async fn run_all(&self) -> Result<()> {
        if self.read().phase_status == PhaseStatus::Gate {
            info!(run_id = %self.run_id(), "Run is waiting at an approval gate; nothing to do");
            return Ok(());
        }
        self.run_from(Phase::Bootstrap).await
    }

    /// Clear the pending gate. Returns the phase the pipeline should resume
    /// at, or `None` when the gated phase was the last one.
    pub async fn approve_gate(&self) -> Result<Option<Phase>> {
        let (phase, status) = {
            let state = self.read();
            (state.phase, state.phase_status)
        };
        if status != PhaseStatus::Gate {
            return Err(EngineError::NoPendingGate {
                phase: phase.to_string(),
                status: status.to_string(),
            }
            .into());
        }
        info!(phase = %phase, "Approved gate");
        self.set_status(PhaseStatus::Completed).await;
        Ok(phase.next())
    }

    /// Approve the pending gate and continue the pipeline.
    pub async fn approve(&self) -> Result<()> {
        match self.approve_gate().await? {
            Some(next) => self.run_from(next).await,
            None => {
                info!("Pipeline completed");
                Ok(())
            }
        }
    }

    /// Run pipeline phases starting at `from` until a gate or the end.
    pub async fn run_from(&self, from: Phase) -> Result<()> {
        let pipeline_id = short_id(12);
        self.persist_execution(ExecutionRecord::phase(&pipeline_id, self.run_id(), PIPELINE_LABEL))
            .await;

        let mut params = Params::new();
        params.insert(PARAM_PIPELINE_EXEC_ID.to_string(), pipeline_id.clone());

        for (phase, gate) in PIPELINE.iter().skip_while(|(p, _)| *p != from) {
            println!("\n=== Phase: {} ===", phase);
            if let Err(e) = self.run_phase(phase.as_str(), &params).await {
                let err = EngineError::PhaseFailed {
                    phase: phase.to_string(),
                    source: e,
                };
                self.finish_execution(&pipeline_id, ExecutionStatus::Failed, &err.to_string())
                    .await;
                return Err(err.into());
            }

            if *gate {
                println!("\nApproval gate reached after {} phase.", phase);
                println!("   Run `sdlc approve` to continue, or review artifacts first.");
                self.set_status(PhaseStatus::Gate).await;
                self.events
                    .emit(EventType::PhaseGate, json!({ "phase": phase.as_str() }));
                // The pipeline execution stays running while paused.
                return Ok(());
            }
        }

        self.set_phase(Phase::Completed, PhaseStatus::Completed).await;
        self.finish_execution(&pipeline_id, ExecutionStatus::Completed, "")
            .await;
        println!("\n=== Pipeline completed ===");
        Ok(())
    }

    // ── Run switching ─────────────────────────────────────────────────

    /// Replace the in-memory run with a stored one.
    pub async fn set_active_run(&self, run_id: &str) -> Result<()> {
        let id = run_id.to_string();
        let state = self
            .store
            .call(move |s| s.load_run(&id))
            .await
            .with_context(|| format!("load run {}", run_id))?;
        self.metrics.set_run(run_id, state.metrics.clone());
        *self.write() = state;
        self.events.emit(
            EventType::PhaseStarted,
            json!({ "phase": "switched", "run_id": run_id }),
        );
        Ok(())
    }

    /// Start a fresh run from `manifest` in place of the current one.
    pub async fn reload_from_manifest(&self, manifest: &Manifest) -> Result<()> {
        let state = new_run_state(manifest)?;
        let persisted = state.clone();
        self.store
            .call(move |s| s.create_run(&persisted))
            .await
            .context("create run in store")?;
        self.metrics.set_run(&state.run_id, state.metrics.clone());
        *self.write() = state;
        self.events
            .emit(EventType::PhaseStarted, json!({ "phase": "init" }));
        Ok(())
    }

    // ── Mutation ──────────────────────────────────────────────────────

    pub async fn save_issue(&self, issue: IssueState) {
        let run_id = {
            let mut state = self.write();
            state.issues.insert(issue.id.clone(), issue.clone());
            state.updated_at = Utc::now();
            state.run_id.clone()
        };
        let issue_id = issue.id.clone();
        if let Err(e) = self.store.call(move |s| s.save_issue(&run_id, &issue)).await {
            warn!(issue_id = %issue_id, "Failed to persist issue: {:#}", e);
        }
    }

    pub async fn save_artifact(&self, key: &str, value: &str) {
        let run_id = {
            let mut state = self.write();
            state.artifacts.insert(key.to_string(), value.to_string());
            state.run_id.clone()
        };
        let (k, v) = (key.to_string(), value.to_string());
        if let Err(e) = self.store.call(move |s| s.save_artifact(&run_id, &k, &v)).await {
            warn!(key, "Failed to persist artifact: {:#}", e);
        }
    }

    pub async fn save_bootstrap_state(&self, repo: &str, rs: RepoState) {
        let run_id = {
            let mut state = self.write();
            state.bootstrap.insert(repo.to_string(), rs);
            state.run_id.clone()
        };
        let name = repo.to_string();
        if let Err(e) = self.store.call(move |s| s.save_bootstrap(&run_id, &name, rs)).await {
            warn!(repo, "Failed to persist bootstrap state: {:#}", e);
        }
    }

    async fn set_phase(&self, phase: Phase, status: PhaseStatus) {
        {
            let mut state = self.write();
            state.phase = phase;
            state.phase_status = status;
            state.updated_at = Utc::now();
        }
        self.save_meta().await;
    }

    async fn set_status(&self, status: PhaseStatus) {
        {
            let mut state = self.write();
            state.phase_status = status;
            state.updated_at = Utc::now();
        }
        self.save_meta().await;
    }

    async fn save_meta(&self) {
        let (run_id, phase, status) = {
            let state = self.read();
            (state.run_id.clone(), state.phase, state.phase_status)
        };
        if let Err(e) = self
            .store
            .call(move |s| s.save_run_meta(&run_id, phase, status))
            .await
        {
            warn!("Failed to persist run meta: {:#}", e);
        }
    }

    async fn persist_execution(&self, record: ExecutionRecord) {
        let id = record.id.clone();
        if let Err(e) = self.store.call(move |s| s.create_execution(&record)).await {
            warn!(execution_id = %id, "Failed to persist execution: {:#}", e);
        }
    }

    async fn finish_execution(&self, id: &str, status: ExecutionStatus, message: &str) {
        let (id, message) = (id.to_string(), message.to_string());
        if let Err(e) = self
            .store
            .call(move |s| s.update_execution_status(&id, status, &message))
            .await
        {
            warn!("Failed to update execution status: {:#}", e);
        }
    }

    /// Print a human-readable summary of the run to stdout.
    pub fn print_status(&self) {
        let state = self.state();
        println!("Run ID:       {}", state.run_id);
        println!("Phase:        {}", state.phase);
        println!("Phase Status: {}", state.phase_status);
        println!("PRD:          {}", state.prd_url);
        println!("Repos:        {}", state.repos.len());
        println!("Issues:       {}", state.issues.len());
        println!("Updated:      {}", state.updated_at.to_rfc3339());

        if !state.issues.is_empty() {
            let counts = state.issue_counts();
            println!("\nIssue Status:");
            for status in state::IssueStatus::ALL {
                if let Some(count) = counts.get(&status) {
                    println!("  {:<16} {}", status, count);
                }
            }
        }

        println!("\nMetrics:");
        println!("  Tokens In:  {}", state.metrics.tokens_in);
        println!("  Tokens Out: {}", state.metrics.tokens_out);
        println!("  Total Cost: ${:.4}", state.metrics.total_cost);
    }
}

fn new_run_state(manifest: &Manifest) -> Result<State> {
    if manifest.repos.is_empty() {
        return Err(EngineError::EmptyManifest.into());
    }
    Ok(State::new(short_id(8), manifest.prd.clone(), manifest.repos.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::fake::FakeRunner;
    use crate::engine::state::RepoConfig;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Records every invocation; fails when told to.
    struct StubPhase {
        phase: Phase,
        fail: bool,
        seen: Arc<Mutex<Vec<(Phase, Params)>>>,
    }

    #[async_trait]
    impl PhaseRunner for StubPhase {
        fn name(&self) -> Phase {
            self.phase
        }

        async fn run(&self, _engine: &Engine, params: &Params) -> Result<()> {
            self.seen.lock().unwrap().push((self.phase, params.clone()));
            if self.fail {
                anyhow::bail!("{} exploded", self.phase);
            }
            Ok(())
        }
    }

    fn manifest() -> Manifest {
        Manifest::new(
            "docs/prd.md",
            vec![RepoConfig {
                name: "api".into(),
                path: "../api".into(),
                team: "core".into(),
                language: "go".into(),
            }],
        )
    }

    async fn engine_with_stubs(
        failing: Option<Phase>,
    ) -> (Engine, Arc<Mutex<Vec<(Phase, Params)>>>) {
        let store = StoreHandle::in_memory().unwrap();
        let engine = Engine::create(&manifest(), store, Arc::new(FakeRunner::replying("")))
            .await
            .unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for (phase, _) in PIPELINE {
            engine.register_phase(Arc::new(StubPhase {
                phase,
                fail: failing == Some(phase),
                seen: seen.clone(),
            }));
        }
        (engine, seen)
    }

    fn drain(sub: &mut events::Subscription) -> Vec<events::Event> {
        let mut out = Vec::new();
        while let Ok(e) = sub.rx.try_recv() {
            out.push(e);
        }
        out
    }

    #[tokio::test]
    async fn test_create_persists_run_with_short_id() {
        let (engine, _) = engine_with_stubs(None).await;
        let run_id = engine.run_id();
        assert_eq!(run_id.len(), 8);
        let stored = engine.store().call(move |s| s.load_run(&run_id)).await.unwrap();
        assert_eq!(stored.repos.len(), 1);
        assert_eq!(stored.phase, Phase::Init);
    }

    #[tokio::test]
    async fn test_create_rejects_empty_manifest() {
        let store = StoreHandle::in_memory().unwrap();
        let result = Engine::create(
            &Manifest::new("prd.md", vec![]),
            store,
            Arc::new(FakeRunner::replying("")),
        )
        .await;
        let err = result.err().unwrap();
        assert!(matches!(
            err.downcast_ref::<EngineError>(),
            Some(EngineError::EmptyManifest)
        ));
    }

    #[tokio::test]
    async fn test_new_empty_falls_back_to_placeholder() {
        let store = StoreHandle::in_memory().unwrap();
        let engine = Engine::new_empty(store.clone(), Arc::new(FakeRunner::replying(""))).await;
        assert_eq!(engine.run_id(), EMPTY_RUN_ID);

        Engine::create(&manifest(), store.clone(), Arc::new(FakeRunner::replying("")))
            .await
            .unwrap();
        let engine = Engine::new_empty(store, Arc::new(FakeRunner::replying(""))).await;
        assert_ne!(engine.run_id(), EMPTY_RUN_ID);
    }

    #[tokio::test]
    async fn test_unknown_phase_is_rejected() {
        let (engine, _) = engine_with_stubs(None).await;
        let err = engine.run_phase("deploy", &Params::new()).await.unwrap_err();
        assert_eq!(err.to_string(), "unknown phase: deploy");
    }

    #[tokio::test]
    async fn test_run_phase_success_records_execution_and_events() {
        let (engine, _) = engine_with_stubs(None).await;
        let mut sub = engine.events().subscribe();

        engine.run_phase("bootstrap", &Params::new()).await.unwrap();

        let state = engine.state();
        assert_eq!(state.phase, Phase::Bootstrap);
        assert_eq!(state.phase_status, PhaseStatus::Completed);
        assert!(state.metrics.phase_timings.contains_key("bootstrap"));

        let events = drain(&mut sub);
        assert_eq!(events[0].kind, EventType::PhaseStarted);
        assert_eq!(events.last().unwrap().kind, EventType::PhaseCompleted);
        let exec_id = events[0].data["execution_id"].as_str().unwrap().to_string();

        let rec = engine
            .store()
            .call(move |s| s.get_execution(&exec_id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(rec.status, ExecutionStatus::Completed);
        assert_eq!(rec.phase, "bootstrap");
    }

    #[tokio::test]
    async fn test_run_phase_failure_marks_failed() {
        let (engine, _) = engine_with_stubs(Some(Phase::Design)).await;
        let mut sub = engine.events().subscribe();

        let err = engine.run_phase("design", &Params::new()).await.unwrap_err();
        assert_eq!(err.to_string(), "design exploded");
        assert_eq!(engine.state().phase_status, PhaseStatus::Failed);

        let events = drain(&mut sub);
        let error = events.iter().find(|e| e.kind == EventType::Error).unwrap();
        assert_eq!(error.data["phase"], "design");
        assert_eq!(error.data["error"], "design exploded");

        let run_id = engine.run_id();
        let rec = engine
            .store()
            .call(move |s| s.latest_execution(&run_id, "design"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(rec.status, ExecutionStatus::Failed);
        assert_eq!(rec.error_message, "design exploded");
    }

    #[tokio::test]
    async fn test_gate_flow_pauses_and_resumes() {
        let (engine, seen) = engine_with_stubs(None).await;
        let mut sub = engine.events().subscribe();

        engine.run_all().await.unwrap();
        let state = engine.state();
        assert_eq!(state.phase, Phase::Design);
        assert_eq!(state.phase_status, PhaseStatus::Gate);
        let gates: Vec<_> = drain(&mut sub)
            .into_iter()
            .filter(|e| e.kind == EventType::PhaseGate)
            .collect();
        assert_eq!(gates.len(), 1);
        assert_eq!(gates[0].data["phase"], "design");

        // Every phase in a pass shares the pipeline execution as parent.
        let parents: Vec<String> = seen
            .lock()
            .unwrap()
            .iter()
            .map(|(_, p)| p[PARAM_PIPELINE_EXEC_ID].clone())
            .collect();
        assert_eq!(parents.len(), 2);
        assert_eq!(parents[0], parents[1]);

        // Already gated: run_all does nothing.
        engine.run_all().await.unwrap();
        assert_eq!(seen.lock().unwrap().len(), 2);

        engine.approve().await.unwrap();
        let state = engine.state();
        assert_eq!(state.phase, Phase::Planning);
        assert_eq!(state.phase_status, PhaseStatus::Gate);

        engine.approve().await.unwrap();
        let state = engine.state();
        assert_eq!(state.phase, Phase::Completed);
        assert_eq!(state.phase_status, PhaseStatus::Completed);

        let order: Vec<Phase> = seen.lock().unwrap().iter().map(|(p, _)| *p).collect();
        assert_eq!(
            order,
            vec![
                Phase::Bootstrap,
                Phase::Design,
                Phase::Planning,
                Phase::Tracking,
                Phase::Executing
            ]
        );

        let run_id = engine.run_id();
        let pipelines: Vec<_> = engine
            .store()
            .call(move |s| s.list_executions(&run_id))
            .await
            .unwrap()
            .into_iter()
            .filter(|r| r.phase == PIPELINE_LABEL)
            .collect();
        assert_eq!(pipelines.len(), 3);
        assert_eq!(pipelines[2].status, ExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn test_approve_without_gate_errors() {
        let (engine, _) = engine_with_stubs(None).await;
        let err = engine.approve().await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "no pending approval gate (current: init/completed)"
        );
    }

    #[tokio::test]
    async fn test_pipeline_failure_marks_pipeline_execution_failed() {
        let (engine, _) = engine_with_stubs(Some(Phase::Bootstrap)).await;
        let err = engine.run_all().await.unwrap_err();
        assert_eq!(err.to_string(), "phase bootstrap failed: bootstrap exploded");

        let run_id = engine.run_id();
        let pipeline = engine
            .store()
            .call(move |s| s.latest_execution(&run_id, PIPELINE_LABEL))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(pipeline.status, ExecutionStatus::Failed);
    }

    #[tokio::test]
    async fn test_save_helpers_update_memory_and_store() {
        let (engine, _) = engine_with_stubs(None).await;
        engine.save_issue(IssueState::new("TASK-001", "A", "api")).await;
        engine.save_artifact("pert", "p.md").await;
        engine
            .save_bootstrap_state("api", RepoState { claude_md: true, architecture_md: true })
            .await;

        let state = engine.state();
        assert!(state.issues.contains_key("TASK-001"));
        assert_eq!(state.artifacts["pert"], "p.md");

        let run_id = engine.run_id();
        let stored = engine.store().call(move |s| s.load_run(&run_id)).await.unwrap();
        assert_eq!(stored.issues.len(), 1);
        assert_eq!(stored.artifacts["pert"], "p.md");
        assert!(stored.bootstrap["api"].architecture_md);
    }

    #[tokio::test]
    async fn test_set_active_run_and_reload() {
        let (engine, _) = engine_with_stubs(None).await;
        let first = engine.run_id();
        let mut sub = engine.events().subscribe();

        engine.reload_from_manifest(&manifest()).await.unwrap();
        let second = engine.run_id();
        assert_ne!(first, second);
        assert_eq!(drain(&mut sub)[0].data["phase"], "init");

        engine.set_active_run(&first).await.unwrap();
        assert_eq!(engine.run_id(), first);
        let switched = drain(&mut sub);
        assert_eq!(switched[0].data["phase"], "switched");
        assert_eq!(switched[0].data["run_id"], first.as_str());

        assert!(engine.set_active_run("missing1").await.is_err());
    }

    #[test]
    fn test_set_parallel_ignores_zero() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let (engine, _) = rt.block_on(engine_with_stubs(None));
        assert_eq!(engine.parallel(), DEFAULT_PARALLEL);
        engine.set_parallel(0);
        assert_eq!(engine.parallel(), DEFAULT_PARALLEL);
        engine.set_parallel(8);
        assert_eq!(engine.parallel(), 8);
    }
}
