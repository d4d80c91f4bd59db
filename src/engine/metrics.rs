use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::events::{EventBus, EventType};
use super::state::{MetricsState, Phase};
use crate::store::StoreHandle;

/// One agent invocation's cost.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsEntry {
    pub timestamp: DateTime<Utc>,
    pub agent: String,
    pub model: String,
    pub tokens_in: i64,
    pub tokens_out: i64,
    pub cost: f64,
    pub duration_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issue_id: Option<String>,
    pub phase: Phase,
}

impl MetricsEntry {
    pub fn new(agent: impl Into<String>, model: impl Into<String>, phase: Phase) -> Self {
        Self {
            timestamp: Utc::now(),
            agent: agent.into(),
            model: model.into(),
            tokens_in: 0,
            tokens_out: 0,
            cost: 0.0,
            duration_ms: 0,
            issue_id: None,
            phase,
        }
    }
}

struct Inner {
    run_id: String,
    metrics: MetricsState,
}

/// In-memory aggregate for the active run, mirrored to the store.
pub struct MetricsCollector {
    inner: Mutex<Inner>,
    store: StoreHandle,
    events: Arc<EventBus>,
}

impl MetricsCollector {
    pub fn new(
        store: StoreHandle,
        run_id: impl Into<String>,
        metrics: MetricsState,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            inner: Mutex::new(Inner {
                run_id: run_id.into(),
                metrics,
            }),
            store,
            events,
        }
    }

    /// Point the collector at another run, replacing the aggregate.
    pub fn set_run(&self, run_id: &str, metrics: MetricsState) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.run_id = run_id.to_string();
            inner.metrics = metrics;
        }
    }

    pub fn run_id(&self) -> String {
        self.inner
            .lock()
            .map(|i| i.run_id.clone())
            .unwrap_or_default()
    }

    pub fn snapshot(&self) -> MetricsState {
        self.inner
            .lock()
            .map(|i| i.metrics.clone())
            .unwrap_or_default()
    }

    /// Fold an entry into the aggregate, persist it and announce it.
    /// Persistence failures are logged, never returned.
    pub async fn record(&self, entry: MetricsEntry) {
        let run_id = {
            let Ok(mut inner) = self.inner.lock() else {
                return;
            };
            let m = &mut inner.metrics;
            m.tokens_in += entry.tokens_in;
            m.tokens_out += entry.tokens_out;
            m.total_cost += entry.cost;
            let usage = m.by_agent.entry(entry.agent.clone()).or_default();
            usage.tokens_in += entry.tokens_in;
            usage.tokens_out += entry.tokens_out;
            usage.cost += entry.cost;
            usage.calls += 1;
            inner.run_id.clone()
        };

        let persisted = entry.clone();
        let rid = run_id.clone();
        if let Err(e) = self
            .store
            .call(move |s| s.record_metric(&rid, &persisted))
            .await
        {
            warn!(run_id = %run_id, agent = %entry.agent, "Failed to persist metric: {:#}", e);
        }

        match serde_json::to_value(&entry) {
            Ok(data) => self.events.emit(EventType::MetricsUpdated, data),
            Err(e) => warn!("Failed to encode metrics event: {}", e),
        }
    }

    pub async fn record_phase_timing(&self, phase: Phase, duration_ms: i64) {
        let run_id = {
            let Ok(mut inner) = self.inner.lock() else {
                return;
            };
            inner
                .metrics
                .phase_timings
                .insert(phase.as_str().to_string(), duration_ms);
            inner.run_id.clone()
        };

        let rid = run_id.clone();
        if let Err(e) = self
            .store
            .call(move |s| s.record_phase_timing(&rid, phase, duration_ms))
            .await
        {
            warn!(run_id = %run_id, phase = %phase, "Failed to persist phase timing: {:#}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::state::State;
    use anyhow::Result;

    async fn collector() -> Result<(MetricsCollector, StoreHandle, Arc<EventBus>)> {
        let store = StoreHandle::in_memory()?;
        store
            .call(|s| s.create_run(&State::new("run00001", "", vec![])))
            .await?;
        let bus = Arc::new(EventBus::new());
        let mc = MetricsCollector::new(store.clone(), "run00001", MetricsState::default(), bus.clone());
        Ok((mc, store, bus))
    }

    fn entry(agent: &str, tokens_in: i64, cost: f64) -> MetricsEntry {
        let mut e = MetricsEntry::new(agent, "sonnet", Phase::Executing);
        e.tokens_in = tokens_in;
        e.tokens_out = tokens_in / 2;
        e.cost = cost;
        e.issue_id = Some("TASK-001".into());
        e
    }

    #[tokio::test]
    async fn test_record_updates_aggregate_store_and_bus() -> Result<()> {
        let (mc, store, bus) = collector().await?;
        let mut sub = bus.subscribe();

        mc.record(entry("coder", 100, 0.5)).await;
        mc.record(entry("coder", 20, 0.1)).await;

        let snap = mc.snapshot();
        assert_eq!(snap.tokens_in, 120);
        assert_eq!(snap.by_agent["coder"].calls, 2);

        let stored = store.call(|s| s.load_metrics_aggregate("run00001")).await?;
        assert_eq!(stored.tokens_in, 120);
        assert_eq!(stored.by_agent["coder"].calls, 2);

        let event = sub.rx.recv().await.unwrap();
        assert_eq!(event.kind, EventType::MetricsUpdated);
        assert_eq!(event.data["agent"], "coder");
        assert_eq!(event.data["issue_id"], "TASK-001");
        Ok(())
    }

    #[tokio::test]
    async fn test_phase_timing_recorded() -> Result<()> {
        let (mc, store, _bus) = collector().await?;
        mc.record_phase_timing(Phase::Design, 900).await;
        assert_eq!(mc.snapshot().phase_timings["design"], 900);
        let stored = store.call(|s| s.load_metrics_aggregate("run00001")).await?;
        assert_eq!(stored.phase_timings["design"], 900);
        Ok(())
    }

    #[tokio::test]
    async fn test_set_run_retargets_persistence() -> Result<()> {
        let (mc, store, _bus) = collector().await?;
        store
            .call(|s| s.create_run(&State::new("run00002", "", vec![])))
            .await?;

        mc.set_run("run00002", MetricsState::default());
        mc.record(entry("coder", 10, 0.0)).await;

        assert_eq!(mc.run_id(), "run00002");
        let first = store.call(|s| s.load_metrics_aggregate("run00001")).await?;
        let second = store.call(|s| s.load_metrics_aggregate("run00002")).await?;
        assert_eq!(first.tokens_in, 0);
        assert_eq!(second.tokens_in, 10);
        Ok(())
    }
}
