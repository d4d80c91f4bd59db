use anyhow::{Context, Result};
use rusqlite::params;

use super::{Store, ts};
use crate::engine::metrics::MetricsEntry;
use crate::engine::state::{MetricsState, Phase, Usage};

impl Store {
    pub fn record_metric(&self, run_id: &str, entry: &MetricsEntry) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO metrics_entries (run_id, timestamp, agent, model, tokens_in, tokens_out, cost, duration_ms, issue_id, phase)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    run_id,
                    ts(&entry.timestamp),
                    entry.agent,
                    entry.model,
                    entry.tokens_in,
                    entry.tokens_out,
                    entry.cost,
                    entry.duration_ms,
                    entry.issue_id,
                    entry.phase.as_str()
                ],
            )
            .context("Failed to record metric")?;
        Ok(())
    }

    pub fn record_phase_timing(&self, run_id: &str, phase: Phase, duration_ms: i64) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO phase_timings (run_id, phase, duration_ms) VALUES (?1, ?2, ?3)
                 ON CONFLICT(run_id, phase) DO UPDATE SET duration_ms = excluded.duration_ms",
                params![run_id, phase.as_str(), duration_ms],
            )
            .context("Failed to record phase timing")?;
        Ok(())
    }

    /// Totals, per-agent breakdown and per-phase timings for one run.
    pub fn load_metrics_aggregate(&self, run_id: &str) -> Result<MetricsState> {
        let mut metrics = MetricsState::default();

        (metrics.tokens_in, metrics.tokens_out, metrics.total_cost) = self
            .conn
            .query_row(
                "SELECT COALESCE(SUM(tokens_in), 0), COALESCE(SUM(tokens_out), 0), COALESCE(SUM(cost), 0)
                 FROM metrics_entries WHERE run_id = ?1",
                params![run_id],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, f64>(2)?,
                    ))
                },
            )
            .context("Failed to aggregate metrics")?;

        let mut stmt = self
            .conn
            .prepare(
                "SELECT agent, SUM(tokens_in), SUM(tokens_out), SUM(cost), COUNT(*)
                 FROM metrics_entries WHERE run_id = ?1 GROUP BY agent",
            )
            .context("Failed to prepare per-agent metrics")?;
        let rows = stmt
            .query_map(params![run_id], |row| {
                Ok((
                    row.get::<_, Option<String>>(0)?.unwrap_or_default(),
                    Usage {
                        tokens_in: row.get::<_, Option<i64>>(1)?.unwrap_or(0),
                        tokens_out: row.get::<_, Option<i64>>(2)?.unwrap_or(0),
                        cost: row.get::<_, Option<f64>>(3)?.unwrap_or(0.0),
                        calls: row.get(4)?,
                    },
                ))
            })
            .context("Failed to query per-agent metrics")?;
        for row in rows {
            let (agent, usage) = row.context("Failed to read metrics row")?;
            metrics.by_agent.insert(agent, usage);
        }

        let mut stmt = self
            .conn
            .prepare("SELECT phase, duration_ms FROM phase_timings WHERE run_id = ?1")
            .context("Failed to prepare phase timings")?;
        let rows = stmt
            .query_map(params![run_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })
            .context("Failed to query phase timings")?;
        for row in rows {
            let (phase, duration) = row.context("Failed to read phase timing row")?;
            metrics.phase_timings.insert(phase, duration);
        }

        Ok(metrics)
    }
}
