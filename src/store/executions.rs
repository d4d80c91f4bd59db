use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{OptionalExtension, Row, params};

use super::{Store, parse_ts, ts};
use crate::engine::execution::{ExecutionRecord, ExecutionStatus, ExecutionType};

const SELECT_EXECUTION: &str = "SELECT id, run_id, parent_id, type, phase, issue_id, status, session_id, tokens_in, tokens_out, error_message, created_at, updated_at FROM executions";

impl Store {
    /// Insert a record, or refresh status, tokens and error if the id exists.
    pub fn create_execution(&self, rec: &ExecutionRecord) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO executions (id, run_id, parent_id, type, phase, issue_id, status, session_id, tokens_in, tokens_out, error_message, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
                 ON CONFLICT(id) DO UPDATE SET
                   status = excluded.status, tokens_in = excluded.tokens_in, tokens_out = excluded.tokens_out,
                   error_message = excluded.error_message, updated_at = excluded.updated_at",
                params![
                    rec.id,
                    rec.run_id,
                    rec.parent_id,
                    rec.exec_type.as_str(),
                    rec.phase,
                    rec.issue_id,
                    rec.status.as_str(),
                    rec.session_id,
                    rec.tokens_in,
                    rec.tokens_out,
                    rec.error_message,
                    ts(&rec.created_at),
                    ts(&rec.updated_at)
                ],
            )
            .with_context(|| format!("Failed to save execution {}", rec.id))?;
        Ok(())
    }

    pub fn get_execution(&self, id: &str) -> Result<Option<ExecutionRecord>> {
        self.conn
            .query_row(
                &format!("{} WHERE id = ?1", SELECT_EXECUTION),
                params![id],
                map_execution,
            )
            .optional()
            .context("Failed to query execution")
    }

    pub fn update_execution_status(
        &self,
        id: &str,
        status: ExecutionStatus,
        error_message: &str,
    ) -> Result<()> {
        self.conn
            .execute(
                "UPDATE executions SET status = ?1, error_message = ?2, updated_at = ?3 WHERE id = ?4",
                params![status.as_str(), error_message, ts(&Utc::now()), id],
            )
            .context("Failed to update execution status")?;
        Ok(())
    }

    /// Overwrite the stored token totals.
    pub fn update_execution_tokens(&self, id: &str, tokens_in: i64, tokens_out: i64) -> Result<()> {
        self.conn
            .execute(
                "UPDATE executions SET tokens_in = ?1, tokens_out = ?2, updated_at = ?3 WHERE id = ?4",
                params![tokens_in, tokens_out, ts(&Utc::now()), id],
            )
            .context("Failed to update execution tokens")?;
        Ok(())
    }

    /// All executions for a run, oldest first.
    pub fn list_executions(&self, run_id: &str) -> Result<Vec<ExecutionRecord>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "{} WHERE run_id = ?1 ORDER BY created_at ASC, rowid ASC",
                SELECT_EXECUTION
            ))
            .context("Failed to prepare list_executions")?;
        let rows = stmt
            .query_map(params![run_id], map_execution)
            .context("Failed to query executions")?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read execution row")
    }

    /// Most recent execution for a run and phase label.
    pub fn latest_execution(&self, run_id: &str, phase: &str) -> Result<Option<ExecutionRecord>> {
        self.conn
            .query_row(
                &format!(
                    "{} WHERE run_id = ?1 AND phase = ?2 ORDER BY created_at DESC, rowid DESC LIMIT 1",
                    SELECT_EXECUTION
                ),
                params![run_id, phase],
                map_execution,
            )
            .optional()
            .context("Failed to query latest execution")
    }
}

fn map_execution(row: &Row<'_>) -> rusqlite::Result<ExecutionRecord> {
    let text = |idx: usize| -> rusqlite::Result<String> {
        Ok(row.get::<_, Option<String>>(idx)?.unwrap_or_default())
    };
    Ok(ExecutionRecord {
        id: row.get(0)?,
        run_id: row.get(1)?,
        parent_id: text(2)?,
        exec_type: text(3)?.parse().unwrap_or(ExecutionType::Phase),
        phase: row.get(4)?,
        issue_id: text(5)?,
        status: text(6)?.parse().unwrap_or(ExecutionStatus::Failed),
        session_id: text(7)?,
        tokens_in: row.get::<_, Option<i64>>(8)?.unwrap_or(0),
        tokens_out: row.get::<_, Option<i64>>(9)?.unwrap_or(0),
        error_message: text(10)?,
        created_at: parse_ts(&text(11)?),
        updated_at: parse_ts(&text(12)?),
    })
}
