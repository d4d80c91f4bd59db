//! SQLite persistence for runs and everything they own.
//!
//! The store is the only component that writes durable state. Child tables
//! cascade on run deletion; every multi-row write runs in one transaction.

mod executions;
mod metrics;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, Transaction, params};
use serde::{Deserialize, Serialize};

use crate::engine::state::{IssueState, Phase, PhaseStatus, RepoConfig, RepoState, State};
use crate::errors::StoreError;

/// Async-safe handle to the store.
///
/// Wraps `Store` behind `Arc<Mutex>` and runs all access on tokio's blocking
/// pool via `spawn_blocking`, so synchronous SQLite I/O never ties up async
/// worker threads.
#[derive(Clone)]
pub struct StoreHandle {
    inner: Arc<std::sync::Mutex<Store>>,
}

impl StoreHandle {
    pub fn new(store: Store) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(store)),
        }
    }

    /// Open a file-backed store and wrap it.
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self::new(Store::open(path)?))
    }

    pub fn in_memory() -> Result<Self> {
        Ok(Self::new(Store::open_in_memory()?))
    }

    /// Run a closure with access to the store on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Store) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let store = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = store.lock().map_err(|_| StoreError::LockPoisoned)?;
            f(&guard)
        })
        .await
        .context("Store task panicked")?
    }

    /// Acquire the store synchronously. Only for startup, CLI commands and
    /// tests; never from a hot async path.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, Store>> {
        self.inner
            .lock()
            .map_err(|_| StoreError::LockPoisoned.into())
    }
}

/// Lightweight row for run listings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub id: String,
    pub phase: String,
    pub phase_status: String,
    pub prd_url: String,
    pub issue_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open (or create) a SQLite database at the given path and apply the schema.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open SQLite database {}", path.display()))?;
        let store = Self { conn };
        store.init()?;
        Ok(store)
    }

    /// Create an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let store = Self { conn };
        store.init()?;
        Ok(store)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA journal_mode = WAL; PRAGMA foreign_keys = ON;")
            .context("Failed to configure connection")?;
        self.conn
            .busy_timeout(Duration::from_millis(5000))
            .context("Failed to set busy timeout")?;
        self.conn
            .execute_batch(SCHEMA)
            .context("Failed to apply migrations")?;
        Ok(())
    }

    // ── Run lifecycle ─────────────────────────────────────────────────

    pub fn create_run(&self, state: &State) -> Result<()> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        insert_run(&tx, state)?;
        insert_repos(&tx, &state.run_id, &state.repos)?;
        tx.commit().context("Failed to commit run")
    }

    pub fn load_run(&self, run_id: &str) -> Result<State> {
        self.load_run_where("WHERE id = ?1", Some(run_id))
    }

    pub fn latest_run(&self) -> Result<State> {
        self.load_run_where("ORDER BY created_at DESC, rowid DESC LIMIT 1", None)
    }

    fn load_run_where(&self, clause: &str, run_id: Option<&str>) -> Result<State> {
        let sql = format!(
            "SELECT id, prd_url, phase, phase_status, updated_at FROM runs {}",
            clause
        );
        let map_row = |row: &rusqlite::Row<'_>| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Option<String>>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, Option<String>>(4)?,
            ))
        };
        let row = match run_id {
            Some(id) => self.conn.query_row(&sql, params![id], map_row),
            None => self.conn.query_row(&sql, [], map_row),
        }
        .optional()
        .context("Failed to query run")?;

        let Some((id, prd_url, phase, status, updated_at)) = row else {
            return Err(StoreError::RunNotFound.into());
        };

        let mut state = State::new(id, prd_url.unwrap_or_default(), Vec::new());
        state.phase = phase.as_deref().and_then(|p| p.parse().ok()).unwrap_or(Phase::Init);
        state.phase_status = status
            .as_deref()
            .and_then(|s| s.parse().ok())
            .unwrap_or(PhaseStatus::Pending);
        state.updated_at = updated_at.as_deref().map(parse_ts).unwrap_or_else(Utc::now);

        state.repos = self.load_repos(&state.run_id)?;
        self.load_bootstrap(&mut state)?;
        self.load_artifacts(&mut state)?;
        self.load_issues(&mut state)?;
        if let Ok(metrics) = self.load_metrics_aggregate(&state.run_id) {
            state.metrics = metrics;
        }
        Ok(state)
    }

    fn load_repos(&self, run_id: &str) -> Result<Vec<RepoConfig>> {
        let mut stmt = self
            .conn
            .prepare("SELECT name, path, team, language FROM repos WHERE run_id = ?1 ORDER BY rowid")
            .context("Failed to prepare load_repos")?;
        let rows = stmt
            .query_map(params![run_id], |row| {
                Ok(RepoConfig {
                    name: row.get(0)?,
                    path: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
                    team: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
                    language: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
                })
            })
            .context("Failed to query repos")?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read repo row")
    }

    fn load_bootstrap(&self, state: &mut State) -> Result<()> {
        let mut stmt = self
            .conn
            .prepare("SELECT repo_name, claude_md, architecture_md FROM bootstrap_state WHERE run_id = ?1")
            .context("Failed to prepare load_bootstrap")?;
        let rows = stmt
            .query_map(params![state.run_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    RepoState {
                        claude_md: row.get(1)?,
                        architecture_md: row.get(2)?,
                    },
                ))
            })
            .context("Failed to query bootstrap state")?;
        for row in rows {
            let (name, rs) = row.context("Failed to read bootstrap row")?;
            state.bootstrap.insert(name, rs);
        }
        Ok(())
    }

    fn load_artifacts(&self, state: &mut State) -> Result<()> {
        let mut stmt = self
            .conn
            .prepare("SELECT key, value FROM artifacts WHERE run_id = ?1")
            .context("Failed to prepare load_artifacts")?;
        let rows = stmt
            .query_map(params![state.run_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?))
            })
            .context("Failed to query artifacts")?;
        for row in rows {
            let (key, value) = row.context("Failed to read artifact row")?;
            state.artifacts.insert(key, value.unwrap_or_default());
        }
        Ok(())
    }

    fn load_issues(&self, state: &mut State) -> Result<()> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, title, repo, status, linear_id, branch, worktree, pr_url, depends_on, iterations
                 FROM issues WHERE run_id = ?1",
            )
            .context("Failed to prepare load_issues")?;
        let rows = stmt
            .query_map(params![state.run_id], |row| {
                Ok(IssueRow {
                    id: row.get(0)?,
                    title: row.get(1)?,
                    repo: row.get(2)?,
                    status: row.get(3)?,
                    linear_id: row.get(4)?,
                    branch: row.get(5)?,
                    worktree: row.get(6)?,
                    pr_url: row.get(7)?,
                    depends_on: row.get(8)?,
                    iterations: row.get(9)?,
                })
            })
            .context("Failed to query issues")?;
        for row in rows {
            let issue = row.context("Failed to read issue row")?.into_issue();
            state.issues.insert(issue.id.clone(), issue);
        }
        Ok(())
    }

    pub fn list_runs(&self) -> Result<Vec<RunSummary>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT r.id, r.phase, r.phase_status, r.prd_url, r.created_at, r.updated_at,
                        (SELECT COUNT(*) FROM issues i WHERE i.run_id = r.id) AS issue_count
                 FROM runs r ORDER BY r.created_at DESC, r.rowid DESC",
            )
            .context("Failed to prepare list_runs")?;
        let rows = stmt
            .query_map([], |row| {
                Ok(RunSummary {
                    id: row.get(0)?,
                    phase: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
                    phase_status: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
                    prd_url: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
                    created_at: parse_ts(&row.get::<_, String>(4)?),
                    updated_at: parse_ts(&row.get::<_, String>(5)?),
                    issue_count: row.get(6)?,
                })
            })
            .context("Failed to query runs")?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read run row")
    }

    /// Delete a run and, by cascade, everything it owns.
    pub fn delete_run(&self, run_id: &str) -> Result<()> {
        let deleted = self
            .conn
            .execute("DELETE FROM runs WHERE id = ?1", params![run_id])
            .context("Failed to delete run")?;
        if deleted == 0 {
            return Err(StoreError::RunNotFound.into());
        }
        Ok(())
    }

    // ── Partial saves ─────────────────────────────────────────────────

    pub fn save_run_meta(&self, run_id: &str, phase: Phase, status: PhaseStatus) -> Result<()> {
        self.conn
            .execute(
                "UPDATE runs SET phase = ?1, phase_status = ?2, updated_at = ?3 WHERE id = ?4",
                params![phase.as_str(), status.as_str(), ts(&Utc::now()), run_id],
            )
            .context("Failed to save run meta")?;
        Ok(())
    }

    pub fn save_repos(&self, run_id: &str, repos: &[RepoConfig]) -> Result<()> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        tx.execute("DELETE FROM repos WHERE run_id = ?1", params![run_id])
            .context("Failed to clear repos")?;
        insert_repos(&tx, run_id, repos)?;
        tx.commit().context("Failed to commit repos")
    }

    pub fn save_bootstrap(&self, run_id: &str, repo: &str, rs: RepoState) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO bootstrap_state (run_id, repo_name, claude_md, architecture_md) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(run_id, repo_name) DO UPDATE SET claude_md = excluded.claude_md, architecture_md = excluded.architecture_md",
                params![run_id, repo, rs.claude_md, rs.architecture_md],
            )
            .context("Failed to save bootstrap state")?;
        Ok(())
    }

    pub fn save_artifact(&self, run_id: &str, key: &str, value: &str) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO artifacts (run_id, key, value) VALUES (?1, ?2, ?3)
                 ON CONFLICT(run_id, key) DO UPDATE SET value = excluded.value",
                params![run_id, key, value],
            )
            .context("Failed to save artifact")?;
        Ok(())
    }

    pub fn save_issue(&self, run_id: &str, issue: &IssueState) -> Result<()> {
        upsert_issue(&self.conn, run_id, issue)
    }

    pub fn save_issues<'a>(
        &self,
        run_id: &str,
        issues: impl IntoIterator<Item = &'a IssueState>,
    ) -> Result<()> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        for issue in issues {
            upsert_issue(&tx, run_id, issue)?;
        }
        tx.commit().context("Failed to commit issues")
    }

    // ── Import ────────────────────────────────────────────────────────

    /// Load a legacy state blob into a brand new run, all or nothing.
    pub fn import_state(&self, state: &State) -> Result<()> {
        let tx = self
            .conn
            .unchecked_transaction()
            .context("Failed to begin transaction")?;
        insert_run(&tx, state).context("Failed to import run")?;
        insert_repos(&tx, &state.run_id, &state.repos)?;

        for (repo, rs) in &state.bootstrap {
            tx.execute(
                "INSERT INTO bootstrap_state (run_id, repo_name, claude_md, architecture_md) VALUES (?1, ?2, ?3, ?4)",
                params![state.run_id, repo, rs.claude_md, rs.architecture_md],
            )
            .context("Failed to import bootstrap state")?;
        }
        for (key, value) in &state.artifacts {
            tx.execute(
                "INSERT INTO artifacts (run_id, key, value) VALUES (?1, ?2, ?3)",
                params![state.run_id, key, value],
            )
            .context("Failed to import artifact")?;
        }
        for issue in state.issues.values() {
            upsert_issue(&tx, &state.run_id, issue)?;
        }
        for (phase, duration) in &state.metrics.phase_timings {
            tx.execute(
                "INSERT INTO phase_timings (run_id, phase, duration_ms) VALUES (?1, ?2, ?3)",
                params![state.run_id, phase, duration],
            )
            .context("Failed to import phase timing")?;
        }
        tx.commit().context("Failed to commit import")
    }
}

// ── Helpers ───────────────────────────────────────────────────────────

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS runs (
    id TEXT PRIMARY KEY,
    prd_url TEXT,
    phase TEXT,
    phase_status TEXT,
    created_at DATETIME DEFAULT (datetime('now')),
    updated_at DATETIME DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS repos (
    run_id TEXT REFERENCES runs(id) ON DELETE CASCADE,
    name TEXT,
    path TEXT,
    team TEXT,
    language TEXT DEFAULT '',
    PRIMARY KEY (run_id, name)
);

CREATE TABLE IF NOT EXISTS bootstrap_state (
    run_id TEXT REFERENCES runs(id) ON DELETE CASCADE,
    repo_name TEXT,
    claude_md BOOLEAN DEFAULT 0,
    architecture_md BOOLEAN DEFAULT 0,
    PRIMARY KEY (run_id, repo_name)
);

CREATE TABLE IF NOT EXISTS artifacts (
    run_id TEXT REFERENCES runs(id) ON DELETE CASCADE,
    key TEXT,
    value TEXT,
    PRIMARY KEY (run_id, key)
);

CREATE TABLE IF NOT EXISTS issues (
    run_id TEXT REFERENCES runs(id) ON DELETE CASCADE,
    id TEXT,
    title TEXT,
    repo TEXT,
    status TEXT DEFAULT 'ready',
    linear_id TEXT,
    branch TEXT,
    worktree TEXT,
    pr_url TEXT,
    depends_on TEXT DEFAULT '[]',
    iterations INTEGER DEFAULT 0,
    PRIMARY KEY (run_id, id)
);

CREATE TABLE IF NOT EXISTS metrics_entries (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id TEXT REFERENCES runs(id) ON DELETE CASCADE,
    timestamp DATETIME,
    agent TEXT,
    model TEXT,
    tokens_in INTEGER,
    tokens_out INTEGER,
    cost REAL,
    duration_ms INTEGER,
    issue_id TEXT,
    phase TEXT
);

CREATE TABLE IF NOT EXISTS phase_timings (
    run_id TEXT REFERENCES runs(id) ON DELETE CASCADE,
    phase TEXT,
    duration_ms INTEGER,
    PRIMARY KEY (run_id, phase)
);

CREATE TABLE IF NOT EXISTS executions (
    id TEXT PRIMARY KEY,
    run_id TEXT NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
    parent_id TEXT DEFAULT '',
    type TEXT NOT NULL DEFAULT 'phase',
    phase TEXT NOT NULL,
    issue_id TEXT DEFAULT '',
    status TEXT NOT NULL DEFAULT 'running',
    session_id TEXT DEFAULT '',
    tokens_in INTEGER DEFAULT 0,
    tokens_out INTEGER DEFAULT 0,
    error_message TEXT DEFAULT '',
    created_at DATETIME DEFAULT (datetime('now')),
    updated_at DATETIME DEFAULT (datetime('now'))
);

CREATE INDEX IF NOT EXISTS idx_executions_run_id ON executions(run_id);
CREATE INDEX IF NOT EXISTS idx_executions_run_phase ON executions(run_id, phase);
";

/// Timestamps are stored as RFC 3339 text with microseconds so that
/// lexical order matches chronological order.
pub(crate) fn ts(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a stored timestamp. Accepts RFC 3339 and SQLite's own
/// `datetime('now')` format; anything else maps to the epoch.
pub(crate) fn parse_ts(s: &str) -> DateTime<Utc> {
    if let Ok(t) = DateTime::parse_from_rfc3339(s) {
        return t.with_timezone(&Utc);
    }
    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
        .map(|n| n.and_utc())
        .unwrap_or_default()
}

fn insert_run(tx: &Transaction<'_>, state: &State) -> Result<()> {
    let now = ts(&Utc::now());
    tx.execute(
        "INSERT INTO runs (id, prd_url, phase, phase_status, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            state.run_id,
            state.prd_url,
            state.phase.as_str(),
            state.phase_status.as_str(),
            now,
            now
        ],
    )
    .context("Failed to insert run")?;
    Ok(())
}

fn insert_repos(tx: &Transaction<'_>, run_id: &str, repos: &[RepoConfig]) -> Result<()> {
    for repo in repos {
        tx.execute(
            "INSERT INTO repos (run_id, name, path, team, language) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![run_id, repo.name, repo.path, repo.team, repo.language],
        )
        .with_context(|| format!("Failed to insert repo {}", repo.name))?;
    }
    Ok(())
}

fn upsert_issue(conn: &Connection, run_id: &str, issue: &IssueState) -> Result<()> {
    let depends_on =
        serde_json::to_string(&issue.depends_on).context("Failed to encode depends_on")?;
    conn.execute(
        "INSERT INTO issues (run_id, id, title, repo, status, linear_id, branch, worktree, pr_url, depends_on, iterations)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
         ON CONFLICT(run_id, id) DO UPDATE SET
           title = excluded.title, repo = excluded.repo, status = excluded.status,
           linear_id = excluded.linear_id, branch = excluded.branch, worktree = excluded.worktree,
           pr_url = excluded.pr_url, depends_on = excluded.depends_on, iterations = excluded.iterations",
        params![
            run_id,
            issue.id,
            issue.title,
            issue.repo,
            issue.status.as_str(),
            issue.linear_id,
            issue.branch,
            issue.worktree,
            issue.pr_url,
            depends_on,
            issue.iterations
        ],
    )
    .with_context(|| format!("Failed to save issue {}", issue.id))?;
    Ok(())
}

/// Raw issue row before enum and JSON decoding.
struct IssueRow {
    id: String,
    title: Option<String>,
    repo: Option<String>,
    status: Option<String>,
    linear_id: Option<String>,
    branch: Option<String>,
    worktree: Option<String>,
    pr_url: Option<String>,
    depends_on: Option<String>,
    iterations: Option<u32>,
}

impl IssueRow {
    fn into_issue(self) -> IssueState {
        let non_empty = |v: Option<String>| v.filter(|s| !s.is_empty());
        IssueState {
            id: self.id,
            title: self.title.unwrap_or_default(),
            repo: self.repo.unwrap_or_default(),
            status: self
                .status
                .as_deref()
                .and_then(|s| s.parse().ok())
                .unwrap_or(crate::engine::state::IssueStatus::Ready),
            linear_id: non_empty(self.linear_id),
            branch: non_empty(self.branch),
            worktree: non_empty(self.worktree),
            pr_url: non_empty(self.pr_url),
            depends_on: self
                .depends_on
                .as_deref()
                .and_then(|s| serde_json::from_str(s).ok())
                .unwrap_or_default(),
            iterations: self.iterations.unwrap_or(0),
        }
    }
}
