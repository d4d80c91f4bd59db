//! Live agent sessions: transcripts, status, cancel handles and token totals.
//!
//! The registry is shared by reference between the HTTP layer and the agent
//! runner. Readers always get owned copies; nothing outside this module holds
//! a reference into the map.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_util::sync::CancellationToken;

use super::events::{EventBus, EventType};
use crate::errors::ExecutionError;

/// Live entries kept before terminal ones are evicted.
pub const MAX_LIVE_EXECUTIONS: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionType {
    Phase,
    Issue,
}

impl ExecutionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Phase => "phase",
            Self::Issue => "issue",
        }
    }
}

impl FromStr for ExecutionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "phase" => Ok(Self::Phase),
            "issue" => Ok(Self::Issue),
            _ => Err(format!("Invalid execution type: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    WaitingInput,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::WaitingInput => "waiting_input",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    fn event_type(&self) -> EventType {
        match self {
            Self::Running => EventType::ExecutionStarted,
            Self::WaitingInput => EventType::ExecutionWaitingInput,
            Self::Completed => EventType::ExecutionCompleted,
            Self::Failed => EventType::ExecutionFailed,
            Self::Cancelled => EventType::ExecutionCancelled,
        }
    }
}

impl FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "waiting_input" => Ok(Self::WaitingInput),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Invalid execution status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    System,
    Assistant,
    User,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(MessageRole::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(MessageRole::User, content)
    }
}

/// One agent session tied to a phase or an issue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    pub id: String,
    pub run_id: String,
    #[serde(rename = "type")]
    pub exec_type: ExecutionType,
    pub phase: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub issue_id: String,
    pub status: ExecutionStatus,
    pub session_id: String,
    pub messages: Vec<Message>,
    #[serde(default)]
    pub params: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub parent_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub tokens_in: i64,
    pub tokens_out: i64,
}

impl Execution {
    pub fn new(
        id: impl Into<String>,
        run_id: impl Into<String>,
        exec_type: ExecutionType,
        phase: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            run_id: run_id.into(),
            exec_type,
            phase: phase.into(),
            issue_id: String::new(),
            status: ExecutionStatus::Running,
            session_id: String::new(),
            messages: Vec::new(),
            params: HashMap::new(),
            parent_id: String::new(),
            created_at: now,
            updated_at: now,
            tokens_in: 0,
            tokens_out: 0,
        }
    }

    pub fn to_record(&self) -> ExecutionRecord {
        ExecutionRecord {
            id: self.id.clone(),
            run_id: self.run_id.clone(),
            parent_id: self.parent_id.clone(),
            exec_type: self.exec_type,
            phase: self.phase.clone(),
            issue_id: self.issue_id.clone(),
            status: self.status,
            session_id: self.session_id.clone(),
            tokens_in: self.tokens_in,
            tokens_out: self.tokens_out,
            error_message: String::new(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

impl From<ExecutionRecord> for Execution {
    /// A stored execution as the API shows it: no transcript or params.
    fn from(rec: ExecutionRecord) -> Self {
        Self {
            id: rec.id,
            run_id: rec.run_id,
            exec_type: rec.exec_type,
            phase: rec.phase,
            issue_id: rec.issue_id,
            status: rec.status,
            session_id: rec.session_id,
            messages: Vec::new(),
            params: HashMap::new(),
            parent_id: rec.parent_id,
            created_at: rec.created_at,
            updated_at: rec.updated_at,
            tokens_in: rec.tokens_in,
            tokens_out: rec.tokens_out,
        }
    }
}

/// Persisted shape of an execution: no transcript, plus the failure message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: String,
    pub run_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub parent_id: String,
    #[serde(rename = "type")]
    pub exec_type: ExecutionType,
    pub phase: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub issue_id: String,
    pub status: ExecutionStatus,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub session_id: String,
    pub tokens_in: i64,
    pub tokens_out: i64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error_message: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ExecutionRecord {
    /// A fresh `running` record of type `phase`.
    pub fn phase(id: impl Into<String>, run_id: impl Into<String>, phase: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            run_id: run_id.into(),
            parent_id: String::new(),
            exec_type: ExecutionType::Phase,
            phase: phase.into(),
            issue_id: String::new(),
            status: ExecutionStatus::Running,
            session_id: String::new(),
            tokens_in: 0,
            tokens_out: 0,
            error_message: String::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug)]
pub struct ExecutionManager {
    executions: RwLock<HashMap<String, Execution>>,
    cancels: RwLock<HashMap<String, CancellationToken>>,
    events: Arc<EventBus>,
}

impl ExecutionManager {
    pub fn new(events: Arc<EventBus>) -> Self {
        Self {
            executions: RwLock::new(HashMap::new()),
            cancels: RwLock::new(HashMap::new()),
            events,
        }
    }

    /// Register an execution, announce it, and trim terminal entries when
    /// the registry grows past [`MAX_LIVE_EXECUTIONS`].
    pub fn create(&self, mut exec: Execution) {
        let payload = json!({
            "execution_id": exec.id,
            "run_id": exec.run_id,
            "type": exec.exec_type,
            "phase": exec.phase,
            "issue_id": exec.issue_id,
        });

        if let Ok(mut map) = self.executions.write() {
            // Creation times are strictly increasing so eviction order is total.
            let mut now = Utc::now();
            if let Some(latest) = map.values().map(|e| e.created_at).max()
                && now <= latest
            {
                now = latest + chrono::Duration::nanoseconds(1);
            }
            exec.created_at = now;
            exec.updated_at = now;
            map.insert(exec.id.clone(), exec);
            let evicted = evict_terminal(&mut map);
            if !evicted.is_empty()
                && let Ok(mut cancels) = self.cancels.write()
            {
                for id in &evicted {
                    cancels.remove(id);
                }
            }
        }

        self.events.emit(EventType::ExecutionStarted, payload);
    }

    pub fn get(&self, id: &str) -> Option<Execution> {
        self.executions.read().ok()?.get(id).cloned()
    }

    /// Copies of every execution for `run_id`; an empty id lists all.
    pub fn list(&self, run_id: &str) -> Vec<Execution> {
        let Ok(map) = self.executions.read() else {
            return Vec::new();
        };
        let mut out: Vec<Execution> = map
            .values()
            .filter(|e| run_id.is_empty() || e.run_id == run_id)
            .cloned()
            .collect();
        out.sort_by_key(|e| e.created_at);
        out
    }

    pub fn len(&self) -> usize {
        self.executions.read().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn append_message(&self, id: &str, mut msg: Message) {
        self.with_execution(id, |exec| {
            msg.timestamp = Utc::now();
            exec.messages.push(msg);
        });
    }

    /// Rewrite the current turn's assistant message, or start one. A turn
    /// begins at the latest user message.
    pub fn update_last_assistant(&self, id: &str, content: &str) {
        self.with_execution(id, |exec| {
            let now = Utc::now();
            match exec
                .messages
                .iter_mut()
                .rev()
                .take_while(|m| m.role != MessageRole::User)
                .find(|m| m.role == MessageRole::Assistant)
            {
                Some(last) => {
                    last.content = content.to_string();
                    last.timestamp = now;
                }
                None => exec.messages.push(Message::new(MessageRole::Assistant, content)),
            }
        });
    }

    pub fn update_status(&self, id: &str, status: ExecutionStatus) {
        let mut run_id = None;
        self.with_execution(id, |exec| {
            exec.status = status;
            run_id = Some(exec.run_id.clone());
        });
        let Some(run_id) = run_id else {
            return;
        };
        self.events.emit(
            status.event_type(),
            json!({
                "execution_id": id,
                "run_id": run_id,
                "status": status,
            }),
        );
    }

    /// Move a waiting execution back to `running` for another turn.
    ///
    /// The check and the transition happen under one write lock, so two
    /// concurrent callers cannot both start a turn.
    pub fn begin_turn(&self, id: &str) -> Result<Execution, ExecutionError> {
        let exec = {
            let mut map = self
                .executions
                .write()
                .map_err(|_| ExecutionError::NotFound(id.to_string()))?;
            let exec = map
                .get_mut(id)
                .ok_or_else(|| ExecutionError::NotFound(id.to_string()))?;
            match exec.status {
                ExecutionStatus::Running => return Err(ExecutionError::Busy),
                s if s.is_terminal() => return Err(ExecutionError::Terminal(s.as_str().to_string())),
                _ => {}
            }
            exec.status = ExecutionStatus::Running;
            exec.updated_at = Utc::now();
            exec.clone()
        };
        self.events.emit(
            EventType::ExecutionStarted,
            json!({
                "execution_id": id,
                "run_id": exec.run_id,
                "status": ExecutionStatus::Running,
            }),
        );
        Ok(exec)
    }

    pub fn update_tokens(&self, id: &str, tokens_in: i64, tokens_out: i64) {
        self.with_execution(id, |exec| {
            exec.tokens_in += tokens_in;
            exec.tokens_out += tokens_out;
        });
    }

    pub fn set_cancel(&self, id: &str, token: CancellationToken) {
        if let Ok(mut cancels) = self.cancels.write() {
            cancels.insert(id.to_string(), token);
        }
    }

    /// Fire the execution's cancel handle and mark it cancelled.
    pub fn cancel(&self, id: &str) -> Result<(), ExecutionError> {
        if self.get(id).is_none() {
            return Err(ExecutionError::NotFound(id.to_string()));
        }
        let token = self
            .cancels
            .read()
            .ok()
            .and_then(|c| c.get(id).cloned())
            .ok_or_else(|| ExecutionError::NoCancel(id.to_string()))?;

        token.cancel();
        self.update_status(id, ExecutionStatus::Cancelled);
        Ok(())
    }

    fn with_execution(&self, id: &str, f: impl FnOnce(&mut Execution)) {
        if let Ok(mut map) = self.executions.write()
            && let Some(exec) = map.get_mut(id)
        {
            f(exec);
            exec.updated_at = Utc::now();
        }
    }
}

/// Remove the oldest non-live executions until the map fits. Running and
/// waiting entries are never removed, so the map can only stay over the cap
/// while everything in it is live.
fn evict_terminal(map: &mut HashMap<String, Execution>) -> Vec<String> {
    let mut evicted = Vec::new();
    while map.len() > MAX_LIVE_EXECUTIONS {
        let oldest = map
            .values()
            .filter(|e| e.status.is_terminal())
            .min_by_key(|e| e.created_at)
            .map(|e| e.id.clone());
        match oldest {
            Some(id) => {
                map.remove(&id);
                evicted.push(id);
            }
            None => break,
        }
    }
    evicted
}
