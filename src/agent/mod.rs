//! Spawning the external coding-agent CLI and folding its stream-json output.
//!
//! Two modes share one parser ([`stream::StreamAccumulator`]):
//!
//! - [`AgentRunner::run`] is fire-and-collect. Every JSON line is republished
//!   on the engine bus as `agent.output`; non-JSON lines land in the output.
//! - [`AgentRunner::run_session`] drives an interactive execution. Assistant
//!   text is streamed into a single transcript message that is rewritten in
//!   place, tool calls become system progress messages, and the child is
//!   killed when the execution's cancel token fires.

pub mod extract;
pub mod stream;

use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::json;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::engine::events::{EventBus, EventType};
use crate::engine::execution::{ExecutionManager, Message};
use crate::errors::AgentError;
use stream::StreamAccumulator;

/// Longest stdout line accepted from the agent.
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

const FLUSH_INTERVAL: Duration = Duration::from_millis(500);
const STDERR_LIMIT: usize = 2000;
const DEFAULT_CLAUDE_CMD: &str = "claude";

/// One agent invocation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunConfig {
    pub prompt: String,
    pub cwd: Option<PathBuf>,
    pub model: String,
    pub allowed_tools: Vec<String>,
    pub max_turns: u32,
    /// Set for session runs: `--session-id` on the first turn, `--resume` after.
    pub session_id: String,
    pub resume: bool,
}

impl RunConfig {
    pub fn new(prompt: impl Into<String>, model: &str, tools: &[&str]) -> Self {
        Self {
            prompt: prompt.into(),
            model: model.to_string(),
            allowed_tools: tools.iter().map(|t| t.to_string()).collect(),
            ..Self::default()
        }
    }

    pub fn in_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// CLI arguments in the order the agent expects them.
    pub fn args(&self) -> Vec<String> {
        let mut args = vec![
            "-p".to_string(),
            self.prompt.clone(),
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--verbose".to_string(),
        ];
        if !self.session_id.is_empty() {
            let flag = if self.resume { "--resume" } else { "--session-id" };
            args.push(flag.to_string());
            args.push(self.session_id.clone());
        }
        if !self.model.is_empty() {
            args.push("--model".to_string());
            args.push(self.model.clone());
        }
        if !self.allowed_tools.is_empty() {
            args.push("--allowedTools".to_string());
            args.push(self.allowed_tools.join(","));
        }
        if self.max_turns > 0 {
            args.push("--max-turns".to_string());
            args.push(self.max_turns.to_string());
        }
        args
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AgentOutput {
    pub output: String,
    pub tokens_in: i64,
    pub tokens_out: i64,
    pub exit_code: i32,
}

/// Abstraction over the agent CLI so phases and sessions can be tested.
/// Real implementation: [`ClaudeRunner`].
#[async_trait]
pub trait AgentRunner: Send + Sync {
    /// Run to completion, publishing raw stream lines as `agent.output`.
    async fn run(&self, cfg: &RunConfig, events: &EventBus, issue_id: &str) -> Result<AgentOutput>;

    /// Run one turn of an interactive execution.
    async fn run_session(
        &self,
        cfg: &RunConfig,
        events: &EventBus,
        executions: &ExecutionManager,
        execution_id: &str,
        cancel: CancellationToken,
    ) -> Result<AgentOutput>;
}

/// Runs the `claude` binary (or whatever `CLAUDE_CMD` names).
#[derive(Debug, Clone)]
pub struct ClaudeRunner {
    program: String,
    base_args: Vec<String>,
}

impl ClaudeRunner {
    pub fn new(program: impl Into<String>, base_args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            base_args,
        }
    }

    /// Split a command line such as `npx claude` into program and leading
    /// args. `CLAUDE_CMD` is passed through here.
    pub fn from_command_line(raw: &str) -> Self {
        let mut parts = raw.split_whitespace().map(str::to_string);
        let program = parts.next().unwrap_or_else(|| DEFAULT_CLAUDE_CMD.to_string());
        Self::new(program, parts.collect())
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// A bare command for the agent CLI, with the leading args applied.
    pub fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.base_args);
        cmd
    }

    fn spawn(&self, cfg: &RunConfig, capture_stderr: bool) -> Result<Child> {
        let mut cmd = self.command();
        cmd.args(cfg.args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(if capture_stderr {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .kill_on_drop(true);
        if let Some(dir) = &cfg.cwd {
            cmd.current_dir(dir);
        }
        debug!(program = %self.program, model = %cfg.model, "Spawning agent");
        Ok(cmd.spawn().map_err(AgentError::SpawnFailed)?)
    }
}

#[async_trait]
impl AgentRunner for ClaudeRunner {
    async fn run(&self, cfg: &RunConfig, events: &EventBus, issue_id: &str) -> Result<AgentOutput> {
        let mut child = self.spawn(cfg, false)?;
        let stdout = child.stdout.take().context("Agent stdout was not captured")?;
        let mut lines = FramedRead::new(stdout, LinesCodec::new_with_max_length(MAX_LINE_BYTES));
        let mut acc = StreamAccumulator::new();

        while let Some(line) = lines.next().await {
            let Some(line) = accept_line(line)? else {
                continue;
            };
            if !acc.handle_line(&line).is_json {
                acc.text.push_str(&line);
                acc.text.push('\n');
                continue;
            }
            events.emit(
                EventType::AgentOutput,
                json!({ "issue_id": issue_id, "raw": line }),
            );
        }

        let status = child.wait().await.context("Failed to wait for agent")?;
        Ok(AgentOutput {
            output: acc.text,
            tokens_in: acc.tokens_in,
            tokens_out: acc.tokens_out,
            exit_code: status.code().unwrap_or(-1),
        })
    }

    async fn run_session(
        &self,
        cfg: &RunConfig,
        events: &EventBus,
        executions: &ExecutionManager,
        execution_id: &str,
        cancel: CancellationToken,
    ) -> Result<AgentOutput> {
        let mut child = self.spawn(cfg, true)?;
        let stdout = child.stdout.take().context("Agent stdout was not captured")?;
        let stderr = child.stderr.take();
        let stderr_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            if let Some(mut stderr) = stderr {
                let _ = stderr.read_to_end(&mut buf).await;
            }
            String::from_utf8_lossy(&buf).into_owned()
        });

        let mut lines = FramedRead::new(stdout, LinesCodec::new_with_max_length(MAX_LINE_BYTES));
        let mut acc = StreamAccumulator::new();
        let mut last_flush = Instant::now();
        let flush = |acc: &StreamAccumulator| {
            if !acc.text.is_empty() {
                executions.update_last_assistant(execution_id, &acc.text);
            }
        };

        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = child.kill().await;
                    stderr_task.abort();
                    return Err(AgentError::Cancelled.into());
                }
                next = lines.next() => next,
            };
            let Some(line) = next else {
                break;
            };
            let Some(line) = accept_line(line)? else {
                continue;
            };

            let effect = acc.handle_line(&line);
            for progress in effect.progress {
                flush(&acc);
                executions.append_message(execution_id, Message::system(progress.clone()));
                events.emit(
                    EventType::ExecutionOutput,
                    json!({ "execution_id": execution_id, "progress": progress }),
                );
            }
            if !acc.text.is_empty() && last_flush.elapsed() > FLUSH_INTERVAL {
                flush(&acc);
                last_flush = Instant::now();
            }
        }
        flush(&acc);

        let status = tokio::select! {
            _ = cancel.cancelled() => {
                let _ = child.kill().await;
                stderr_task.abort();
                return Err(AgentError::Cancelled.into());
            }
            status = child.wait() => status.context("Failed to wait for agent session")?,
        };
        let exit_code = status.code().unwrap_or(-1);
        if exit_code == -1 || exit_code == 137 {
            executions.append_message(
                execution_id,
                Message::system(format!(
                    "Claude process was killed (exit code {}). Likely OOM, consider reducing task scope or using --max-turns.",
                    exit_code
                )),
            );
        }

        let stderr_text = stderr_task.await.unwrap_or_default();
        if !stderr_text.is_empty() && (acc.text.is_empty() || exit_code != 0) {
            executions.append_message(
                execution_id,
                Message::system(format!("stderr: {}", truncate_stderr(&stderr_text))),
            );
        }

        executions.update_tokens(execution_id, acc.tokens_in, acc.tokens_out);

        Ok(AgentOutput {
            output: acc.text,
            tokens_in: acc.tokens_in,
            tokens_out: acc.tokens_out,
            exit_code,
        })
    }
}

/// Skip blank and oversized lines; surface read errors.
fn accept_line(line: Result<String, LinesCodecError>) -> Result<Option<String>> {
    match line {
        Ok(line) if line.is_empty() => Ok(None),
        Ok(line) => Ok(Some(line)),
        Err(LinesCodecError::MaxLineLengthExceeded) => {
            warn!("Skipping agent output line longer than {} bytes", MAX_LINE_BYTES);
            Ok(None)
        }
        Err(LinesCodecError::Io(e)) => Err(e).context("Failed to read agent output"),
    }
}

fn truncate_stderr(s: &str) -> String {
    if s.len() <= STDERR_LIMIT {
        return s.to_string();
    }
    let mut end = STDERR_LIMIT;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}... (truncated)", &s[..end])
}


#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::engine::execution::{Execution, ExecutionType, MessageRole};
    use std::sync::Arc;
    use tempfile::TempDir;

    /// A runner that executes `body` with `/bin/sh`.
    fn script_runner(body: &str) -> (ClaudeRunner, TempDir) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("fake-claude.sh");
        std::fs::write(&path, body).unwrap();
        let runner = ClaudeRunner::new("sh", vec![path.to_string_lossy().into_owned()]);
        (runner, dir)
    }

    fn session_fixture() -> (Arc<EventBus>, ExecutionManager) {
        let bus = Arc::new(EventBus::new());
        let mgr = ExecutionManager::new(bus.clone());
        mgr.create(Execution::new("e1", "run1", ExecutionType::Phase, "design"));
        (bus, mgr)
    }

    #[test]
    fn test_args_order_for_first_turn_and_resume() {
        let mut cfg = RunConfig::new("do it", "opus", &["Read", "Write"]);
        cfg.session_id = "sid-1".into();
        cfg.max_turns = 4;
        assert_eq!(
            cfg.args(),
            vec![
                "-p", "do it", "--output-format", "stream-json", "--verbose",
                "--session-id", "sid-1", "--model", "opus", "--allowedTools", "Read,Write",
                "--max-turns", "4",
            ]
        );

        cfg.resume = true;
        assert!(cfg.args().windows(2).any(|w| w == ["--resume", "sid-1"]));

        let bare = RunConfig::new("p", "", &[]);
        assert_eq!(bare.args().len(), 5);
    }

    #[test]
    fn test_truncate_stderr() {
        assert_eq!(truncate_stderr("short"), "short");
        let long = "e".repeat(STDERR_LIMIT + 10);
        let cut = truncate_stderr(&long);
        assert!(cut.ends_with("... (truncated)"));
        assert_eq!(cut.len(), STDERR_LIMIT + "... (truncated)".len());
    }

    #[tokio::test]
    async fn test_run_collects_raw_lines_and_publishes_json() {
        let (runner, _dir) = script_runner(concat!(
            "echo 'starting up'\n",
            "echo '{\"type\":\"assistant\",\"message\":{\"content\":[{\"type\":\"text\",\"text\":\"done\"}],\"usage\":{\"input_tokens\":3,\"output_tokens\":1}}}'\n",
        ));
        let bus = EventBus::new();
        let mut sub = bus.subscribe();

        let out = runner
            .run(&RunConfig::new("p", "sonnet", &[]), &bus, "TASK-001")
            .await
            .unwrap();

        assert_eq!(out.output, "starting up\ndone");
        assert_eq!((out.tokens_in, out.tokens_out, out.exit_code), (3, 1, 0));
        let event = sub.rx.recv().await.unwrap();
        assert_eq!(event.kind, EventType::AgentOutput);
        assert_eq!(event.data["issue_id"], "TASK-001");
        assert!(sub.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_run_passes_cli_flags() {
        let (runner, _dir) = script_runner("printf '%s\\n' \"$@\"\n");
        let bus = EventBus::new();
        let out = runner
            .run(&RunConfig::new("hello", "sonnet", &["Bash"]), &bus, "")
            .await
            .unwrap();
        assert_eq!(
            out.output,
            "-p\nhello\n--output-format\nstream-json\n--verbose\n--model\nsonnet\n--allowedTools\nBash\n"
        );
    }

    #[tokio::test]
    async fn test_session_collapses_stream_into_one_assistant_message() {
        let (runner, _dir) = script_runner(concat!(
            "echo '{\"type\":\"assistant\",\"message\":{\"content\":[{\"type\":\"text\",\"text\":\"H\"}]}}'\n",
            "echo '{\"type\":\"assistant\",\"message\":{\"content\":[{\"type\":\"tool_use\",\"name\":\"Read\",\"input\":{\"file_path\":\"/r/src/lib.rs\"}}]}}'\n",
            "echo '{\"type\":\"assistant\",\"message\":{\"content\":[{\"type\":\"text\",\"text\":\"i\"}]}}'\n",
            "echo '{\"type\":\"result\",\"result\":\"Hi\",\"usage\":{\"input_tokens\":12,\"output_tokens\":4}}'\n",
        ));
        let (bus, mgr) = session_fixture();

        let out = runner
            .run_session(&RunConfig::new("p", "", &[]), &bus, &mgr, "e1", CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out.output, "Hi");

        let exec = mgr.get("e1").unwrap();
        let assistants: Vec<_> = exec
            .messages
            .iter()
            .filter(|m| m.role == MessageRole::Assistant)
            .collect();
        assert_eq!(assistants.len(), 1);
        assert_eq!(assistants[0].content, "Hi");
        assert!(exec
            .messages
            .iter()
            .any(|m| m.role == MessageRole::System && m.content == "Reading src/lib.rs"));
        assert_eq!((exec.tokens_in, exec.tokens_out), (12, 4));
    }

    #[tokio::test]
    async fn test_session_reports_stderr_on_failure() {
        let (runner, _dir) = script_runner("echo 'boom' >&2\nexit 3\n");
        let (bus, mgr) = session_fixture();

        let out = runner
            .run_session(&RunConfig::new("p", "", &[]), &bus, &mgr, "e1", CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(out.exit_code, 3);
        let messages = mgr.get("e1").unwrap().messages;
        assert_eq!(messages.last().unwrap().content, "stderr: boom\n");
    }

    #[tokio::test]
    async fn test_session_cancel_kills_child() {
        let (runner, _dir) = script_runner("sleep 30\n");
        let (bus, mgr) = session_fixture();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let err = runner
            .run_session(&RunConfig::new("p", "", &[]), &bus, &mgr, "e1", cancel)
            .await
            .unwrap_err();
        assert!(matches!(err.downcast_ref::<AgentError>(), Some(AgentError::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_spawn_failure_is_typed() {
        let runner = ClaudeRunner::new("/definitely/not/a/claude", vec![]);
        let err = runner
            .run(&RunConfig::new("p", "", &[]), &EventBus::new(), "")
            .await
            .unwrap_err();
        assert!(matches!(err.downcast_ref::<AgentError>(), Some(AgentError::SpawnFailed(_))));
    }
}
