use serde::Deserialize;
use serde_json::Value;

/// One line of the agent CLI's `stream-json` output.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum StreamEvent {
    #[serde(rename = "assistant")]
    Assistant { message: AssistantMessage },

    #[serde(rename = "result")]
    Result {
        #[serde(default)]
        result: Option<String>,
        #[serde(default)]
        usage: Option<TokenUsage>,
    },

    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
pub struct AssistantMessage {
    #[serde(default)]
    pub content: Vec<ContentBlock>,
    #[serde(default)]
    pub usage: Option<TokenUsage>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum ContentBlock {
    #[serde(rename = "tool_use")]
    ToolUse {
        #[serde(default)]
        name: String,
        #[serde(default)]
        input: Value,
    },

    #[serde(rename = "text")]
    Text { text: String },

    #[serde(other)]
    Other,
}

#[derive(Debug, Default, Clone, Copy, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub input_tokens: i64,
    #[serde(default)]
    pub output_tokens: i64,
}

/// What a single stdout line contributed.
#[derive(Debug, Default, PartialEq)]
pub struct LineEffect {
    /// False when the line was not a JSON object.
    pub is_json: bool,
    /// Tool-progress strings in block order.
    pub progress: Vec<String>,
}

/// Folds stream lines into the final text and token totals.
///
/// Assistant text blocks append; a `result` line's text replaces everything
/// gathered so far and its usage replaces the running token counts.
#[derive(Debug, Default)]
pub struct StreamAccumulator {
    pub text: String,
    pub tokens_in: i64,
    pub tokens_out: i64,
}

impl StreamAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle_line(&mut self, line: &str) -> LineEffect {
        let Ok(Value::Object(_)) = serde_json::from_str::<Value>(line) else {
            return LineEffect::default();
        };
        let mut effect = LineEffect {
            is_json: true,
            progress: Vec::new(),
        };
        // Unknown shapes still count as JSON, they just carry nothing.
        let Ok(event) = serde_json::from_str::<StreamEvent>(line) else {
            return effect;
        };

        match event {
            StreamEvent::Assistant { message } => {
                for block in message.content {
                    match block {
                        ContentBlock::Text { text } => self.text.push_str(&text),
                        ContentBlock::ToolUse { name, input } => {
                            effect.progress.push(describe_tool_use(&name, &input));
                        }
                        ContentBlock::Other => {}
                    }
                }
                if let Some(usage) = message.usage {
                    self.tokens_in += usage.input_tokens;
                    self.tokens_out += usage.output_tokens;
                }
            }
            StreamEvent::Result { result, usage } => {
                if let Some(result) = result.filter(|r| !r.is_empty()) {
                    self.text = result;
                }
                if let Some(usage) = usage {
                    self.tokens_in = usage.input_tokens;
                    self.tokens_out = usage.output_tokens;
                }
            }
            StreamEvent::Other => {}
        }
        effect
    }
}

/// Human-readable progress line for a tool invocation.
pub fn describe_tool_use(name: &str, input: &Value) -> String {
    let field = |key: &str| {
        input
            .get(key)
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
    };

    match name {
        "Write" | "Edit" | "Read" => {
            let verb = match name {
                "Write" => "Writing",
                "Edit" => "Editing",
                _ => "Reading",
            };
            match field("file_path") {
                Some(path) => format!("{} {}", verb, shorten_path(path)),
                None => format!("{} file...", verb),
            }
        }
        "Glob" => match field("pattern") {
            Some(p) => format!("Searching files: {}", p),
            None => "Searching files...".to_string(),
        },
        "Grep" => match field("pattern") {
            Some(p) => format!("Searching for: {}", p),
            None => "Searching code...".to_string(),
        },
        "Bash" => match field("command") {
            Some(cmd) => format!("Running: {}", truncate_str(cmd, 60)),
            None => "Running command...".to_string(),
        },
        "" => "Working...".to_string(),
        other => format!("Using {}", other),
    }
}

/// Shorten a file path to just the last 2 components
fn shorten_path(path: &str) -> String {
    let parts: Vec<&str> = path.split('/').collect();
    if parts.len() <= 2 {
        path.to_string()
    } else {
        parts[parts.len() - 2..].join("/")
    }
}

/// Keep the first `max_chars` characters, marking the cut with an ellipsis.
fn truncate_str(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}…", &s[..idx]),
        None => s.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_assistant_tool_use() {
        let line = r#"{"type":"assistant","message":{"content":[{"type":"tool_use","name":"Read","input":{"file_path":"/foo/src/bar.rs"},"id":"123"}]},"session_id":"abc"}"#;
        let mut acc = StreamAccumulator::new();
        let effect = acc.handle_line(line);
        assert!(effect.is_json);
        assert_eq!(effect.progress, vec!["Reading src/bar.rs"]);
        assert!(acc.text.is_empty());
    }

    #[test]
    fn test_text_accumulates_and_usage_adds() {
        let mut acc = StreamAccumulator::new();
        acc.handle_line(r#"{"type":"assistant","message":{"content":[{"type":"text","text":"He"}],"usage":{"input_tokens":10,"output_tokens":2}}}"#);
        acc.handle_line(r#"{"type":"assistant","message":{"content":[{"type":"thinking","thinking":"hm"},{"type":"text","text":"llo"}],"usage":{"input_tokens":5,"output_tokens":3}}}"#);
        assert_eq!(acc.text, "Hello");
        assert_eq!((acc.tokens_in, acc.tokens_out), (15, 5));
    }

    #[test]
    fn test_result_is_authoritative() {
        let mut acc = StreamAccumulator::new();
        acc.handle_line(r#"{"type":"assistant","message":{"content":[{"type":"text","text":"draft"}],"usage":{"input_tokens":7,"output_tokens":7}}}"#);
        acc.handle_line(r#"{"type":"result","subtype":"success","result":"final","usage":{"input_tokens":100,"output_tokens":40}}"#);
        assert_eq!(acc.text, "final");
        assert_eq!((acc.tokens_in, acc.tokens_out), (100, 40));
    }

    #[test]
    fn test_empty_result_keeps_text() {
        let mut acc = StreamAccumulator::new();
        acc.handle_line(r#"{"type":"assistant","message":{"content":[{"type":"text","text":"kept"}]}}"#);
        acc.handle_line(r#"{"type":"result","result":""}"#);
        assert_eq!(acc.text, "kept");
    }

    #[test]
    fn test_non_json_and_unknown_types() {
        let mut acc = StreamAccumulator::new();
        assert!(!acc.handle_line("plain text").is_json);
        assert!(!acc.handle_line("[1,2]").is_json);
        let effect = acc.handle_line(r#"{"type":"system","subtype":"init"}"#);
        assert!(effect.is_json);
        assert!(effect.progress.is_empty());
        assert!(acc.handle_line(r#"{"no_type":true}"#).is_json);
    }

    #[test]
    fn test_describe_tool_use() {
        assert_eq!(describe_tool_use("Write", &json!({"file_path": "a.rs"})), "Writing a.rs");
        assert_eq!(describe_tool_use("Edit", &json!({})), "Editing file...");
        assert_eq!(describe_tool_use("Glob", &json!({"pattern": "**/*.go"})), "Searching files: **/*.go");
        assert_eq!(describe_tool_use("Grep", &json!({"pattern": "fn main"})), "Searching for: fn main");
        assert_eq!(describe_tool_use("Grep", &json!({})), "Searching code...");
        assert_eq!(describe_tool_use("WebFetch", &json!({})), "Using WebFetch");
        assert_eq!(describe_tool_use("", &json!({})), "Working...");

        let long = "x".repeat(80);
        let desc = describe_tool_use("Bash", &json!({"command": long}));
        assert_eq!(desc, format!("Running: {}…", "x".repeat(60)));
        assert_eq!(describe_tool_use("Bash", &json!({"command": "ls"})), "Running: ls");
    }

    #[test]
    fn test_shorten_path() {
        assert_eq!(shorten_path("/a/b/c/d.rs"), "c/d.rs");
        assert_eq!(shorten_path("b/c.rs"), "b/c.rs");
    }
}
