//! Pulling structured data out of free-form agent output.

use regex::Regex;
use std::sync::LazyLock;

static FENCED_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```(?:json)?\s*\n(.*?)```").unwrap());

/// Return the first JSON value embedded in `output`.
///
/// A fenced code block wins if present (its body is returned trimmed, valid
/// or not). Otherwise the slice from the first `{` or `[` up to its matching
/// closer is returned, skipping brackets inside string literals. `None` when
/// there is no opener or it is never closed.
pub fn extract_json(output: &str) -> Option<&str> {
    if let Some(caps) = FENCED_BLOCK.captures(output)
        && let Some(body) = caps.get(1)
    {
        return Some(body.as_str().trim());
    }

    let start = output.find(['{', '['])?;
    let bytes = output.as_bytes();
    let opener = bytes[start];
    let closer = if opener == b'[' { b']' } else { b'}' };

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, &c) in bytes.iter().enumerate().skip(start) {
        if escaped {
            escaped = false;
            continue;
        }
        if c == b'\\' && in_string {
            escaped = true;
            continue;
        }
        if c == b'"' {
            in_string = !in_string;
            continue;
        }
        if in_string {
            continue;
        }
        if c == opener {
            depth += 1;
        } else if c == closer {
            depth -= 1;
            if depth == 0 {
                return Some(&output[start..=i]);
            }
        }
    }
    None
}

/// Body under the first `#` heading whose text contains `heading`
/// (case-insensitive), up to the next heading of the same or higher level.
pub fn extract_markdown_section(output: &str, heading: &str) -> String {
    let needle = heading.to_lowercase();
    let mut level = None;
    let mut body = String::new();

    for line in output.lines() {
        let trimmed = line.trim();
        let hashes = trimmed.chars().take_while(|&c| c == '#').count();
        match level {
            None => {
                if hashes > 0 && trimmed.to_lowercase().contains(&needle) {
                    level = Some(hashes);
                }
            }
            Some(target) => {
                if hashes > 0 && hashes <= target {
                    break;
                }
                body.push_str(line);
                body.push('\n');
            }
        }
    }
    body.trim().to_string()
}
