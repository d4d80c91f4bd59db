use std::sync::LazyLock;

use anyhow::{Context, Result};
use regex::Regex;
use serde::Deserialize;
use serde_json::{Value, json};

const NOTION_API_URL: &str = "https://api.notion.com/v1";
const NOTION_VERSION: &str = "2022-06-28";
/// Notion accepts at most this many children per request.
const MAX_CHILDREN: usize = 100;
/// Notion's limit on a single rich-text content string.
const MAX_TEXT_LEN: usize = 2000;

static PAGE_ID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)[0-9a-f]{8}-?[0-9a-f]{4}-?[0-9a-f]{4}-?[0-9a-f]{4}-?[0-9a-f]{12}").unwrap()
});

/// Whether `s` looks like a Notion page URL.
pub fn is_notion_url(s: &str) -> bool {
    s.contains("notion.so") || s.contains("notion.site")
}

/// Extract the 32-hex page id from a URL or id (dashes optional).
/// Inputs without one are returned unchanged.
pub fn extract_page_id(url_or_id: &str) -> String {
    let path = url_or_id.split(['?', '#']).next().unwrap_or(url_or_id);
    match PAGE_ID.find_iter(path).last() {
        Some(m) => m.as_str().replace('-', "").to_lowercase(),
        None => url_or_id.to_string(),
    }
}

#[derive(Debug, Deserialize)]
struct BlockList {
    #[serde(default)]
    results: Vec<Value>,
    #[serde(default)]
    has_more: bool,
    #[serde(default)]
    next_cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CreatedPage {
    id: String,
    #[serde(default)]
    url: String,
}

/// Notion REST client. Unconfigured when no API key is present.
#[derive(Debug, Clone)]
pub struct NotionClient {
    api_key: Option<String>,
    base_url: String,
    http: reqwest::Client,
}

impl NotionClient {
    pub fn new(api_key: Option<String>) -> Self {
        Self {
            api_key: super::non_empty(api_key),
            base_url: NOTION_API_URL.to_string(),
            http: super::http_client(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }

    /// Read a page's top-level blocks as markdown.
    pub async fn read_page(&self, url_or_id: &str) -> Result<String> {
        let page_id = extract_page_id(url_or_id);
        let mut markdown = String::new();
        let mut cursor: Option<String> = None;

        loop {
            let mut url = format!(
                "{}/blocks/{}/children?page_size={}",
                self.base_url, page_id, MAX_CHILDREN
            );
            if let Some(c) = &cursor {
                url.push_str("&start_cursor=");
                url.push_str(c);
            }
            let page: BlockList = self.send(self.http.get(&url)).await?;
            for block in &page.results {
                if let Some(md) = block_to_markdown(block) {
                    markdown.push_str(&md);
                }
            }
            match page.next_cursor {
                Some(next) if page.has_more => cursor = Some(next),
                _ => break,
            }
        }
        Ok(markdown)
    }

    /// Create a child page of `parent` from markdown; returns the page URL.
    pub async fn create_page(&self, parent: &str, title: &str, content: &str) -> Result<String> {
        let parent_id = extract_page_id(parent);
        let blocks = markdown_to_blocks(content);
        let mut chunks = blocks.chunks(MAX_CHILDREN);

        let payload = json!({
            "parent": { "page_id": parent_id },
            "properties": {
                "title": [{ "text": { "content": title } }]
            },
            "children": chunks.next().unwrap_or_default(),
        });
        let url = format!("{}/pages", self.base_url);
        let page: CreatedPage = self.send(self.http.post(&url).json(&payload)).await?;

        for chunk in chunks {
            let url = format!("{}/blocks/{}/children", self.base_url, page.id);
            let _: Value = self
                .send(self.http.patch(&url).json(&json!({ "children": chunk })))
                .await?;
        }
        Ok(page.url)
    }

    async fn send<T: serde::de::DeserializeOwned>(
        &self,
        req: reqwest::RequestBuilder,
    ) -> Result<T> {
        let Some(key) = &self.api_key else {
            anyhow::bail!("NOTION_API_KEY not set");
        };
        let resp = req
            .bearer_auth(key)
            .header("Notion-Version", NOTION_VERSION)
            .send()
            .await
            .context("notion request")?;

        let status = resp.status();
        let text = resp.text().await.context("read notion response")?;
        if !status.is_success() {
            anyhow::bail!("notion HTTP {}: {}", status.as_u16(), text);
        }
        serde_json::from_str(&text).context("parse notion response")
    }
}

fn rich_text(block: &Value, kind: &str) -> String {
    block[kind]["rich_text"]
        .as_array()
        .map(|parts| {
            parts
                .iter()
                .filter_map(|p| p["plain_text"].as_str())
                .collect::<String>()
        })
        .unwrap_or_default()
}

/// Render one block; unsupported types yield `None`.
fn block_to_markdown(block: &Value) -> Option<String> {
    let kind = block["type"].as_str()?;
    let text = rich_text(block, kind);
    let md = match kind {
        "heading_1" => format!("# {}\n\n", text),
        "heading_2" => format!("## {}\n\n", text),
        "heading_3" => format!("### {}\n\n", text),
        "paragraph" => format!("{}\n\n", text),
        "bulleted_list_item" => format!("- {}\n", text),
        "numbered_list_item" => format!("1. {}\n", text),
        "quote" => format!("> {}\n\n", text),
        "to_do" => {
            let mark = if block["to_do"]["checked"].as_bool() == Some(true) {
                "x"
            } else {
                " "
            };
            format!("- [{}] {}\n", mark, text)
        }
        "code" => {
            let lang = block["code"]["language"].as_str().unwrap_or_default();
            format!("```{}\n{}\n```\n\n", lang, text)
        }
        "divider" => "---\n\n".to_string(),
        _ => return None,
    };
    Some(md)
}

fn text_block(kind: &str, text: &str) -> Value {
    let content: String = text.chars().take(MAX_TEXT_LEN).collect();
    json!({
        "object": "block",
        "type": kind,
        kind: {
            "rich_text": [{ "type": "text", "text": { "content": content } }]
        }
    })
}

/// Convert markdown into Notion blocks, one per non-blank line.
/// Fenced code is kept together as a single code block.
pub fn markdown_to_blocks(content: &str) -> Vec<Value> {
    let mut blocks = Vec::new();
    let mut code: Option<Vec<&str>> = None;

    for raw in content.lines() {
        let line = raw.trim();
        if line.starts_with("```") {
            match code.take() {
                Some(body) => blocks.push(text_block("code", &body.join("\n"))),
                None => code = Some(Vec::new()),
            }
            continue;
        }
        if let Some(body) = code.as_mut() {
            body.push(raw);
            continue;
        }
        if line.is_empty() {
            continue;
        }

        let block = if let Some(rest) = line.strip_prefix("### ") {
            text_block("heading_3", rest)
        } else if let Some(rest) = line.strip_prefix("## ") {
            text_block("heading_2", rest)
        } else if let Some(rest) = line.strip_prefix("# ") {
            text_block("heading_1", rest)
        } else if let Some(rest) = line.strip_prefix("- ").or_else(|| line.strip_prefix("* ")) {
            text_block("bulleted_list_item", rest)
        } else if let Some(rest) = line.strip_prefix("> ") {
            text_block("quote", rest)
        } else if let Some(rest) = numbered_item(line) {
            text_block("numbered_list_item", rest)
        } else {
            text_block("paragraph", line)
        };
        blocks.push(block);
    }

    if let Some(body) = code {
        blocks.push(text_block("code", &body.join("\n")));
    }
    blocks
}

fn numbered_item(line: &str) -> Option<&str> {
    let digits = line.chars().take_while(|c| c.is_ascii_digit()).count();
    if digits == 0 {
        return None;
    }
    line[digits..].strip_prefix(". ")
}
