//! Clients for the external systems a run talks to: the issue tracker
//! (Linear), the document host (Notion) and the code host (GitHub via `gh`).
//!
//! The HTTP clients are optional: an empty API key leaves them unconfigured
//! and the phases fall back to asking the agent to use its MCP tools.

pub mod github;
pub mod linear;
pub mod notion;

pub use github::GitHubClient;
pub use linear::LinearClient;
pub use notion::NotionClient;

/// Treat blank keys as absent.
fn non_empty(key: Option<String>) -> Option<String> {
    key.map(|k| k.trim().to_string()).filter(|k| !k.is_empty())
}

fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .user_agent(concat!("sdlc/", env!("CARGO_PKG_VERSION")))
        .build()
        .unwrap_or_default()
}
