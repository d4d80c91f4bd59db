use std::path::PathBuf;

/// Default HTTP port for `sdlc serve`.
pub const DEFAULT_PORT: u16 = 3000;
/// Default SQLite database path.
pub const DEFAULT_DB_PATH: &str = "sdlc.db";

/// Runtime configuration read from the environment.
///
/// `main` loads `.env` with dotenvy before calling [`Config::from_env`];
/// CLI flags then override `port` and `db_path`.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub port: u16,
    pub db_path: PathBuf,
    /// Agent command line, split on whitespace (`claude` when unset).
    pub claude_cmd: String,
    pub linear_api_key: Option<String>,
    pub notion_api_key: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            db_path: PathBuf::from(DEFAULT_DB_PATH),
            claude_cmd: "claude".to_string(),
            linear_api_key: None,
            notion_api_key: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source. Blank values count as unset
    /// and an unparsable `PORT` falls back to the default.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| get(key).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();
        Self {
            port: get("PORT")
                .and_then(|p| p.trim().parse().ok())
                .unwrap_or(defaults.port),
            db_path: get("DB_PATH").map(PathBuf::from).unwrap_or(defaults.db_path),
            claude_cmd: get("CLAUDE_CMD").unwrap_or(defaults.claude_cmd),
            linear_api_key: get("LINEAR_API_KEY"),
            notion_api_key: get("NOTION_API_KEY"),
        }
    }

    /// Apply CLI overrides.
    pub fn with_overrides(mut self, port: Option<u16>, db: Option<PathBuf>) -> Self {
        if let Some(port) = port {
            self.port = port;
        }
        if let Some(db) = db {
            self.db_path = db;
        }
        self
    }
}
