//! Runtime settings and the MCP server catalog.
//!
//! Settings come from CLI flags / environment (see `main.rs`); the catalog
//! is a single JSON document with a top-level `mcpServers` object, one entry
//! per launchable server.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context as _;
use serde::Deserialize;

#[derive(Debug, Clone)]
pub struct Settings {
    pub bind_addr: SocketAddr,
    /// Prefix for generated download URLs, e.g. `http://files.example.com`.
    pub base_url: String,
    pub jobs_dir: PathBuf,
    /// Global cap on concurrent in-flight subprocess calls.
    pub max_concurrent: usize,
    /// Per-call deadline.
    pub timeout: Duration,
    /// How long workspaces (and the download URLs into them) stay valid.
    pub file_expiry: Duration,
    /// Master switch; when off, every server runs ephemeral.
    pub stateful_enabled: bool,
    pub stateful_default_idle_timeout: Duration,
    pub stateful_max_per_session: usize,
    pub stateful_max_total: usize,
    pub cleanup_interval: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bind_addr: ([0, 0, 0, 0], 8080).into(),
            base_url: "http://127.0.0.1:8080".to_string(),
            jobs_dir: PathBuf::from("/tmp/mcpo-jobs"),
            max_concurrent: 16,
            timeout: Duration::from_secs(300),
            file_expiry: Duration::from_secs(3600),
            stateful_enabled: true,
            stateful_default_idle_timeout: Duration::from_secs(1800),
            stateful_max_per_session: 1,
            stateful_max_total: 100,
            cleanup_interval: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerMode {
    #[default]
    Ephemeral,
    Stateful,
}

fn default_true() -> bool {
    true
}

fn default_file_path_fields() -> Vec<String> {
    vec!["file_path".to_string()]
}

/// One entry of the `mcpServers` catalog.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSpec {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Values (and `args`) may carry the `{WORKDIR}` token, substituted with
    /// the workspace path at spawn time.
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub mode: ServerMode,
    /// Seconds of inactivity before a stateful session is reaped.
    pub idle_timeout: Option<u64>,
    pub max_processes_per_chat: Option<usize>,
    #[serde(default = "default_true")]
    pub session_persistence: bool,
    /// Response fields whose string values name generated files to expose
    /// as downloads.
    #[serde(default = "default_file_path_fields")]
    pub file_path_fields: Vec<String>,
    /// Request fields whose string values are rewritten to
    /// workspace-absolute paths.
    #[serde(default)]
    pub resolve_path_fields: Vec<String>,
    pub usage_guide: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CatalogFile {
    #[serde(rename = "mcpServers")]
    mcp_servers: HashMap<String, ServerSpec>,
}

#[derive(Debug, Clone)]
pub struct ServerCatalog {
    servers: HashMap<String, ServerSpec>,
}

impl ServerCatalog {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read config file {}", path.display()))?;
        Self::from_json(&raw).with_context(|| format!("parse config file {}", path.display()))
    }

    pub fn from_json(raw: &str) -> anyhow::Result<Self> {
        let file: CatalogFile = serde_json::from_str(raw).context("parse mcpServers document")?;
        Ok(Self {
            servers: file.mcp_servers,
        })
    }

    pub fn get(&self, name: &str) -> Option<&ServerSpec> {
        self.servers.get(name)
    }

    pub fn server_names(&self) -> impl Iterator<Item = &str> {
        self.servers.keys().map(String::as_str)
    }

    /// A server keeps its process across requests only when its own mode and
    /// persistence flag say so AND the global switch is on.
    pub fn is_stateful(&self, spec: &ServerSpec, settings: &Settings) -> bool {
        spec.mode == ServerMode::Stateful && spec.session_persistence && settings.stateful_enabled
    }

    pub fn idle_timeout(&self, spec: &ServerSpec, settings: &Settings) -> Duration {
        spec.idle_timeout
            .map(Duration::from_secs)
            .unwrap_or(settings.stateful_default_idle_timeout)
    }

    pub fn max_per_session(&self, spec: &ServerSpec, settings: &Settings) -> usize {
        spec.max_processes_per_chat
            .unwrap_or(settings.stateful_max_per_session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CATALOG: &str = r#"{
        "mcpServers": {
            "powerpoint": {
                "command": "uvx",
                "args": ["pptx-mcp", "--workdir", "{WORKDIR}"],
                "env": { "PPTX_HOME": "{WORKDIR}" },
                "mode": "stateful",
                "idle_timeout": 600,
                "file_path_fields": ["file_path", "output_path"],
                "resolve_path_fields": ["file_path"],
                "usage_guide": "HELLO"
            },
            "converter": {
                "command": "converter-mcp"
            }
        }
    }"#;

    #[test]
    fn catalog_parses_with_defaults() {
        let catalog = ServerCatalog::from_json(CATALOG).expect("parse");
        let settings = Settings::default();

        let pp = catalog.get("powerpoint").expect("powerpoint entry");
        assert_eq!(pp.mode, ServerMode::Stateful);
        assert!(catalog.is_stateful(pp, &settings));
        assert_eq!(catalog.idle_timeout(pp, &settings), Duration::from_secs(600));
        assert_eq!(pp.usage_guide.as_deref(), Some("HELLO"));
        assert_eq!(pp.file_path_fields, ["file_path", "output_path"]);

        let conv = catalog.get("converter").expect("converter entry");
        assert_eq!(conv.mode, ServerMode::Ephemeral);
        assert!(!catalog.is_stateful(conv, &settings));
        assert!(conv.session_persistence, "defaults to true");
        assert_eq!(conv.file_path_fields, ["file_path"], "default field list");
        assert_eq!(
            catalog.idle_timeout(conv, &settings),
            settings.stateful_default_idle_timeout
        );
        assert_eq!(catalog.max_per_session(conv, &settings), 1);

        assert!(catalog.get("unknown").is_none());
    }

    #[test]
    fn stateful_master_switch_wins() {
        let catalog = ServerCatalog::from_json(CATALOG).expect("parse");
        let settings = Settings {
            stateful_enabled: false,
            ..Settings::default()
        };
        let pp = catalog.get("powerpoint").expect("powerpoint entry");
        assert!(!catalog.is_stateful(pp, &settings));
    }

    #[test]
    fn missing_command_is_rejected() {
        let err = ServerCatalog::from_json(r#"{"mcpServers":{"bad":{"args":[]}}}"#)
            .err()
            .expect("must fail");
        assert!(format!("{err:#}").contains("command"), "got {err:#}");
    }

    #[test]
    fn missing_top_level_key_is_rejected() {
        assert!(ServerCatalog::from_json(r#"{"servers":{}}"#).is_err());
    }
}
