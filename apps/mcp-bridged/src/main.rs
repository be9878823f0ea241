use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::Parser;
use tracing::{info, warn};

use mcp_bridged::app::{self, AppState};
use mcp_bridged::config::{ServerCatalog, Settings};
use mcp_bridged::gc::GarbageCollector;

#[derive(Debug, Clone, Parser)]
#[command(name = "mcp-bridged", version, about = "HTTP bridge for stdio MCP servers")]
struct Args {
    /// Address to listen on.
    #[arg(long, env = "BIND_ADDR", default_value = "0.0.0.0:8080")]
    bind_addr: SocketAddr,

    /// Prefix for generated download URLs (the static file server fronting
    /// the jobs directory).
    #[arg(long, env = "BASE_URL", default_value = "http://127.0.0.1:8080")]
    base_url: String,

    /// Path to the mcpServers catalog.
    #[arg(long, env = "CONFIG_FILE", default_value = "mcp-servers.json")]
    config_file: PathBuf,

    /// Root directory for per-session workspaces.
    #[arg(long, env = "JOBS_DIR", default_value = "/tmp/mcpo-jobs")]
    jobs_dir: PathBuf,

    /// Global cap on concurrent in-flight subprocess calls.
    #[arg(long, env = "MAX_CONCURRENT", default_value_t = 16)]
    max_concurrent: usize,

    /// Per-call timeout in seconds.
    #[arg(long, env = "TIMEOUT", default_value_t = 300)]
    timeout: u64,

    /// How long generated files (and their workspaces) stay downloadable,
    /// in seconds.
    #[arg(long, env = "FILE_EXPIRY", default_value_t = 3600)]
    file_expiry: u64,

    /// Default tracing filter when RUST_LOG is unset.
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Master switch for stateful sessions; off forces every server into
    /// ephemeral mode.
    #[arg(long, env = "STATEFUL_ENABLED", default_value_t = true, action = clap::ArgAction::Set)]
    stateful_enabled: bool,

    /// Idle timeout in seconds for servers that do not set their own.
    #[arg(long, env = "STATEFUL_DEFAULT_IDLE_TIMEOUT", default_value_t = 1800)]
    stateful_default_idle_timeout: u64,

    /// Per-session process cap for servers that do not set their own.
    #[arg(long, env = "STATEFUL_MAX_PROCESSES_PER_CHAT", default_value_t = 1)]
    stateful_max_processes_per_chat: usize,

    /// Global cap on live stateful sessions.
    #[arg(long, env = "STATEFUL_MAX_TOTAL_PROCESSES", default_value_t = 100)]
    stateful_max_total_processes: usize,

    /// Seconds between garbage-collection passes (session reaping and
    /// workspace expiry).
    #[arg(long, env = "STATEFUL_CLEANUP_INTERVAL", default_value_t = 300)]
    stateful_cleanup_interval: u64,
}

impl Args {
    fn settings(&self) -> Settings {
        Settings {
            bind_addr: self.bind_addr,
            base_url: self.base_url.clone(),
            jobs_dir: self.jobs_dir.clone(),
            max_concurrent: self.max_concurrent,
            timeout: Duration::from_secs(self.timeout),
            file_expiry: Duration::from_secs(self.file_expiry),
            stateful_enabled: self.stateful_enabled,
            stateful_default_idle_timeout: Duration::from_secs(self.stateful_default_idle_timeout),
            stateful_max_per_session: self.stateful_max_processes_per_chat,
            stateful_max_total: self.stateful_max_total_processes,
            cleanup_interval: Duration::from_secs(self.stateful_cleanup_interval),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.clone().into()),
        )
        .json()
        .init();

    let settings = args.settings();
    let catalog = ServerCatalog::load(&args.config_file)?;
    info!(
        config = %args.config_file.display(),
        jobs_dir = %settings.jobs_dir.display(),
        max_concurrent = settings.max_concurrent,
        stateful = settings.stateful_enabled,
        servers = catalog.server_names().count(),
        "mcp-bridged starting"
    );

    let state = AppState::new(settings.clone(), catalog).context("initialize state")?;

    let gc = Arc::new(GarbageCollector::new(
        state.jobs.clone(),
        state.registry.clone(),
        settings.file_expiry,
        settings.cleanup_interval,
    ));
    // Clear out whatever a previous instance left behind before serving.
    gc.collect().await;
    let gc_task = tokio::spawn(gc.run());

    let serve_result = app::serve_tcp(settings.bind_addr, state.clone()).await;

    info!("shutting down: closing sessions");
    gc_task.abort();
    if tokio::time::timeout(Duration::from_secs(30), state.registry.shutdown())
        .await
        .is_err()
    {
        warn!("session shutdown timed out after 30s");
    }

    serve_result
}
