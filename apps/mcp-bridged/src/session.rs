//! Session keys and the stateful session registry.
//!
//! A stateful server keeps one subprocess per `(server, session key)`.
//! Calls within a session are serialized through the session lock; sessions
//! idle past their timeout (or whose adapter died) are reaped.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::{Duration, Instant};

use axum::http::HeaderMap;
use bridge_mcp::{AdapterError, LaunchSpec, StdioAdapter};
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::ServerSpec;
use crate::jobs::{JobWorkspaces, Workspace};
use crate::pathmap::substitute_workdir;

pub const USER_ID_HEADER: &str = "x-openwebui-user-id";
pub const CHAT_ID_HEADER: &str = "x-openwebui-chat-id";

/// Routing key for stateful sessions, derived from identity headers with a
/// client-IP fallback.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SessionKey {
    User { user_id: String, chat_id: String },
    Ip(String),
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionKey::User { user_id, chat_id } => write!(f, "user:{user_id}:chat:{chat_id}"),
            SessionKey::Ip(ip) => write!(f, "ip:{ip}"),
        }
    }
}

impl SessionKey {
    /// Both identity headers present and non-empty wins; otherwise fall back
    /// to the client address. Empty-string headers count as absent.
    pub fn derive(headers: &HeaderMap, client_ip: &str) -> Self {
        let user_id = non_empty_header(headers, USER_ID_HEADER);
        let chat_id = non_empty_header(headers, CHAT_ID_HEADER);
        match (user_id, chat_id) {
            (Some(user_id), Some(chat_id)) => SessionKey::User { user_id, chat_id },
            _ => SessionKey::Ip(client_ip.to_string()),
        }
    }
}

fn non_empty_header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Client address for the IP fallback: proxy headers first, then the socket
/// peer. Invalid literals are skipped rather than trusted.
pub fn client_ip(headers: &HeaderMap, peer: Option<IpAddr>) -> String {
    if let Some(forwarded) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok())
        && let Some(first) = forwarded.split(',').next()
    {
        let first = first.trim();
        if first.parse::<IpAddr>().is_ok() {
            return first.to_string();
        }
    }
    if let Some(real) = headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
        let real = real.trim();
        if real.parse::<IpAddr>().is_ok() {
            return real.to_string();
        }
    }
    match peer {
        Some(addr) => addr.to_string(),
        None => {
            warn!("no client address available, using 'unknown'");
            "unknown".to_string()
        }
    }
}

/// Build the subprocess launch from the catalog entry and the workspace,
/// substituting `{WORKDIR}` and exporting the workspace location the way the
/// servers expect it.
pub fn launch_spec(name: &str, spec: &ServerSpec, workspace: &Workspace) -> LaunchSpec {
    let mut env: HashMap<String, String> = spec
        .env
        .iter()
        .map(|(k, v)| (k.clone(), substitute_workdir(v, &workspace.dir)))
        .collect();
    env.insert(
        "MCPO_WORKDIR".to_string(),
        workspace.dir.to_string_lossy().into_owned(),
    );
    env.insert("MCPO_JOB_ID".to_string(), workspace.job_id.to_string());

    LaunchSpec {
        name: name.to_string(),
        command: spec.command.clone(),
        args: spec
            .args
            .iter()
            .map(|a| substitute_workdir(a, &workspace.dir))
            .collect(),
        env,
        cwd: Some(workspace.dir.clone()),
    }
}

pub struct Session {
    pub server: String,
    pub key: SessionKey,
    pub workspace: Workspace,
    pub adapter: StdioAdapter,
    pub idle_timeout: Duration,
    /// Serializes calls within this session in arrival order.
    pub lock: AsyncMutex<()>,
    created_at: Instant,
    last_active: StdMutex<Instant>,
    in_flight: AtomicU32,
}

impl Session {
    fn touch(&self) {
        *self
            .last_active
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    fn idle_for(&self, now: Instant) -> Duration {
        let last = *self
            .last_active
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        now.saturating_duration_since(last)
    }

    pub fn in_flight(&self) -> u32 {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }
}

/// Returned by `acquire`; releases the in-flight slot (and touches
/// `last_active`) on drop.
pub struct SessionHandle {
    session: Arc<Session>,
}

impl SessionHandle {
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        self.session.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.session.touch();
    }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("session capacity exceeded")]
    CapacityExceeded,

    #[error(transparent)]
    Spawn(AdapterError),

    #[error("workspace error: {0}")]
    Workspace(#[from] anyhow::Error),
}

#[derive(Default)]
struct SessionCell {
    slot: AsyncMutex<Option<Arc<Session>>>,
}

pub struct SessionRegistry {
    cells: StdMutex<HashMap<(String, SessionKey), Arc<SessionCell>>>,
    live: AtomicUsize,
    max_total: usize,
}

impl SessionRegistry {
    pub fn new(max_total: usize) -> Self {
        Self {
            cells: StdMutex::new(HashMap::new()),
            live: AtomicUsize::new(0),
            max_total,
        }
    }

    pub fn live_sessions(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn max_total(&self) -> usize {
        self.max_total
    }

    fn cell(&self, server: &str, key: &SessionKey) -> Arc<SessionCell> {
        let mut cells = self.cells.lock().unwrap_or_else(PoisonError::into_inner);
        cells
            .entry((server.to_string(), key.clone()))
            .or_default()
            .clone()
    }

    /// Locate or spawn the session for `(server, key)`.
    ///
    /// The registry map is only held long enough to fetch the per-key cell;
    /// spawning happens under the cell's own lock, so a slow server start
    /// never blocks unrelated sessions.
    pub async fn acquire(
        &self,
        server: &str,
        key: SessionKey,
        spec: &ServerSpec,
        jobs: &JobWorkspaces,
        idle_timeout: Duration,
        max_per_session: usize,
    ) -> Result<SessionHandle, RegistryError> {
        let cell = self.cell(server, &key);
        let mut slot = cell.slot.lock().await;

        let reusable = slot
            .as_ref()
            .filter(|session| session.adapter.is_alive())
            .cloned();
        if let Some(session) = reusable {
            session.touch();
            session.in_flight.fetch_add(1, Ordering::SeqCst);
            return Ok(SessionHandle { session });
        }
        // Anything still in the slot died on its own; clear it so we respawn.
        if let Some(dead) = slot.take() {
            self.live.fetch_sub(1, Ordering::SeqCst);
            info!(server, key = %dead.key, "removing dead session");
            tokio::spawn(async move { dead.adapter.close().await });
        }

        // A cell holds at most one live process per key, so the per-key cap
        // can only refuse at zero; the global cap does the real limiting.
        if max_per_session == 0 || self.live.load(Ordering::SeqCst) >= self.max_total {
            return Err(RegistryError::CapacityExceeded);
        }

        let workspace = jobs.create(server, Some(&key.to_string())).await?;
        let launch = launch_spec(server, spec, &workspace);
        let adapter = StdioAdapter::spawn(&launch)
            .await
            .map_err(RegistryError::Spawn)?;

        info!(server, key = %key, job_id = %workspace.job_id, "spawned stateful session");

        let session = Arc::new(Session {
            server: server.to_string(),
            key,
            workspace,
            adapter,
            idle_timeout,
            lock: AsyncMutex::new(()),
            created_at: Instant::now(),
            last_active: StdMutex::new(Instant::now()),
            in_flight: AtomicU32::new(1),
        });
        *slot = Some(session.clone());
        self.live.fetch_add(1, Ordering::SeqCst);

        Ok(SessionHandle { session })
    }

    /// Drop a session whose exchange failed so the next request respawns.
    /// No-op if the slot was already replaced.
    pub async fn invalidate(&self, session: &Arc<Session>) {
        let cell = self.cell(&session.server, &session.key);
        let mut slot = cell.slot.lock().await;
        let is_current = slot
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, session));
        if is_current && let Some(removed) = slot.take() {
            self.live.fetch_sub(1, Ordering::SeqCst);
            warn!(server = %removed.server, key = %removed.key, "invalidating session after failure");
            tokio::spawn(async move { removed.adapter.close().await });
        }
    }

    /// Remove idle and dead sessions. Sessions with requests in flight (or
    /// whose cell is busy spawning) are left alone. Workspaces are not
    /// deleted here; the GC sweep ages them out.
    pub async fn reap(&self, now: Instant) -> usize {
        let cells: Vec<(String, SessionKey, Arc<SessionCell>)> = {
            let cells = self.cells.lock().unwrap_or_else(PoisonError::into_inner);
            cells
                .iter()
                .map(|((server, key), cell)| (server.clone(), key.clone(), cell.clone()))
                .collect()
        };

        let mut reaped = 0;
        for (server, key, cell) in cells {
            let Ok(mut slot) = cell.slot.try_lock() else {
                continue;
            };
            let expired = match slot.as_ref() {
                Some(session) => {
                    let dead = !session.adapter.is_alive();
                    let idle = session.in_flight() == 0
                        && session.idle_for(now) > session.idle_timeout;
                    dead || idle
                }
                None => false,
            };
            if !expired {
                continue;
            }

            if let Some(removed) = slot.take() {
                info!(
                    server = %server,
                    key = %key,
                    idle_secs = removed.idle_for(now).as_secs(),
                    "reaping session"
                );
                self.live.fetch_sub(1, Ordering::SeqCst);
                reaped += 1;
                tokio::spawn(async move { removed.adapter.close().await });
            }
        }

        // Drop cells whose slot is empty so abandoned keys don't accumulate.
        {
            let mut cells = self.cells.lock().unwrap_or_else(PoisonError::into_inner);
            cells.retain(|_, cell| match cell.slot.try_lock() {
                Ok(slot) => slot.is_some(),
                Err(_) => true,
            });
        }

        reaped
    }

    /// Job ids of workspaces owned by live sessions; the GC sweep must never
    /// delete these.
    pub async fn live_job_ids(&self) -> HashSet<Uuid> {
        let cells: Vec<Arc<SessionCell>> = {
            let cells = self.cells.lock().unwrap_or_else(PoisonError::into_inner);
            cells.values().cloned().collect()
        };
        let mut ids = HashSet::new();
        for cell in cells {
            let slot = cell.slot.lock().await;
            if let Some(session) = slot.as_ref() {
                ids.insert(session.workspace.job_id);
            }
        }
        ids
    }

    /// Close every session; used on daemon shutdown.
    pub async fn shutdown(&self) {
        let cells: Vec<Arc<SessionCell>> = {
            let cells = self.cells.lock().unwrap_or_else(PoisonError::into_inner);
            cells.values().cloned().collect()
        };
        let mut closed = 0usize;
        for cell in cells {
            let mut slot = cell.slot.lock().await;
            if let Some(session) = slot.take() {
                self.live.fetch_sub(1, Ordering::SeqCst);
                session.adapter.close().await;
                closed += 1;
            }
        }
        info!(closed, "session registry shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use std::path::Path;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut h = HeaderMap::new();
        for (k, v) in pairs {
            h.insert(
                axum::http::HeaderName::from_bytes(k.as_bytes()).expect("header name"),
                HeaderValue::from_str(v).expect("header value"),
            );
        }
        h
    }

    #[test]
    fn key_prefers_identity_headers() {
        let h = headers(&[("X-OpenWebUI-User-Id", "u1"), ("X-OpenWebUI-Chat-Id", "c1")]);
        assert_eq!(
            SessionKey::derive(&h, "10.0.0.1"),
            SessionKey::User {
                user_id: "u1".to_string(),
                chat_id: "c1".to_string()
            }
        );
    }

    #[test]
    fn key_derivation_is_deterministic() {
        let h = headers(&[("X-OpenWebUI-User-Id", "u1"), ("X-OpenWebUI-Chat-Id", "c1")]);
        assert_eq!(
            SessionKey::derive(&h, "10.0.0.1"),
            SessionKey::derive(&h, "10.0.0.2"),
            "identity keys must not depend on the client address"
        );
    }

    #[test]
    fn key_falls_back_to_ip_when_either_header_is_missing_or_empty() {
        let only_user = headers(&[("X-OpenWebUI-User-Id", "u1")]);
        assert_eq!(
            SessionKey::derive(&only_user, "10.0.0.1"),
            SessionKey::Ip("10.0.0.1".to_string())
        );

        let empty_chat = headers(&[("X-OpenWebUI-User-Id", "u1"), ("X-OpenWebUI-Chat-Id", "  ")]);
        assert_eq!(
            SessionKey::derive(&empty_chat, "10.0.0.1"),
            SessionKey::Ip("10.0.0.1".to_string()),
            "empty-string headers count as absent"
        );
    }

    #[test]
    fn client_ip_prefers_forwarded_for() {
        let h = headers(&[("X-Forwarded-For", "203.0.113.9, 10.0.0.1")]);
        assert_eq!(client_ip(&h, Some("127.0.0.1".parse().expect("ip"))), "203.0.113.9");

        let h = headers(&[("X-Forwarded-For", "not-an-ip"), ("X-Real-IP", "203.0.113.7")]);
        assert_eq!(client_ip(&h, None), "203.0.113.7");

        let h = HeaderMap::new();
        assert_eq!(client_ip(&h, Some("192.0.2.4".parse().expect("ip"))), "192.0.2.4");
        assert_eq!(client_ip(&h, None), "unknown");
    }

    #[test]
    fn launch_spec_substitutes_workdir() {
        let spec = ServerSpec {
            command: "pptx-mcp".to_string(),
            args: vec!["--workdir".to_string(), "{WORKDIR}".to_string()],
            env: HashMap::from([("PPTX_HOME".to_string(), "{WORKDIR}/home".to_string())]),
            mode: crate::config::ServerMode::Stateful,
            idle_timeout: None,
            max_processes_per_chat: None,
            session_persistence: true,
            file_path_fields: vec![],
            resolve_path_fields: vec![],
            usage_guide: None,
        };
        let workspace = Workspace {
            job_id: Uuid::new_v4(),
            dir: "/jobs/abc".into(),
        };

        let launch = launch_spec("pp", &spec, &workspace);
        assert_eq!(launch.args, ["--workdir", "/jobs/abc"]);
        assert_eq!(launch.env["PPTX_HOME"], "/jobs/abc/home");
        assert_eq!(launch.env["MCPO_WORKDIR"], "/jobs/abc");
        assert_eq!(launch.cwd.as_deref(), Some(Path::new("/jobs/abc")));
    }
}
