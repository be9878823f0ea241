//! Subprocess adapter: owns one MCP server child process and exposes a
//! concurrency-safe `call` over its line-delimited stdio.
//!
//! Framing: one JSON object per `\n`-terminated line in both directions.
//! Writes go through a single writer task so concurrent callers can never
//! interleave bytes within a line. A single reader task drains stdout and
//! completes waiters by id; stderr is logged and never parsed.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt as _, AsyncWriteExt as _, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::Mutex as AsyncMutex;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::jsonrpc::{JsonRpcError, JsonRpcId, JsonRpcNotification, JsonRpcRequest};

/// How to launch an MCP server subprocess.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    /// Label used in logs and errors (typically the catalog server name).
    pub name: String,
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub cwd: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct AdapterOptions {
    /// How long to wait for a graceful exit (stdin closed) before `kill`.
    pub grace_period: Duration,
    /// Sliding window for the timeout health check. When more than half of
    /// the calls recorded in this window timed out (and at least two did),
    /// the adapter tears itself down.
    pub timeout_window: Duration,
}

impl Default for AdapterOptions {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(10),
            timeout_window: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum AdapterState {
    Starting = 0,
    Ready = 1,
    Terminating = 2,
    Dead = 3,
}

impl AdapterState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => AdapterState::Starting,
            1 => AdapterState::Ready,
            2 => AdapterState::Terminating,
            _ => AdapterState::Dead,
        }
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("failed to spawn `{command}`: {reason}")]
    Spawn { command: String, reason: String },

    #[error("call timed out after {0:?}")]
    Timeout(Duration),

    #[error("adapter terminated")]
    Terminated,

    /// The subprocess answered with a JSON-RPC `error` member. Carried
    /// verbatim so the dispatcher can forward it to the caller.
    #[error("upstream error {code}: {message}", code = .0.code, message = .0.message)]
    Rpc(JsonRpcError),

    #[error("transport error: {0}")]
    Transport(String),
}

enum WriterMsg {
    Line(String),
    /// Stop writing and drop stdin, signalling EOF to the child.
    Shutdown,
}

type Waiter = oneshot::Sender<Result<Value, AdapterError>>;

struct Shared {
    name: String,
    state: AtomicU8,
    pending: Mutex<HashMap<u64, Waiter>>,
    /// Recent call outcomes: (when recorded, timed out).
    outcomes: Mutex<VecDeque<(Instant, bool)>>,
    timeout_window: Duration,
}

impl Shared {
    /// Monotone state transition. Returns the previous state.
    fn advance(&self, to: AdapterState) -> AdapterState {
        AdapterState::from_u8(self.state.fetch_max(to as u8, Ordering::SeqCst))
    }

    fn state(&self) -> AdapterState {
        AdapterState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn take_waiter(&self, id: u64) -> Option<Waiter> {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
    }

    fn register_waiter(&self, id: u64, tx: Waiter) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, tx);
    }

    /// Fail every pending waiter with [`AdapterError::Terminated`].
    fn fail_pending(&self) {
        let drained: Vec<Waiter> = {
            let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
            pending.drain().map(|(_, tx)| tx).collect()
        };
        if !drained.is_empty() {
            warn!(
                server = %self.name,
                count = drained.len(),
                "failing pending calls: adapter terminated"
            );
        }
        for tx in drained {
            let _ = tx.send(Err(AdapterError::Terminated));
        }
    }

    /// Record one call outcome; returns true when the timeout ratio says the
    /// process should be torn down.
    fn record_outcome(&self, timed_out: bool) -> bool {
        let now = Instant::now();
        let mut win = self.outcomes.lock().unwrap_or_else(PoisonError::into_inner);
        win.push_back((now, timed_out));
        while let Some(&(t, _)) = win.front() {
            if now.duration_since(t) > self.timeout_window {
                win.pop_front();
            } else {
                break;
            }
        }
        let total = win.len();
        let timeouts = win.iter().filter(|(_, t)| *t).count();
        timed_out && timeouts >= 2 && timeouts * 2 > total
    }
}

/// In-process proxy for one MCP server subprocess.
///
/// `call` is safe to invoke concurrently; requests are correlated by a
/// monotone outbound id that is unrelated to any id the HTTP caller used.
pub struct StdioAdapter {
    shared: Arc<Shared>,
    child: Arc<AsyncMutex<Child>>,
    writer_tx: mpsc::Sender<WriterMsg>,
    next_id: AtomicU64,
    grace_period: Duration,
}

impl StdioAdapter {
    pub async fn spawn(spec: &LaunchSpec) -> Result<Self, AdapterError> {
        Self::spawn_with_options(spec, AdapterOptions::default()).await
    }

    pub async fn spawn_with_options(
        spec: &LaunchSpec,
        options: AdapterOptions,
    ) -> Result<Self, AdapterError> {
        let mut cmd = Command::new(&spec.command);
        cmd.args(&spec.args)
            .envs(&spec.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &spec.cwd {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|e| AdapterError::Spawn {
            command: spec.command.clone(),
            reason: e.to_string(),
        })?;

        let stdin = child.stdin.take().ok_or_else(|| AdapterError::Spawn {
            command: spec.command.clone(),
            reason: "failed to capture stdin".to_string(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| AdapterError::Spawn {
            command: spec.command.clone(),
            reason: "failed to capture stdout".to_string(),
        })?;
        let stderr = child.stderr.take();

        let shared = Arc::new(Shared {
            name: spec.name.clone(),
            state: AtomicU8::new(AdapterState::Starting as u8),
            pending: Mutex::new(HashMap::new()),
            outcomes: Mutex::new(VecDeque::new()),
            timeout_window: options.timeout_window,
        });
        let child = Arc::new(AsyncMutex::new(child));

        let (writer_tx, writer_rx) = mpsc::channel::<WriterMsg>(64);
        tokio::spawn(writer_loop(shared.clone(), stdin, writer_rx));
        tokio::spawn(reader_loop(
            shared.clone(),
            stdout,
            child.clone(),
            writer_tx.clone(),
            options.grace_period,
        ));
        if let Some(stderr) = stderr {
            let name = spec.name.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(server = %name, "stderr: {line}");
                }
            });
        }

        // No handshake is performed here: the first dispatched call doubles
        // as the readiness probe.
        shared.advance(AdapterState::Ready);

        debug!(server = %spec.name, command = %spec.command, "spawned MCP server process");

        Ok(Self {
            shared,
            child,
            writer_tx,
            next_id: AtomicU64::new(1),
            grace_period: options.grace_period,
        })
    }

    pub fn state(&self) -> AdapterState {
        self.shared.state()
    }

    pub fn is_alive(&self) -> bool {
        self.shared.state() <= AdapterState::Ready && !self.writer_tx.is_closed()
    }

    /// Issue one JSON-RPC request and await the matching response.
    ///
    /// On timeout the waiter is removed and the process left running; the
    /// response, if it ever arrives, is dropped by the reader. Repeated
    /// timeouts within the configured window tear the adapter down.
    pub async fn call(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, AdapterError> {
        if self.shared.state() > AdapterState::Ready {
            return Err(AdapterError::Terminated);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let req = JsonRpcRequest::new(JsonRpcId::Number(id as i64), method, params);
        let line = serde_json::to_string(&req).map_err(|e| AdapterError::Transport(e.to_string()))?;

        let (tx, rx) = oneshot::channel();
        self.shared.register_waiter(id, tx);

        if self.writer_tx.send(WriterMsg::Line(line)).await.is_err() {
            self.shared.take_waiter(id);
            return Err(AdapterError::Terminated);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => {
                self.shared.record_outcome(false);
                outcome
            }
            // Waiter dropped without completion: teardown raced us.
            Ok(Err(_)) => Err(AdapterError::Terminated),
            Err(_) => {
                self.shared.take_waiter(id);
                warn!(server = %self.shared.name, method, id, "call timed out");
                if self.shared.record_outcome(true) {
                    warn!(
                        server = %self.shared.name,
                        "too many timeouts in window, tearing adapter down"
                    );
                    let shared = self.shared.clone();
                    let child = self.child.clone();
                    let writer_tx = self.writer_tx.clone();
                    let grace = self.grace_period;
                    tokio::spawn(async move {
                        teardown(&shared, &child, &writer_tx, grace).await;
                    });
                }
                Err(AdapterError::Timeout(timeout))
            }
        }
    }

    /// Fire-and-forget JSON-RPC notification.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), AdapterError> {
        if self.shared.state() > AdapterState::Ready {
            return Err(AdapterError::Terminated);
        }
        let note = JsonRpcNotification::new(method, params);
        let line = serde_json::to_string(&note).map_err(|e| AdapterError::Transport(e.to_string()))?;
        self.writer_tx
            .send(WriterMsg::Line(line))
            .await
            .map_err(|_| AdapterError::Terminated)
    }

    /// Terminate the subprocess: stop writing, close stdin, wait out the
    /// grace period, then kill. All pending waiters fail with `Terminated`.
    pub async fn close(&self) {
        teardown(&self.shared, &self.child, &self.writer_tx, self.grace_period).await;
    }
}

async fn writer_loop(
    shared: Arc<Shared>,
    mut stdin: ChildStdin,
    mut rx: mpsc::Receiver<WriterMsg>,
) {
    while let Some(msg) = rx.recv().await {
        match msg {
            WriterMsg::Line(mut line) => {
                line.push('\n');
                if let Err(e) = stdin.write_all(line.as_bytes()).await {
                    warn!(server = %shared.name, error = %e, "stdin write failed");
                    break;
                }
                if let Err(e) = stdin.flush().await {
                    warn!(server = %shared.name, error = %e, "stdin flush failed");
                    break;
                }
            }
            WriterMsg::Shutdown => break,
        }
    }
    // Dropping stdin delivers EOF, the graceful half of termination.
}

async fn reader_loop(
    shared: Arc<Shared>,
    stdout: tokio::process::ChildStdout,
    child: Arc<AsyncMutex<Child>>,
    writer_tx: mpsc::Sender<WriterMsg>,
    grace: Duration,
) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let value: Value = match serde_json::from_str(line) {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(server = %shared.name, error = %e, "unparseable stdout line, terminating");
                        break;
                    }
                };
                dispatch_inbound(&shared, value);
            }
            Ok(None) => {
                debug!(server = %shared.name, "stdout closed");
                break;
            }
            Err(e) => {
                warn!(server = %shared.name, error = %e, "stdout read failed");
                break;
            }
        }
    }
    teardown(&shared, &child, &writer_tx, grace).await;
}

fn dispatch_inbound(shared: &Shared, value: Value) {
    match value.get("id").and_then(Value::as_u64) {
        Some(id) => match shared.take_waiter(id) {
            Some(tx) => {
                let outcome = match value.get("error") {
                    Some(err) => {
                        let rpc = serde_json::from_value::<JsonRpcError>(err.clone())
                            .unwrap_or_else(|_| JsonRpcError {
                                code: -32603,
                                message: "malformed error member".to_string(),
                                data: Some(err.clone()),
                            });
                        Err(AdapterError::Rpc(rpc))
                    }
                    None => Ok(value.get("result").cloned().unwrap_or(Value::Null)),
                };
                let _ = tx.send(outcome);
            }
            None => {
                // Late arrival after a timeout, or an id we never issued.
                warn!(server = %shared.name, id, "response with no pending waiter, dropped");
            }
        },
        None => {
            debug!(
                server = %shared.name,
                method = value.get("method").and_then(|v| v.as_str()).unwrap_or("?"),
                "server notification discarded"
            );
        }
    }
}

async fn teardown(
    shared: &Shared,
    child: &AsyncMutex<Child>,
    writer_tx: &mpsc::Sender<WriterMsg>,
    grace: Duration,
) {
    // First caller through wins; later triggers (EOF after close, etc) bail.
    if shared.advance(AdapterState::Terminating) >= AdapterState::Terminating {
        return;
    }

    let _ = writer_tx.send(WriterMsg::Shutdown).await;

    {
        let mut child = child.lock().await;
        match tokio::time::timeout(grace, child.wait()).await {
            Ok(_) => {}
            Err(_) => {
                warn!(server = %shared.name, "process ignored stdin close, killing");
                let _ = child.start_kill();
                let _ = child.wait().await;
            }
        }
    }

    shared.fail_pending();
    shared.advance(AdapterState::Dead);
    debug!(server = %shared.name, "adapter dead");
}
