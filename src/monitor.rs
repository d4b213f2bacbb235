//! QMP/QGA session multiplexer.
//!
//! The [`InstanceMonitor`] holds socket sessions to many running VMs,
//! tracks per-session readiness, and correlates requests with replies.
//! Both protocols speak line-delimited JSON over a unix socket; a QMP
//! session announces itself with a greeting and requires a
//! `qmp_capabilities` round trip before accepting commands, while a QGA
//! session is probed with `guest-ping` until the guest agent answers.
//!
//! Session lifecycle: absent (unregistered) -> `Opened` (socket
//! connected) -> `Ready` (handshake complete). A session that hits EOF
//! or a transport error is dropped from the table; its pending reply
//! sinks observe the closure as a transport failure.

use crate::error::{Error, Result};
use crate::util;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Session key prefix for QMP control sockets.
pub const PREFIX_QMP: &str = "qmp";

/// Session key prefix for QGA guest-agent sockets.
pub const PREFIX_QGA: &str = "qga";

/// Initial delay of the QGA `guest-ping` probe.
const QGA_PROBE_INITIAL: Duration = Duration::from_millis(500);

/// Cap on the QGA probe backoff.
const QGA_PROBE_MAX: Duration = Duration::from_secs(8);

/// Build a session key from a prefix and an instance id.
pub fn session_key(prefix: &str, id: &str) -> String {
    format!("{}:{}", prefix, id)
}

/// Readiness of a registered session.
///
/// Absent keys are unregistered (or closed: a failed session is dropped
/// from the table rather than parked).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Socket connected, handshake not yet complete.
    Opened,
    /// Handshake round trip succeeded; commands are accepted.
    Ready,
}

/// A request to execute on a QMP or QGA session.
#[derive(Debug, Clone)]
pub struct Request {
    /// Command name (e.g. `system_powerdown`, `guest-ping`).
    pub execute: String,
    /// Optional command arguments.
    pub arguments: Option<Value>,
}

impl Request {
    /// Request with no arguments.
    pub fn new(execute: impl Into<String>) -> Self {
        Self {
            execute: execute.into(),
            arguments: None,
        }
    }

    /// Request with arguments.
    pub fn with_arguments(execute: impl Into<String>, arguments: Value) -> Self {
        Self {
            execute: execute.into(),
            arguments: Some(arguments),
        }
    }

    fn to_wire(&self, id: &str) -> Value {
        let mut frame = json!({ "execute": self.execute, "id": id });
        if let Some(args) = &self.arguments {
            frame["arguments"] = args.clone();
        }
        frame
    }
}

/// A correlated reply off a session socket.
#[derive(Debug, Clone)]
pub struct Reply {
    /// The `return` payload on success.
    pub ret: Option<Value>,
    /// The `error` payload on failure.
    pub error: Option<Value>,
}

impl Reply {
    fn from_value(value: &Value) -> Self {
        Self {
            ret: value.get("return").cloned(),
            error: value.get("error").cloned(),
        }
    }
}

/// Awaits the reply matching one submitted request.
#[derive(Debug)]
pub struct ExecuteHandle {
    id: String,
    rx: oneshot::Receiver<Reply>,
    inner: Arc<MonitorInner>,
}

impl ExecuteHandle {
    /// The request id this handle is correlated on.
    pub fn request_id(&self) -> &str {
        &self.id
    }

    /// Await the reply, bounded by `timeout`.
    ///
    /// On timeout the pending sink is cancelled so a late reply is
    /// dropped without leaking.
    pub async fn get(self, timeout: Duration) -> Result<Reply> {
        match tokio::time::timeout(timeout, self.rx).await {
            Err(_) => {
                self.inner.cancel(&self.id);
                Err(Error::timeout(format!(
                    "no reply to request {} within {:?}",
                    self.id, timeout
                )))
            }
            Ok(Err(_)) => Err(Error::transport("session closed before reply")),
            Ok(Ok(reply)) => Ok(reply),
        }
    }
}

#[derive(Debug)]
struct Pending {
    key: String,
    tx: oneshot::Sender<Reply>,
}

#[derive(Debug)]
struct Session {
    state: SessionState,
    writer: Arc<tokio::sync::Mutex<OwnedWriteHalf>>,
    reader: Option<JoinHandle<()>>,
    probe: Option<JoinHandle<()>>,
    /// Request id of the in-flight `qmp_capabilities` negotiation.
    handshake_id: Option<String>,
}

#[derive(Debug)]
struct MonitorInner {
    sessions: Mutex<HashMap<String, Session>>,
    pending: Mutex<HashMap<String, Pending>>,
    next_request: AtomicU64,
}

/// Multiplexes QMP/QGA sessions for many VMs.
///
/// Cheap to clone; clones share the session table.
#[derive(Clone)]
pub struct InstanceMonitor {
    inner: Arc<MonitorInner>,
}

impl Default for InstanceMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl InstanceMonitor {
    /// Create an empty monitor.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MonitorInner {
                sessions: Mutex::new(HashMap::new()),
                pending: Mutex::new(HashMap::new()),
                next_request: AtomicU64::new(1),
            }),
        }
    }

    /// Register a session.
    ///
    /// Waits up to `deadline` for the socket file to appear, connects,
    /// and starts the per-session reader. Returns once the socket is
    /// open; readiness follows asynchronously after the protocol
    /// handshake. A previous session under the same key is replaced.
    pub async fn add(&self, key: &str, socket_path: &Path, deadline: Duration) -> Result<()> {
        util::wait_for_path(socket_path, deadline).await?;

        let stream = UnixStream::connect(socket_path).await.map_err(|e| {
            Error::transport(format!("connect {}: {}", socket_path.display(), e))
        })?;
        let (read_half, write_half) = stream.into_split();
        let writer = Arc::new(tokio::sync::Mutex::new(write_half));
        let is_qmp = key.starts_with(PREFIX_QMP);

        self.inner.close_session(key);
        self.inner.sessions.lock().insert(
            key.to_string(),
            Session {
                state: SessionState::Opened,
                writer: writer.clone(),
                reader: None,
                probe: None,
                handshake_id: None,
            },
        );

        let reader = tokio::spawn(read_loop(
            self.inner.clone(),
            key.to_string(),
            read_half,
            writer.clone(),
            is_qmp,
        ));
        let probe = if is_qmp {
            None
        } else {
            Some(tokio::spawn(qga_probe(
                self.inner.clone(),
                key.to_string(),
                writer,
            )))
        };

        // The reader may already have torn the session down (immediate
        // EOF); in that case the tasks must not outlive it.
        let mut sessions = self.inner.sessions.lock();
        match sessions.get_mut(key) {
            Some(session) => {
                session.reader = Some(reader);
                session.probe = probe;
            }
            None => {
                reader.abort();
                if let Some(probe) = probe {
                    probe.abort();
                }
            }
        }
        drop(sessions);

        tracing::debug!(session = %key, socket = %socket_path.display(), "session opened");
        Ok(())
    }

    /// Submit a request on a ready session.
    ///
    /// Returns [`Error::NotReady`] unless the session's handshake has
    /// completed. The returned handle awaits the correlated reply.
    pub async fn execute(&self, key: &str, request: Request) -> Result<ExecuteHandle> {
        {
            let sessions = self.inner.sessions.lock();
            match sessions.get(key) {
                Some(session) if session.state == SessionState::Ready => {}
                _ => return Err(Error::not_ready(key)),
            }
        }
        self.inner.submit(key, request).await
    }

    /// Discard the pending reply sink for a request id.
    pub fn cancel(&self, request_id: &str) {
        self.inner.cancel(request_id);
    }

    /// Current state of a session, if registered.
    pub fn session_state(&self, key: &str) -> Option<SessionState> {
        self.inner.sessions.lock().get(key).map(|s| s.state)
    }

    /// True once the session's handshake has completed.
    pub fn ready(&self, key: &str) -> bool {
        self.session_state(key) == Some(SessionState::Ready)
    }

    /// Drop one session and fail its pending requests.
    pub fn remove(&self, key: &str) {
        self.inner.close_session(key);
    }

    /// Terminate all sessions and release the underlying connections.
    pub fn close(&self) {
        let keys: Vec<String> = self.inner.sessions.lock().keys().cloned().collect();
        for key in keys {
            self.inner.close_session(&key);
        }
    }

    #[cfg(test)]
    fn pending_len(&self) -> usize {
        self.inner.pending.lock().len()
    }
}

impl MonitorInner {
    fn allocate_request_id(&self) -> String {
        format!("qf-{}", self.next_request.fetch_add(1, Ordering::Relaxed))
    }

    async fn submit(self: &Arc<Self>, key: &str, request: Request) -> Result<ExecuteHandle> {
        let writer = self
            .sessions
            .lock()
            .get(key)
            .map(|s| s.writer.clone())
            .ok_or_else(|| Error::not_ready(key))?;

        let id = self.allocate_request_id();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(
            id.clone(),
            Pending {
                key: key.to_string(),
                tx,
            },
        );

        if let Err(e) = write_frame(&writer, &request.to_wire(&id)).await {
            self.pending.lock().remove(&id);
            self.close_session(key);
            return Err(Error::transport(format!("write {}: {}", key, e)));
        }

        Ok(ExecuteHandle {
            id,
            rx,
            inner: self.clone(),
        })
    }

    fn cancel(&self, request_id: &str) {
        self.pending.lock().remove(request_id);
    }

    fn mark_ready(&self, key: &str, protocol: &str) {
        let marked = {
            let mut sessions = self.sessions.lock();
            match sessions.get_mut(key) {
                Some(session) => {
                    session.state = SessionState::Ready;
                    true
                }
                None => false,
            }
        };
        if marked {
            tracing::info!(session = %key, protocol = protocol, "session ready");
        }
    }

    /// Drop a session from the table, abort its tasks, and fail its
    /// pending reply sinks.
    fn close_session(&self, key: &str) {
        let session = self.sessions.lock().remove(key);
        if let Some(session) = session {
            if let Some(reader) = session.reader {
                reader.abort();
            }
            if let Some(probe) = session.probe {
                probe.abort();
            }
            self.pending.lock().retain(|_, p| p.key != key);
            tracing::debug!(session = %key, "session closed");
        }
    }
}

async fn write_frame(
    writer: &Arc<tokio::sync::Mutex<OwnedWriteHalf>>,
    frame: &Value,
) -> std::io::Result<()> {
    let mut line = frame.to_string();
    line.push('\n');
    let mut writer = writer.lock().await;
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await
}

/// Single reader per session. Parses each line, drives the QMP
/// handshake, and dispatches correlated replies to their sinks.
async fn read_loop(
    inner: Arc<MonitorInner>,
    key: String,
    read_half: OwnedReadHalf,
    writer: Arc<tokio::sync::Mutex<OwnedWriteHalf>>,
    is_qmp: bool,
) {
    let mut lines = BufReader::new(read_half).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => {
                tracing::debug!(session = %key, "session eof");
                break;
            }
            Err(e) => {
                tracing::debug!(session = %key, error = %e, "session read failed");
                break;
            }
        };

        let value: Value = match serde_json::from_str(&line) {
            Ok(value) => value,
            Err(e) => {
                tracing::trace!(session = %key, error = %e, "unparseable line skipped");
                continue;
            }
        };

        if is_qmp && value.get("QMP").is_some() {
            // Greeting. Capabilities must be negotiated before the
            // session accepts commands.
            let id = inner.allocate_request_id();
            {
                let mut sessions = inner.sessions.lock();
                match sessions.get_mut(&key) {
                    Some(session) => session.handshake_id = Some(id.clone()),
                    None => return,
                }
            }
            if write_frame(&writer, &Request::new("qmp_capabilities").to_wire(&id))
                .await
                .is_err()
            {
                break;
            }
            continue;
        }

        let Some(id) = value.get("id").and_then(Value::as_str).map(str::to_string) else {
            // Asynchronous event broadcast; not correlated to a request.
            tracing::trace!(session = %key, "unsolicited message ignored");
            continue;
        };

        let handshake_outcome = {
            let mut sessions = inner.sessions.lock();
            match sessions.get_mut(&key) {
                Some(session) if session.handshake_id.as_deref() == Some(id.as_str()) => {
                    session.handshake_id = None;
                    Some(value.get("error").is_none())
                }
                _ => None,
            }
        };
        match handshake_outcome {
            Some(true) => {
                inner.mark_ready(&key, PREFIX_QMP);
                continue;
            }
            Some(false) => {
                tracing::warn!(session = %key, "capabilities negotiation rejected");
                continue;
            }
            None => {}
        }

        let sink = inner.pending.lock().remove(&id);
        match sink {
            Some(pending) => {
                let _ = pending.tx.send(Reply::from_value(&value));
            }
            None => {
                // Cancelled or timed out; late reply dropped.
                tracing::trace!(session = %key, request = %id, "reply with no sink dropped");
            }
        }
    }

    inner.close_session(&key);
}

/// QGA readiness probe: `guest-ping` with exponential backoff until the
/// guest agent answers without error.
async fn qga_probe(
    inner: Arc<MonitorInner>,
    key: String,
    writer: Arc<tokio::sync::Mutex<OwnedWriteHalf>>,
) {
    let mut delay = QGA_PROBE_INITIAL;
    loop {
        if !inner.sessions.lock().contains_key(&key) {
            return;
        }

        let id = inner.allocate_request_id();
        let (tx, rx) = oneshot::channel();
        inner.pending.lock().insert(
            id.clone(),
            Pending {
                key: key.clone(),
                tx,
            },
        );

        if write_frame(&writer, &Request::new("guest-ping").to_wire(&id))
            .await
            .is_err()
        {
            inner.cancel(&id);
            inner.close_session(&key);
            return;
        }

        match tokio::time::timeout(delay, rx).await {
            Ok(Ok(reply)) if reply.error.is_none() => {
                inner.mark_ready(&key, PREFIX_QGA);
                return;
            }
            Ok(Ok(_)) => {
                // Agent answered but rejected the ping; keep probing.
            }
            Ok(Err(_)) => {
                // Session closed underneath the probe.
                return;
            }
            Err(_) => {
                inner.cancel(&id);
            }
        }

        tokio::time::sleep(delay).await;
        delay = (delay * 2).min(QGA_PROBE_MAX);
    }
}
