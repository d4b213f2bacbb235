//! Per-instance supervision actor.
//!
//! The [`LifecycleLoop`] is the single owner of all supervision records
//! for currently-running VMs. External callers interact only through
//! the clonable [`LifecycleHandle`]; every mutation of the supervision
//! map happens on the loop task, which removes the need for any lock
//! around it.
//!
//! For one VM id, handle registration, command dispatch, force-stop and
//! completion handling are all serialised by this loop.

use crate::error::{Error, Result};
use crate::monitor::{session_key, InstanceMonitor, Reply, Request, PREFIX_QGA, PREFIX_QMP};
use crate::network::NetworkManager;
use crate::qemu::InstanceHandle;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

/// Capacity of the loop's inbound channels.
const CHANNEL_CAPACITY: usize = 32;

/// Default bound on registering a new instance's sockets with the
/// monitor. Guests can take a long time to create the QGA socket.
pub const DEFAULT_ATTACH_DEADLINE: Duration = Duration::from_secs(600);

/// Which of an instance's two sessions a command targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    /// The QMP control socket.
    Qmp,
    /// The QGA guest-agent socket.
    Qga,
}

impl SessionKind {
    fn prefix(self) -> &'static str {
        match self {
            SessionKind::Qmp => PREFIX_QMP,
            SessionKind::Qga => PREFIX_QGA,
        }
    }
}

/// Handoff of a freshly started (or re-attached) VM process.
#[derive(Debug)]
pub struct InstanceEvent {
    /// Instance id.
    pub id: String,
    /// Launcher handle for the process.
    pub handle: InstanceHandle,
}

/// A QMP/QGA request forwarded through the loop.
pub struct Command {
    /// Target instance id.
    pub id: String,
    /// Which session to execute on.
    pub kind: SessionKind,
    /// The request to execute.
    pub request: Request,
    /// Reply budget.
    pub timeout: Duration,
    /// Receives the outcome. Dropped without a value when the instance
    /// is not supervised.
    pub reply: oneshot::Sender<Result<Reply>>,
}

/// Observed runtime changes flowing from the loop to the manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusEvent {
    /// The instance started or stopped running.
    Status {
        /// Instance id.
        id: String,
        /// Whether the process is running.
        running: bool,
    },
    /// The instance's process id became known.
    Pid {
        /// Instance id.
        id: String,
        /// OS process id.
        pid: i32,
    },
    /// Guest addresses were observed; published, never persisted.
    Info {
        /// Instance id.
        id: String,
        /// Filtered guest IP addresses.
        ip_addresses: Vec<String>,
    },
}

struct Supervision {
    handle: InstanceHandle,
    attach: JoinHandle<()>,
    follower: JoinHandle<()>,
}

/// Clonable front end of the lifecycle loop.
#[derive(Clone)]
pub struct LifecycleHandle {
    instances_tx: mpsc::Sender<InstanceEvent>,
    commands_tx: mpsc::Sender<Command>,
    force_tx: mpsc::Sender<String>,
    shutdown_tx: Arc<watch::Sender<bool>>,
}

impl LifecycleHandle {
    /// Hand a started instance over to supervision.
    pub async fn submit(&self, id: impl Into<String>, handle: InstanceHandle) -> Result<()> {
        self.instances_tx
            .send(InstanceEvent {
                id: id.into(),
                handle,
            })
            .await
            .map_err(|_| Error::transport("lifecycle loop gone"))
    }

    /// Execute a request on one of the instance's sessions and await the
    /// reply.
    ///
    /// Yields [`Error::NotReady`] when the instance is not supervised or
    /// its session has not completed the handshake.
    pub async fn command(
        &self,
        id: &str,
        kind: SessionKind,
        request: Request,
        timeout: Duration,
    ) -> Result<Reply> {
        let (tx, rx) = oneshot::channel();
        self.commands_tx
            .send(Command {
                id: id.to_string(),
                kind,
                request,
                timeout,
                reply: tx,
            })
            .await
            .map_err(|_| Error::transport("lifecycle loop gone"))?;

        match rx.await {
            Ok(result) => result,
            // Reply closed without a value: the instance is not supervised.
            Err(_) => Err(Error::not_ready(session_key(kind.prefix(), id))),
        }
    }

    /// Request a forced stop. Fire-and-forget; the loop never blocks on
    /// a reply for this.
    pub async fn force_stop(&self, id: impl Into<String>) -> Result<()> {
        self.force_tx
            .send(id.into())
            .await
            .map_err(|_| Error::transport("lifecycle loop gone"))
    }

    /// Ask the loop to cancel all supervisions and exit.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

/// Single-writer supervision actor. See module docs.
pub struct LifecycleLoop {
    monitor: InstanceMonitor,
    network: Arc<dyn NetworkManager>,
    status_tx: mpsc::Sender<StatusEvent>,
    attach_deadline: Duration,

    instances_rx: mpsc::Receiver<InstanceEvent>,
    commands_rx: mpsc::Receiver<Command>,
    force_rx: mpsc::Receiver<String>,
    removals_rx: mpsc::Receiver<String>,
    removals_tx: mpsc::Sender<String>,
    shutdown_rx: watch::Receiver<bool>,

    supervisions: HashMap<String, Supervision>,
}

impl LifecycleLoop {
    /// Start the loop task. Returns the handle callers use and the join
    /// handle of the loop itself.
    pub fn spawn(
        monitor: InstanceMonitor,
        network: Arc<dyn NetworkManager>,
        status_tx: mpsc::Sender<StatusEvent>,
        attach_deadline: Duration,
    ) -> (LifecycleHandle, JoinHandle<()>) {
        let (instances_tx, instances_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (commands_tx, commands_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (force_tx, force_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (removals_tx, removals_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let lifecycle = Self {
            monitor,
            network,
            status_tx,
            attach_deadline,
            instances_rx,
            commands_rx,
            force_rx,
            removals_rx,
            removals_tx,
            shutdown_rx,
            supervisions: HashMap::new(),
        };
        let task = tokio::spawn(lifecycle.run());

        (
            LifecycleHandle {
                instances_tx,
                commands_tx,
                force_tx,
                shutdown_tx: Arc::new(shutdown_tx),
            },
            task,
        )
    }

    async fn run(mut self) {
        tracing::info!("lifecycle loop started");
        loop {
            tokio::select! {
                Some(event) = self.instances_rx.recv() => self.register(event).await,
                Some(command) = self.commands_rx.recv() => self.dispatch(command).await,
                Some(id) = self.force_rx.recv() => self.force_stop(&id).await,
                Some(id) = self.removals_rx.recv() => self.unregister(&id),
                changed = self.shutdown_rx.changed() => {
                    if changed.is_err() || *self.shutdown_rx.borrow() {
                        break;
                    }
                }
                else => break,
            }
        }

        tracing::info!(
            supervised = self.supervisions.len(),
            "lifecycle loop shutting down"
        );
        for (_, supervision) in self.supervisions.drain() {
            supervision.attach.abort();
            supervision.follower.abort();
            // Handles are dropped here; the processes themselves are left
            // running so a controller restart can re-attach.
        }
        self.monitor.close();
    }

    async fn register(&mut self, event: InstanceEvent) {
        let InstanceEvent { id, mut handle } = event;
        if self.supervisions.contains_key(&id) {
            tracing::warn!(instance = %id, "instance already supervised, replacing");
            self.unregister(&id);
        }

        let done = handle.take_done();
        let pid = handle.pid;

        let _ = self
            .status_tx
            .send(StatusEvent::Pid {
                id: id.clone(),
                pid,
            })
            .await;
        let _ = self
            .status_tx
            .send(StatusEvent::Status {
                id: id.clone(),
                running: true,
            })
            .await;

        let attach = {
            let monitor = self.monitor.clone();
            let deadline = self.attach_deadline;
            let qmp_key = session_key(PREFIX_QMP, &id);
            let qga_key = session_key(PREFIX_QGA, &id);
            let qmp_path = handle.qmp_path.clone();
            let qga_path = handle.qga_path.clone();
            let id = id.clone();
            tokio::spawn(async move {
                if let Err(e) = monitor.add(&qmp_key, &qmp_path, deadline).await {
                    tracing::warn!(instance = %id, error = %e, "qmp session attach failed");
                }
                if let Err(e) = monitor.add(&qga_key, &qga_path, deadline).await {
                    tracing::warn!(instance = %id, error = %e, "qga session attach failed");
                }
            })
        };

        let follower = {
            let status_tx = self.status_tx.clone();
            let removals_tx = self.removals_tx.clone();
            let id = id.clone();
            tokio::spawn(async move {
                if let Some(done) = done {
                    let _ = done.await;
                }
                tracing::info!(instance = %id, "instance process completed");
                let _ = status_tx
                    .send(StatusEvent::Status {
                        id: id.clone(),
                        running: false,
                    })
                    .await;
                let _ = removals_tx.send(id).await;
            })
        };

        tracing::debug!(instance = %id, pid = pid, "supervision registered");
        self.supervisions.insert(
            id,
            Supervision {
                handle,
                attach,
                follower,
            },
        );
    }

    async fn dispatch(&mut self, command: Command) {
        let Command {
            id,
            kind,
            request,
            timeout,
            reply,
        } = command;

        if !self.supervisions.contains_key(&id) {
            // Closing the reply without a value tells the caller the
            // instance is not supervised.
            drop(reply);
            return;
        }

        let key = session_key(kind.prefix(), &id);
        match self.monitor.execute(&key, request).await {
            Ok(handle) => {
                // Await the reply off-loop so a slow guest never stalls
                // supervision of other instances.
                tokio::spawn(async move {
                    let _ = reply.send(handle.get(timeout).await);
                });
            }
            Err(e) => {
                let _ = reply.send(Err(e));
            }
        }
    }

    async fn force_stop(&mut self, id: &str) {
        let Some(supervision) = self.supervisions.remove(id) else {
            tracing::debug!(instance = %id, "force stop for unsupervised instance ignored");
            return;
        };

        tracing::info!(instance = %id, pid = supervision.handle.pid, "force stopping instance");
        supervision.attach.abort();
        supervision.follower.abort();

        let handle = supervision.handle;
        tokio::task::spawn_blocking(move || handle.stop());

        self.teardown_sessions(id);
        let _ = self
            .status_tx
            .send(StatusEvent::Status {
                id: id.to_string(),
                running: false,
            })
            .await;
    }

    /// Natural completion reported by a follower.
    fn unregister(&mut self, id: &str) {
        if let Some(supervision) = self.supervisions.remove(id) {
            supervision.attach.abort();
            supervision.follower.abort();
            self.teardown_sessions(id);
            tracing::debug!(instance = %id, "supervision removed");
        }
    }

    fn teardown_sessions(&self, id: &str) {
        self.monitor.remove(&session_key(PREFIX_QMP, id));
        self.monitor.remove(&session_key(PREFIX_QGA, id));
        if let Err(e) = self.network.remove_interface(id) {
            tracing::warn!(instance = %id, error = %e, "failed to remove network interface");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::NoopNetworkManager;
    use serde_json::Value;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Instant;
    use tempfile::TempDir;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::UnixListener;

    fn fake_handle(pid: i32, qmp_path: PathBuf, qga_path: PathBuf) -> (InstanceHandle, oneshot::Sender<()>) {
        let (done_tx, done_rx) = oneshot::channel();
        let handle = InstanceHandle::new(pid, qmp_path, qga_path, done_rx, || {});
        (handle, done_tx)
    }

    fn spawn_loop(
        monitor: InstanceMonitor,
        attach_deadline: Duration,
    ) -> (LifecycleHandle, mpsc::Receiver<StatusEvent>) {
        let (status_tx, status_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (handle, _task) = LifecycleLoop::spawn(
            monitor,
            Arc::new(NoopNetworkManager),
            status_tx,
            attach_deadline,
        );
        (handle, status_rx)
    }

    async fn wait_until(mut condition: impl FnMut() -> bool, budget: Duration) {
        let start = Instant::now();
        while !condition() {
            assert!(start.elapsed() < budget, "condition not met within {budget:?}");
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    #[tokio::test]
    async fn test_submit_emits_pid_then_running_then_completion() {
        let dir = TempDir::new().unwrap();
        let (lifecycle, mut status_rx) =
            spawn_loop(InstanceMonitor::new(), Duration::from_millis(100));

        let (handle, done_tx) = fake_handle(
            4242,
            dir.path().join("qmp.sock"),
            dir.path().join("qga.sock"),
        );
        lifecycle.submit("vm1", handle).await.unwrap();

        assert_eq!(
            status_rx.recv().await.unwrap(),
            StatusEvent::Pid {
                id: "vm1".to_string(),
                pid: 4242
            }
        );
        assert_eq!(
            status_rx.recv().await.unwrap(),
            StatusEvent::Status {
                id: "vm1".to_string(),
                running: true
            }
        );

        // Natural completion flows through the follower.
        done_tx.send(()).unwrap();
        assert_eq!(
            status_rx.recv().await.unwrap(),
            StatusEvent::Status {
                id: "vm1".to_string(),
                running: false
            }
        );
    }

    #[tokio::test]
    async fn test_command_for_unsupervised_instance_is_not_ready() {
        let (lifecycle, _status_rx) =
            spawn_loop(InstanceMonitor::new(), Duration::from_millis(100));

        let err = lifecycle
            .command(
                "ghost",
                SessionKind::Qga,
                Request::new("guest-ping"),
                Duration::from_secs(1),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotReady { .. }));
    }

    #[tokio::test]
    async fn test_command_before_session_ready_is_not_ready() {
        let dir = TempDir::new().unwrap();
        let (lifecycle, mut status_rx) =
            spawn_loop(InstanceMonitor::new(), Duration::from_millis(100));

        // Sockets never appear, so the sessions never hand-shake.
        let (handle, _done_tx) = fake_handle(
            4242,
            dir.path().join("qmp.sock"),
            dir.path().join("qga.sock"),
        );
        lifecycle.submit("vm1", handle).await.unwrap();
        status_rx.recv().await.unwrap();
        status_rx.recv().await.unwrap();

        let err = lifecycle
            .command(
                "vm1",
                SessionKind::Qga,
                Request::new("guest-ping"),
                Duration::from_secs(1),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotReady { .. }));
    }

    #[tokio::test]
    async fn test_force_stop_invokes_handle_stop_and_reports_stopped() {
        let dir = TempDir::new().unwrap();
        let (lifecycle, mut status_rx) =
            spawn_loop(InstanceMonitor::new(), Duration::from_millis(100));

        let stopped = Arc::new(AtomicBool::new(false));
        let (done_tx, done_rx) = oneshot::channel::<()>();
        let stopped_flag = stopped.clone();
        let handle = InstanceHandle::new(
            4242,
            dir.path().join("qmp.sock"),
            dir.path().join("qga.sock"),
            done_rx,
            move || {
                stopped_flag.store(true, Ordering::SeqCst);
            },
        );

        lifecycle.submit("vm1", handle).await.unwrap();
        status_rx.recv().await.unwrap();
        status_rx.recv().await.unwrap();

        lifecycle.force_stop("vm1").await.unwrap();

        assert_eq!(
            status_rx.recv().await.unwrap(),
            StatusEvent::Status {
                id: "vm1".to_string(),
                running: false
            }
        );
        let stopped_probe = stopped.clone();
        wait_until(
            move || stopped_probe.load(Ordering::SeqCst),
            Duration::from_secs(5),
        )
        .await;

        // A follow-up command sees the instance as gone.
        let err = lifecycle
            .command(
                "vm1",
                SessionKind::Qmp,
                Request::new("query-status"),
                Duration::from_secs(1),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotReady { .. }));
        drop(done_tx);
    }

    #[tokio::test]
    async fn test_replies_arrive_in_submission_order() {
        let dir = TempDir::new().unwrap();
        let qmp_path = dir.path().join("qmp.sock");
        let listener = UnixListener::bind(&qmp_path).unwrap();

        // Scripted QMP endpoint: handshake, then answer each command
        // with a sequence number in arrival order.
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (r, mut w) = stream.into_split();
            let mut lines = BufReader::new(r).lines();

            w.write_all(b"{\"QMP\": {\"version\": {}, \"capabilities\": []}}\n")
                .await
                .unwrap();
            let line = lines.next_line().await.unwrap().unwrap();
            let v: Value = serde_json::from_str(&line).unwrap();
            let frame = format!(
                "{{\"return\": {{}}, \"id\": \"{}\"}}\n",
                v["id"].as_str().unwrap()
            );
            w.write_all(frame.as_bytes()).await.unwrap();

            for seq in 1..=2 {
                let line = lines.next_line().await.unwrap().unwrap();
                let v: Value = serde_json::from_str(&line).unwrap();
                let frame = format!(
                    "{{\"return\": {{\"seq\": {}}}, \"id\": \"{}\"}}\n",
                    seq,
                    v["id"].as_str().unwrap()
                );
                w.write_all(frame.as_bytes()).await.unwrap();
            }
            let _ = lines.next_line().await;
        });

        let monitor = InstanceMonitor::new();
        let (status_tx, _status_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (lifecycle, _task) = LifecycleLoop::spawn(
            monitor.clone(),
            Arc::new(NoopNetworkManager),
            status_tx,
            Duration::from_secs(5),
        );

        let (handle, _done_tx) =
            fake_handle(4242, qmp_path.clone(), dir.path().join("qga.sock"));
        lifecycle.submit("vm1", handle).await.unwrap();

        let monitor_probe = monitor.clone();
        wait_until(
            move || monitor_probe.ready(&session_key(PREFIX_QMP, "vm1")),
            Duration::from_secs(5),
        )
        .await;

        // Submit both commands before either response arrives, in a
        // deterministic order.
        let first = lifecycle.clone();
        let (tx_a, rx_a) = oneshot::channel();
        first
            .commands_tx
            .send(Command {
                id: "vm1".to_string(),
                kind: SessionKind::Qmp,
                request: Request::new("query-status"),
                timeout: Duration::from_secs(5),
                reply: tx_a,
            })
            .await
            .unwrap();
        let (tx_b, rx_b) = oneshot::channel();
        first
            .commands_tx
            .send(Command {
                id: "vm1".to_string(),
                kind: SessionKind::Qmp,
                request: Request::new("query-status"),
                timeout: Duration::from_secs(5),
                reply: tx_b,
            })
            .await
            .unwrap();

        let reply_a = rx_a.await.unwrap().unwrap();
        let reply_b = rx_b.await.unwrap().unwrap();
        assert_eq!(reply_a.ret.unwrap()["seq"], 1);
        assert_eq!(reply_b.ret.unwrap()["seq"], 2);

        lifecycle.shutdown();
        server.abort();
    }
}
