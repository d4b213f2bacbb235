//! QEMU process launch and re-attach.
//!
//! [`QemuLauncher`] is the seam between the lifecycle kernel and the
//! actual `qemu-system` binary: `start` spawns a fresh process,
//! `attach` adopts one that survived a controller restart. Both return
//! an [`InstanceHandle`] bundling the pid, the QMP/QGA socket paths,
//! a one-shot completion signal, and a stop primitive. Socket paths
//! need not exist when the handle is returned; the monitor waits for
//! them.

use crate::error::{Error, Result};
use crate::instance::Hardware;
use crate::network::NetworkManager;
use crate::process;
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

/// QMP control socket file name inside an instance directory.
pub const QMP_SOCKET: &str = "qmp.sock";

/// QGA guest-agent socket file name inside an instance directory.
pub const QGA_SOCKET: &str = "qga.sock";

/// Poll period for liveness of re-attached (non-child) processes.
const ATTACH_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Everything the launcher needs to start a VM process.
#[derive(Debug, Clone)]
pub struct StartSpec {
    /// Instance id.
    pub id: String,
    /// Boot image path.
    pub image: PathBuf,
    /// File receiving the process stdout.
    pub stdout_path: PathBuf,
    /// File receiving the process stderr.
    pub stderr_path: PathBuf,
    /// Hardware shape.
    pub hardware: Hardware,
    /// Guest MAC address.
    pub mac: String,
}

/// Handle to a running (or adopted) QEMU process.
pub struct InstanceHandle {
    /// OS process id.
    pub pid: i32,
    /// Path to the QMP control socket.
    pub qmp_path: PathBuf,
    /// Path to the QGA guest-agent socket.
    pub qga_path: PathBuf,
    done: Option<oneshot::Receiver<()>>,
    stop: Arc<dyn Fn() + Send + Sync>,
}

impl std::fmt::Debug for InstanceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceHandle")
            .field("pid", &self.pid)
            .field("qmp_path", &self.qmp_path)
            .field("qga_path", &self.qga_path)
            .finish_non_exhaustive()
    }
}

impl InstanceHandle {
    /// Build a handle from its parts.
    ///
    /// `done` fires exactly once when the process exits. `stop` must
    /// terminate the process; it may block and is expected to run inside
    /// a blocking-capable context.
    pub fn new(
        pid: i32,
        qmp_path: PathBuf,
        qga_path: PathBuf,
        done: oneshot::Receiver<()>,
        stop: impl Fn() + Send + Sync + 'static,
    ) -> Self {
        Self {
            pid,
            qmp_path,
            qga_path,
            done: Some(done),
            stop: Arc::new(stop),
        }
    }

    /// Take the completion signal. The lifecycle loop's follower task
    /// consumes it; subsequent calls return `None`.
    pub fn take_done(&mut self) -> Option<oneshot::Receiver<()>> {
        self.done.take()
    }

    /// Stop the underlying process. May block until it is gone.
    pub fn stop(&self) {
        (self.stop)()
    }
}

/// Starts and adopts QEMU processes.
#[async_trait]
pub trait QemuLauncher: Send + Sync {
    /// Spawn a new QEMU process for the instance.
    async fn start(&self, spec: StartSpec) -> Result<InstanceHandle>;

    /// Adopt an already-running QEMU process (controller restart).
    async fn attach(&self, id: &str, pid: i32) -> Result<InstanceHandle>;
}

/// Launcher driving an external `qemu-system` binary.
pub struct SystemQemuLauncher {
    binary: String,
    instances_dir: PathBuf,
    network: Arc<dyn NetworkManager>,
}

impl SystemQemuLauncher {
    /// Create a launcher.
    ///
    /// `instances_dir` is the per-instance working-directory root; the
    /// QMP/QGA sockets for instance `id` live at
    /// `<instances_dir>/<id>/{qmp.sock,qga.sock}`.
    pub fn new(
        binary: impl Into<String>,
        instances_dir: impl Into<PathBuf>,
        network: Arc<dyn NetworkManager>,
    ) -> Self {
        Self {
            binary: binary.into(),
            instances_dir: instances_dir.into(),
            network,
        }
    }

    fn socket_paths(&self, id: &str) -> (PathBuf, PathBuf) {
        let dir = self.instances_dir.join(id);
        (dir.join(QMP_SOCKET), dir.join(QGA_SOCKET))
    }
}

#[async_trait]
impl QemuLauncher for SystemQemuLauncher {
    async fn start(&self, spec: StartSpec) -> Result<InstanceHandle> {
        let (qmp_path, qga_path) = self.socket_paths(&spec.id);

        // Stale sockets from a previous run must not be mistaken for the
        // new process having come up.
        let _ = std::fs::remove_file(&qmp_path);
        let _ = std::fs::remove_file(&qga_path);

        let tap = self.network.create_interface(&spec.id)?;

        let stdout = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&spec.stdout_path)
            .map_err(|e| Error::launch("spawn", format!("open stdout log: {}", e)))?;
        let stderr = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&spec.stderr_path)
            .map_err(|e| Error::launch("spawn", format!("open stderr log: {}", e)))?;

        let mut command = std::process::Command::new(&self.binary);
        command
            .arg("-name")
            .arg(&spec.id)
            .arg("-smp")
            .arg(spec.hardware.cpus.to_string())
            .arg("-m")
            .arg(&spec.hardware.memory)
            // Disk size is applied when the image is provisioned, not at
            // launch time.
            .arg("-drive")
            .arg(format!("file={},if=virtio", spec.image.display()))
            .arg("-qmp")
            .arg(format!("unix:{},server=on,wait=off", qmp_path.display()))
            .arg("-chardev")
            .arg(format!(
                "socket,path={},server=on,wait=off,id=qga0",
                qga_path.display()
            ))
            .arg("-device")
            .arg("virtio-serial")
            .arg("-device")
            .arg("virtserialport,chardev=qga0,name=org.qemu.guest_agent.0")
            .arg("-display")
            .arg("none");

        match tap {
            Some(ifname) => {
                command.arg("-netdev").arg(format!(
                    "tap,id=net0,ifname={},script=no,downscript=no",
                    ifname
                ));
            }
            None => {
                command.arg("-netdev").arg("user,id=net0");
            }
        }
        command
            .arg("-device")
            .arg(format!("virtio-net-pci,netdev=net0,mac={}", spec.mac));

        command
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr));

        let mut child = command
            .spawn()
            .map_err(|e| Error::launch("spawn", format!("{}: {}", self.binary, e)))?;
        let pid = child.id() as i32;

        let (done_tx, done_rx) = oneshot::channel();
        std::thread::spawn(move || {
            let _ = child.wait();
            let _ = done_tx.send(());
        });

        tracing::info!(instance = %spec.id, pid = pid, "qemu process started");

        Ok(InstanceHandle::new(pid, qmp_path, qga_path, done_rx, move || {
            if let Err(e) = process::stop_process(pid, process::DEFAULT_STOP_TIMEOUT) {
                tracing::warn!(pid = pid, error = %e, "failed to stop qemu process");
            }
        }))
    }

    async fn attach(&self, id: &str, pid: i32) -> Result<InstanceHandle> {
        if !process::is_alive(pid) {
            return Err(Error::launch(
                "attach",
                format!("process {} is not running", pid),
            ));
        }

        let (qmp_path, qga_path) = self.socket_paths(id);

        // An adopted process is not our child, so exit is observed by
        // polling rather than waitpid.
        let (done_tx, done_rx) = oneshot::channel();
        std::thread::spawn(move || {
            while process::is_alive(pid) {
                std::thread::sleep(ATTACH_POLL_INTERVAL);
            }
            let _ = done_tx.send(());
        });

        tracing::info!(instance = %id, pid = pid, "attached to running qemu process");

        Ok(InstanceHandle::new(pid, qmp_path, qga_path, done_rx, move || {
            if let Err(e) = process::stop_process(pid, process::DEFAULT_STOP_TIMEOUT) {
                tracing::warn!(pid = pid, error = %e, "failed to stop qemu process");
            }
        }))
    }
}
