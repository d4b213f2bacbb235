//! Top-level VM fleet facade.
//!
//! The [`Manager`] is the only writer to the [`StateStore`] and the
//! coordinator between image fetch, state writes, and lifecycle
//! handoff. Mutating operations serialise on one coarse lock; `info`
//! takes it shared. Observed runtime changes arrive on the
//! status channel and are written through by a single ingestion task,
//! so for any one VM the order of status application matches the order
//! the lifecycle loop emitted them in.

use crate::config::FleetConfig;
use crate::error::{Error, Result};
use crate::events::{EventPublisher, FleetEvent};
use crate::images::ImageRegistry;
use crate::instance::{Hardware, Instance, VmInfo, VmState};
use crate::lifecycle::{LifecycleHandle, LifecycleLoop, SessionKind, StatusEvent};
use crate::monitor::{InstanceMonitor, Request};
use crate::network::NetworkManager;
use crate::qemu::{QemuLauncher, StartSpec};
use crate::store::StateStore;
use crate::util;
use serde_json::Value;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;

/// Directory under the root holding per-instance working directories.
const INSTANCES_DIR: &str = "instances";

/// Captured QEMU stdout file name.
const OUT_LOG: &str = "log.out";

/// Captured QEMU stderr file name.
const ERR_LOG: &str = "log.err";

/// Boot image file name inside an instance directory.
const IMAGE_FILE: &str = "image";

/// Capacity of the monitor-to-manager status channel.
const STATUS_CHANNEL_CAPACITY: usize = 32;

/// Top-level VM fleet facade. Construct via [`Manager::new`] or
/// [`bootstrap`].
pub struct Manager {
    instances_dir: PathBuf,
    store: StateStore,
    launcher: Arc<dyn QemuLauncher>,
    images: Arc<dyn ImageRegistry>,
    lifecycle: LifecycleHandle,
    publisher: EventPublisher,
    status_tx: mpsc::Sender<StatusEvent>,
    lock: RwLock<()>,
    command_timeout: Duration,
}

impl Manager {
    /// Construct the manager and run crash recovery.
    ///
    /// Every stored instance is reset to `Stopped`; instances that
    /// carried a pid are then re-started so the launcher attaches to the
    /// still-running process. A failed re-attach is logged and skipped,
    /// never fatal.
    #[allow(clippy::too_many_arguments)]
    pub async fn new(
        root_dir: impl Into<PathBuf>,
        store: StateStore,
        launcher: Arc<dyn QemuLauncher>,
        images: Arc<dyn ImageRegistry>,
        lifecycle: LifecycleHandle,
        publisher: EventPublisher,
        status_tx: mpsc::Sender<StatusEvent>,
        status_rx: mpsc::Receiver<StatusEvent>,
        command_timeout: Duration,
    ) -> Result<Arc<Self>> {
        let root_dir = root_dir.into();
        let instances_dir = root_dir.join(INSTANCES_DIR);
        std::fs::create_dir_all(&instances_dir)?;

        // This can only run at startup: nothing is supervised yet, so
        // every stored instance is at most a candidate for re-attach.
        let stored = store.list()?;
        for instance in &stored {
            let mut reset = instance.clone();
            reset.state = VmState::Stopped;
            store.update(&reset)?;
        }

        let manager = Arc::new(Self {
            instances_dir,
            store,
            launcher,
            images,
            lifecycle,
            publisher,
            status_tx,
            lock: RwLock::new(()),
            command_timeout,
        });

        let ingester = manager.clone();
        tokio::spawn(async move { ingester.ingest_loop(status_rx).await });

        for instance in stored {
            if instance.pid.is_some() {
                if let Err(e) = manager.start(&instance.id).await {
                    tracing::warn!(
                        instance = %instance.id,
                        error = %e,
                        "failed to reattach to qemu instance"
                    );
                    let _ = manager
                        .publisher
                        .error(format!("failed to reattach: {}", e), &instance.id);
                }
            }
        }

        Ok(manager)
    }

    /// Create a new instance: fetch its boot image, assign a fresh MAC,
    /// and persist the declaration with `state = Stopped`.
    pub async fn create(
        &self,
        id: &str,
        image_id: &str,
        cpus: u32,
        memory: impl Into<String>,
        disk: impl Into<String>,
    ) -> Result<()> {
        let _guard = self.lock.write().await;

        if self.store.get(id).is_ok() {
            return Err(Error::already_exists(id));
        }

        let image_path = self.instance_dir(id).join(IMAGE_FILE);
        self.images.download(image_id, &image_path).await?;

        self.store.update(&Instance {
            id: id.to_string(),
            image_path,
            hardware: Hardware {
                cpus,
                memory: memory.into(),
                disk: disk.into(),
            },
            mac: self.free_mac()?,
            state: VmState::Stopped,
            pid: None,
        })?;

        tracing::info!(instance = %id, image = %image_id, "instance created");
        Ok(())
    }

    /// Start a stopped instance and hand the process to the lifecycle
    /// loop. An instance that carries a pid is attached to instead of
    /// spawned (crash recovery).
    pub async fn start(&self, id: &str) -> Result<()> {
        let _guard = self.lock.write().await;
        self.start_locked(id).await
    }

    async fn start_locked(&self, id: &str) -> Result<()> {
        let instance = match self.store.get(id) {
            Ok(instance) => instance,
            Err(Error::NotFound { .. }) => {
                return Err(Error::not_startable(id, "does not exist"))
            }
            Err(e) => return Err(e),
        };
        if instance.state != VmState::Stopped {
            return Err(Error::not_startable(id, "not stopped"));
        }

        let dir = self.instance_dir(id);
        std::fs::create_dir_all(&dir)?;
        let stdout_path = dir.join(OUT_LOG);
        let stderr_path = dir.join(ERR_LOG);
        util::touch_file(&stdout_path)?;
        util::touch_file(&stderr_path)?;

        let handle = match instance.pid {
            Some(pid) => self.launcher.attach(id, pid).await?,
            None => {
                self.launcher
                    .start(StartSpec {
                        id: id.to_string(),
                        image: instance.image_path.clone(),
                        stdout_path,
                        stderr_path,
                        hardware: instance.hardware.clone(),
                        mac: instance.mac.clone(),
                    })
                    .await?
            }
        };

        self.lifecycle.submit(id, handle).await?;
        tracing::info!(instance = %id, "instance started");
        Ok(())
    }

    /// Stop an instance.
    ///
    /// With `force` the kill request is fire-and-forget through the
    /// lifecycle loop. Otherwise a QMP `system_powerdown` is forwarded
    /// and its reply awaited.
    pub async fn stop(&self, id: &str, force: bool) -> Result<()> {
        let _guard = self.lock.write().await;

        if force {
            return self.lifecycle.force_stop(id).await;
        }

        let reply = self
            .lifecycle
            .command(
                id,
                SessionKind::Qmp,
                Request::new("system_powerdown"),
                self.command_timeout,
            )
            .await?;
        if let Some(error) = reply.error {
            return Err(Error::transport(format!(
                "system_powerdown rejected: {}",
                error
            )));
        }
        Ok(())
    }

    /// Remove a stopped instance: drop it from the store, publish the
    /// removal, and delete its working directory.
    ///
    /// A missing or still-running instance is left untouched and
    /// reported as success (idempotent at this boundary).
    pub async fn remove(&self, id: &str) -> Result<()> {
        let _guard = self.lock.write().await;

        match self.store.remove(id) {
            Ok(()) => {}
            Err(Error::NotRemoved { .. }) => return Ok(()),
            Err(e) => return Err(e),
        }

        if let Err(e) = self.publisher.vm_removed(id) {
            tracing::warn!(instance = %id, error = %e, "failed to publish removal event");
        }

        let dir = self.instance_dir(id);
        if dir.exists() {
            tokio::fs::remove_dir_all(&dir).await?;
        }
        tracing::info!(instance = %id, "instance removed");
        Ok(())
    }

    /// Describe one instance, or all of them when `id` is empty.
    ///
    /// Guest addresses are enumerated over QGA; instances whose guest
    /// agent is not ready contribute an entry without addresses, never
    /// an error.
    pub async fn info(&self, id: &str) -> Result<Vec<VmInfo>> {
        let _guard = self.lock.read().await;

        let instances = if id.is_empty() {
            self.store.list()?
        } else {
            vec![self.store.get(id)?]
        };

        let mut result = Vec::with_capacity(instances.len());
        for instance in instances {
            let mut info = VmInfo {
                name: instance.id.clone(),
                state: instance.state,
                hardware: Some(instance.hardware.clone()),
                ip_addresses: Vec::new(),
            };

            match self
                .lifecycle
                .command(
                    &instance.id,
                    SessionKind::Qga,
                    Request::new("guest-network-get-interfaces"),
                    self.command_timeout,
                )
                .await
            {
                Ok(reply) => {
                    if let Some(ret) = reply.ret {
                        info.ip_addresses = guest_addresses(&ret);
                    }
                }
                Err(e) if e.is_not_ready() => {}
                Err(e) => {
                    tracing::debug!(instance = %info.name, error = %e, "address enumeration failed");
                }
            }

            // try_send: the ingestion task may be waiting on the manager
            // lock this call holds.
            let _ = self.status_tx.try_send(StatusEvent::Info {
                id: info.name.clone(),
                ip_addresses: info.ip_addresses.clone(),
            });

            result.push(info);
        }

        Ok(result)
    }

    /// Ask the lifecycle loop to cancel all supervisions and exit.
    pub fn shutdown(&self) {
        self.lifecycle.shutdown();
    }

    fn instance_dir(&self, id: &str) -> PathBuf {
        self.instances_dir.join(id)
    }

    fn free_mac(&self) -> Result<String> {
        loop {
            let mac = util::generate_mac();
            if !self.store.mac_in_use(&mac)? {
                return Ok(mac);
            }
            tracing::debug!(mac = %mac, "generated mac already in use, retrying");
        }
    }

    async fn ingest_loop(self: Arc<Self>, mut status_rx: mpsc::Receiver<StatusEvent>) {
        while let Some(event) = status_rx.recv().await {
            self.ingest(event).await;
        }
        tracing::debug!("status channel closed, ingestion stopped");
    }

    async fn ingest(&self, event: StatusEvent) {
        match event {
            StatusEvent::Status { id, running } => {
                let _guard = self.lock.write().await;
                let Ok(mut instance) = self.store.get(&id) else {
                    return;
                };

                let observed = if running {
                    VmState::Running
                } else {
                    VmState::Stopped
                };
                if instance.state != observed {
                    instance.state = observed;
                    if let Err(e) = self.store.update(&instance) {
                        tracing::error!(instance = %id, error = %e, "failed to write state");
                    }
                    if let Err(e) = self.publisher.vm_updated(VmInfo {
                        name: instance.id.clone(),
                        state: instance.state,
                        hardware: None,
                        ip_addresses: Vec::new(),
                    }) {
                        tracing::warn!(instance = %id, error = %e, "failed to publish state update");
                    }
                }
                if !running && instance.pid.is_some() {
                    instance.pid = None;
                    if let Err(e) = self.store.update(&instance) {
                        tracing::error!(instance = %id, error = %e, "failed to clear pid");
                    }
                }
            }
            StatusEvent::Pid { id, pid } => {
                let _guard = self.lock.write().await;
                let Ok(mut instance) = self.store.get(&id) else {
                    return;
                };
                instance.pid = Some(pid);
                if let Err(e) = self.store.update(&instance) {
                    // The pid may have been reassigned concurrently; a
                    // uniqueness conflict here is a write-back race, not
                    // a failure of the ingesting task.
                    tracing::warn!(instance = %id, pid = pid, error = %e, "failed to write pid");
                }
            }
            StatusEvent::Info { id, ip_addresses } => {
                let Ok(instance) = self.store.get(&id) else {
                    return;
                };
                if let Err(e) = self.publisher.vm_updated(VmInfo {
                    name: instance.id,
                    state: instance.state,
                    hardware: None,
                    ip_addresses,
                }) {
                    tracing::warn!(instance = %id, error = %e, "failed to publish info update");
                }
            }
        }
    }
}

/// Extract usable guest addresses from a QGA
/// `guest-network-get-interfaces` reply, dropping loopback and
/// link-local entries.
fn guest_addresses(ret: &Value) -> Vec<String> {
    let mut addresses = Vec::new();
    let Some(interfaces) = ret.as_array() else {
        return addresses;
    };
    for interface in interfaces {
        let Some(addrs) = interface.get("ip-addresses").and_then(Value::as_array) else {
            continue;
        };
        for addr in addrs {
            let Some(text) = addr.get("ip-address").and_then(Value::as_str) else {
                continue;
            };
            let Ok(ip) = text.parse::<IpAddr>() else {
                continue;
            };
            if ip.is_loopback() || is_link_local(&ip) {
                continue;
            }
            addresses.push(text.to_string());
        }
    }
    addresses
}

fn is_link_local(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_link_local(),
        IpAddr::V6(v6) => (v6.segments()[0] & 0xffc0) == 0xfe80,
    }
}

/// A wired-up controller: manager, event stream, and the lifecycle loop
/// task.
pub struct Fleet {
    /// The fleet facade.
    pub manager: Arc<Manager>,
    /// Receiving end of the de-duplicated event stream.
    pub events: mpsc::Receiver<FleetEvent>,
    /// Join handle of the lifecycle loop.
    pub lifecycle_task: JoinHandle<()>,
}

/// Construct the whole controller stack from a configuration and the
/// three collaborators.
///
/// There is exactly one manager per store; callers thread the returned
/// handle through instead of relying on any process-wide global.
pub async fn bootstrap(
    config: &FleetConfig,
    launcher: Arc<dyn QemuLauncher>,
    images: Arc<dyn ImageRegistry>,
    network: Arc<dyn NetworkManager>,
) -> Result<Fleet> {
    let store = StateStore::open_at(&config.db_path())?;
    let monitor = InstanceMonitor::new();
    let (status_tx, status_rx) = mpsc::channel(STATUS_CHANNEL_CAPACITY);
    let (lifecycle, lifecycle_task) =
        LifecycleLoop::spawn(monitor, network, status_tx.clone(), config.attach_deadline());
    let (publisher, events) = EventPublisher::new(config.event_queue_capacity);

    let manager = Manager::new(
        &config.root_dir,
        store,
        launcher,
        images,
        lifecycle,
        publisher,
        status_tx,
        status_rx,
        config.command_timeout(),
    )
    .await?;

    Ok(Fleet {
        manager,
        events,
        lifecycle_task,
    })
}
