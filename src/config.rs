//! Controller configuration.
//!
//! Persistent daemon settings: where state lives, which QEMU binary to
//! drive, and the timeouts of the lifecycle kernel. Loaded and saved
//! through confy; missing files yield the defaults.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Application name for config file storage.
const APP_NAME: &str = "qfleet";

/// Controller configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetConfig {
    /// Configuration format version.
    pub version: u8,

    /// Root directory for the state store and per-instance directories.
    pub root_dir: PathBuf,

    /// QEMU system binary to launch instances with.
    pub qemu_binary: String,

    /// Directory the local image registry resolves image ids in.
    pub image_dir: PathBuf,

    /// Capacity of the outbound event queue.
    #[serde(default = "default_event_queue_capacity")]
    pub event_queue_capacity: usize,

    /// Bound, in seconds, on registering a started instance's sockets
    /// with the monitor.
    #[serde(default = "default_attach_deadline_secs")]
    pub attach_deadline_secs: u64,

    /// Budget, in seconds, for a single QMP/QGA command reply.
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
}

fn default_event_queue_capacity() -> usize {
    crate::events::DEFAULT_QUEUE_CAPACITY
}

fn default_attach_deadline_secs() -> u64 {
    crate::lifecycle::DEFAULT_ATTACH_DEADLINE.as_secs()
}

fn default_command_timeout_secs() -> u64 {
    30
}

impl Default for FleetConfig {
    fn default() -> Self {
        let root_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("/var/lib"))
            .join(APP_NAME);
        Self {
            version: 1,
            image_dir: root_dir.join("images"),
            root_dir,
            qemu_binary: default_qemu_binary().to_string(),
            event_queue_capacity: default_event_queue_capacity(),
            attach_deadline_secs: default_attach_deadline_secs(),
            command_timeout_secs: default_command_timeout_secs(),
        }
    }
}

#[cfg(target_arch = "aarch64")]
fn default_qemu_binary() -> &'static str {
    "qemu-system-aarch64"
}

#[cfg(not(target_arch = "aarch64"))]
fn default_qemu_binary() -> &'static str {
    "qemu-system-x86_64"
}

impl FleetConfig {
    /// Load configuration from the default location.
    ///
    /// Returns the defaults when no configuration file exists yet.
    pub fn load() -> Result<Self> {
        confy::load(APP_NAME, None).map_err(|e| Error::config("load", e.to_string()))
    }

    /// Save configuration to the default location.
    pub fn save(&self) -> Result<()> {
        confy::store(APP_NAME, None, self).map_err(|e| Error::config("save", e.to_string()))
    }

    /// Path of the embedded state store.
    pub fn db_path(&self) -> PathBuf {
        self.root_dir.join("db").join("fleet.redb")
    }

    /// Directory of per-instance working directories.
    pub fn instances_dir(&self) -> PathBuf {
        self.root_dir.join("instances")
    }

    /// Bound on monitor socket registration per instance.
    pub fn attach_deadline(&self) -> Duration {
        Duration::from_secs(self.attach_deadline_secs)
    }

    /// Budget for a single command reply.
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}
