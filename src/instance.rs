//! VM instance records.
//!
//! An [`Instance`] is the persistent declaration of a VM: identity, boot
//! image, hardware shape, network address, and observed runtime state.
//! The state store enforces the record's uniqueness invariants; this
//! module owns the record types and the required-field validation that
//! runs at the store boundary.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// VM lifecycle state.
///
/// The wire protocols of some front ends expose richer state machines;
/// the controller core only distinguishes these two.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum VmState {
    /// No process is associated with the instance.
    #[default]
    Stopped,
    /// A QEMU process is (believed to be) running.
    Running,
}

impl std::fmt::Display for VmState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VmState::Stopped => write!(f, "stopped"),
            VmState::Running => write!(f, "running"),
        }
    }
}

/// Hardware shape of a VM.
///
/// `memory` and `disk` are opaque size specifiers passed through to QEMU
/// (e.g. `"1G"`, `"10G"`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Hardware {
    /// Number of vCPUs. Must be greater than zero.
    pub cpus: u32,
    /// Memory size specifier.
    pub memory: String,
    /// Disk size specifier.
    pub disk: String,
}

/// Persistent declaration of a VM.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Instance {
    /// Primary key. Non-empty.
    pub id: String,

    /// Local filesystem path to the boot image.
    pub image_path: PathBuf,

    /// Hardware shape.
    pub hardware: Hardware,

    /// Locally-administered Ethernet address. Unique across all instances.
    pub mac: String,

    /// Lifecycle state.
    #[serde(default)]
    pub state: VmState,

    /// OS process id of the QEMU process when running. Unique across all
    /// instances while present.
    #[serde(default)]
    pub pid: Option<i32>,
}

impl Instance {
    /// Validate required fields.
    ///
    /// Runs at the store boundary before any write; an incomplete record
    /// is rejected without mutation.
    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(Error::constraint("instance id must not be empty"));
        }
        if self.mac.is_empty() {
            return Err(Error::constraint("instance mac must not be empty"));
        }
        if self.hardware.cpus == 0 {
            return Err(Error::constraint("instance cpus must be greater than zero"));
        }
        if self.hardware.memory.is_empty() {
            return Err(Error::constraint("instance memory must not be empty"));
        }
        if self.hardware.disk.is_empty() {
            return Err(Error::constraint("instance disk must not be empty"));
        }
        Ok(())
    }
}

/// Point-in-time view of a VM handed to event subscribers and `info`
/// callers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VmInfo {
    /// Instance id.
    pub name: String,
    /// Lifecycle state at observation time.
    pub state: VmState,
    /// Hardware shape, when the caller asked for it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hardware: Option<Hardware>,
    /// Guest IP addresses reported over QGA; loopback and link-local
    /// addresses are filtered out. Empty when the guest agent is not
    /// ready.
    #[serde(default)]
    pub ip_addresses: Vec<String>,
}
