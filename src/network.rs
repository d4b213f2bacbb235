//! Host network configuration for VM instances.
//!
//! Platforms with a managed bridge allocate a tap interface per VM
//! before launch and release it after the process exits. Platforms
//! without the facility use the no-op manager and fall back to
//! user-mode networking in the launcher.

use crate::error::Result;

/// Pre-/post-VM host network hooks.
pub trait NetworkManager: Send + Sync {
    /// Allocate a host-side interface for the instance.
    ///
    /// Returns the tap device name to hand to QEMU, or `None` when the
    /// platform manages no interfaces.
    fn create_interface(&self, id: &str) -> Result<Option<String>>;

    /// Release the instance's host-side interface, if any.
    fn remove_interface(&self, id: &str) -> Result<()>;
}

/// Network manager for platforms without host bridge management.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopNetworkManager;

impl NetworkManager for NoopNetworkManager {
    fn create_interface(&self, _id: &str) -> Result<Option<String>> {
        Ok(None)
    }

    fn remove_interface(&self, _id: &str) -> Result<()> {
        Ok(())
    }
}
