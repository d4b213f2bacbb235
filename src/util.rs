//! Small filesystem and address helpers shared across the crate.

use crate::error::{Error, Result};
use rand::RngCore;
use std::path::Path;
use std::time::Duration;

/// Poll interval while waiting for a path to appear.
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Generate a random 48-bit MAC address.
///
/// The locally-administered bit is set and the multicast bit cleared, so
/// the address never collides with vendor-assigned hardware. Uniqueness
/// against the state store is the caller's responsibility (retry on
/// collision).
pub fn generate_mac() -> String {
    let mut octets = [0u8; 6];
    rand::thread_rng().fill_bytes(&mut octets);
    octets[0] = (octets[0] | 0x02) & 0xfe;
    format!(
        "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        octets[0], octets[1], octets[2], octets[3], octets[4], octets[5]
    )
}

/// Create an empty file if it does not exist, updating its mtime if it does.
pub fn touch_file(path: &Path) -> Result<()> {
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    file.set_modified(std::time::SystemTime::now())?;
    Ok(())
}

/// Wait for a path to appear on disk, bounded by `deadline`.
///
/// QEMU creates its QMP/QGA sockets asynchronously after the process
/// starts; callers poll here before connecting.
pub async fn wait_for_path(path: &Path, deadline: Duration) -> Result<()> {
    let start = tokio::time::Instant::now();
    loop {
        if path.exists() {
            return Ok(());
        }
        if start.elapsed() >= deadline {
            return Err(Error::timeout(format!(
                "path did not appear within {:?}: {}",
                deadline,
                path.display()
            )));
        }
        tokio::time::sleep(WAIT_POLL_INTERVAL).await;
    }
}
