//! qfleet - QEMU VM fleet controller
//!
//! qfleet accepts high-level VM requests (create, start, stop, remove,
//! query), persists per-VM declarative state, supervises the lifecycle
//! of running QEMU processes, and keeps control-plane state consistent
//! with observed runtime status through the QMP and QGA side channels.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │  Manager (facade, sole StateStore writer)       │
//! ├─────────────────────────────────────────────────┤
//! │  LifecycleLoop (per-VM supervision actor)       │
//! ├─────────────────────────────────────────────────┤
//! │  InstanceMonitor (QMP/QGA session multiplexer)  │
//! ├─────────────────────────────────────────────────┤
//! │  StateStore (redb) · EventPublisher (dedup)     │
//! └─────────────────────────────────────────────────┘
//! ```
//!
//! The manager hands started QEMU processes to the lifecycle loop,
//! which registers their QMP/QGA sockets with the monitor and watches
//! for completion. Observed status flows back through a single channel
//! into the manager's ingestion task, which writes it through to the
//! store and publishes de-duplicated events to subscribers.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use qfleet::{bootstrap, FleetConfig, LocalImageRegistry, NoopNetworkManager, SystemQemuLauncher};
//!
//! # async fn run() -> qfleet::Result<()> {
//! let config = FleetConfig::load()?;
//! let network = Arc::new(NoopNetworkManager);
//! let fleet = bootstrap(
//!     &config,
//!     Arc::new(SystemQemuLauncher::new(
//!         &config.qemu_binary,
//!         config.instances_dir(),
//!         network.clone(),
//!     )),
//!     Arc::new(LocalImageRegistry::new(&config.image_dir)),
//!     network,
//! )
//! .await?;
//!
//! fleet.manager.create("vm1", "alpine.img", 2, "1G", "10G").await?;
//! fleet.manager.start("vm1").await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod events;
pub mod images;
pub mod instance;
pub mod lifecycle;
pub mod manager;
pub mod monitor;
pub mod network;
pub mod process;
pub mod qemu;
pub mod store;
pub mod util;

// Re-export main types for convenience
pub use config::FleetConfig;
pub use error::{Error, Result};
pub use events::{EventPublisher, FleetEvent};
pub use images::{ImageRegistry, LocalImageRegistry};
pub use instance::{Hardware, Instance, VmInfo, VmState};
pub use lifecycle::{LifecycleHandle, LifecycleLoop, SessionKind, StatusEvent};
pub use manager::{bootstrap, Fleet, Manager};
pub use monitor::{InstanceMonitor, Reply, Request};
pub use network::{NetworkManager, NoopNetworkManager};
pub use qemu::{InstanceHandle, QemuLauncher, StartSpec, SystemQemuLauncher};
pub use store::StateStore;

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
