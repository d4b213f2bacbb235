//! De-duplicating broadcast of VM status to subscribers.
//!
//! The publisher keeps the last [`VmInfo`] it emitted per instance and
//! drops structurally equal repeats, so subscribers only hear about
//! actual changes. The outbound queue is bounded; when it is full the
//! newest event is dropped and [`Error::QueueFull`] returned to the
//! caller. Publishing never blocks state mutation.

use crate::error::{Error, Result};
use crate::instance::VmInfo;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Default capacity of the outbound event queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 100;

/// An event delivered to fleet subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FleetEvent {
    /// A VM's observable state changed.
    VmUpdated(VmInfo),
    /// A VM was removed; only the name is populated.
    VmRemoved {
        /// Id of the removed VM.
        name: String,
    },
    /// An error worth surfacing to subscribers.
    Error {
        /// Human-readable description.
        message: String,
        /// The resource the error relates to.
        resource: String,
    },
}

/// De-duplicating event publisher.
///
/// Cheap to clone; clones share the dedup cache and the queue.
#[derive(Clone)]
pub struct EventPublisher {
    tx: mpsc::Sender<FleetEvent>,
    last_info: Arc<Mutex<HashMap<String, VmInfo>>>,
}

impl EventPublisher {
    /// Create a publisher with a bounded outbound queue, returning the
    /// receiving end for the subscriber side.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<FleetEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            Self {
                tx,
                last_info: Arc::new(Mutex::new(HashMap::new())),
            },
            rx,
        )
    }

    /// Publish a VM update, dropping it if nothing changed since the last
    /// published info for that VM.
    pub fn vm_updated(&self, info: VmInfo) -> Result<()> {
        {
            let mut cache = self.last_info.lock();
            if cache.get(&info.name) == Some(&info) {
                return Ok(());
            }
            cache.insert(info.name.clone(), info.clone());
        }
        self.enqueue(FleetEvent::VmUpdated(info))
    }

    /// Publish a VM removal and forget its cached info.
    pub fn vm_removed(&self, id: &str) -> Result<()> {
        self.last_info.lock().remove(id);
        self.enqueue(FleetEvent::VmRemoved {
            name: id.to_string(),
        })
    }

    /// Publish an error event.
    pub fn error(&self, message: impl Into<String>, resource: impl Into<String>) -> Result<()> {
        self.enqueue(FleetEvent::Error {
            message: message.into(),
            resource: resource.into(),
        })
    }

    fn enqueue(&self, event: FleetEvent) -> Result<()> {
        match self.tx.try_send(event) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(Error::QueueFull),
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(Error::transport("event subscriber gone"))
            }
        }
    }
}
