//! Fleet-wide events.
//!
//! Components that observe the fleet (today: the stale-device sweeper)
//! publish here; every running job coordinator subscribes for straggler
//! handling.

use tokio::sync::broadcast;

use edgeorchestra_core::DeviceId;

/// An event concerning the fleet as a whole.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FleetEvent {
    /// A device stopped heartbeating and was downgraded to `offline`.
    DeviceOffline(DeviceId),
}

/// The fleet event bus. Cheap to clone; every clone publishes into the same
/// channel.
#[derive(Debug, Clone)]
pub struct FleetEvents {
    tx: broadcast::Sender<FleetEvent>,
}

impl FleetEvents {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(64);
        Self { tx }
    }

    /// Publishes an event to all current subscribers. Events published while
    /// nobody listens are dropped.
    pub fn publish(&self, event: FleetEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FleetEvent> {
        self.tx.subscribe()
    }
}

impl Default for FleetEvents {
    fn default() -> Self {
        Self::new()
    }
}
