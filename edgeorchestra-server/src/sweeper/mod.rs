//! The stale-device sweeper.
//!
//! A periodic task that downgrades devices whose liveness entry expired.
//! Because the liveness TTL is `miss_threshold * heartbeat_interval`, a
//! device that stops heartbeating goes `offline` within one sweep period of
//! crossing that threshold. Sweeping is idempotent: rerunning on an already
//! swept fleet changes nothing.

use std::time::Duration;

use tracing::{debug, error, info};

use edgeorchestra_core::DeviceStatus;

use crate::{
    events::{FleetEvent, FleetEvents},
    storage::{DeviceStorage, LivenessStorage, StorageResult},
};

pub struct Sweeper<T> {
    store: T,
    period: Duration,
    events: FleetEvents,
}

impl<T> Sweeper<T>
where
    T: DeviceStorage + LivenessStorage,
{
    pub fn new(store: T, period: Duration, events: FleetEvents) -> Self {
        Self {
            store,
            period,
            events,
        }
    }

    /// Runs the sweeper until the process shuts down.
    pub async fn run(mut self) {
        info!(period_s = self.period.as_secs(), "stale-device sweeper started");
        let mut ticker = tokio::time::interval(self.period);
        // The first tick fires immediately; skip it so a freshly started
        // orchestrator gives reconnecting devices one full period.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if let Err(err) = self.sweep().await {
                error!(error = %err, "sweep failed");
            }
        }
    }

    /// One pass over the fleet. Returns the number of devices downgraded.
    pub async fn sweep(&mut self) -> StorageResult<usize> {
        let mut candidates = self.store.list_devices(Some(DeviceStatus::Online)).await?;
        candidates.extend(self.store.list_devices(Some(DeviceStatus::Training)).await?);

        let mut swept = 0;
        for device in candidates {
            if self.store.heartbeat(&device.id).await?.is_some() {
                continue;
            }
            self.store
                .set_device_status(&device.id, DeviceStatus::Offline)
                .await?;
            self.store.remove_heartbeat(&device.id).await?;
            self.events.publish(FleetEvent::DeviceOffline(device.id));
            debug!(device_id = %device.id, "device marked offline");
            swept += 1;
        }
        Ok(swept)
    }
}
