//! The in-memory index of device liveness and pending commands.
//!
//! Backed by a process-visible key/value store with per-key TTL so that every
//! orchestrator replica sees the same fleet. A device is live exactly while
//! its `live:{device_id}` entry exists; the entry expires after
//! `miss_threshold * heartbeat_interval`.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use edgeorchestra_core::{Command, DeviceId, DeviceMetrics};

use crate::storage::{LivenessStorage, StaleSequence, StorageResult};

/// Commands queued per device; overflow drops the oldest non-durable entry.
pub const COMMAND_QUEUE_CAP: usize = 32;

/// The last observed heartbeat of a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatSnapshot {
    /// Monotonic per-session counter reported by the worker.
    pub seq: u64,
    pub received_at: DateTime<Utc>,
    pub metrics: DeviceMetrics,
}

/// An error returned when a heartbeat cannot be ingested.
#[derive(Error, Debug)]
pub enum IngestError {
    #[error(transparent)]
    Stale(#[from] StaleSequence),
    #[error(transparent)]
    Storage(#[from] crate::storage::StorageError),
}

/// The liveness tracker.
#[derive(Clone)]
pub struct LivenessTracker<T> {
    store: T,
    ttl: Duration,
}

impl<T> LivenessTracker<T>
where
    T: LivenessStorage,
{
    /// Creates a tracker whose entries live for
    /// `miss_threshold * heartbeat_interval`.
    pub fn new(store: T, heartbeat_interval: Duration, miss_threshold: u32) -> Self {
        Self {
            store,
            ttl: heartbeat_interval * miss_threshold,
        }
    }

    /// Records a heartbeat. Rejects sequence numbers that do not advance the
    /// stored one (stale-stream defense).
    pub async fn ingest(
        &mut self,
        id: &DeviceId,
        seq: u64,
        metrics: &DeviceMetrics,
    ) -> Result<(), IngestError> {
        let snapshot = HeartbeatSnapshot {
            seq,
            received_at: Utc::now(),
            metrics: metrics.clone(),
        };
        self.store
            .upsert_heartbeat(id, &snapshot, self.ttl)
            .await?
            .into_inner()?;
        debug!(device_id = %id, seq, "heartbeat ingested");
        Ok(())
    }

    /// Whether the device has a live heartbeat entry.
    pub async fn is_live(&mut self, id: &DeviceId) -> StorageResult<bool> {
        Ok(self.store.heartbeat(id).await?.is_some())
    }

    /// Returns the live snapshot of a device, if any.
    pub async fn snapshot(&mut self, id: &DeviceId) -> StorageResult<Option<HeartbeatSnapshot>> {
        self.store.heartbeat(id).await
    }

    /// Drops the liveness entry of a device, if present.
    pub async fn forget(&mut self, id: &DeviceId) -> StorageResult<()> {
        self.store.remove_heartbeat(id).await
    }

    /// Queues a command for delivery on the device's next heartbeat response.
    pub async fn queue_command(&mut self, id: &DeviceId, command: &Command) -> StorageResult<()> {
        if let Some(dropped) = self
            .store
            .push_command(id, command, COMMAND_QUEUE_CAP)
            .await?
        {
            warn!(
                device_id = %id,
                dropped = dropped.kind(),
                "command queue full, dropped oldest entry"
            );
        }
        Ok(())
    }

    /// Pops the oldest queued command of a device, if any. Consumers pop one
    /// entry per heartbeat response.
    pub async fn pop_command(&mut self, id: &DeviceId) -> StorageResult<Option<Command>> {
        self.store.pop_command(id).await
    }
}
