//! Storage API.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use derive_more::Deref;
use displaydoc::Display;
use thiserror::Error;

use edgeorchestra_core::{Command, DeviceId, DeviceMetrics, DeviceStatus, JobId, ModelId};

use crate::{
    coordinator::job::{JobRecord, JobStatus, RoundRecord, Submission},
    liveness::HeartbeatSnapshot,
    registry::Device,
};

/// The error type for storage operations that are not directly related to the
/// application domain, for example broken connections or I/O failures.
pub type StorageError = anyhow::Error;

/// The result of a storage operation.
pub type StorageResult<T> = Result<T, StorageError>;

#[async_trait]
/// Storage for the authoritative device rows.
pub trait DeviceStorage
where
    Self: Clone + Send + Sync + 'static,
{
    /// Inserts a device row. An existing row with the same id is overwritten.
    async fn insert_device(&mut self, device: &Device) -> StorageResult<()>;

    /// Returns the device row with the given id, if any.
    async fn device(&mut self, id: &DeviceId) -> StorageResult<Option<Device>>;

    /// Returns all device rows, optionally filtered by status.
    async fn list_devices(&mut self, status: Option<DeviceStatus>) -> StorageResult<Vec<Device>>;

    /// Updates the liveness fields of a device row.
    ///
    /// # Behavior
    ///
    /// - If the row exists, update `last_metrics`, `status` and
    ///   `last_seen_at` and return `Ok(true)`.
    /// - If the row does not exist, return `Ok(false)`.
    async fn touch_device(
        &mut self,
        id: &DeviceId,
        metrics: &DeviceMetrics,
        status: DeviceStatus,
        seen_at: DateTime<Utc>,
    ) -> StorageResult<bool>;

    /// Updates only the status of a device row. Returns whether the row
    /// exists.
    async fn set_device_status(
        &mut self,
        id: &DeviceId,
        status: DeviceStatus,
    ) -> StorageResult<bool>;
}

#[async_trait]
/// Storage for job, round and submission rows.
///
/// Round and submission rows are only ever written by the job coordinator
/// task that owns them; uniqueness of `(device_id, round)` within a job is
/// nevertheless enforced here as a backstop.
pub trait JobStorage
where
    Self: Clone + Send + Sync + 'static,
{
    /// Inserts or overwrites a job row.
    async fn upsert_job(&mut self, job: &JobRecord) -> StorageResult<()>;

    /// Returns the job row with the given id, if any.
    async fn job(&mut self, id: &JobId) -> StorageResult<Option<JobRecord>>;

    /// Returns all job rows, optionally filtered by status.
    async fn list_jobs(&mut self, status: Option<JobStatus>) -> StorageResult<Vec<JobRecord>>;

    /// Inserts or overwrites a round row.
    async fn upsert_round(&mut self, round: &RoundRecord) -> StorageResult<()>;

    /// Returns the round row `(job_id, round)`, if any.
    async fn round(&mut self, job_id: &JobId, round: u32) -> StorageResult<Option<RoundRecord>>;

    /// Adds a submission row.
    ///
    /// # Behavior
    ///
    /// - If no submission for `(device_id, round)` exists within the job,
    ///   insert it and return `Ok(SubmissionAdd)` containing `Ok(())`.
    /// - If one exists, return `Ok(SubmissionAdd)` containing
    ///   `Err(SubmissionAddError::AlreadySubmitted)`.
    async fn add_submission(&mut self, submission: &Submission) -> StorageResult<SubmissionAdd>;

    /// Returns the submissions of `(job_id, round)` ordered by device id.
    async fn submissions(
        &mut self,
        job_id: &JobId,
        round: u32,
    ) -> StorageResult<Vec<Submission>>;

    /// Discards the submissions of `(job_id, round)`. Called when a round
    /// aborts so that a retried round accepts fresh submissions.
    async fn remove_submissions(&mut self, job_id: &JobId, round: u32) -> StorageResult<()>;
}

#[async_trait]
/// Ephemeral liveness storage: TTL'd heartbeat snapshots and per-device
/// command queues. Losing this data on restart is acceptable.
pub trait LivenessStorage
where
    Self: Clone + Send + Sync + 'static,
{
    /// Stores a heartbeat snapshot with the given time-to-live.
    ///
    /// # Behavior
    ///
    /// - If no snapshot exists or the stored sequence is lower, store the
    ///   snapshot and return `Ok(HeartbeatUpsert)` containing `Ok(())`.
    /// - If the stored sequence is greater or equal, leave the entry
    ///   untouched and return `Ok(HeartbeatUpsert)` containing
    ///   `Err(StaleSequence)`.
    async fn upsert_heartbeat(
        &mut self,
        id: &DeviceId,
        snapshot: &HeartbeatSnapshot,
        ttl: Duration,
    ) -> StorageResult<HeartbeatUpsert>;

    /// Returns the live heartbeat snapshot of a device, if any.
    async fn heartbeat(&mut self, id: &DeviceId) -> StorageResult<Option<HeartbeatSnapshot>>;

    /// Drops the heartbeat snapshot of a device, if present.
    async fn remove_heartbeat(&mut self, id: &DeviceId) -> StorageResult<()>;

    /// Appends a command to the device's queue, bounded to `cap` entries.
    ///
    /// # Behavior
    ///
    /// On overflow the oldest non-durable entry is dropped and returned so
    /// the caller can log it; durable commands are never dropped.
    async fn push_command(
        &mut self,
        id: &DeviceId,
        command: &Command,
        cap: usize,
    ) -> StorageResult<Option<Command>>;

    /// Pops the oldest queued command of a device, if any.
    async fn pop_command(&mut self, id: &DeviceId) -> StorageResult<Option<Command>>;
}

/// Size and timestamps of a stored model artifact.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelStat {
    pub size: u64,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
/// Content-addressed model blob storage.
pub trait ModelStorage
where
    Self: Clone + Send + Sync + 'static,
{
    /// Stores a blob under its content address and returns the address.
    /// Storing the same bytes twice is a no-op returning the same id.
    async fn put_model(&mut self, bytes: &[u8]) -> StorageResult<ModelId>;

    /// Returns the bytes of a blob, if present.
    async fn model(&mut self, id: &ModelId) -> StorageResult<Option<Vec<u8>>>;

    /// Returns size and creation time of a blob, if present.
    async fn model_stat(&mut self, id: &ModelId) -> StorageResult<Option<ModelStat>>;

    /// Adds a named garbage-collection reference to a blob.
    async fn pin_model(&mut self, id: &ModelId, reference: &str) -> StorageResult<()>;

    /// Removes a named garbage-collection reference from a blob.
    async fn unpin_model(&mut self, id: &ModelId, reference: &str) -> StorageResult<()>;

    /// Deletes blobs with zero references that are older than `retention` and
    /// returns their ids.
    async fn collect_garbage(&mut self, retention: Duration) -> StorageResult<Vec<ModelId>>;
}

#[async_trait]
/// The combined storage the orchestrator runs on.
pub trait Storage:
    DeviceStorage + JobStorage + LivenessStorage + ModelStorage
{
    /// Checks if every backing store is ready to process requests.
    ///
    /// # Behavior
    ///
    /// Returns `Ok(())` when all inner stores can process requests, and the
    /// first connection error otherwise.
    async fn is_ready(&mut self) -> StorageResult<()>;
}

/// A wrapper that contains the result of the "add submission" operation.
#[derive(Deref, Debug)]
pub struct SubmissionAdd(pub(crate) Result<(), SubmissionAddError>);

impl SubmissionAdd {
    /// Unwraps this wrapper, returning the underlying result.
    pub fn into_inner(self) -> Result<(), SubmissionAddError> {
        self.0
    }
}

/// Error that can occur when adding a submission row.
#[derive(Display, Error, Debug, PartialEq, Eq)]
pub enum SubmissionAddError {
    /// the device already submitted for this round
    AlreadySubmitted,
}

/// A wrapper that contains the result of the "upsert heartbeat" operation.
#[derive(Deref, Debug)]
pub struct HeartbeatUpsert(pub(crate) Result<(), StaleSequence>);

impl HeartbeatUpsert {
    /// Unwraps this wrapper, returning the underlying result.
    pub fn into_inner(self) -> Result<(), StaleSequence> {
        self.0
    }
}

/// Error that can occur when a heartbeat arrives with a sequence number that
/// does not advance the stored one.
#[derive(Error, Debug, PartialEq, Eq)]
#[error("stale heartbeat sequence: stored {stored}, received {received}")]
pub struct StaleSequence {
    pub stored: u64,
    pub received: u64,
}
