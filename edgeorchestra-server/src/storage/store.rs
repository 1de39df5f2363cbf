//! A generic store composing one backend per storage concern.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use edgeorchestra_core::{Command, DeviceId, DeviceMetrics, DeviceStatus, JobId, ModelId};

use crate::{
    coordinator::job::{JobRecord, JobStatus, RoundRecord, Submission},
    liveness::HeartbeatSnapshot,
    registry::Device,
    storage::{
        DeviceStorage,
        HeartbeatUpsert,
        JobStorage,
        LivenessStorage,
        ModelStat,
        ModelStorage,
        Storage,
        StorageResult,
        SubmissionAdd,
    },
};

#[derive(Clone)]
/// A generic store.
pub struct Store<D, J, L, M>
where
    D: DeviceStorage,
    J: JobStorage,
    L: LivenessStorage,
    M: ModelStorage,
{
    /// Device rows.
    devices: D,
    /// Job, round and submission rows.
    jobs: J,
    /// Ephemeral liveness and command queues.
    liveness: L,
    /// Content-addressed model blobs.
    models: M,
}

impl<D, J, L, M> Store<D, J, L, M>
where
    D: DeviceStorage,
    J: JobStorage,
    L: LivenessStorage,
    M: ModelStorage,
{
    /// Creates a new [`Store`].
    pub fn new(devices: D, jobs: J, liveness: L, models: M) -> Self {
        Self {
            devices,
            jobs,
            liveness,
            models,
        }
    }
}

#[async_trait]
impl<D, J, L, M> DeviceStorage for Store<D, J, L, M>
where
    D: DeviceStorage,
    J: JobStorage,
    L: LivenessStorage,
    M: ModelStorage,
{
    async fn insert_device(&mut self, device: &Device) -> StorageResult<()> {
        self.devices.insert_device(device).await
    }

    async fn device(&mut self, id: &DeviceId) -> StorageResult<Option<Device>> {
        self.devices.device(id).await
    }

    async fn list_devices(&mut self, status: Option<DeviceStatus>) -> StorageResult<Vec<Device>> {
        self.devices.list_devices(status).await
    }

    async fn touch_device(
        &mut self,
        id: &DeviceId,
        metrics: &DeviceMetrics,
        status: DeviceStatus,
        seen_at: DateTime<Utc>,
    ) -> StorageResult<bool> {
        self.devices.touch_device(id, metrics, status, seen_at).await
    }

    async fn set_device_status(
        &mut self,
        id: &DeviceId,
        status: DeviceStatus,
    ) -> StorageResult<bool> {
        self.devices.set_device_status(id, status).await
    }
}

#[async_trait]
impl<D, J, L, M> JobStorage for Store<D, J, L, M>
where
    D: DeviceStorage,
    J: JobStorage,
    L: LivenessStorage,
    M: ModelStorage,
{
    async fn upsert_job(&mut self, job: &JobRecord) -> StorageResult<()> {
        self.jobs.upsert_job(job).await
    }

    async fn job(&mut self, id: &JobId) -> StorageResult<Option<JobRecord>> {
        self.jobs.job(id).await
    }

    async fn list_jobs(&mut self, status: Option<JobStatus>) -> StorageResult<Vec<JobRecord>> {
        self.jobs.list_jobs(status).await
    }

    async fn upsert_round(&mut self, round: &RoundRecord) -> StorageResult<()> {
        self.jobs.upsert_round(round).await
    }

    async fn round(&mut self, job_id: &JobId, round: u32) -> StorageResult<Option<RoundRecord>> {
        self.jobs.round(job_id, round).await
    }

    async fn add_submission(&mut self, submission: &Submission) -> StorageResult<SubmissionAdd> {
        self.jobs.add_submission(submission).await
    }

    async fn submissions(
        &mut self,
        job_id: &JobId,
        round: u32,
    ) -> StorageResult<Vec<Submission>> {
        self.jobs.submissions(job_id, round).await
    }

    async fn remove_submissions(&mut self, job_id: &JobId, round: u32) -> StorageResult<()> {
        self.jobs.remove_submissions(job_id, round).await
    }
}

#[async_trait]
impl<D, J, L, M> LivenessStorage for Store<D, J, L, M>
where
    D: DeviceStorage,
    J: JobStorage,
    L: LivenessStorage,
    M: ModelStorage,
{
    async fn upsert_heartbeat(
        &mut self,
        id: &DeviceId,
        snapshot: &HeartbeatSnapshot,
        ttl: Duration,
    ) -> StorageResult<HeartbeatUpsert> {
        self.liveness.upsert_heartbeat(id, snapshot, ttl).await
    }

    async fn heartbeat(&mut self, id: &DeviceId) -> StorageResult<Option<HeartbeatSnapshot>> {
        self.liveness.heartbeat(id).await
    }

    async fn remove_heartbeat(&mut self, id: &DeviceId) -> StorageResult<()> {
        self.liveness.remove_heartbeat(id).await
    }

    async fn push_command(
        &mut self,
        id: &DeviceId,
        command: &Command,
        cap: usize,
    ) -> StorageResult<Option<Command>> {
        self.liveness.push_command(id, command, cap).await
    }

    async fn pop_command(&mut self, id: &DeviceId) -> StorageResult<Option<Command>> {
        self.liveness.pop_command(id).await
    }
}

#[async_trait]
impl<D, J, L, M> ModelStorage for Store<D, J, L, M>
where
    D: DeviceStorage,
    J: JobStorage,
    L: LivenessStorage,
    M: ModelStorage,
{
    async fn put_model(&mut self, bytes: &[u8]) -> StorageResult<ModelId> {
        self.models.put_model(bytes).await
    }

    async fn model(&mut self, id: &ModelId) -> StorageResult<Option<Vec<u8>>> {
        self.models.model(id).await
    }

    async fn model_stat(&mut self, id: &ModelId) -> StorageResult<Option<ModelStat>> {
        self.models.model_stat(id).await
    }

    async fn pin_model(&mut self, id: &ModelId, reference: &str) -> StorageResult<()> {
        self.models.pin_model(id, reference).await
    }

    async fn unpin_model(&mut self, id: &ModelId, reference: &str) -> StorageResult<()> {
        self.models.unpin_model(id, reference).await
    }

    async fn collect_garbage(&mut self, retention: Duration) -> StorageResult<Vec<ModelId>> {
        self.models.collect_garbage(retention).await
    }
}

#[async_trait]
impl<D, J, L, M> Storage for Store<D, J, L, M>
where
    D: DeviceStorage,
    J: JobStorage,
    L: LivenessStorage,
    M: ModelStorage,
{
    async fn is_ready(&mut self) -> StorageResult<()> {
        Ok(())
    }
}
