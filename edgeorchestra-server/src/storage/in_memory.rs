//! An in-memory store implementing every storage trait.
//!
//! Backs the test suite and single-process deployments. Liveness TTLs run on
//! the tokio clock so tests with paused time stay deterministic.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap, VecDeque},
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::time::Instant;

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
        StaleSequence,
        Storage,
        StorageResult,
        SubmissionAdd,
        SubmissionAddError,
    },
};

#[derive(Default)]
struct ModelEntry {
    bytes: Vec<u8>,
    created_at: Option<DateTime<Utc>>,
    pins: BTreeSet<String>,
}

#[derive(Default)]
struct Inner {
    devices: HashMap<DeviceId, Device>,
    jobs: HashMap<JobId, JobRecord>,
    rounds: HashMap<(JobId, u32), RoundRecord>,
    submissions: HashMap<(JobId, u32), BTreeMap<DeviceId, Submission>>,
    heartbeats: HashMap<DeviceId, (HeartbeatSnapshot, Instant)>,
    queues: HashMap<DeviceId, VecDeque<Command>>,
    models: HashMap<ModelId, ModelEntry>,
}

/// The in-memory store. Clones share the same state.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // Lock poisoning only happens if another thread panicked while
        // holding the guard, which is already a test failure.
        self.inner.lock().unwrap()
    }
}

#[async_trait]
impl DeviceStorage for InMemoryStore {
    async fn insert_device(&mut self, device: &Device) -> StorageResult<()> {
        self.lock().devices.insert(device.id, device.clone());
        Ok(())
    }

    async fn device(&mut self, id: &DeviceId) -> StorageResult<Option<Device>> {
        Ok(self.lock().devices.get(id).cloned())
    }

    async fn list_devices(&mut self, status: Option<DeviceStatus>) -> StorageResult<Vec<Device>> {
        let inner = self.lock();
        let mut devices: Vec<_> = inner
            .devices
            .values()
            .filter(|d| status.map_or(true, |s| d.status == s))
            .cloned()
            .collect();
        devices.sort_by_key(|d| d.id);
        Ok(devices)
    }

    async fn touch_device(
        &mut self,
        id: &DeviceId,
        metrics: &DeviceMetrics,
        status: DeviceStatus,
        seen_at: DateTime<Utc>,
    ) -> StorageResult<bool> {
        let mut inner = self.lock();
        match inner.devices.get_mut(id) {
            Some(device) => {
                device.last_metrics = metrics.clone();
                device.status = status;
                device.last_seen_at = seen_at;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn set_device_status(
        &mut self,
        id: &DeviceId,
        status: DeviceStatus,
    ) -> StorageResult<bool> {
        let mut inner = self.lock();
        match inner.devices.get_mut(id) {
            Some(device) => {
                device.status = status;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[async_trait]
impl JobStorage for InMemoryStore {
    async fn upsert_job(&mut self, job: &JobRecord) -> StorageResult<()> {
        self.lock().jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn job(&mut self, id: &JobId) -> StorageResult<Option<JobRecord>> {
        Ok(self.lock().jobs.get(id).cloned())
    }

    async fn list_jobs(&mut self, status: Option<JobStatus>) -> StorageResult<Vec<JobRecord>> {
        let inner = self.lock();
        let mut jobs: Vec<_> = inner
            .jobs
            .values()
            .filter(|j| status.map_or(true, |s| j.status == s))
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.id);
        Ok(jobs)
    }

    async fn upsert_round(&mut self, round: &RoundRecord) -> StorageResult<()> {
        self.lock()
            .rounds
            .insert((round.job_id, round.round), round.clone());
        Ok(())
    }

    async fn round(&mut self, job_id: &JobId, round: u32) -> StorageResult<Option<RoundRecord>> {
        Ok(self.lock().rounds.get(&(*job_id, round)).cloned())
    }

    async fn add_submission(&mut self, submission: &Submission) -> StorageResult<SubmissionAdd> {
        let mut inner = self.lock();
        let per_round = inner
            .submissions
            .entry((submission.job_id, submission.round))
            .or_default();
        if per_round.contains_key(&submission.device_id) {
            return Ok(SubmissionAdd(Err(SubmissionAddError::AlreadySubmitted)));
        }
        per_round.insert(submission.device_id, submission.clone());
        Ok(SubmissionAdd(Ok(())))
    }

    async fn submissions(
        &mut self,
        job_id: &JobId,
        round: u32,
    ) -> StorageResult<Vec<Submission>> {
        Ok(self
            .lock()
            .submissions
            .get(&(*job_id, round))
            .map(|per_round| per_round.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn remove_submissions(&mut self, job_id: &JobId, round: u32) -> StorageResult<()> {
        self.lock().submissions.remove(&(*job_id, round));
        Ok(())
    }
}

#[async_trait]
impl LivenessStorage for InMemoryStore {
    async fn upsert_heartbeat(
        &mut self,
        id: &DeviceId,
        snapshot: &HeartbeatSnapshot,
        ttl: Duration,
    ) -> StorageResult<HeartbeatUpsert> {
        let now = Instant::now();
        let mut inner = self.lock();
        if let Some((stored, expires_at)) = inner.heartbeats.get(id) {
            if *expires_at > now && snapshot.seq <= stored.seq {
                return Ok(HeartbeatUpsert(Err(StaleSequence {
                    stored: stored.seq,
                    received: snapshot.seq,
                })));
            }
        }
        inner
            .heartbeats
            .insert(*id, (snapshot.clone(), now + ttl));
        Ok(HeartbeatUpsert(Ok(())))
    }

    async fn heartbeat(&mut self, id: &DeviceId) -> StorageResult<Option<HeartbeatSnapshot>> {
        let now = Instant::now();
        let mut inner = self.lock();
        match inner.heartbeats.get(id) {
            Some((snapshot, expires_at)) if *expires_at > now => Ok(Some(snapshot.clone())),
            Some(_) => {
                inner.heartbeats.remove(id);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn remove_heartbeat(&mut self, id: &DeviceId) -> StorageResult<()> {
        self.lock().heartbeats.remove(id);
        Ok(())
    }

    async fn push_command(
        &mut self,
        id: &DeviceId,
        command: &Command,
        cap: usize,
    ) -> StorageResult<Option<Command>> {
        let mut inner = self.lock();
        let queue = inner.queues.entry(*id).or_default();
        queue.push_back(command.clone());
        if queue.len() <= cap {
            return Ok(None);
        }
        match queue.iter().position(|c| !c.is_durable()) {
            Some(index) => Ok(queue.remove(index)),
            None => Ok(None),
        }
    }

    async fn pop_command(&mut self, id: &DeviceId) -> StorageResult<Option<Command>> {
        let mut inner = self.lock();
        Ok(inner
            .queues
            .get_mut(id)
            .and_then(|queue| queue.pop_front()))
    }
}

#[async_trait]
impl ModelStorage for InMemoryStore {
    async fn put_model(&mut self, bytes: &[u8]) -> StorageResult<ModelId> {
        let id = ModelId::digest(bytes);
        let mut inner = self.lock();
        inner.models.entry(id.clone()).or_insert_with(|| ModelEntry {
            bytes: bytes.to_vec(),
            created_at: Some(Utc::now()),
            pins: BTreeSet::new(),
        });
        Ok(id)
    }

    async fn model(&mut self, id: &ModelId) -> StorageResult<Option<Vec<u8>>> {
        Ok(self.lock().models.get(id).map(|entry| entry.bytes.clone()))
    }

    async fn model_stat(&mut self, id: &ModelId) -> StorageResult<Option<ModelStat>> {
        Ok(self.lock().models.get(id).map(|entry| ModelStat {
            size: entry.bytes.len() as u64,
            created_at: entry.created_at.unwrap_or_else(Utc::now),
        }))
    }

    async fn pin_model(&mut self, id: &ModelId, reference: &str) -> StorageResult<()> {
        if let Some(entry) = self.lock().models.get_mut(id) {
            entry.pins.insert(reference.to_string());
        }
        Ok(())
    }

    async fn unpin_model(&mut self, id: &ModelId, reference: &str) -> StorageResult<()> {
        if let Some(entry) = self.lock().models.get_mut(id) {
            entry.pins.remove(reference);
        }
        Ok(())
    }

    async fn collect_garbage(&mut self, retention: Duration) -> StorageResult<Vec<ModelId>> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(retention).unwrap_or_else(|_| chrono::Duration::zero());
        let mut inner = self.lock();
        let doomed: Vec<ModelId> = inner
            .models
            .iter()
            .filter(|(_, entry)| {
                entry.pins.is_empty()
                    && entry.created_at.map_or(true, |created| created < cutoff)
            })
            .map(|(id, _)| id.clone())
            .collect();
        for id in &doomed {
            inner.models.remove(id);
        }
        Ok(doomed)
    }
}

#[async_trait]
impl Storage for InMemoryStore {
    async fn is_ready(&mut self) -> StorageResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_model_is_content_addressed_and_deduplicated() {
        let mut store = InMemoryStore::new();
        let first = store.put_model(b"weights").await.unwrap();
        let second = store.put_model(b"weights").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first, ModelId::digest(b"weights"));
        assert_eq!(store.model(&first).await.unwrap().unwrap(), b"weights");
    }

    #[tokio::test]
    async fn test_gc_spares_pinned_models() {
        let mut store = InMemoryStore::new();
        let pinned = store.put_model(b"pinned").await.unwrap();
        let loose = store.put_model(b"loose").await.unwrap();
        store.pin_model(&pinned, "job:1").await.unwrap();

        let collected = store.collect_garbage(Duration::from_secs(0)).await.unwrap();
        assert_eq!(collected, vec![loose.clone()]);
        assert!(store.model(&loose).await.unwrap().is_none());
        assert!(store.model(&pinned).await.unwrap().is_some());

        store.unpin_model(&pinned, "job:1").await.unwrap();
        let collected = store.collect_garbage(Duration::from_secs(0)).await.unwrap();
        assert_eq!(collected, vec![pinned]);
    }

    #[tokio::test]
    async fn test_gc_respects_retention() {
        let mut store = InMemoryStore::new();
        store.put_model(b"fresh").await.unwrap();
        let collected = store.collect_garbage(Duration::from_secs(3600)).await.unwrap();
        assert!(collected.is_empty());
    }

    #[tokio::test]
    async fn test_submission_uniqueness() {
        let mut store = InMemoryStore::new();
        let submission = Submission {
            device_id: DeviceId::generate(),
            job_id: JobId::generate(),
            round: 1,
            blob: vec![0x00],
            num_samples: 10,
            metrics: BTreeMap::new(),
            received_at: Utc::now(),
        };
        assert!(store
            .add_submission(&submission)
            .await
            .unwrap()
            .into_inner()
            .is_ok());
        assert_eq!(
            store
                .add_submission(&submission)
                .await
                .unwrap()
                .into_inner()
                .unwrap_err(),
            SubmissionAddError::AlreadySubmitted
        );
        assert_eq!(
            store
                .submissions(&submission.job_id, submission.round)
                .await
                .unwrap()
                .len(),
            1
        );
    }
}
