//! The fleet of running jobs.
//!
//! Starts, resumes and cancels job coordinators, routes submissions to the
//! job currently distributing a given model, and exposes the freshest
//! aggregate telemetry for heartbeat metadata stamping.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use thiserror::Error;
use tracing::{info, warn, Span};

use edgeorchestra_core::{architecture, JobId, ModelId};

use crate::{
    coordinator::{
        events::{AggregateTelemetry, EventSubscriber},
        job::{JobRecord, JobSpec, JobStatus, RoundPolicy},
        requests::{JobRequest, RequestError, RequestSender, SubmissionRequest},
        StateMachine,
    },
    events::FleetEvents,
    storage::{JobStorage, ModelStorage, Storage, StorageError},
};

/// An error starting a job.
#[derive(Error, Debug)]
pub enum StartJobError {
    #[error("too many active jobs")]
    TooManyJobs,
    #[error("unknown architecture `{0}`")]
    UnknownArchitecture(String),
    #[error("initial model `{0}` is not in the store")]
    UnknownModel(ModelId),
    #[error("invalid job spec: {0}")]
    InvalidSpec(&'static str),
    #[error("quorum {requested} is below the configured minimum {minimum}")]
    QuorumTooLow { requested: usize, minimum: usize },
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// An error routing a submission.
#[derive(Error, Debug)]
pub enum SubmitError {
    #[error("no running job distributes model `{0}`")]
    UnknownModel(ModelId),
    #[error(transparent)]
    Request(#[from] RequestError),
}

/// The handle the fleet keeps per running job.
#[derive(Clone)]
pub struct JobHandle {
    pub job_id: JobId,
    pub request_tx: RequestSender,
    pub events: EventSubscriber,
}

/// The supervisor of all running job coordinators.
#[derive(Clone)]
pub struct Fleet<T> {
    store: T,
    policy: RoundPolicy,
    max_active: usize,
    fleet_events: FleetEvents,
    jobs: Arc<Mutex<HashMap<JobId, JobHandle>>>,
}

impl<T> Fleet<T>
where
    T: Storage,
{
    pub fn new(store: T, policy: RoundPolicy, max_active: usize, fleet_events: FleetEvents) -> Self {
        Self {
            store,
            policy,
            max_active,
            fleet_events,
            jobs: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Starts a new training job and returns its id.
    pub async fn start_job(&self, spec: JobSpec) -> Result<JobId, StartJobError> {
        if spec.target_rounds == 0 {
            return Err(StartJobError::InvalidSpec("target_rounds must be positive"));
        }
        if spec.quorum == 0 {
            return Err(StartJobError::InvalidSpec("quorum must be at least 1"));
        }
        if spec.quorum < self.policy.quorum_min {
            return Err(StartJobError::QuorumTooLow {
                requested: spec.quorum,
                minimum: self.policy.quorum_min,
            });
        }
        if let Some(max) = spec.participants_max {
            if max < spec.quorum {
                return Err(StartJobError::InvalidSpec(
                    "participants_max must not undercut the quorum",
                ));
            }
        }
        architecture::get(&spec.architecture)
            .map_err(|_| StartJobError::UnknownArchitecture(spec.architecture.clone()))?;

        let mut store = self.store.clone();
        if store.model_stat(&spec.initial_model_id).await?.is_none() {
            return Err(StartJobError::UnknownModel(spec.initial_model_id));
        }

        if self.jobs.lock().unwrap().len() >= self.max_active {
            return Err(StartJobError::TooManyJobs);
        }

        let record = JobRecord::new(spec);
        let job_ref = format!("job:{}", record.id);
        store.pin_model(&record.global_model_id, &job_ref).await?;
        store.upsert_job(&record).await?;

        let job_id = record.id;
        self.spawn(record);
        info!(job_id = %job_id, "training job started");
        Ok(job_id)
    }

    /// Re-attaches coordinators to jobs whose row says `running`, e.g. after
    /// a restart. Such a job continues from its persisted round counter.
    pub async fn resume_jobs(&self) -> Result<usize, StorageError> {
        let mut store = self.store.clone();
        let running = store.list_jobs(Some(JobStatus::Running)).await?;
        let mut resumed = 0;
        for record in running {
            if self.jobs.lock().unwrap().contains_key(&record.id) {
                continue;
            }
            info!(job_id = %record.id, round = record.next_round(), "resuming interrupted job");
            self.spawn(record);
            resumed += 1;
        }
        Ok(resumed)
    }

    fn spawn(&self, record: JobRecord) {
        let job_id = record.id;
        let (machine, request_tx, events) = StateMachine::new(
            record,
            self.policy,
            self.store.clone(),
            self.fleet_events.subscribe(),
        );
        self.jobs.lock().unwrap().insert(
            job_id,
            JobHandle {
                job_id,
                request_tx,
                events,
            },
        );

        let jobs = Arc::clone(&self.jobs);
        tokio::spawn(async move {
            machine.run().await;
            jobs.lock().unwrap().remove(&job_id);
        });
    }

    /// Routes a submission to the job currently distributing `model_id`.
    pub async fn submit(
        &self,
        model_id: &ModelId,
        submission: SubmissionRequest,
    ) -> Result<(), SubmitError> {
        let handle = self
            .job_for_model(model_id)
            .ok_or_else(|| SubmitError::UnknownModel(model_id.clone()))?;
        handle
            .request_tx
            .request(JobRequest::Submission(submission), Span::current())
            .await?;
        Ok(())
    }

    /// Requests cancellation of a running job. Returns whether the job was
    /// known.
    pub async fn cancel_job(&self, job_id: &JobId) -> Result<bool, RequestError> {
        let handle = match self.handle(job_id) {
            Some(handle) => handle,
            None => return Ok(false),
        };
        info!(job_id = %job_id, "job cancellation requested");
        match handle
            .request_tx
            .request(JobRequest::Cancel, Span::current())
            .await
        {
            Ok(()) => Ok(true),
            // The job ended on its own before the cancel arrived.
            Err(RequestError::JobTerminated) => {
                warn!(job_id = %job_id, "job ended before cancellation");
                Ok(true)
            }
            Err(err) => Err(err),
        }
    }

    /// The handle of a running job, if any.
    pub fn handle(&self, job_id: &JobId) -> Option<JobHandle> {
        self.jobs.lock().unwrap().get(job_id).cloned()
    }

    /// The job currently distributing `model_id`, if any.
    pub fn job_for_model(&self, model_id: &ModelId) -> Option<JobHandle> {
        self.jobs
            .lock()
            .unwrap()
            .values()
            .find(|handle| handle.events.model_listener().get_latest().event == *model_id)
            .cloned()
    }

    /// The freshest aggregate telemetry across all running jobs, if any job
    /// has aggregated a round yet.
    pub fn latest_telemetry(&self) -> Option<AggregateTelemetry> {
        self.jobs
            .lock()
            .unwrap()
            .values()
            .filter_map(|handle| handle.events.telemetry_listener().get_latest().event)
            .max_by_key(|telemetry| telemetry.updated_at)
    }

    /// The number of currently running jobs.
    pub fn active_jobs(&self) -> usize {
        self.jobs.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;
    use crate::storage::InMemoryStore;
    use edgeorchestra_core::{architecture, bank::WeightBank};

    async fn fleet_with_model(max_active: usize) -> (Fleet<InMemoryStore>, ModelId) {
        let mut store = InMemoryStore::new();
        let arch = architecture::get("mnist").unwrap();
        let model_id = store
            .put_model(&WeightBank::zeroed(arch).to_bytes())
            .await
            .unwrap();
        let fleet = Fleet::new(
            store,
            RoundPolicy::default(),
            max_active,
            FleetEvents::new(),
        );
        (fleet, model_id)
    }

    fn spec(model_id: &ModelId) -> JobSpec {
        JobSpec {
            architecture: "mnist".into(),
            initial_model_id: model_id.clone(),
            target_rounds: 2,
            quorum: 1,
            required_frameworks: BTreeSet::new(),
            participants_max: None,
        }
    }

    #[tokio::test]
    async fn test_start_job_validates_spec() {
        let (fleet, model_id) = fleet_with_model(4).await;

        let mut bad = spec(&model_id);
        bad.quorum = 0;
        assert!(matches!(
            fleet.start_job(bad).await,
            Err(StartJobError::InvalidSpec(_))
        ));

        let mut bad = spec(&model_id);
        bad.target_rounds = 0;
        assert!(matches!(
            fleet.start_job(bad).await,
            Err(StartJobError::InvalidSpec(_))
        ));

        let mut bad = spec(&model_id);
        bad.quorum = 3;
        bad.participants_max = Some(2);
        assert!(matches!(
            fleet.start_job(bad).await,
            Err(StartJobError::InvalidSpec(_))
        ));

        let mut bad = spec(&model_id);
        bad.architecture = "resnet50".into();
        assert!(matches!(
            fleet.start_job(bad).await,
            Err(StartJobError::UnknownArchitecture(_))
        ));

        let mut bad = spec(&model_id);
        bad.initial_model_id = ModelId::digest(b"never stored");
        assert!(matches!(
            fleet.start_job(bad).await,
            Err(StartJobError::UnknownModel(_))
        ));
    }

    #[tokio::test]
    async fn test_quorum_floor_enforced() {
        let mut store = InMemoryStore::new();
        let arch = architecture::get("mnist").unwrap();
        let model_id = store
            .put_model(&WeightBank::zeroed(arch).to_bytes())
            .await
            .unwrap();
        let mut policy = RoundPolicy::default();
        policy.quorum_min = 2;
        let fleet = Fleet::new(store, policy, 4, FleetEvents::new());

        let mut low = spec(&model_id);
        low.quorum = 1;
        assert!(matches!(
            fleet.start_job(low).await,
            Err(StartJobError::QuorumTooLow {
                requested: 1,
                minimum: 2,
            })
        ));

        let mut ok = spec(&model_id);
        ok.quorum = 2;
        fleet.start_job(ok).await.unwrap();
    }

    #[tokio::test]
    async fn test_active_job_cap() {
        let (fleet, model_id) = fleet_with_model(1).await;

        fleet.start_job(spec(&model_id)).await.unwrap();
        assert_eq!(fleet.active_jobs(), 1);
        assert!(matches!(
            fleet.start_job(spec(&model_id)).await,
            Err(StartJobError::TooManyJobs)
        ));
    }

    #[tokio::test]
    async fn test_submissions_route_by_model() {
        let (fleet, model_id) = fleet_with_model(4).await;
        let job_id = fleet.start_job(spec(&model_id)).await.unwrap();

        let handle = fleet.job_for_model(&model_id).expect("job routes its model");
        assert_eq!(handle.job_id, job_id);
        assert!(fleet.job_for_model(&ModelId::digest(b"other")).is_none());
        assert!(fleet.latest_telemetry().is_none());
    }

    #[tokio::test]
    async fn test_cancel_unknown_job() {
        let (fleet, _model_id) = fleet_with_model(4).await;
        assert!(!fleet.cancel_job(&JobId::generate()).await.unwrap());
    }
}
