//! End-to-end scenarios for the round state machine, driven against the
//! in-memory store with a paused clock.

use std::collections::BTreeSet;
use std::time::Duration;

use tracing::Span;

use edgeorchestra_core::{
    architecture,
    bank::WeightBank,
    delta,
    BatteryState,
    DeviceCapabilities,
    DeviceId,
    DeviceMetrics,
    DeviceStatus,
    ModelId,
};
use edgeorchestra_server::{
    coordinator::{
        job::{JobRecord, JobSpec, JobStatus, RoundPolicy, RoundStatus},
        requests::{JobRequest, RequestError, RequestSender, SubmissionRequest},
        StateMachine,
    },
    events::{FleetEvent, FleetEvents},
    liveness::LivenessTracker,
    registry::{DeviceRegistry, Registration},
    storage::{InMemoryStore, JobStorage, ModelStorage},
};

const ARCH: &str = "mnist";

struct Harness {
    store: InMemoryStore,
    fleet_events: FleetEvents,
    initial_model: ModelId,
}

impl Harness {
    async fn new() -> Self {
        let mut store = InMemoryStore::new();
        let arch = architecture::get(ARCH).unwrap();
        let initial_model = store
            .put_model(&WeightBank::zeroed(arch).to_bytes())
            .await
            .unwrap();
        Self {
            store,
            fleet_events: FleetEvents::new(),
            initial_model,
        }
    }

    fn healthy_metrics() -> DeviceMetrics {
        DeviceMetrics {
            cpu_usage: 0.1,
            memory_usage: 0.2,
            thermal_pressure: 0.1,
            battery_level: 1.0,
            battery_state: BatteryState::Charging,
            low_power_mode: false,
        }
    }

    async fn register_worker(&self, name: &str, metrics: DeviceMetrics) -> DeviceId {
        let mut registry = DeviceRegistry::new(self.store.clone());
        let device = registry
            .register(Registration {
                name: name.into(),
                device_model: "sim".into(),
                os_version: "1.0".into(),
                capabilities: DeviceCapabilities::default(),
                initial_metrics: metrics.clone(),
            })
            .await
            .unwrap();
        self.heartbeat(&device.id, 1, metrics).await;
        device.id
    }

    async fn heartbeat(&self, id: &DeviceId, seq: u64, metrics: DeviceMetrics) {
        let mut tracker =
            LivenessTracker::new(self.store.clone(), Duration::from_secs(5), 3);
        tracker.ingest(id, seq, &metrics).await.unwrap();
    }

    async fn start_job(
        &self,
        target_rounds: u32,
        quorum: usize,
    ) -> (StateMachine<InMemoryStore>, RequestSender, JobRecord) {
        let record = JobRecord::new(JobSpec {
            architecture: ARCH.into(),
            initial_model_id: self.initial_model.clone(),
            target_rounds,
            quorum,
            required_frameworks: BTreeSet::new(),
            participants_max: None,
        });
        let mut store = self.store.clone();
        store.upsert_job(&record).await.unwrap();
        let (machine, request_tx, _events) = StateMachine::new(
            record.clone(),
            RoundPolicy::default(),
            self.store.clone(),
            self.fleet_events.subscribe(),
        );
        (machine, request_tx, record)
    }

    fn delta_blob(value: f32) -> Vec<u8> {
        let arch = architecture::get(ARCH).unwrap();
        let mut bank = WeightBank::zeroed(arch);
        for layer in &mut bank.layers {
            for slot in &mut layer.values {
                *slot = value;
            }
        }
        delta::encode(&bank)
    }

    fn submit(
        &self,
        request_tx: &RequestSender,
        device_id: DeviceId,
        round: u32,
        blob: Vec<u8>,
    ) -> tokio::task::JoinHandle<Result<(), RequestError>> {
        let tx = request_tx.clone();
        tokio::spawn(async move {
            tx.request(
                JobRequest::Submission(SubmissionRequest {
                    device_id,
                    round,
                    blob,
                    num_samples: 10,
                    metrics: vec![("loss".to_string(), 0.5), ("accuracy".to_string(), 0.9)]
                        .into_iter()
                        .collect(),
                }),
                Span::none(),
            )
            .await
        })
    }

    async fn job(&self, record: &JobRecord) -> JobRecord {
        let mut store = self.store.clone();
        store.job(&record.id).await.unwrap().unwrap()
    }

    async fn device_status(&self, id: &DeviceId) -> DeviceStatus {
        let mut registry = DeviceRegistry::new(self.store.clone());
        registry.get(id).await.unwrap().unwrap().status
    }
}

async fn step(machine: StateMachine<InMemoryStore>) -> StateMachine<InMemoryStore> {
    machine.next().await.expect("state machine ended early")
}

/// Scenario: 3 healthy workers, 2 rounds, quorum 2, everyone submits.
#[tokio::test(start_paused = true)]
async fn integration_happy_path_two_rounds() {
    let harness = Harness::new().await;
    let workers = vec![
        harness.register_worker("a", Harness::healthy_metrics()).await,
        harness.register_worker("b", Harness::healthy_metrics()).await,
        harness.register_worker("c", Harness::healthy_metrics()).await,
    ];

    let (machine, request_tx, record) = harness.start_job(2, 2).await;

    // Round 1: forming selects all three workers.
    let machine = step(machine).await;
    assert!(machine.is_open());
    for id in &workers {
        assert_eq!(harness.device_status(id).await, DeviceStatus::Training);
    }

    let handles: Vec<_> = workers
        .iter()
        .map(|id| harness.submit(&request_tx, *id, 1, Harness::delta_blob(0.25)))
        .collect();
    let machine = step(machine).await;
    assert!(machine.is_aggregating());
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let machine = step(machine).await;
    assert!(machine.is_forming());

    let job = harness.job(&record).await;
    assert_eq!(job.current_round, 1);
    let mut store = harness.store.clone();
    let round1 = store.round(&record.id, 1).await.unwrap().unwrap();
    assert_eq!(round1.status, RoundStatus::Closed);
    let first_aggregate = round1.aggregate_model_id.clone().unwrap();
    assert!(store.model(&first_aggregate).await.unwrap().is_some());

    // Round 2 with a different delta produces a different aggregate.
    let machine = step(machine).await;
    assert!(machine.is_open());
    for id in &workers {
        harness.submit(&request_tx, *id, 2, Harness::delta_blob(-0.125));
    }
    let machine = step(machine).await;
    assert!(machine.is_aggregating());
    let machine = step(machine).await; // -> Complete
    let machine = step(machine).await; // -> Shutdown
    assert!(machine.next().await.is_none());

    let job = harness.job(&record).await;
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.current_round, 2);

    let round2 = store.round(&record.id, 2).await.unwrap().unwrap();
    let second_aggregate = round2.aggregate_model_id.clone().unwrap();
    assert_ne!(first_aggregate, second_aggregate);

    for id in &workers {
        assert_eq!(harness.device_status(id).await, DeviceStatus::Online);
    }
}

/// Scenario: a participant goes offline after `start_training`; the round
/// proceeds with the remaining two submissions at quorum 2.
#[tokio::test(start_paused = true)]
async fn integration_straggler_offline_round_completes() {
    let harness = Harness::new().await;
    let good = vec![
        harness.register_worker("a", Harness::healthy_metrics()).await,
        harness.register_worker("b", Harness::healthy_metrics()).await,
    ];
    let straggler = harness
        .register_worker("straggler", Harness::healthy_metrics())
        .await;

    let (machine, request_tx, record) = harness.start_job(1, 2).await;
    let machine = step(machine).await;
    assert!(machine.is_open());

    for id in &good {
        harness.submit(&request_tx, *id, 1, Harness::delta_blob(0.5));
    }
    harness
        .fleet_events
        .publish(FleetEvent::DeviceOffline(straggler));

    let machine = step(machine).await;
    assert!(machine.is_aggregating());
    let machine = step(machine).await; // -> Complete
    let machine = step(machine).await; // -> Shutdown
    assert!(machine.next().await.is_none());

    let job = harness.job(&record).await;
    assert_eq!(job.status, JobStatus::Completed);

    let mut store = harness.store.clone();
    let round = store.round(&record.id, 1).await.unwrap().unwrap();
    assert_eq!(round.status, RoundStatus::Closed);
}

/// Scenario: quorum 3 but only 2 submissions before the hard deadline. The
/// round aborts and the retry succeeds once the third worker submits too.
#[tokio::test(start_paused = true)]
async fn integration_quorum_miss_abort_then_retry() {
    let harness = Harness::new().await;
    let workers = vec![
        harness.register_worker("a", Harness::healthy_metrics()).await,
        harness.register_worker("b", Harness::healthy_metrics()).await,
        harness.register_worker("c", Harness::healthy_metrics()).await,
    ];

    let (machine, request_tx, record) = harness.start_job(1, 3).await;
    let machine = step(machine).await;
    assert!(machine.is_open());

    // Only two of three submit; the paused clock races to the hard deadline.
    for id in workers.iter().take(2) {
        harness.submit(&request_tx, *id, 1, Harness::delta_blob(1.0));
    }
    let machine = step(machine).await; // Open aborts -> Failure

    let mut store = harness.store.clone();
    // Stepping the failure phase re-enters forming for the same round.
    let machine = step(machine).await;
    assert!(machine.is_forming());
    let round = store.round(&record.id, 1).await.unwrap().unwrap();
    assert_eq!(round.status, RoundStatus::Aborted);
    assert_eq!(harness.job(&record).await.round_retries, 1);
    assert!(store.submissions(&record.id, 1).await.unwrap().is_empty());

    // The wait for the hard deadline outlived the liveness TTL; fresh
    // heartbeats make the workers selectable again.
    for id in &workers {
        harness.heartbeat(id, 2, Harness::healthy_metrics()).await;
    }

    let machine = step(machine).await;
    assert!(machine.is_open());
    for id in &workers {
        harness.submit(&request_tx, *id, 1, Harness::delta_blob(1.0));
    }
    let machine = step(machine).await;
    assert!(machine.is_aggregating());
    let machine = step(machine).await; // -> Complete
    let machine = step(machine).await; // -> Shutdown
    assert!(machine.next().await.is_none());

    assert_eq!(harness.job(&record).await.status, JobStatus::Completed);
    let round = store.round(&record.id, 1).await.unwrap().unwrap();
    assert_eq!(round.status, RoundStatus::Closed);
}

/// Scenario: the only available device sits below the battery floor; the job
/// stalls in forming and fails once the selection budget is exhausted.
#[tokio::test(start_paused = true)]
async fn integration_ineligible_device_never_selected() {
    let harness = Harness::new().await;
    let mut weak = Harness::healthy_metrics();
    weak.battery_level = 0.20;
    let weak_device = harness.register_worker("weak", weak).await;

    let (machine, _request_tx, record) = harness.start_job(1, 1).await;
    machine.run().await;

    let job = harness.job(&record).await;
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.current_round, 0);
    // The weak device was never assigned.
    assert_eq!(
        harness.device_status(&weak_device).await,
        DeviceStatus::Online
    );
}

/// Scenario: a corrupt submission is dropped at aggregation time and the
/// round closes on the remaining good one.
#[tokio::test(start_paused = true)]
async fn integration_corrupt_blob_round_still_completes() {
    let harness = Harness::new().await;
    let good = harness.register_worker("good", Harness::healthy_metrics()).await;
    let bad = harness.register_worker("bad", Harness::healthy_metrics()).await;

    let (machine, request_tx, record) = harness.start_job(1, 1).await;
    let machine = step(machine).await;
    assert!(machine.is_open());

    // The corrupt blob declares a layer set that is not the architecture's.
    let corrupt = delta::encode_uncompressed(&WeightBank {
        layers: vec![edgeorchestra_core::bank::Layer {
            name: "rogue".into(),
            values: vec![1.0, 2.0],
        }],
    });
    harness.submit(&request_tx, bad, 1, corrupt);
    harness.submit(&request_tx, good, 1, Harness::delta_blob(0.125));

    let machine = step(machine).await;
    assert!(machine.is_aggregating());
    let machine = step(machine).await; // -> Complete
    let machine = step(machine).await; // -> Shutdown
    assert!(machine.next().await.is_none());

    assert_eq!(harness.job(&record).await.status, JobStatus::Completed);
}

/// Duplicate submissions for the same round are rejected.
#[tokio::test(start_paused = true)]
async fn integration_duplicate_submission_rejected() {
    let harness = Harness::new().await;
    let worker = harness.register_worker("a", Harness::healthy_metrics()).await;
    let other = harness.register_worker("b", Harness::healthy_metrics()).await;

    let (machine, request_tx, record) = harness.start_job(1, 2).await;
    let machine = step(machine).await;
    assert!(machine.is_open());

    let first = harness.submit(&request_tx, worker, 1, Harness::delta_blob(0.5));
    let duplicate = harness.submit(&request_tx, worker, 1, Harness::delta_blob(0.5));
    let second = harness.submit(&request_tx, other, 1, Harness::delta_blob(0.5));

    let machine = step(machine).await;
    assert!(machine.is_aggregating());

    first.await.unwrap().unwrap();
    second.await.unwrap().unwrap();
    assert!(matches!(
        duplicate.await.unwrap(),
        Err(RequestError::AlreadySubmitted)
    ));

    let mut store = harness.store.clone();
    assert_eq!(store.submissions(&record.id, 1).await.unwrap().len(), 2);
}

/// Cancellation tears the job down and marks it cancelled.
#[tokio::test(start_paused = true)]
async fn integration_cancel_marks_job_cancelled() {
    let harness = Harness::new().await;
    harness.register_worker("a", Harness::healthy_metrics()).await;

    let (machine, request_tx, record) = harness.start_job(5, 1).await;
    let machine = step(machine).await;
    assert!(machine.is_open());

    let cancel = {
        let tx = request_tx.clone();
        tokio::spawn(async move { tx.request(JobRequest::Cancel, Span::none()).await })
    };
    machine.run().await;
    cancel.await.unwrap().unwrap();

    assert_eq!(harness.job(&record).await.status, JobStatus::Cancelled);
}
