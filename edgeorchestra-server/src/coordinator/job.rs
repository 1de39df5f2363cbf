//! Persisted job, round and submission state.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use derive_more::Display;
use serde::{Deserialize, Serialize};

use edgeorchestra_core::{DeviceId, JobId, ModelId};

use crate::settings::{EligibilitySettings, RoundSettings};

/// The lifecycle status of a training job.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[display(fmt = "running")]
    Running,
    #[display(fmt = "completed")]
    Completed,
    #[display(fmt = "failed")]
    Failed,
    #[display(fmt = "cancelled")]
    Cancelled,
}

/// The lifecycle status of a round.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundStatus {
    #[display(fmt = "open")]
    Open,
    #[display(fmt = "aggregating")]
    Aggregating,
    #[display(fmt = "closed")]
    Closed,
    #[display(fmt = "aborted")]
    Aborted,
}

/// What a caller provides to start a job.
#[derive(Debug, Clone)]
pub struct JobSpec {
    /// Key into the architecture registry; fixes the canonical layer order.
    pub architecture: String,
    /// The content address of the initial global model.
    pub initial_model_id: ModelId,
    pub target_rounds: u32,
    pub quorum: usize,
    /// Frameworks a device must support to be selected.
    pub required_frameworks: BTreeSet<String>,
    /// Upper bound on participants per round; unbounded when absent.
    pub participants_max: Option<usize>,
}

/// A job row. Also the in-memory state the round state machine advances;
/// the coordinator task that owns the job is its single writer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub architecture: String,
    pub initial_model_id: ModelId,
    /// The current global model; updated at every successful round boundary.
    pub global_model_id: ModelId,
    pub status: JobStatus,
    /// Completed rounds; the round in flight is `current_round + 1`.
    pub current_round: u32,
    pub target_rounds: u32,
    pub quorum: usize,
    pub required_frameworks: BTreeSet<String>,
    pub participants_max: Option<usize>,
    /// Retries spent on the round in flight.
    pub round_retries: u32,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    pub fn new(spec: JobSpec) -> Self {
        Self {
            id: JobId::generate(),
            architecture: spec.architecture,
            initial_model_id: spec.initial_model_id.clone(),
            global_model_id: spec.initial_model_id,
            status: JobStatus::Running,
            current_round: 0,
            target_rounds: spec.target_rounds,
            quorum: spec.quorum,
            required_frameworks: spec.required_frameworks,
            participants_max: spec.participants_max,
            round_retries: 0,
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    /// The number of the round in flight (1-based).
    pub fn next_round(&self) -> u32 {
        self.current_round + 1
    }
}

/// A round row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundRecord {
    pub job_id: JobId,
    pub round: u32,
    /// The global model distributed for this round.
    pub global_model_id: ModelId,
    pub status: RoundStatus,
    pub participants: BTreeSet<DeviceId>,
    pub started_at: DateTime<Utc>,
    pub deadline_at: Option<DateTime<Utc>>,
    pub aggregate_model_id: Option<ModelId>,
}

/// A submission row: one device's weight-delta blob for one round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Submission {
    pub device_id: DeviceId,
    pub job_id: JobId,
    pub round: u32,
    /// The encoded delta blob as received on the wire.
    pub blob: Vec<u8>,
    pub num_samples: u32,
    pub metrics: BTreeMap<String, f64>,
    pub received_at: DateTime<Utc>,
}

/// The timing and threshold knobs the state machine runs with, derived from
/// the settings sections once at job start.
#[derive(Debug, Clone, Copy)]
pub struct RoundPolicy {
    pub round_timeout: Duration,
    pub round_grace: Duration,
    /// Operator-enforced floor on the quorum a job may request.
    pub quorum_min: usize,
    pub selection_backoff: Duration,
    pub selection_max_attempts: u32,
    pub round_max_retries: u32,
    pub battery_floor: f32,
    pub thermal_ceiling: f32,
}

impl RoundPolicy {
    pub fn new(round: &RoundSettings, eligibility: &EligibilitySettings) -> Self {
        Self {
            round_timeout: Duration::from_secs(round.timeout_s),
            round_grace: Duration::from_secs(round.grace_s),
            quorum_min: round.quorum_min,
            selection_backoff: Duration::from_secs(round.selection_backoff_s),
            selection_max_attempts: round.selection_max_attempts,
            round_max_retries: round.max_retries,
            battery_floor: eligibility.battery_floor,
            thermal_ceiling: eligibility.thermal_ceiling,
        }
    }
}

impl Default for RoundPolicy {
    fn default() -> Self {
        Self::new(&RoundSettings::default(), &EligibilitySettings::default())
    }
}
