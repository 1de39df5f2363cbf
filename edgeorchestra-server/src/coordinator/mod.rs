//! The training job coordinator: the round state machine.
//!
//! # Overview
//!
//! Each running job is driven by one [`StateMachine`] task. A round moves
//! through `Forming → Open → Aggregating`, then either the next round's
//! `Forming` or `Complete`; every error funnels through `Failure`, which
//! decides between retrying the round and ending the job; `Shutdown` drains
//! the request channel.
//!
//! # Phase states
//!
//! **Forming**
//!
//! Selects at least `quorum` eligible participants, retrying every
//! `selection_backoff` up to `selection_max_attempts` before the job fails.
//! Selected devices are marked `training` and the round row is opened.
//!
//! **Open**
//!
//! Enqueues one `start_training` command per participant and collects
//! submissions. The round aggregates as soon as every standing participant
//! submitted, or once the deadline passed with the quorum met; at the hard
//! deadline (`deadline + grace`) it aggregates with quorum or aborts below
//! it. A participant that goes offline is marked failed and the round
//! continues with the rest.
//!
//! **Aggregating**
//!
//! Freezes the submission snapshot, runs sample-weighted federated averaging
//! on a blocking worker, stores the new global model, closes the round and
//! advances the job.
//!
//! **Failure**
//!
//! Marks the round aborted, discards its submissions, notifies and restores
//! participants, then retries the round (up to `round_max_retries`) or marks
//! the job `failed`/`cancelled`.
//!
//! **Shutdown**
//!
//! Closes the request channel and answers all remaining requests.
//!
//! # Requests and events
//!
//! Submissions and cancellation arrive through a [`RequestSender`] channel;
//! each request carries a oneshot responder. Per-job events (phase, status,
//! current global model, aggregate telemetry) are published through an
//! [`EventSubscriber`] obtained at construction. Fleet-wide device-offline
//! events arrive on the broadcast bus the sweeper publishes to.

pub mod events;
pub mod fleet;
pub mod job;
pub mod phases;
pub mod requests;
pub mod selection;

use derive_more::From;
use tokio::sync::broadcast;

use self::{
    events::{EventPublisher, EventSubscriber},
    job::{JobRecord, RoundPolicy},
    phases::{
        Aggregating,
        Complete,
        Failure,
        Forming,
        Open,
        PhaseName,
        PhaseState,
        Shared,
        Shutdown,
    },
    requests::{RequestReceiver, RequestSender},
};
use crate::{events::FleetEvent, storage::Storage};

pub use self::fleet::Fleet;

/// The state machine with all its states.
#[derive(From)]
pub enum StateMachine<T>
where
    T: Storage,
{
    Forming(PhaseState<Forming, T>),
    Open(PhaseState<Open, T>),
    Aggregating(PhaseState<Aggregating, T>),
    Complete(PhaseState<Complete, T>),
    Failure(PhaseState<Failure, T>),
    Shutdown(PhaseState<Shutdown, T>),
}

impl<T> StateMachine<T>
where
    T: Storage,
{
    /// Creates a new state machine for `record`, starting in [`Forming`].
    ///
    /// The job row must already be persisted; the machine assumes it is the
    /// single writer from here on.
    pub fn new(
        record: JobRecord,
        policy: RoundPolicy,
        store: T,
        fleet_rx: broadcast::Receiver<FleetEvent>,
    ) -> (Self, RequestSender, EventSubscriber) {
        let (events, subscriber) = EventPublisher::init(
            record.next_round(),
            record.global_model_id.clone(),
            PhaseName::Forming,
            record.status,
        );
        let (request_rx, request_tx) = RequestReceiver::new();
        let shared = Shared::new(record, policy, request_rx, fleet_rx, events, store);
        let machine = StateMachine::from(PhaseState::<Forming, _>::new(shared));
        (machine, request_tx, subscriber)
    }

    /// Moves the state machine to the next state and consumes the current
    /// one. Returns `None` once the job reached a terminal state.
    pub async fn next(self) -> Option<Self> {
        match self {
            StateMachine::Forming(state) => state.run_phase().await,
            StateMachine::Open(state) => state.run_phase().await,
            StateMachine::Aggregating(state) => state.run_phase().await,
            StateMachine::Complete(state) => state.run_phase().await,
            StateMachine::Failure(state) => state.run_phase().await,
            StateMachine::Shutdown(state) => state.run_phase().await,
        }
    }

    /// Runs the state machine until the job ends.
    pub async fn run(mut self) {
        loop {
            self = match self.next().await {
                Some(machine) => machine,
                None => return,
            };
        }
    }

    /// The name of the phase the machine currently sits in.
    pub fn phase(&self) -> PhaseName {
        match self {
            StateMachine::Forming(_) => PhaseName::Forming,
            StateMachine::Open(_) => PhaseName::Open,
            StateMachine::Aggregating(_) => PhaseName::Aggregating,
            StateMachine::Complete(_) => PhaseName::Complete,
            StateMachine::Failure(_) => PhaseName::Failure,
            StateMachine::Shutdown(_) => PhaseName::Shutdown,
        }
    }

    pub fn is_forming(&self) -> bool {
        matches!(self, StateMachine::Forming(_))
    }

    pub fn is_open(&self) -> bool {
        matches!(self, StateMachine::Open(_))
    }

    pub fn is_aggregating(&self) -> bool {
        matches!(self, StateMachine::Aggregating(_))
    }
}
