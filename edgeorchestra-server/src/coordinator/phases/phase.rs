use std::fmt;

use async_trait::async_trait;
use derive_more::Display;
use tokio::sync::broadcast;
use tracing::{debug, error_span, info, warn, Instrument};

use edgeorchestra_core::{Command, DeviceId, DeviceStatus};

use crate::{
    coordinator::{
        events::EventPublisher,
        job::{JobRecord, RoundPolicy, RoundRecord},
        requests::{JobRequest, RequestError, RequestReceiver, ResponseSender},
        StateMachine,
    },
    events::FleetEvent,
    liveness::COMMAND_QUEUE_CAP,
    storage::{Storage, StorageResult},
};

use super::{Failure, PhaseError};

/// The name of the current phase.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
pub enum PhaseName {
    #[display(fmt = "Forming")]
    Forming,
    #[display(fmt = "Open")]
    Open,
    #[display(fmt = "Aggregating")]
    Aggregating,
    #[display(fmt = "Complete")]
    Complete,
    #[display(fmt = "Failure")]
    Failure,
    #[display(fmt = "Shutdown")]
    Shutdown,
}

/// A trait that must be implemented by a state in order to move to a next
/// state.
#[async_trait]
pub trait Phase<T>
where
    T: Storage,
{
    /// The name of the current phase.
    const NAME: PhaseName;

    /// Performs the tasks of this phase.
    async fn process(&mut self) -> Result<(), PhaseError>;

    /// Moves from this phase to the next phase.
    async fn next(self) -> Option<StateMachine<T>>;
}

/// The job state and I/O interfaces shared by and moved between all
/// `PhaseState`s of one job.
pub struct Shared<T> {
    /// The job row this coordinator advances; it is its single writer.
    pub(in crate::coordinator) state: JobRecord,
    /// Timing and threshold knobs.
    pub(in crate::coordinator) policy: RoundPolicy,
    /// The request receiver half.
    pub(in crate::coordinator) request_rx: RequestReceiver,
    /// Fleet events (device offline) for straggler handling.
    pub(in crate::coordinator) fleet_rx: broadcast::Receiver<FleetEvent>,
    /// The event publisher.
    pub(in crate::coordinator) events: EventPublisher,
    /// The backing store.
    pub(in crate::coordinator) store: T,
    /// Set when a cancel request was observed outside a phase's own request
    /// loop; the next phase honors it before doing any work.
    pub(in crate::coordinator) cancel_requested: bool,
}

impl<T> fmt::Debug for Shared<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shared")
            .field("state", &self.state)
            .field("cancel_requested", &self.cancel_requested)
            .finish()
    }
}

impl<T> Shared<T>
where
    T: Storage,
{
    pub fn new(
        state: JobRecord,
        policy: RoundPolicy,
        request_rx: RequestReceiver,
        fleet_rx: broadcast::Receiver<FleetEvent>,
        events: EventPublisher,
        store: T,
    ) -> Self {
        Self {
            state,
            policy,
            request_rx,
            fleet_rx,
            events,
            store,
            cancel_requested: false,
        }
    }

    /// The number of the round in flight.
    pub fn round(&self) -> u32 {
        self.state.next_round()
    }

    /// Persists the job row.
    pub(in crate::coordinator) async fn persist_job(&mut self) -> StorageResult<()> {
        self.store.upsert_job(&self.state).await
    }

    /// Persists a round row.
    pub(in crate::coordinator) async fn persist_round(
        &mut self,
        round: &RoundRecord,
    ) -> StorageResult<()> {
        self.store.upsert_round(round).await
    }

    /// Queues a command for a device, logging a dropped entry on overflow.
    pub(in crate::coordinator) async fn queue_command(
        &mut self,
        device_id: &DeviceId,
        command: &Command,
    ) -> StorageResult<()> {
        if let Some(dropped) = self
            .store
            .push_command(device_id, command, COMMAND_QUEUE_CAP)
            .await?
        {
            warn!(
                device_id = %device_id,
                dropped = dropped.kind(),
                "command queue full, dropped oldest entry"
            );
        }
        Ok(())
    }

    /// Restores participants that are still marked `training` to `online`.
    pub(in crate::coordinator) async fn restore_participants(
        &mut self,
        participants: impl IntoIterator<Item = &DeviceId>,
    ) -> StorageResult<()> {
        for device_id in participants {
            if let Some(device) = self.store.device(device_id).await? {
                if device.status == DeviceStatus::Training {
                    self.store
                        .set_device_status(device_id, DeviceStatus::Online)
                        .await?;
                }
            }
        }
        Ok(())
    }
}

/// The state corresponding to a phase of the round state machine.
///
/// This contains the phase-dependent `private` state and the
/// phase-independent `shared` state which travels across transitions.
pub struct PhaseState<S, T> {
    /// The private state.
    pub(in crate::coordinator) private: S,
    /// The shared job state and I/O interfaces.
    pub(in crate::coordinator) shared: Shared<T>,
}

impl<S, T> PhaseState<S, T>
where
    S: Send,
    T: Storage,
    Self: Phase<T>,
{
    /// Runs the current phase to completion.
    ///
    /// 1. Performs the phase tasks.
    /// 2. Purges requests that outlived the phase.
    /// 3. Transitions to the next phase.
    pub async fn run_phase(mut self) -> Option<StateMachine<T>> {
        let phase = Self::NAME;
        let span = error_span!("run_phase", job_id = %self.shared.state.id, phase = %phase);

        async move {
            info!("starting phase");
            self.shared.events.set_round(self.shared.round());
            self.shared.events.broadcast_phase(phase);

            if let Err(err) = self.process().await {
                warn!(error = %err, "phase did not complete");
                return Some(self.into_failure_state(err));
            }

            if let Err(err) = self.purge_outdated_requests() {
                match phase {
                    PhaseName::Failure | PhaseName::Shutdown => {
                        debug!("ignoring request channel error during {}", phase);
                    }
                    _ => return Some(self.into_failure_state(err)),
                }
            }

            info!("transitioning to the next phase");
            self.next().await
        }
        .instrument(span)
        .await
    }

    /// Responds to all pending requests that are outdated at a phase
    /// boundary. A pending cancel is remembered for the next phase.
    fn purge_outdated_requests(&mut self) -> Result<(), PhaseError> {
        while let Some(item) = self.shared.request_rx.try_recv() {
            let (req, span, resp_tx) = match item {
                Some(item) => item,
                None => {
                    return Err(PhaseError::RequestChannel(
                        "all request senders have been dropped",
                    ))
                }
            };
            let _guard = span.enter();
            match req {
                JobRequest::Cancel => {
                    debug!("cancel observed at phase boundary");
                    self.shared.cancel_requested = true;
                    let _ = resp_tx.send(Ok(()));
                }
                JobRequest::Submission(_) => {
                    debug!("discarding submission at phase boundary");
                    let _ = resp_tx.send(Err(RequestError::RoundNotOpen));
                }
            }
        }
        Ok(())
    }

    fn into_failure_state(self, err: PhaseError) -> StateMachine<T> {
        PhaseState::<Failure, _>::new(self.shared, err).into()
    }
}

impl<S, T> PhaseState<S, T> {
    /// Receives the next request.
    ///
    /// # Errors
    /// Fails with [`PhaseError::RequestChannel`] when all sender halves have
    /// been dropped.
    pub async fn next_request(
        &mut self,
    ) -> Result<(JobRequest, tracing::Span, ResponseSender), PhaseError> {
        self.shared.request_rx.recv().await.ok_or({
            PhaseError::RequestChannel("all request senders have been dropped")
        })
    }
}
