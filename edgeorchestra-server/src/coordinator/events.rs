//! The job coordinator's `Event`, `EventSubscriber` and `EventPublisher`
//! types.
//!
//! Each running job broadcasts its phase, status, current global model and
//! latest aggregate telemetry over watch channels. The heartbeat service
//! subscribes for metadata stamping, the model service for routing
//! submissions to the right job.

use chrono::{DateTime, Utc};
use tokio::sync::watch;

use edgeorchestra_core::{JobId, ModelId};

use crate::coordinator::{job::JobStatus, phases::PhaseName};

/// An event emitted by a job coordinator.
#[derive(Debug, Clone, PartialEq)]
pub struct Event<E> {
    /// The round in flight when the event was emitted.
    pub round: u32,
    /// The event itself.
    pub event: E,
}

/// The summary metrics of the latest successful aggregation.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateTelemetry {
    pub job_id: JobId,
    pub round: u32,
    pub server_loss: Option<f64>,
    pub server_accuracy: Option<f64>,
    pub delta_norm: f64,
    pub updated_at: DateTime<Utc>,
}

/// A convenience type to emit any job coordinator event.
#[derive(Debug)]
pub struct EventPublisher {
    /// Round number attached to all published events.
    round: u32,
    phase_tx: watch::Sender<Event<PhaseName>>,
    status_tx: watch::Sender<Event<JobStatus>>,
    model_tx: watch::Sender<Event<ModelId>>,
    telemetry_tx: watch::Sender<Event<Option<AggregateTelemetry>>>,
}

/// The `EventSubscriber` hands out `EventListener`s for any job coordinator
/// event.
#[derive(Debug, Clone)]
pub struct EventSubscriber {
    phase_rx: EventListener<PhaseName>,
    status_rx: EventListener<JobStatus>,
    model_rx: EventListener<ModelId>,
    telemetry_rx: EventListener<Option<AggregateTelemetry>>,
}

impl EventPublisher {
    /// Initializes a new event publisher with the given initial events.
    pub fn init(
        round: u32,
        model: ModelId,
        phase: PhaseName,
        status: JobStatus,
    ) -> (Self, EventSubscriber) {
        let (phase_tx, phase_rx) = watch::channel(Event { round, event: phase });
        let (status_tx, status_rx) = watch::channel(Event { round, event: status });
        let (model_tx, model_rx) = watch::channel(Event { round, event: model });
        let (telemetry_tx, telemetry_rx) = watch::channel(Event { round, event: None });

        let publisher = EventPublisher {
            round,
            phase_tx,
            status_tx,
            model_tx,
            telemetry_tx,
        };
        let subscriber = EventSubscriber {
            phase_rx: phase_rx.into(),
            status_rx: status_rx.into(),
            model_rx: model_rx.into(),
            telemetry_rx: telemetry_rx.into(),
        };
        (publisher, subscriber)
    }

    /// Sets the round number attached to subsequently published events.
    pub fn set_round(&mut self, round: u32) {
        self.round = round;
    }

    fn event<E>(&self, event: E) -> Event<E> {
        Event {
            round: self.round,
            event,
        }
    }

    /// Emits a phase event.
    pub fn broadcast_phase(&mut self, phase: PhaseName) {
        let _ = self.phase_tx.send(self.event(phase));
    }

    /// Emits a job status event.
    pub fn broadcast_status(&mut self, status: JobStatus) {
        let _ = self.status_tx.send(self.event(status));
    }

    /// Emits the current global model id.
    pub fn broadcast_model(&mut self, model: ModelId) {
        let _ = self.model_tx.send(self.event(model));
    }

    /// Emits the latest aggregate telemetry.
    pub fn broadcast_telemetry(&mut self, telemetry: AggregateTelemetry) {
        let _ = self.telemetry_tx.send(self.event(Some(telemetry)));
    }
}

impl EventSubscriber {
    pub fn phase_listener(&self) -> EventListener<PhaseName> {
        self.phase_rx.clone()
    }

    pub fn status_listener(&self) -> EventListener<JobStatus> {
        self.status_rx.clone()
    }

    pub fn model_listener(&self) -> EventListener<ModelId> {
        self.model_rx.clone()
    }

    pub fn telemetry_listener(&self) -> EventListener<Option<AggregateTelemetry>> {
        self.telemetry_rx.clone()
    }
}

/// A handle on the latest value of one event stream.
#[derive(Debug, Clone)]
pub struct EventListener<E>(watch::Receiver<Event<E>>);

impl<E> From<watch::Receiver<Event<E>>> for EventListener<E> {
    fn from(rx: watch::Receiver<Event<E>>) -> Self {
        Self(rx)
    }
}

impl<E: Clone> EventListener<E> {
    /// Returns the most recently published event.
    pub fn get_latest(&self) -> Event<E> {
        self.0.borrow().clone()
    }

    /// Waits for the next published event.
    pub async fn changed(&mut self) -> Result<Event<E>, watch::error::RecvError> {
        self.0.changed().await?;
        Ok(self.0.borrow().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_is_stamped_per_event() {
        let model = ModelId::digest(b"m");
        let (mut publisher, subscriber) =
            EventPublisher::init(1, model.clone(), PhaseName::Forming, JobStatus::Running);

        let phases = subscriber.phase_listener();
        assert_eq!(phases.get_latest().round, 1);

        publisher.set_round(2);
        // Old events keep their round.
        assert_eq!(phases.get_latest().round, 1);

        publisher.broadcast_phase(PhaseName::Open);
        let latest = phases.get_latest();
        assert_eq!(latest.round, 2);
        assert_eq!(latest.event, PhaseName::Open);

        assert_eq!(subscriber.model_listener().get_latest().event, model);
    }
}
