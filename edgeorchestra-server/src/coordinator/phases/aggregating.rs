use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{info, warn};

use edgeorchestra_core::{architecture, Command, DeviceId};

use crate::aggregator::{self, AggregateOutcome};
use crate::coordinator::{
    events::AggregateTelemetry,
    job::RoundStatus,
    phases::{AbortReason, Complete, Forming, Phase, PhaseError, PhaseName, PhaseState, Shared},
    StateMachine,
};
use crate::storage::Storage;

/// Aggregating state: fold the frozen submissions into the next global model.
#[derive(Debug)]
pub struct Aggregating {
    participants: BTreeSet<DeviceId>,
}

#[async_trait]
impl<T> Phase<T> for PhaseState<Aggregating, T>
where
    T: Storage,
{
    const NAME: PhaseName = PhaseName::Aggregating;

    async fn process(&mut self) -> Result<(), PhaseError> {
        let round = self.shared.round();
        self.freeze_round().await?;

        let outcome = self.run_aggregation().await?;

        let new_model_id = self
            .shared
            .store
            .put_model(&outcome.bank.to_bytes())
            .await?;
        let job_ref = format!("job:{}", self.shared.state.id);
        self.shared.store.pin_model(&new_model_id, &job_ref).await?;
        let previous = self.shared.state.global_model_id.clone();
        self.shared.store.unpin_model(&previous, &job_ref).await?;

        self.close_round(&new_model_id).await?;

        // Tell submitters the round is over; their training session is done.
        for device_id in &outcome.accepted {
            let stop = Command::StopTraining {
                job_id: self.shared.state.id,
            };
            self.shared.queue_command(device_id, &stop).await?;
        }
        let participants = self.private.participants.clone();
        self.shared.restore_participants(participants.iter()).await?;

        self.shared.state.global_model_id = new_model_id.clone();
        self.shared.state.current_round = round;
        self.shared.state.round_retries = 0;
        self.shared.persist_job().await?;

        self.shared.events.broadcast_model(new_model_id);
        self.shared.events.broadcast_telemetry(AggregateTelemetry {
            job_id: self.shared.state.id,
            round,
            server_loss: outcome.avg_loss,
            server_accuracy: outcome.avg_accuracy,
            delta_norm: outcome.delta_norm,
            updated_at: Utc::now(),
        });

        info!(
            round,
            accepted = outcome.accepted.len(),
            rejected = outcome.rejected.len(),
            delta_norm = outcome.delta_norm,
            "round closed"
        );
        Ok(())
    }

    async fn next(self) -> Option<StateMachine<T>> {
        if self.shared.state.current_round < self.shared.state.target_rounds {
            Some(PhaseState::<Forming, _>::new(self.shared).into())
        } else {
            Some(PhaseState::<Complete, _>::new(self.shared).into())
        }
    }
}

impl<T> PhaseState<Aggregating, T>
where
    T: Storage,
{
    /// Creates a new aggregating state.
    pub fn new(shared: Shared<T>, participants: BTreeSet<DeviceId>) -> Self {
        Self {
            private: Aggregating { participants },
            shared,
        }
    }

    /// Freezes the submission snapshot: from here on the round rejects
    /// further submissions as late.
    async fn freeze_round(&mut self) -> Result<(), PhaseError> {
        let round = self.shared.round();
        if let Some(mut record) = self.shared.store.round(&self.shared.state.id, round).await? {
            record.status = RoundStatus::Aggregating;
            self.shared.persist_round(&record).await?;
        }
        Ok(())
    }

    async fn close_round(
        &mut self,
        aggregate_model_id: &edgeorchestra_core::ModelId,
    ) -> Result<(), PhaseError> {
        let round = self.shared.round();
        if let Some(mut record) = self.shared.store.round(&self.shared.state.id, round).await? {
            record.status = RoundStatus::Closed;
            record.aggregate_model_id = Some(aggregate_model_id.clone());
            self.shared.persist_round(&record).await?;
        }
        Ok(())
    }

    /// Runs the CPU-bound aggregation on a blocking worker.
    async fn run_aggregation(&mut self) -> Result<AggregateOutcome, PhaseError> {
        let round = self.shared.round();
        let submissions = self
            .shared
            .store
            .submissions(&self.shared.state.id, round)
            .await?;
        let global_bytes = self
            .shared
            .store
            .model(&self.shared.state.global_model_id)
            .await?
            .ok_or(PhaseError::Internal("global model missing from the store"))?;
        let arch = architecture::get(&self.shared.state.architecture)
            .map_err(|_| PhaseError::Internal("job references an unknown architecture"))?;

        let outcome = tokio::task::spawn_blocking(move || {
            aggregator::aggregate(&global_bytes, arch, &submissions)
        })
        .await
        .map_err(|_| PhaseError::Internal("aggregation task panicked"))?
        .map_err(|err| {
            warn!(error = %err, "aggregation failed");
            PhaseError::RoundAborted(AbortReason::Aggregation(err))
        })?;
        Ok(outcome)
    }
}
