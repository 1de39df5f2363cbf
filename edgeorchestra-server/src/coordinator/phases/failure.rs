use async_trait::async_trait;
use chrono::Utc;
use tracing::{error, info, warn};

use edgeorchestra_core::Command;

use crate::coordinator::{
    job::{JobStatus, RoundStatus},
    phases::{Forming, Phase, PhaseError, PhaseName, PhaseState, Shared, Shutdown},
    StateMachine,
};
use crate::storage::Storage;

/// Failure state: decide between retrying the round and ending the job.
///
/// Every phase error funnels here. Round-level failures (quorum missed,
/// aggregation failed) retry the same round up to the configured budget;
/// everything else ends the job. Errors never escape the state machine.
#[derive(Debug)]
pub struct Failure {
    error: PhaseError,
    retry: bool,
}

#[async_trait]
impl<T> Phase<T> for PhaseState<Failure, T>
where
    T: Storage,
{
    const NAME: PhaseName = PhaseName::Failure;

    async fn process(&mut self) -> Result<(), PhaseError> {
        if let Err(err) = self.handle().await {
            // A failing store leaves nothing to clean up with; log and end.
            error!(error = %err, "cleanup after phase failure failed");
            self.private.retry = false;
            self.shared.state.status = JobStatus::Failed;
        }
        Ok(())
    }

    async fn next(self) -> Option<StateMachine<T>> {
        if self.private.retry {
            Some(PhaseState::<Forming, _>::new(self.shared).into())
        } else {
            Some(PhaseState::<Shutdown, _>::new(self.shared).into())
        }
    }
}

impl<T> PhaseState<Failure, T>
where
    T: Storage,
{
    /// Creates a new failure state from `error`.
    pub fn new(shared: Shared<T>, error: PhaseError) -> Self {
        Self {
            private: Failure {
                error,
                retry: false,
            },
            shared,
        }
    }

    async fn handle(&mut self) -> Result<(), PhaseError> {
        warn!(error = %self.private.error, "handling phase failure");
        self.abort_open_round().await?;

        match &self.private.error {
            PhaseError::Cancelled => {
                info!("job cancelled");
                self.shared.state.status = JobStatus::Cancelled;
            }
            PhaseError::RoundAborted(reason) => {
                let retries = self.shared.state.round_retries;
                if retries < self.shared.policy.round_max_retries {
                    self.shared.state.round_retries = retries + 1;
                    self.private.retry = true;
                    info!(
                        round = self.shared.round(),
                        retry = retries + 1,
                        max_retries = self.shared.policy.round_max_retries,
                        reason = %reason,
                        "retrying aborted round"
                    );
                } else {
                    warn!(
                        round = self.shared.round(),
                        retries,
                        "round retry budget exhausted, job failed"
                    );
                    self.shared.state.status = JobStatus::Failed;
                }
            }
            PhaseError::SelectionExhausted { attempts } => {
                warn!(attempts, "selection attempts exhausted, job failed");
                self.shared.state.status = JobStatus::Failed;
            }
            PhaseError::RequestChannel(reason) => {
                warn!(reason, "request channel gone, job failed");
                self.shared.state.status = JobStatus::Failed;
            }
            PhaseError::Internal(_) | PhaseError::Storage(_) => {
                self.shared.state.status = JobStatus::Failed;
            }
        }

        if !self.private.retry {
            self.shared.state.completed_at = Some(Utc::now());
        }
        self.shared.persist_job().await?;
        let status = self.shared.state.status;
        self.shared.events.broadcast_status(status);
        Ok(())
    }

    /// Marks the round in flight aborted, discards its submissions, stops
    /// and restores every participant. The job's global model id was only
    /// advanced on success, so the previous global model is already in place
    /// for a retry.
    async fn abort_open_round(&mut self) -> Result<(), PhaseError> {
        let round = self.shared.round();
        let record = match self.shared.store.round(&self.shared.state.id, round).await? {
            Some(record) => record,
            None => return Ok(()),
        };
        if !matches!(record.status, RoundStatus::Open | RoundStatus::Aggregating) {
            return Ok(());
        }

        let mut record = record;
        record.status = RoundStatus::Aborted;
        self.shared.persist_round(&record).await?;
        self.shared
            .store
            .remove_submissions(&self.shared.state.id, round)
            .await?;

        let stop = Command::StopTraining {
            job_id: self.shared.state.id,
        };
        let participants = record.participants.clone();
        for device_id in &participants {
            self.shared.queue_command(device_id, &stop).await?;
        }
        self.shared.restore_participants(participants.iter()).await?;
        Ok(())
    }
}
