use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::Utc;
use tokio::time::Instant;
use tracing::{debug, info, warn, Instrument};

use edgeorchestra_core::{
    command::StartTraining,
    Command,
    DeviceId,
};

use crate::coordinator::{
    job::Submission,
    phases::{AbortReason, Aggregating, Phase, PhaseError, PhaseName, PhaseState, Shared},
    requests::{JobRequest, RequestError, SubmissionRequest},
    StateMachine,
};
use crate::events::FleetEvent;
use crate::storage::Storage;

/// Open state: collect submissions until the quorum rules resolve the round.
#[derive(Debug)]
pub struct Open {
    /// Participants in selection order; fixes the partition indexes.
    participants: Vec<DeviceId>,
    /// Participants that have not submitted and are not known failed.
    pending: BTreeSet<DeviceId>,
    /// Participants that went offline before submitting.
    failed: BTreeSet<DeviceId>,
    /// Participants whose submission was accepted.
    submitted: BTreeSet<DeviceId>,
}

#[async_trait]
impl<T> Phase<T> for PhaseState<Open, T>
where
    T: Storage,
{
    const NAME: PhaseName = PhaseName::Open;

    async fn process(&mut self) -> Result<(), PhaseError> {
        if self.shared.cancel_requested {
            return Err(PhaseError::Cancelled);
        }

        self.dispatch_start_training().await?;

        let deadline = Instant::now() + self.shared.policy.round_timeout;
        let hard_deadline = deadline + self.shared.policy.round_grace;
        self.persist_deadline().await?;

        let mut deadline_passed = false;
        let mut fleet_closed = false;
        loop {
            if self.can_aggregate(deadline_passed) {
                info!(
                    submissions = self.private.submitted.len(),
                    "round ready to aggregate"
                );
                return Ok(());
            }
            if self.private.pending.is_empty() {
                // Everyone left has either submitted or gone offline;
                // nothing further can arrive.
                return Err(self.abort_below_quorum());
            }

            tokio::select! {
                item = self.shared.request_rx.recv() => {
                    let (req, span, resp_tx) = item.ok_or(PhaseError::RequestChannel(
                        "all request senders have been dropped",
                    ))?;
                    match req {
                        JobRequest::Cancel => {
                            let _ = resp_tx.send(Ok(()));
                            return Err(PhaseError::Cancelled);
                        }
                        JobRequest::Submission(submission) => {
                            let result = self
                                .handle_submission(submission)
                                .instrument(span)
                                .await;
                            let _ = resp_tx.send(result);
                        }
                    }
                }
                event = self.shared.fleet_rx.recv(), if !fleet_closed => {
                    match event {
                        Ok(FleetEvent::DeviceOffline(device_id)) => {
                            self.handle_device_offline(device_id);
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "fleet event stream lagged");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                            fleet_closed = true;
                        }
                    }
                }
                _ = tokio::time::sleep_until(deadline), if !deadline_passed => {
                    debug!("round deadline passed");
                    deadline_passed = true;
                }
                _ = tokio::time::sleep_until(hard_deadline) => {
                    return if self.quorum_met() {
                        info!(
                            submissions = self.private.submitted.len(),
                            "hard deadline reached with quorum"
                        );
                        Ok(())
                    } else {
                        Err(self.abort_below_quorum())
                    };
                }
            }
        }
    }

    async fn next(self) -> Option<StateMachine<T>> {
        let participants: BTreeSet<DeviceId> = self.private.participants.iter().copied().collect();
        Some(PhaseState::<Aggregating, _>::new(self.shared, participants).into())
    }
}

impl<T> PhaseState<Open, T>
where
    T: Storage,
{
    /// Creates a new open state.
    pub fn new(shared: Shared<T>, participants: Vec<DeviceId>) -> Self {
        let pending = participants.iter().copied().collect();
        Self {
            private: Open {
                participants,
                pending,
                failed: BTreeSet::new(),
                submitted: BTreeSet::new(),
            },
            shared,
        }
    }

    /// Enqueues one `start_training` command per participant. The command is
    /// keyed by `(job_id, round)`, so redelivery is idempotent on the worker.
    async fn dispatch_start_training(&mut self) -> Result<(), PhaseError> {
        let total = self.private.participants.len() as u32;
        let participants = self.private.participants.clone();
        for (index, device_id) in participants.iter().enumerate() {
            let command = Command::StartTraining(StartTraining {
                job_id: self.shared.state.id,
                model_id: self.shared.state.global_model_id.clone(),
                round: self.shared.round(),
                partition_index: index as u32,
                partition_total: total,
                architecture: self.shared.state.architecture.clone(),
            });
            self.shared.queue_command(device_id, &command).await?;
        }
        info!(participants = total, round = self.shared.round(), "round opened");
        Ok(())
    }

    async fn persist_deadline(&mut self) -> Result<(), PhaseError> {
        let round = self.shared.round();
        if let Some(mut record) = self.shared.store.round(&self.shared.state.id, round).await? {
            let timeout = chrono::Duration::from_std(self.shared.policy.round_timeout)
                .unwrap_or_else(|_| chrono::Duration::zero());
            record.deadline_at = Some(Utc::now() + timeout);
            self.shared.persist_round(&record).await?;
        }
        Ok(())
    }

    async fn handle_submission(
        &mut self,
        submission: SubmissionRequest,
    ) -> Result<(), RequestError> {
        if submission.round != self.shared.round() {
            return Err(RequestError::RoundNotOpen);
        }
        if !self
            .private
            .participants
            .contains(&submission.device_id)
        {
            return Err(RequestError::NotAParticipant);
        }
        if self.private.submitted.contains(&submission.device_id) {
            return Err(RequestError::AlreadySubmitted);
        }

        let row = Submission {
            device_id: submission.device_id,
            job_id: self.shared.state.id,
            round: submission.round,
            blob: submission.blob,
            num_samples: submission.num_samples,
            metrics: submission.metrics,
            received_at: Utc::now(),
        };
        self.shared
            .store
            .add_submission(&row)
            .await?
            .into_inner()?;

        self.private.submitted.insert(row.device_id);
        self.private.pending.remove(&row.device_id);
        // A straggler that reconnected and submitted in time still counts.
        self.private.failed.remove(&row.device_id);
        info!(
            device_id = %row.device_id,
            num_samples = row.num_samples,
            submissions = self.private.submitted.len(),
            "submission accepted"
        );
        Ok(())
    }

    fn handle_device_offline(&mut self, device_id: DeviceId) {
        if self.private.pending.remove(&device_id) {
            warn!(device_id = %device_id, "participant went offline before submitting");
            self.private.failed.insert(device_id);
        }
    }

    fn quorum_met(&self) -> bool {
        self.private.submitted.len() >= self.shared.state.quorum
    }

    /// Whether the round can move to aggregation: everyone still standing
    /// has submitted, or the deadline passed with the quorum met.
    fn can_aggregate(&self, deadline_passed: bool) -> bool {
        (self.private.pending.is_empty() && self.quorum_met())
            || (deadline_passed && self.quorum_met())
    }

    fn abort_below_quorum(&self) -> PhaseError {
        warn!(
            submissions = self.private.submitted.len(),
            quorum = self.shared.state.quorum,
            "aborting round below quorum"
        );
        PhaseError::RoundAborted(AbortReason::QuorumUnreachable {
            submitted: self.private.submitted.len(),
            quorum: self.shared.state.quorum,
        })
    }
}
