use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info, warn};

use edgeorchestra_core::{DeviceId, DeviceStatus};

use crate::coordinator::{
    job::{RoundRecord, RoundStatus},
    phases::{Open, Phase, PhaseError, PhaseName, PhaseState, Shared},
    requests::{JobRequest, RequestError},
    selection,
    StateMachine,
};
use crate::storage::Storage;

/// Forming state: assemble a quorum of eligible participants.
#[derive(Debug, Default)]
pub struct Forming {
    /// Participants in selection order; set once selection succeeds.
    selected: Vec<DeviceId>,
}

#[async_trait]
impl<T> Phase<T> for PhaseState<Forming, T>
where
    T: Storage,
{
    const NAME: PhaseName = PhaseName::Forming;

    async fn process(&mut self) -> Result<(), PhaseError> {
        if self.shared.cancel_requested {
            return Err(PhaseError::Cancelled);
        }

        let attempts = self.shared.policy.selection_max_attempts;
        for attempt in 1..=attempts {
            if let Some(participants) = self.try_select().await? {
                info!(
                    round = self.shared.round(),
                    participants = participants.len(),
                    attempt,
                    "participants selected"
                );
                self.open_round(&participants).await?;
                self.private.selected = participants;
                return Ok(());
            }
            debug!(
                attempt,
                backoff_s = self.shared.policy.selection_backoff.as_secs(),
                "not enough eligible devices, backing off"
            );
            self.backoff().await?;
        }
        Err(PhaseError::SelectionExhausted { attempts })
    }

    async fn next(self) -> Option<StateMachine<T>> {
        Some(PhaseState::<Open, _>::new(self.shared, self.private.selected).into())
    }
}

impl<T> PhaseState<Forming, T>
where
    T: Storage,
{
    /// Creates a new forming state.
    pub fn new(shared: Shared<T>) -> Self {
        Self {
            private: Forming::default(),
            shared,
        }
    }

    /// One selection attempt. Returns the chosen participants in selection
    /// order, or `None` when fewer than `quorum` devices are eligible.
    async fn try_select(&mut self) -> Result<Option<Vec<DeviceId>>, PhaseError> {
        let candidates = self
            .shared
            .store
            .list_devices(Some(DeviceStatus::Online))
            .await?;

        let mut eligible = Vec::new();
        for device in candidates {
            let live = self.shared.store.heartbeat(&device.id).await?.is_some();
            if selection::is_eligible(
                &device,
                live,
                &self.shared.policy,
                &self.shared.state.required_frameworks,
            ) {
                eligible.push(device);
            }
        }

        if eligible.len() < self.shared.state.quorum {
            return Ok(None);
        }

        let picked = selection::pick(eligible, self.shared.state.participants_max);
        Ok(Some(picked.into_iter().map(|d| d.id).collect()))
    }

    /// Persists the round row and marks the participants as training.
    async fn open_round(&mut self, participants: &[DeviceId]) -> Result<(), PhaseError> {
        for device_id in participants {
            self.shared
                .store
                .set_device_status(device_id, DeviceStatus::Training)
                .await?;
        }
        let round = RoundRecord {
            job_id: self.shared.state.id,
            round: self.shared.round(),
            global_model_id: self.shared.state.global_model_id.clone(),
            status: RoundStatus::Open,
            participants: participants.iter().copied().collect::<BTreeSet<_>>(),
            started_at: Utc::now(),
            deadline_at: None,
            aggregate_model_id: None,
        };
        self.shared.persist_round(&round).await?;
        Ok(())
    }

    /// Sleeps out the selection backoff while answering requests; a cancel
    /// ends the phase.
    async fn backoff(&mut self) -> Result<(), PhaseError> {
        let wakeup = tokio::time::Instant::now() + self.shared.policy.selection_backoff;
        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(wakeup) => return Ok(()),
                item = self.shared.request_rx.recv() => {
                    let (req, span, resp_tx) = item.ok_or(PhaseError::RequestChannel(
                        "all request senders have been dropped",
                    ))?;
                    let _guard = span.enter();
                    match req {
                        JobRequest::Cancel => {
                            let _ = resp_tx.send(Ok(()));
                            return Err(PhaseError::Cancelled);
                        }
                        JobRequest::Submission(submission) => {
                            warn!(
                                device_id = %submission.device_id,
                                round = submission.round,
                                "submission while no round is open"
                            );
                            let _ = resp_tx.send(Err(RequestError::RoundNotOpen));
                        }
                    }
                }
            }
        }
    }
}
