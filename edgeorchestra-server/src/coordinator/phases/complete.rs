use async_trait::async_trait;
use chrono::Utc;
use tracing::info;

use crate::coordinator::{
    job::JobStatus,
    phases::{Phase, PhaseError, PhaseName, PhaseState, Shared, Shutdown},
    StateMachine,
};
use crate::storage::Storage;

/// Complete state: all target rounds closed successfully.
#[derive(Debug)]
pub struct Complete;

#[async_trait]
impl<T> Phase<T> for PhaseState<Complete, T>
where
    T: Storage,
{
    const NAME: PhaseName = PhaseName::Complete;

    async fn process(&mut self) -> Result<(), PhaseError> {
        self.shared.state.status = JobStatus::Completed;
        self.shared.state.completed_at = Some(Utc::now());
        self.shared.persist_job().await?;
        self.shared.events.broadcast_status(JobStatus::Completed);
        info!(
            rounds = self.shared.state.current_round,
            "training job completed"
        );
        Ok(())
    }

    async fn next(self) -> Option<StateMachine<T>> {
        Some(PhaseState::<Shutdown, _>::new(self.shared).into())
    }
}

impl<T> PhaseState<Complete, T>
where
    T: Storage,
{
    /// Creates a new complete state.
    pub fn new(shared: Shared<T>) -> Self {
        Self {
            private: Complete,
            shared,
        }
    }
}
