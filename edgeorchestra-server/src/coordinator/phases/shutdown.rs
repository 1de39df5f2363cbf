use async_trait::async_trait;
use tracing::debug;

use crate::coordinator::{
    phases::{Phase, PhaseError, PhaseName, PhaseState, Shared},
    requests::RequestError,
    StateMachine,
};
use crate::storage::Storage;

/// Shutdown state: the job reached a terminal status; drain the request
/// channel and stop.
#[derive(Debug)]
pub struct Shutdown;

#[async_trait]
impl<T> Phase<T> for PhaseState<Shutdown, T>
where
    T: Storage,
{
    const NAME: PhaseName = PhaseName::Shutdown;

    async fn process(&mut self) -> Result<(), PhaseError> {
        // Clean shutdown of the request channel: close it and answer all
        // remaining requests.
        self.shared.request_rx.close();
        while let Some(Some((_req, span, resp_tx))) = self.shared.request_rx.try_recv() {
            let _guard = span.enter();
            debug!("rejecting request during shutdown");
            let _ = resp_tx.send(Err(RequestError::JobTerminated));
        }
        Ok(())
    }

    async fn next(self) -> Option<StateMachine<T>> {
        None
    }
}

impl<T> PhaseState<Shutdown, T>
where
    T: Storage,
{
    /// Creates a new shutdown state.
    pub fn new(shared: Shared<T>) -> Self {
        Self {
            private: Shutdown,
            shared,
        }
    }
}
