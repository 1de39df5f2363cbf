//! The phases of the round state machine.

mod aggregating;
mod complete;
mod failure;
mod forming;
mod open;
mod phase;
mod shutdown;

pub use self::{
    aggregating::Aggregating,
    complete::Complete,
    failure::Failure,
    forming::Forming,
    open::Open,
    phase::{Phase, PhaseName, PhaseState, Shared},
    shutdown::Shutdown,
};

use thiserror::Error;

use crate::{aggregator::AggregationError, storage::StorageError};

/// Why a round could not be closed.
#[derive(Error, Debug)]
pub enum AbortReason {
    #[error("quorum unreachable: {submitted} submissions, quorum {quorum}")]
    QuorumUnreachable { submitted: usize, quorum: usize },
    #[error("aggregation failed: {0}")]
    Aggregation(#[from] AggregationError),
}

/// An error that ends the current phase.
#[derive(Error, Debug)]
pub enum PhaseError {
    #[error("could not assemble a quorum of eligible devices in {attempts} attempts")]
    SelectionExhausted { attempts: u32 },
    #[error("round aborted: {0}")]
    RoundAborted(#[from] AbortReason),
    #[error("request channel error: {0}")]
    RequestChannel(&'static str),
    #[error("job cancelled")]
    Cancelled,
    #[error("internal error: {0}")]
    Internal(&'static str),
    #[error(transparent)]
    Storage(#[from] StorageError),
}
