//! Storage backends and the traits over which the orchestrator is written.
//!
//! Device rows, job/round/submission rows, liveness snapshots and model blobs
//! each live behind their own trait so that backends can be mixed: the
//! reference deployment keeps rows in memory, liveness and command queues in
//! Redis (shared across orchestrator replicas) and model blobs on the local
//! filesystem.

pub mod fs;
pub mod in_memory;
pub mod redis;
mod store;
mod traits;

pub use self::{
    fs::FsModelStore,
    in_memory::InMemoryStore,
    store::Store,
    traits::{
        DeviceStorage,
        JobStorage,
        LivenessStorage,
        ModelStat,
        ModelStorage,
        Storage,
        StorageError,
        StorageResult,
        SubmissionAdd,
        SubmissionAddError,
        HeartbeatUpsert,
        StaleSequence,
    },
};
