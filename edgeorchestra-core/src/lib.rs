//! # EdgeOrchestra core
//!
//! Shared vocabulary and wire formats for the EdgeOrchestra federated-learning
//! control plane. This crate is deliberately free of any I/O: it defines the
//! identifiers, device telemetry types and the typed command envelope that the
//! orchestrator and its workers exchange, the registry of supported model
//! architectures, and the two binary formats that cross the wire:
//!
//! - the layered [`WeightBank`] format used for model artifacts and decoded
//!   weight deltas, and
//! - the compressed [delta blob][crate::delta] submitted by workers after a
//!   training round (f16 quantization + raw LZ4 block).

pub mod architecture;
pub mod bank;
pub mod command;
pub mod common;
pub mod delta;

pub use self::{
    architecture::Architecture,
    bank::WeightBank,
    command::Command,
    common::{
        BatteryState,
        DeviceCapabilities,
        DeviceId,
        DeviceMetrics,
        DeviceStatus,
        JobId,
        ModelId,
    },
};

/// An opaque error returned when a wire payload cannot be decoded.
pub type DecodeError = anyhow::Error;
