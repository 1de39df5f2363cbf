//! Generated protobuf types for EdgeOrchestra.
//!
//! All cross-language contracts are defined in the `proto/` tree and compiled
//! by `tonic-build`; the generated types and service traits are re-exported at
//! the crate root.

#[allow(clippy::all)]
mod generated {
    tonic::include_proto!("edgeorchestra.v1");
}

pub use generated::*;
