//! Meshwire Protocol Buffers
//!
//! Generated protobuf code for the Meshwire gRPC API.
//!
//! This crate contains:
//! - `TaskService` for node registration and task dispatch
//! - `StatusService` for health reporting and dashboard streaming

/// Meshwire v1 API definitions.
///
/// All generated types and services are included here.
#[allow(
    clippy::derive_partial_eq_without_eq,
    clippy::pedantic,
    clippy::nursery
)]
pub mod v1 {
    tonic::include_proto!("meshwire.v1");

    /// Encoded file descriptor set for gRPC server reflection.
    pub const FILE_DESCRIPTOR_SET: &[u8] =
        tonic::include_file_descriptor_set!("meshwire_descriptor");
}

// Re-export v1 as the default API version for convenience
pub use v1::*;

// Re-export prost_types for downstream crates that need timestamp conversion
pub use prost_types;
