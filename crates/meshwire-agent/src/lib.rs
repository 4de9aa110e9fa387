//! Meshwire agent library
//!
//! The long-lived process on each mesh member:
//! - maintains a persistent gRPC session to the coordinator
//! - receives task frames and executes them sequentially
//! - fetches rendered configuration over HTTP and materializes it
//! - restarts the tunnel and routing daemons
//! - reports host health every 30 seconds

pub mod executor;
pub mod metrics;
pub mod session;
pub mod status;
