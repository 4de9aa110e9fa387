//! Per-node session state on the coordinator.

mod session;

pub use session::{NodeSession, SessionRegistry, TaskSender};
