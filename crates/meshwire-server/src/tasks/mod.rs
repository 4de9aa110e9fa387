//! Task creation, dispatch, and finalization.

mod bus;

pub use bus::TaskBus;
