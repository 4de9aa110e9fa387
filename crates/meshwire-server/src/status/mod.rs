//! Node status persistence and dashboard fan-out.

mod hub;

pub use hub::StatusHub;
