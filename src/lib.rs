//! Coordinator core: a UDP discovery responder, a TCP session server, a
//! device registry, and a liveness monitor wired together under one
//! cancellation scope.
//!
//! [`Coordinator`] is the entry point; everything else in this crate is an
//! implementation detail it owns.

pub mod config;
pub mod coordinator;
pub mod discovery;
pub mod error;
pub mod events;
pub mod liveness;
pub mod probe;
pub mod registry;
pub mod session;

pub use coordinator::Coordinator;
pub use events::CoordinatorEvent;
pub use registry::{DeviceEntry, DeviceSnapshot};
