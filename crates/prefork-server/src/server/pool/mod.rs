//! Worker process management.
//!
//! - [`manager`] - The [`Server`] that owns the listener and the worker set.
//! - [`worker`] - Worker entry point and the process spawning seam.

pub mod manager;
pub mod worker;

pub use manager::Server;
pub use worker::{ProcessSpawner, Worker, WorkerContext, WorkerHandle};
