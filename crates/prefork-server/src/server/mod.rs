//! Server-side components of the prefork RPC server.
//!
//! This module contains the building blocks needed to run the pre-forking
//! server: connection handling, worker process management, lifecycle hooks
//! and telemetry setup.
//!
//! ## Submodules
//!
//! - [`config`] - CLI and environment configuration.
//! - [`lifecycle`] - Post-fork hook and interrupt handling.
//! - [`pool`] - The [`Server`](pool::Server) and its worker processes.
//! - [`service`] - Pipeline, session loop and accept loop run by each worker.
//! - [`telemetry`] - Tracing-based structured logging initialization.
//!
//! These components are wired together in the server's `main.rs`.

pub mod config;
pub mod lifecycle;
pub mod pool;
pub mod service;
pub mod telemetry;

#[cfg(test)]
pub(crate) mod testing;
