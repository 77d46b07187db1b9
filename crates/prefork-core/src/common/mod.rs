//! Contracts shared between the prefork server and the code it hosts.
//!
//! ## Submodules
//!
//! - [`error`] - Centralized error type and its disconnect classification.
//! - [`transport`] - Byte-level transports over the halves of a socket.
//! - [`protocol`] - Message framing over transports, split or unified.
//! - [`processor`] - The application dispatch contract.
//! - [`context`] - Per-call peer identity.

pub mod context;
pub mod error;
pub mod processor;
pub mod protocol;
pub mod transport;
