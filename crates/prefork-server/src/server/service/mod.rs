//! Connection handling inside a worker process.
//!
//! This module turns accepted sockets into served sessions. It owns the
//! transport/protocol pipeline, the per-connection session loop and the
//! cooperative accept loop that drives them.
//!
//! ## Structure
//!
//! - [`pipeline`] - Factories that wrap a socket into a protocol pair.
//! - [`session`] - The per-connection request loop.
//! - [`acceptor`] - The accept loop every worker runs.
//! - [`echo`] - A processor that returns each request unchanged.

pub mod acceptor;
pub mod echo;
pub mod pipeline;
pub mod session;

pub use acceptor::{Acceptor, Listener};
pub use echo::EchoProcessor;
pub use pipeline::{PipelineBuilder, PipelineFactories, ProtocolFactories};
pub use session::SessionHandler;
