//! # `prefork-core`
//!
//! Contracts for the pluggable pieces of the prefork RPC server: the
//! transports that wrap an accepted socket, the protocols that frame messages
//! on top of them, and the [`Processor`] that handles one request per call.
//!
//! A small set of reference implementations ships alongside the traits so the
//! server is usable out of the box:
//!
//! - [`SocketTransportFactory`] and [`BufferedTransportFactory`]
//! - [`FramedProtocolFactory`] (split, length-prefixed frames)
//! - [`HeaderProtocolFactory`] (unified, sequence-id header frames)

mod common;
pub use common::*;

pub use context::CallContext;
pub use error::{BoxError, Error, Result};
pub use processor::Processor;
pub use protocol::{
    DuplexProtocol, DuplexProtocolFactory, FramedProtocolFactory, HeaderProtocolFactory,
    InputProtocol, InputProtocolFactory, OutputProtocol, OutputProtocolFactory, ProtocolPair,
};
pub use transport::{
    BufferedTransportFactory, InputTransport, InputTransportFactory, OutputTransport,
    OutputTransportFactory, SocketTransportFactory,
};
