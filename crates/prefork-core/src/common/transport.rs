//! Byte-level transports wrapping the two halves of an accepted socket.
//!
//! An accepted [`TcpStream`](tokio::net::TcpStream) is split into a read half
//! and a write half. An [`InputTransportFactory`] turns the read half into an
//! [`InputTransport`] and an [`OutputTransportFactory`] turns the write half
//! into an [`OutputTransport`]. Protocols are layered on top of these.
//!
//! ## Provided factories
//!
//! - [`SocketTransportFactory`] - passes the socket halves through unchanged.
//! - [`BufferedTransportFactory`] - wraps each half in a tokio buffer.

use futures::future::{BoxFuture, FutureExt};
use std::io;
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter},
    net::tcp::{OwnedReadHalf, OwnedWriteHalf},
};

/// Default buffer capacity used by [`BufferedTransportFactory`].
pub const DEFAULT_BUFFER_SIZE: usize = 8 * 1024;

/// Readable side of a connection.
pub trait InputTransport: AsyncRead + Unpin + Send {
    /// Releases the transport. Called exactly once when the session ends.
    fn close(&mut self) -> BoxFuture<'_, io::Result<()>>;
}

/// Writable side of a connection.
pub trait OutputTransport: AsyncWrite + Unpin + Send {
    /// Flushes pending bytes and shuts the write direction down. Called
    /// exactly once when the session ends.
    fn close(&mut self) -> BoxFuture<'_, io::Result<()>>;
}

/// Builds an [`InputTransport`] over the read half of an accepted socket.
pub trait InputTransportFactory: Send + Sync + 'static {
    fn input_transport(&self, read: OwnedReadHalf) -> Box<dyn InputTransport>;
}

/// Builds an [`OutputTransport`] over the write half of an accepted socket.
pub trait OutputTransportFactory: Send + Sync + 'static {
    fn output_transport(&self, write: OwnedWriteHalf) -> Box<dyn OutputTransport>;
}

impl InputTransport for OwnedReadHalf {
    fn close(&mut self) -> BoxFuture<'_, io::Result<()>> {
        // The descriptor is released when the half is dropped.
        futures::future::ready(Ok(())).boxed()
    }
}

impl OutputTransport for OwnedWriteHalf {
    fn close(&mut self) -> BoxFuture<'_, io::Result<()>> {
        self.shutdown().boxed()
    }
}

impl<T: InputTransport> InputTransport for BufReader<T> {
    fn close(&mut self) -> BoxFuture<'_, io::Result<()>> {
        self.get_mut().close()
    }
}

impl<T: OutputTransport> OutputTransport for BufWriter<T> {
    fn close(&mut self) -> BoxFuture<'_, io::Result<()>> {
        async move {
            self.flush().await?;
            self.get_mut().close().await
        }
        .boxed()
    }
}

/// Uses the raw socket halves as transports.
#[derive(Debug, Default, Clone, Copy)]
pub struct SocketTransportFactory;

impl InputTransportFactory for SocketTransportFactory {
    fn input_transport(&self, read: OwnedReadHalf) -> Box<dyn InputTransport> {
        Box::new(read)
    }
}

impl OutputTransportFactory for SocketTransportFactory {
    fn output_transport(&self, write: OwnedWriteHalf) -> Box<dyn OutputTransport> {
        Box::new(write)
    }
}

/// Wraps each socket half in a fixed-capacity buffer.
///
/// Writes are only guaranteed to reach the peer once the protocol flushes,
/// which both bundled protocols do after every message.
#[derive(Debug, Clone, Copy)]
pub struct BufferedTransportFactory {
    capacity: usize,
}

impl BufferedTransportFactory {
    pub const fn new(capacity: usize) -> Self {
        Self { capacity }
    }
}

impl Default for BufferedTransportFactory {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_SIZE)
    }
}

impl InputTransportFactory for BufferedTransportFactory {
    fn input_transport(&self, read: OwnedReadHalf) -> Box<dyn InputTransport> {
        Box::new(BufReader::with_capacity(self.capacity, read))
    }
}

impl OutputTransportFactory for BufferedTransportFactory {
    fn output_transport(&self, write: OwnedWriteHalf) -> Box<dyn OutputTransport> {
        Box::new(BufWriter::with_capacity(self.capacity, write))
    }
}
