//! Message protocols layered over connection transports.
//!
//! A protocol turns a byte stream into whole messages. The server never looks
//! inside a message; it only hands the protocols of a connection to the
//! [`Processor`](crate::Processor) as a [`ProtocolPair`].
//!
//! Protocols come in two shapes:
//!
//! - **Split**: an [`InputProtocol`] reads requests from the input transport
//!   and an independent [`OutputProtocol`] writes responses to the output
//!   transport. See [`FramedProtocolFactory`].
//! - **Unified**: a single [`DuplexProtocol`] instance owns both transports
//!   and keeps framing state that spans a request and its response. The same
//!   instance serves as both sides of the pair. See [`HeaderProtocolFactory`].

use crate::{
    Error, Result,
    transport::{InputTransport, OutputTransport},
};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures::{
    SinkExt, StreamExt,
    future::{BoxFuture, FutureExt},
};
use std::io;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

/// Default upper bound on a single frame, in bytes.
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

/// Size of the sequence id header carried by [`HeaderProtocol`] frames.
pub const HEADER_SIZE: usize = core::mem::size_of::<u32>();

/// Reads request messages from an [`InputTransport`].
pub trait InputProtocol: Send {
    /// Reads the next whole message.
    ///
    /// Returns [`Error::Transport`] once the peer has gone away.
    fn read_message(&mut self) -> BoxFuture<'_, Result<Bytes>>;

    /// The transport this protocol reads from.
    fn input_transport(&mut self) -> &mut dyn InputTransport;
}

/// Writes response messages to an [`OutputTransport`].
pub trait OutputProtocol: Send {
    /// Writes one whole message and flushes it to the transport.
    fn write_message(&mut self, message: Bytes) -> BoxFuture<'_, Result<()>>;

    /// The transport this protocol writes to.
    fn output_transport(&mut self) -> &mut dyn OutputTransport;
}

/// A protocol that frames requests and responses over one logical channel.
pub trait DuplexProtocol: InputProtocol + OutputProtocol {
    fn as_input(&mut self) -> &mut dyn InputProtocol;
    fn as_output(&mut self) -> &mut dyn OutputProtocol;
}

impl<T: InputProtocol + OutputProtocol> DuplexProtocol for T {
    fn as_input(&mut self) -> &mut dyn InputProtocol {
        self
    }

    fn as_output(&mut self) -> &mut dyn OutputProtocol {
        self
    }
}

/// Builds the input protocol of a split pair.
pub trait InputProtocolFactory: Send + Sync + 'static {
    fn input_protocol(&self, transport: Box<dyn InputTransport>) -> Box<dyn InputProtocol>;
}

/// Builds the output protocol of a split pair.
pub trait OutputProtocolFactory: Send + Sync + 'static {
    fn output_protocol(&self, transport: Box<dyn OutputTransport>) -> Box<dyn OutputProtocol>;
}

/// Builds the single protocol instance of a unified pair.
pub trait DuplexProtocolFactory: Send + Sync + 'static {
    fn duplex_protocol(
        &self,
        input: Box<dyn InputTransport>,
        output: Box<dyn OutputTransport>,
    ) -> Box<dyn DuplexProtocol>;
}

enum Protocols {
    Split {
        input: Box<dyn InputProtocol>,
        output: Box<dyn OutputProtocol>,
    },
    Unified(Box<dyn DuplexProtocol>),
}

/// The input and output protocols of one connection.
///
/// For a unified protocol, [`input`](Self::input) and
/// [`output`](Self::output) both return the same underlying instance.
pub struct ProtocolPair {
    protocols: Protocols,
}

impl ProtocolPair {
    pub fn split(input: Box<dyn InputProtocol>, output: Box<dyn OutputProtocol>) -> Self {
        Self {
            protocols: Protocols::Split { input, output },
        }
    }

    pub fn unified(protocol: Box<dyn DuplexProtocol>) -> Self {
        Self {
            protocols: Protocols::Unified(protocol),
        }
    }

    pub fn input(&mut self) -> &mut dyn InputProtocol {
        match &mut self.protocols {
            Protocols::Split { input, .. } => &mut **input,
            Protocols::Unified(protocol) => protocol.as_input(),
        }
    }

    pub fn output(&mut self) -> &mut dyn OutputProtocol {
        match &mut self.protocols {
            Protocols::Split { output, .. } => &mut **output,
            Protocols::Unified(protocol) => protocol.as_output(),
        }
    }

    pub const fn is_unified(&self) -> bool {
        matches!(self.protocols, Protocols::Unified(_))
    }

    /// Closes the input transport, then the output transport.
    ///
    /// Both closes are attempted even if the first fails; the first failure
    /// is returned. Consuming `self` guarantees each transport is closed at
    /// most once.
    pub async fn close(mut self) -> io::Result<()> {
        let input = self.input().input_transport().close().await;
        let output = self.output().output_transport().close().await;
        input.and(output)
    }
}

fn length_delimited(max_frame_length: usize) -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(max_frame_length)
        .new_codec()
}

async fn next_frame(
    frames: &mut FramedRead<Box<dyn InputTransport>, LengthDelimitedCodec>,
) -> Result<BytesMut> {
    match frames.next().await {
        Some(Ok(frame)) => Ok(frame),
        Some(Err(e)) => Err(Error::from_codec(e)),
        None => Err(Error::end_of_stream()),
    }
}

/// Split protocol of `u32` big-endian length-prefixed frames.
#[derive(Debug, Clone, Copy)]
pub struct FramedProtocolFactory {
    max_frame_length: usize,
}

impl FramedProtocolFactory {
    pub const fn new(max_frame_length: usize) -> Self {
        Self { max_frame_length }
    }
}

impl Default for FramedProtocolFactory {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LENGTH)
    }
}

impl InputProtocolFactory for FramedProtocolFactory {
    fn input_protocol(&self, transport: Box<dyn InputTransport>) -> Box<dyn InputProtocol> {
        Box::new(FramedInputProtocol {
            frames: FramedRead::new(transport, length_delimited(self.max_frame_length)),
        })
    }
}

impl OutputProtocolFactory for FramedProtocolFactory {
    fn output_protocol(&self, transport: Box<dyn OutputTransport>) -> Box<dyn OutputProtocol> {
        Box::new(FramedOutputProtocol {
            frames: FramedWrite::new(transport, length_delimited(self.max_frame_length)),
        })
    }
}

pub struct FramedInputProtocol {
    frames: FramedRead<Box<dyn InputTransport>, LengthDelimitedCodec>,
}

impl InputProtocol for FramedInputProtocol {
    fn read_message(&mut self) -> BoxFuture<'_, Result<Bytes>> {
        async move { next_frame(&mut self.frames).await.map(BytesMut::freeze) }.boxed()
    }

    fn input_transport(&mut self) -> &mut dyn InputTransport {
        &mut **self.frames.get_mut()
    }
}

pub struct FramedOutputProtocol {
    frames: FramedWrite<Box<dyn OutputTransport>, LengthDelimitedCodec>,
}

impl OutputProtocol for FramedOutputProtocol {
    fn write_message(&mut self, message: Bytes) -> BoxFuture<'_, Result<()>> {
        async move { self.frames.send(message).await.map_err(Error::from_codec) }.boxed()
    }

    fn output_transport(&mut self) -> &mut dyn OutputTransport {
        &mut **self.frames.get_mut()
    }
}

/// Unified protocol whose frames carry a `u32` sequence id header.
///
/// Every response is stamped with the sequence id of the request it answers,
/// so reading and writing share state and the protocol must be a single
/// instance per connection.
#[derive(Debug, Clone, Copy)]
pub struct HeaderProtocolFactory {
    max_frame_length: usize,
}

impl HeaderProtocolFactory {
    pub const fn new(max_frame_length: usize) -> Self {
        Self { max_frame_length }
    }
}

impl Default for HeaderProtocolFactory {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LENGTH)
    }
}

impl DuplexProtocolFactory for HeaderProtocolFactory {
    fn duplex_protocol(
        &self,
        input: Box<dyn InputTransport>,
        output: Box<dyn OutputTransport>,
    ) -> Box<dyn DuplexProtocol> {
        Box::new(HeaderProtocol {
            reader: FramedRead::new(input, length_delimited(self.max_frame_length)),
            writer: FramedWrite::new(output, length_delimited(self.max_frame_length)),
            pending: None,
        })
    }
}

pub struct HeaderProtocol {
    reader: FramedRead<Box<dyn InputTransport>, LengthDelimitedCodec>,
    writer: FramedWrite<Box<dyn OutputTransport>, LengthDelimitedCodec>,
    pending: Option<u32>,
}

impl HeaderProtocol {
    /// Sequence id of the request awaiting a response, if any.
    pub const fn pending_sequence(&self) -> Option<u32> {
        self.pending
    }
}

impl InputProtocol for HeaderProtocol {
    fn read_message(&mut self) -> BoxFuture<'_, Result<Bytes>> {
        async move {
            let mut frame = next_frame(&mut self.reader).await?;
            if frame.len() < HEADER_SIZE {
                return Err(Error::Protocol {
                    reason: format!(
                        "header frame of {} bytes is shorter than its {HEADER_SIZE}-byte header",
                        frame.len()
                    ),
                });
            }
            self.pending = Some(frame.get_u32());
            Ok(frame.freeze())
        }
        .boxed()
    }

    fn input_transport(&mut self) -> &mut dyn InputTransport {
        &mut **self.reader.get_mut()
    }
}

impl OutputProtocol for HeaderProtocol {
    fn write_message(&mut self, message: Bytes) -> BoxFuture<'_, Result<()>> {
        async move {
            let sequence = self.pending.take().ok_or_else(|| Error::Protocol {
                reason: "response written with no pending request".to_string(),
            })?;
            let mut frame = BytesMut::with_capacity(HEADER_SIZE + message.len());
            frame.put_u32(sequence);
            frame.put(message);
            self.writer
                .send(frame.freeze())
                .await
                .map_err(Error::from_codec)
        }
        .boxed()
    }

    fn output_transport(&mut self) -> &mut dyn OutputTransport {
        &mut **self.writer.get_mut()
    }
}
