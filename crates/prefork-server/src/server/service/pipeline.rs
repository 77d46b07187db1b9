//! Turns an accepted socket into the protocol pair a processor works on.
//!
//! The socket is split into a read half and a write half. The configured
//! transport factories wrap each half, then the protocol factories wrap the
//! transports. A unified protocol produces one instance that serves as both
//! the input and the output protocol; two independent instances over the same
//! framed channel would each track only half of the exchange.

use prefork_core::{
    DuplexProtocolFactory, FramedProtocolFactory, InputProtocolFactory, InputTransportFactory,
    OutputProtocolFactory, OutputTransportFactory, ProtocolPair, SocketTransportFactory,
};
use std::sync::Arc;
use tokio::net::TcpStream;

/// How the protocols of a connection are constructed.
#[derive(Clone)]
pub enum ProtocolFactories {
    /// Independent input and output protocols.
    Split {
        input: Arc<dyn InputProtocolFactory>,
        output: Arc<dyn OutputProtocolFactory>,
    },
    /// One protocol instance for both directions.
    Unified(Arc<dyn DuplexProtocolFactory>),
}

/// Transport and protocol factories applied to every accepted socket.
#[derive(Clone)]
pub struct PipelineFactories {
    input_transport: Arc<dyn InputTransportFactory>,
    output_transport: Arc<dyn OutputTransportFactory>,
    protocols: ProtocolFactories,
}

impl PipelineFactories {
    /// Uses the same factory for both directions of a split protocol.
    pub fn new<T, P>(transport: T, protocol: P) -> Self
    where
        T: InputTransportFactory + OutputTransportFactory,
        P: InputProtocolFactory + OutputProtocolFactory,
    {
        let transport = Arc::new(transport);
        let protocol = Arc::new(protocol);
        Self {
            input_transport: transport.clone(),
            output_transport: transport,
            protocols: ProtocolFactories::Split {
                input: protocol.clone(),
                output: protocol,
            },
        }
    }

    /// Uses `transport` for both directions and a unified protocol.
    pub fn unified<T, P>(transport: T, protocol: P) -> Self
    where
        T: InputTransportFactory + OutputTransportFactory,
        P: DuplexProtocolFactory,
    {
        let transport = Arc::new(transport);
        Self {
            input_transport: transport.clone(),
            output_transport: transport,
            protocols: ProtocolFactories::Unified(Arc::new(protocol)),
        }
    }

    /// Fully explicit construction.
    pub fn from_parts(
        input_transport: Arc<dyn InputTransportFactory>,
        output_transport: Arc<dyn OutputTransportFactory>,
        protocols: ProtocolFactories,
    ) -> Self {
        Self {
            input_transport,
            output_transport,
            protocols,
        }
    }

    pub const fn is_unified(&self) -> bool {
        matches!(self.protocols, ProtocolFactories::Unified(_))
    }

    /// Wraps `socket` into the connection's protocol pair.
    pub fn build(&self, socket: TcpStream) -> ProtocolPair {
        let (read, write) = socket.into_split();
        let input = self.input_transport.input_transport(read);
        let output = self.output_transport.output_transport(write);

        match &self.protocols {
            ProtocolFactories::Split {
                input: input_protocol,
                output: output_protocol,
            } => ProtocolPair::split(
                input_protocol.input_protocol(input),
                output_protocol.output_protocol(output),
            ),
            ProtocolFactories::Unified(duplex) => {
                ProtocolPair::unified(duplex.duplex_protocol(input, output))
            }
        }
    }
}

impl Default for PipelineFactories {
    fn default() -> Self {
        Self::new(SocketTransportFactory, FramedProtocolFactory::default())
    }
}

/// Builder for [`PipelineFactories`].
///
/// A factory given with [`transport`](Self::transport) or
/// [`protocol`](Self::protocol) serves the input side and, unless an explicit
/// output factory is set, the output side as well.
#[derive(Default)]
pub struct PipelineBuilder {
    transport: Option<(Arc<dyn InputTransportFactory>, Arc<dyn OutputTransportFactory>)>,
    output_transport: Option<Arc<dyn OutputTransportFactory>>,
    protocol: Option<(Arc<dyn InputProtocolFactory>, Arc<dyn OutputProtocolFactory>)>,
    output_protocol: Option<Arc<dyn OutputProtocolFactory>>,
    unified_protocol: Option<Arc<dyn DuplexProtocolFactory>>,
}

impl PipelineBuilder {
    #[must_use]
    pub fn transport<T>(mut self, factory: T) -> Self
    where
        T: InputTransportFactory + OutputTransportFactory,
    {
        let factory = Arc::new(factory);
        let input: Arc<dyn InputTransportFactory> = factory.clone();
        let output: Arc<dyn OutputTransportFactory> = factory;
        self.transport = Some((input, output));
        self
    }

    #[must_use]
    pub fn output_transport(mut self, factory: Arc<dyn OutputTransportFactory>) -> Self {
        self.output_transport = Some(factory);
        self
    }

    #[must_use]
    pub fn protocol<P>(mut self, factory: P) -> Self
    where
        P: InputProtocolFactory + OutputProtocolFactory,
    {
        let factory = Arc::new(factory);
        let input: Arc<dyn InputProtocolFactory> = factory.clone();
        let output: Arc<dyn OutputProtocolFactory> = factory;
        self.protocol = Some((input, output));
        self
    }

    #[must_use]
    pub fn output_protocol(mut self, factory: Arc<dyn OutputProtocolFactory>) -> Self {
        self.output_protocol = Some(factory);
        self
    }

    /// Selects a unified protocol. Takes precedence over split protocols.
    #[must_use]
    pub fn unified_protocol<P>(mut self, factory: P) -> Self
    where
        P: DuplexProtocolFactory,
    {
        self.unified_protocol = Some(Arc::new(factory));
        self
    }

    /// Resolves unset factories to raw socket transports and length-prefixed
    /// frames.
    pub fn build(self) -> PipelineFactories {
        let (input_transport, output_transport) = match self.transport {
            Some(transport) => transport,
            None => (
                Arc::new(SocketTransportFactory) as Arc<dyn InputTransportFactory>,
                Arc::new(SocketTransportFactory) as Arc<dyn OutputTransportFactory>,
            ),
        };
        let output_transport = self.output_transport.unwrap_or(output_transport);

        let protocols = match self.unified_protocol {
            Some(duplex) => ProtocolFactories::Unified(duplex),
            None => {
                let (input, output) = match self.protocol {
                    Some(protocol) => protocol,
                    None => (
                        Arc::new(FramedProtocolFactory::default()) as Arc<dyn InputProtocolFactory>,
                        Arc::new(FramedProtocolFactory::default())
                            as Arc<dyn OutputProtocolFactory>,
                    ),
                };
                ProtocolFactories::Split {
                    input,
                    output: self.output_protocol.unwrap_or(output),
                }
            }
        };

        PipelineFactories::from_parts(input_transport, output_transport, protocols)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::{Buf, BufMut, Bytes, BytesMut};
    use futures::{SinkExt, StreamExt};
    use portable_atomic::{AtomicUsize, Ordering};
    use prefork_core::{
        BufferedTransportFactory, HeaderProtocolFactory, InputProtocol, InputTransport,
        OutputProtocol, OutputTransport, Result,
    };
    use tokio::net::{
        TcpListener,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    };
    use tokio_util::codec::{Framed, LengthDelimitedCodec};

    async fn accept_one() -> Result<(TcpStream, Framed<TcpStream, LengthDelimitedCodec>)> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let client = TcpStream::connect(listener.local_addr()?).await?;
        let (server, _) = listener.accept().await?;
        Ok((server, Framed::new(client, LengthDelimitedCodec::new())))
    }

    #[derive(Clone, Default)]
    struct CountingTransport {
        inputs: Arc<AtomicUsize>,
        outputs: Arc<AtomicUsize>,
    }

    impl InputTransportFactory for CountingTransport {
        fn input_transport(&self, read: OwnedReadHalf) -> Box<dyn InputTransport> {
            self.inputs.fetch_add(1, Ordering::SeqCst);
            Box::new(read)
        }
    }

    impl OutputTransportFactory for CountingTransport {
        fn output_transport(&self, write: OwnedWriteHalf) -> Box<dyn OutputTransport> {
            self.outputs.fetch_add(1, Ordering::SeqCst);
            Box::new(write)
        }
    }

    #[tokio::test]
    async fn split_pipeline_builds_independent_protocols() -> Result<()> {
        let factories = PipelineFactories::default();
        assert!(!factories.is_unified());

        let (server, mut client) = accept_one().await?;
        let mut pair = factories.build(server);
        assert!(!pair.is_unified());

        client.send(Bytes::from_static(b"hello")).await?;
        let request = pair.input().read_message().await?;
        pair.output().write_message(request).await?;
        let response = client.next().await.expect("response")?;
        assert_eq!(&response[..], b"hello");
        Ok(())
    }

    #[tokio::test]
    async fn unified_pipeline_shares_one_protocol_instance() -> Result<()> {
        let factories = PipelineBuilder::default()
            .transport(BufferedTransportFactory::default())
            .unified_protocol(HeaderProtocolFactory::default())
            .build();
        assert!(factories.is_unified());

        let (server, mut client) = accept_one().await?;
        let mut pair = factories.build(server);
        assert!(pair.is_unified());

        let input = pair.input() as *mut dyn InputProtocol as *mut ();
        let output = pair.output() as *mut dyn OutputProtocol as *mut ();
        assert_eq!(input, output);

        let mut request = BytesMut::new();
        request.put_u32(7);
        request.put_slice(b"req");
        client.send(request.freeze()).await?;

        pair.input().read_message().await?;
        pair.output()
            .write_message(Bytes::from_static(b"resp"))
            .await?;

        let mut response = client.next().await.expect("response")?;
        assert_eq!(response.get_u32(), 7);
        assert_eq!(&response[..], b"resp");
        Ok(())
    }

    #[test]
    fn unified_constructor_selects_a_duplex_protocol() {
        let factories =
            PipelineFactories::unified(SocketTransportFactory, HeaderProtocolFactory::default());
        assert!(factories.is_unified());
        assert!(!PipelineBuilder::default().build().is_unified());
    }

    #[tokio::test]
    async fn output_side_defaults_to_input_factory() -> Result<()> {
        let shared = CountingTransport::default();
        let factories = PipelineBuilder::default().transport(shared.clone()).build();

        let (server, _client) = accept_one().await?;
        factories.build(server);
        assert_eq!(shared.inputs.load(Ordering::SeqCst), 1);
        assert_eq!(shared.outputs.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[tokio::test]
    async fn explicit_output_factory_overrides_shared_one() -> Result<()> {
        let shared = CountingTransport::default();
        let output = CountingTransport::default();
        let factories = PipelineBuilder::default()
            .transport(shared.clone())
            .output_transport(Arc::new(output.clone()))
            .build();

        let (server, _client) = accept_one().await?;
        factories.build(server);
        assert_eq!(shared.inputs.load(Ordering::SeqCst), 1);
        assert_eq!(shared.outputs.load(Ordering::SeqCst), 0);
        assert_eq!(output.outputs.load(Ordering::SeqCst), 1);
        Ok(())
    }
}
