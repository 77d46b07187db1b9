use crate::server::{
    pool::Server,
    service::{PipelineBuilder, PipelineFactories},
};
use anyhow::bail;
use clap::{Parser, ValueEnum};
use prefork_core::{
    BufferedTransportFactory, FramedProtocolFactory, HeaderProtocolFactory, Processor,
    SocketTransportFactory, protocol::DEFAULT_MAX_FRAME_LENGTH, transport::DEFAULT_BUFFER_SIZE,
};
use std::sync::Arc;

/// How each half of an accepted socket is wrapped.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// Raw socket halves.
    Socket,
    /// Buffered socket halves.
    Buffered,
}

/// How messages are framed on the wire.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolKind {
    /// Length-prefixed frames with separate input and output protocols.
    Framed,
    /// Length-prefixed frames carrying a sequence id, one protocol for both
    /// directions.
    Header,
}

/// Runtime configuration for the `prefork-server` binary.
///
/// All values are parsed from CLI arguments or environment variables.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "prefork-server",
    version,
    about = "A pre-forking RPC server that echoes every request"
)]
pub struct CliArgs {
    /// Address to listen on.
    ///
    /// Environment variable: `SERVER_ADDR`
    #[arg(long, env = "SERVER_ADDR", default_value_t = String::from("0.0.0.0:9090"))]
    pub server_addr: String,

    /// Number of processes serving connections, including the primary.
    ///
    /// Defaults to the number of CPUs.
    ///
    /// Environment variable: `NUM_WORKERS`
    #[arg(long, env = "NUM_WORKERS")]
    pub num_workers: Option<usize>,

    /// Logger name attached to every reported error.
    ///
    /// Environment variable: `LOGGER_NAME`
    #[arg(long, env = "LOGGER_NAME", default_value_t = String::from("prefork"))]
    pub logger_name: String,

    /// Transport wrapping each socket half.
    ///
    /// Environment variable: `TRANSPORT`
    #[arg(long, env = "TRANSPORT", value_enum, default_value_t = TransportKind::Socket)]
    pub transport: TransportKind,

    /// Message framing.
    ///
    /// Environment variable: `PROTOCOL`
    #[arg(long, env = "PROTOCOL", value_enum, default_value_t = ProtocolKind::Framed)]
    pub protocol: ProtocolKind,

    /// Largest accepted frame, in bytes.
    ///
    /// Environment variable: `MAX_FRAME_LENGTH`
    #[arg(long, env = "MAX_FRAME_LENGTH", default_value_t = DEFAULT_MAX_FRAME_LENGTH)]
    pub max_frame_length: usize,

    /// Buffer capacity of the buffered transport, in bytes.
    ///
    /// Environment variable: `BUFFER_SIZE`
    #[arg(long, env = "BUFFER_SIZE", default_value_t = DEFAULT_BUFFER_SIZE)]
    pub buffer_size: usize,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub server_addr: String,
    pub num_workers: usize,
    pub logger_name: String,
    pub transport: TransportKind,
    pub protocol: ProtocolKind,
    pub max_frame_length: usize,
    pub buffer_size: usize,
}

impl TryFrom<CliArgs> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        let num_workers = args.num_workers.unwrap_or_else(num_cpus::get);

        if num_workers == 0 {
            bail!("NUM_WORKERS must be greater than 0");
        }

        if args.max_frame_length == 0 {
            bail!("MAX_FRAME_LENGTH must be greater than 0");
        }

        if args.transport == TransportKind::Buffered && args.buffer_size == 0 {
            bail!("BUFFER_SIZE must be greater than 0");
        }

        if args.logger_name.trim().is_empty() {
            bail!("LOGGER_NAME must not be empty");
        }

        Ok(Self {
            server_addr: args.server_addr,
            num_workers,
            logger_name: args.logger_name,
            transport: args.transport,
            protocol: args.protocol,
            max_frame_length: args.max_frame_length,
            buffer_size: args.buffer_size,
        })
    }
}

impl ServerConfig {
    /// Transport and protocol factories selected by this configuration.
    pub fn pipeline(&self) -> PipelineFactories {
        let builder = match self.transport {
            TransportKind::Socket => PipelineBuilder::default().transport(SocketTransportFactory),
            TransportKind::Buffered => PipelineBuilder::default()
                .transport(BufferedTransportFactory::new(self.buffer_size)),
        };

        match self.protocol {
            ProtocolKind::Framed => builder
                .protocol(FramedProtocolFactory::new(self.max_frame_length))
                .build(),
            ProtocolKind::Header => builder
                .unified_protocol(HeaderProtocolFactory::new(self.max_frame_length))
                .build(),
        }
    }

    /// Builds an idle server serving `processor` with this configuration.
    pub fn build_server(&self, processor: Arc<dyn Processor>) -> anyhow::Result<Server> {
        let server = Server::new(self.server_addr.clone(), self.pipeline(), processor)
            .with_logger(self.logger_name.as_str());
        server.set_worker_count(self.num_workers)?;
        Ok(server)
    }
}
