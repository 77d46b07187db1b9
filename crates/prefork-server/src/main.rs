//! # `prefork-server`
//!
//! Pre-forking echo server.
//!
//! ## Usage
//!
//! ```bash
//! cargo run --bin prefork-server --release -- --num-workers 4
//! ```

use clap::Parser;
use prefork_server::{
    EchoProcessor,
    server::{
        config::{CliArgs, ServerConfig},
        telemetry::init_tracing,
    },
};
use std::sync::Arc;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

// Not `#[tokio::main]`: workers are forked before any runtime exists and each
// builds its own.
fn main() -> anyhow::Result<()> {
    // Load from .env
    let _ = dotenvy::dotenv();
    let args = CliArgs::parse();
    let config = ServerConfig::try_from(args)?;

    init_tracing()?;

    if cfg!(debug_assertions) {
        tracing::info!("Starting prefork server with full config: {:#?}", config);
    } else {
        tracing::info!(
            "Starting prefork server on {} with {} workers",
            config.server_addr,
            config.num_workers
        );
    }

    let server = config.build_server(Arc::new(EchoProcessor))?;
    let code = server.serve(None)?;
    tracing::info!("Service shut down successfully");
    std::process::exit(code);
}
