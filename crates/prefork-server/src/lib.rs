//! # `prefork-server`
//!
//! A pre-forking RPC server. One listening socket is bound, worker processes
//! are forked to share it, and each worker serves its connections as
//! cooperative tasks on a single-threaded tokio runtime.
//!
//! ```no_run
//! use prefork_server::{EchoProcessor, PipelineFactories, Server};
//! use std::sync::Arc;
//!
//! let server = Server::new("0.0.0.0:9090", PipelineFactories::default(), Arc::new(EchoProcessor));
//! server.set_worker_count(4)?;
//! server.set_post_fork_hook(|| println!("worker {} ready", std::process::id()))?;
//! let code = server.serve(None)?;
//! std::process::exit(code);
//! # Ok::<(), prefork_core::Error>(())
//! ```

pub mod server;

pub use server::{
    lifecycle::PostForkHook,
    pool::{ProcessSpawner, Server, WorkerHandle},
    service::{
        Acceptor, EchoProcessor, Listener, PipelineBuilder, PipelineFactories,
        ProtocolFactories, SessionHandler,
    },
};
