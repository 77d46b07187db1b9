//! Per-connection session loop.
//!
//! A session owns one accepted socket for its whole life. It builds the
//! protocol pair, calls the processor until a call fails, reports the failure
//! unless it was an ordinary disconnect, and closes the input transport and
//! then the output transport.
//!
//! Sessions run as cooperative tasks on the worker's single thread, so a
//! processor that blocks the thread stalls every other session in the worker.

use super::pipeline::PipelineFactories;
use futures::FutureExt;
use portable_atomic::{AtomicUsize, Ordering};
use prefork_core::{CallContext, Error, Processor, Result};
use std::{any::Any, panic::AssertUnwindSafe, sync::Arc};
use tokio::net::TcpStream;

static SESSIONS_INFLIGHT: AtomicUsize = AtomicUsize::new(0);

/// Number of sessions currently running in this process.
pub fn sessions_inflight() -> usize {
    SESSIONS_INFLIGHT.load(Ordering::Relaxed)
}

struct InflightGuard;

impl InflightGuard {
    fn enter() -> Self {
        SESSIONS_INFLIGHT.fetch_add(1, Ordering::Relaxed);
        Self
    }
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        SESSIONS_INFLIGHT.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Everything a worker needs to serve a connection.
///
/// Cloned into every session task; the clones share the factories, the
/// processor and the logger name.
#[derive(Clone)]
pub struct SessionHandler {
    factories: PipelineFactories,
    processor: Arc<dyn Processor>,
    logger: Arc<str>,
}

impl SessionHandler {
    pub fn new(
        factories: PipelineFactories,
        processor: Arc<dyn Processor>,
        logger: impl Into<Arc<str>>,
    ) -> Self {
        Self {
            factories,
            processor,
            logger: logger.into(),
        }
    }

    #[must_use]
    pub fn with_logger(mut self, logger: impl Into<Arc<str>>) -> Self {
        self.logger = logger.into();
        self
    }

    /// Name attached to every error reported by this handler.
    pub fn logger(&self) -> &str {
        &self.logger
    }

    /// Serves `socket` until the processor fails or the peer goes away.
    ///
    /// A transport error ends the session quietly and yields `Ok(())`. Any
    /// other error is logged once with the peer address and returned. The
    /// transports are closed in both cases.
    pub async fn run(&self, socket: TcpStream, ctx: CallContext) -> Result<()> {
        let _inflight = InflightGuard::enter();
        let mut protocols = self.factories.build(socket);

        let err = loop {
            let call = ctx.scope(self.processor.process(&ctx, &mut protocols));
            match AssertUnwindSafe(call).catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => break e,
                Err(panic) => {
                    break Error::Panicked {
                        reason: panic_reason(panic.as_ref()),
                    };
                }
            }
        };

        let result = if err.is_transport() {
            tracing::debug!(peer_addr = %ctx.peer_addr(), "Client disconnected: {err}");
            Ok(())
        } else {
            tracing::error!(
                peer_addr = %ctx.peer_addr(),
                logger = %self.logger,
                "[{err}]"
            );
            Err(err)
        };

        if let Err(e) = protocols.close().await {
            tracing::debug!(peer_addr = %ctx.peer_addr(), "Failed to close transports: {e}");
        }

        result
    }
}

fn panic_reason(panic: &(dyn Any + Send)) -> String {
    if let Some(reason) = panic.downcast_ref::<&str>() {
        (*reason).to_string()
    } else if let Some(reason) = panic.downcast_ref::<String>() {
        reason.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
