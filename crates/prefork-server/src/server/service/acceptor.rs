//! Cooperative accept loop run by every worker process.
//!
//! Each accepted connection becomes its own task on the worker's
//! [`LocalSet`](tokio::task::LocalSet), so sessions interleave on one thread
//! and only yield at I/O. An accept failure does not take the worker down: it
//! is logged together with the last peer seen, and accepting restarts after a
//! short delay. The loop ends with exit code 0 when the worker is interrupted
//! or stopped.

use super::session::{SessionHandler, sessions_inflight};
use crate::server::lifecycle::interrupt_signal;
use core::time::Duration;
use prefork_core::CallContext;
use std::{cell::Cell, future::Future, io, net::SocketAddr};
use tokio::{
    net::{TcpListener, TcpStream},
    time::sleep,
};
use tokio_util::sync::CancellationToken;

/// Delay before accepting again after an accept error.
pub const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Source of accepted connections.
pub trait Listener {
    fn accept(&self) -> impl Future<Output = io::Result<(TcpStream, SocketAddr)>>;

    fn local_addr(&self) -> io::Result<SocketAddr>;
}

impl Listener for TcpListener {
    fn accept(&self) -> impl Future<Output = io::Result<(TcpStream, SocketAddr)>> {
        TcpListener::accept(self)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        TcpListener::local_addr(self)
    }
}

/// Accepts connections on a shared listener and serves each on a local task.
///
/// Must run inside a [`LocalSet`](tokio::task::LocalSet).
pub struct Acceptor<L = TcpListener> {
    listener: L,
    handler: SessionHandler,
    worker: usize,
    shutdown: CancellationToken,
    last_peer: Cell<Option<SocketAddr>>,
    sessions: Cell<u64>,
}

impl Acceptor {
    /// Adopts a listener bound before the worker's runtime existed.
    ///
    /// Must be called from within a tokio runtime.
    pub fn from_std(
        listener: std::net::TcpListener,
        handler: SessionHandler,
        worker: usize,
        shutdown: CancellationToken,
    ) -> io::Result<Self> {
        listener.set_nonblocking(true)?;
        let listener = TcpListener::from_std(listener)?;
        Ok(Self::new(listener, handler, worker, shutdown))
    }
}

impl<L: Listener> Acceptor<L> {
    pub fn new(
        listener: L,
        handler: SessionHandler,
        worker: usize,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            listener,
            handler,
            worker,
            shutdown,
            last_peer: Cell::new(None),
            sessions: Cell::new(0),
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Address of the most recently accepted peer.
    pub fn last_peer(&self) -> Option<SocketAddr> {
        self.last_peer.get()
    }

    /// Serves until SIGINT or SIGTERM arrives or the server is stopped.
    ///
    /// Returns the worker's exit code, which is always 0.
    pub async fn run_forever(self) -> i32 {
        match interrupt_signal() {
            Ok(interrupt) => self.run_until(interrupt).await,
            Err(e) => {
                tracing::warn!(
                    worker = self.worker,
                    "Failed to install interrupt handler: {e}"
                );
                self.run_until(std::future::pending()).await
            }
        }
    }

    /// Serves until `stop` completes or the server is stopped.
    pub async fn run_until<F>(self, stop: F) -> i32
    where
        F: Future<Output = ()>,
    {
        let shutdown = self.shutdown.clone();
        let stopped = async move {
            tokio::select! {
                () = shutdown.cancelled() => {}
                () = stop => {}
            }
        };
        tokio::pin!(stopped);

        loop {
            let err = tokio::select! {
                () = &mut stopped => break,
                err = self.accept_loop() => err,
            };

            let last_peer = self
                .last_peer
                .get()
                .map_or_else(|| "none".to_string(), |peer| peer.to_string());
            tracing::error!(
                peer_addr = %last_peer,
                logger = %self.handler.logger(),
                "[{err}]"
            );

            tokio::select! {
                () = &mut stopped => break,
                () = sleep(ACCEPT_RETRY_DELAY) => {}
            }
        }

        tracing::info!(
            worker = self.worker,
            sessions = self.sessions.get(),
            inflight = sessions_inflight(),
            "Worker stopped accepting connections"
        );
        0
    }

    /// Accepts until the listener reports an error.
    async fn accept_loop(&self) -> io::Error {
        loop {
            let (socket, peer) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => return e,
            };
            self.last_peer.set(Some(peer));

            let session = self.sessions.get() + 1;
            self.sessions.set(session);
            let ctx = CallContext::new(peer, self.worker, session);

            tracing::trace!(peer_addr = %peer, session, "Accepted connection");

            let handler = self.handler.clone();
            tokio::task::spawn_local(async move {
                // Failures were already reported by the session.
                let _ = handler.run(socket, ctx).await;
            });
        }
    }
}
