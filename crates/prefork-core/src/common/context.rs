//! Per-call context handed to the processor.
//!
//! A worker process interleaves many sessions on one thread, so "who is
//! calling" cannot be stored on the shared processor. Each session instead owns
//! a [`CallContext`], passes it explicitly to every
//! [`Processor::process`](crate::Processor::process) call, and scopes it as the
//! current task's context for the duration of that call only. Handler code
//! further down the stack can read it back with [`CallContext::current`]
//! without threading a parameter through.

use std::net::SocketAddr;

tokio::task_local! {
    static CURRENT: CallContext;
}

/// Identity of the connection a request arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallContext {
    peer_addr: SocketAddr,
    worker: usize,
    session: u64,
}

impl CallContext {
    pub const fn new(peer_addr: SocketAddr, worker: usize, session: u64) -> Self {
        Self {
            peer_addr,
            worker,
            session,
        }
    }

    /// Address of the remote peer.
    pub const fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Spawn index of the worker process serving the call. The primary
    /// process is worker 0.
    pub const fn worker(&self) -> usize {
        self.worker
    }

    /// Per-worker sequence number of the session.
    pub const fn session(&self) -> u64 {
        self.session
    }

    /// The context of the call the current task is executing, if any.
    pub fn current() -> Option<Self> {
        CURRENT.try_with(|ctx| *ctx).ok()
    }

    /// Runs `fut` with `self` as the current context.
    pub async fn scope<F>(self, fut: F) -> F::Output
    where
        F: Future,
    {
        CURRENT.scope(self, fut).await
    }
}
