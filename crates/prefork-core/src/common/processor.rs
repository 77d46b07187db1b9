use crate::{CallContext, ProtocolPair, Result};
use futures::future::BoxFuture;

/// Application dispatch object driven by the session loop.
///
/// One call to [`process`](Self::process) performs exactly one unit of work:
/// read a request from `protocols.input()`, handle it, and write the response
/// to `protocols.output()`. The session loop calls it repeatedly until it
/// fails.
///
/// Returning [`Error::Transport`](crate::Error::Transport) means the peer went
/// away and ends the session silently. Any other error ends the session and is
/// logged with the peer address.
///
/// A single processor instance is shared by every session in a worker, and
/// every worker process holds its own copy after fork. Any state that must be
/// shared across workers is the integrator's responsibility.
pub trait Processor: Send + Sync + 'static {
    fn process<'a>(
        &'a self,
        ctx: &'a CallContext,
        protocols: &'a mut ProtocolPair,
    ) -> BoxFuture<'a, Result<()>>;
}
