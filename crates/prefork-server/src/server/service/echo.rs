use futures::{FutureExt, future::BoxFuture};
use prefork_core::{CallContext, Processor, ProtocolPair, Result};

/// Processor that answers every request with the request itself.
///
/// Served by the `prefork-server` binary and used as the default workload in
/// tests and benchmarks.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoProcessor;

impl Processor for EchoProcessor {
    fn process<'a>(
        &'a self,
        ctx: &'a CallContext,
        protocols: &'a mut ProtocolPair,
    ) -> BoxFuture<'a, Result<()>> {
        async move {
            let request = protocols.input().read_message().await?;
            tracing::trace!(
                peer_addr = %ctx.peer_addr(),
                session = ctx.session(),
                bytes = request.len(),
                "Echoing request"
            );
            protocols.output().write_message(request).await
        }
        .boxed()
    }
}
