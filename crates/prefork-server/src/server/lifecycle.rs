//! Process lifecycle hooks: the post-fork callback and interrupt handling.

use std::{fmt, future::Future, io, sync::Arc};

/// Callback run once in every worker right after it starts and before it
/// accepts its first connection.
///
/// The primary process runs it too, since it serves as worker 0. Use it to
/// reopen resources that must not be shared across a fork, such as database
/// connections or random number generators.
#[derive(Clone)]
pub struct PostForkHook(Arc<dyn Fn() + Send + Sync>);

impl PostForkHook {
    pub fn new<F>(hook: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        Self(Arc::new(hook))
    }

    pub fn call(&self) {
        (self.0)();
    }
}

impl fmt::Debug for PostForkHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PostForkHook(..)")
    }
}

/// Resolves when the process receives SIGINT or SIGTERM.
///
/// Handlers are installed when this is called, not when the future is first
/// polled, so a signal arriving in between is not lost.
#[cfg(unix)]
pub fn interrupt_signal() -> io::Result<impl Future<Output = ()>> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;

    Ok(async move {
        tokio::select! {
            _ = interrupt.recv() => tracing::info!("Received SIGINT signal"),
            _ = terminate.recv() => tracing::info!("Received SIGTERM signal"),
        }
    })
}

/// Resolves on Ctrl+C.
#[cfg(not(unix))]
pub fn interrupt_signal() -> io::Result<impl Future<Output = ()>> {
    Ok(async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("Received Ctrl+C signal"),
            Err(e) => {
                tracing::warn!("Failed to listen for Ctrl+C: {e}");
                std::future::pending::<()>().await;
            }
        }
    })
}
