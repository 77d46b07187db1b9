//! Worker processes and the seam used to create them.
//!
//! Every worker runs the same entry point: it builds its own current-thread
//! runtime, calls the post-fork hook and accepts on the shared listener until
//! it is interrupted. Worker 0 is the primary process itself; the rest are
//! created through a [`ProcessSpawner`].

use crate::server::{
    lifecycle::PostForkHook,
    service::{Acceptor, SessionHandler},
};
use std::{fmt, io, net::TcpListener};
use tokio::{runtime, task::LocalSet};
use tokio_util::sync::CancellationToken;

/// Handle to a running worker process, held by the primary.
pub trait WorkerHandle: Send + fmt::Debug {
    /// Operating system id of the worker.
    fn id(&self) -> u32;

    /// Asks the worker to exit. Does not wait for it.
    fn terminate(&mut self) -> io::Result<()>;

    /// Collects the worker's exit status if it has exited. Never blocks.
    ///
    /// Returns `true` once the worker is gone.
    fn try_wait(&mut self) -> io::Result<bool>;
}

/// Creates worker processes.
pub trait ProcessSpawner: Send + Sync {
    /// Starts worker `index`.
    ///
    /// In the new worker, `entry` runs to completion and its return value
    /// becomes the process exit code; this call never returns there. In the
    /// caller it returns a handle to the new worker.
    fn spawn(
        &self,
        index: usize,
        entry: &mut dyn FnMut() -> i32,
    ) -> io::Result<Box<dyn WorkerHandle>>;
}

/// A spawned worker tracked by the primary.
#[derive(Debug)]
pub struct Worker {
    pub index: usize,
    pub handle: Box<dyn WorkerHandle>,
}

/// Everything one worker needs to serve, captured before it is spawned.
///
/// A forked worker must not touch the primary's locks, so this is the only
/// state it sees.
pub struct WorkerContext {
    pub index: usize,
    pub listener: TcpListener,
    pub handler: SessionHandler,
    pub post_fork_hook: Option<PostForkHook>,
    pub shutdown: CancellationToken,
}

impl WorkerContext {
    /// Runs the worker to completion and returns its exit code.
    pub fn run(self) -> i32 {
        let runtime = match runtime::Builder::new_current_thread().enable_all().build() {
            Ok(runtime) => runtime,
            Err(e) => {
                tracing::error!(worker = self.index, "Failed to build runtime: {e}");
                return 1;
            }
        };
        let _guard = runtime.enter();

        if let Some(hook) = &self.post_fork_hook {
            hook.call();
        }

        let acceptor =
            match Acceptor::from_std(self.listener, self.handler, self.index, self.shutdown) {
                Ok(acceptor) => acceptor,
                Err(e) => {
                    tracing::error!(worker = self.index, "Failed to adopt listener: {e}");
                    return 1;
                }
            };

        tracing::debug!(worker = self.index, pid = std::process::id(), "Worker started");
        LocalSet::new().block_on(&runtime, acceptor.run_forever())
    }
}

#[cfg(unix)]
pub use self::unix::{ForkSpawner, ProcessHandle};

/// Stand-in spawner for platforms without `fork(2)`.
///
/// Only a single worker can be served; any attempt to spawn more fails.
#[cfg(not(unix))]
#[derive(Debug, Default, Clone, Copy)]
pub struct UnsupportedSpawner;

#[cfg(not(unix))]
impl ProcessSpawner for UnsupportedSpawner {
    fn spawn(
        &self,
        _index: usize,
        _entry: &mut dyn FnMut() -> i32,
    ) -> io::Result<Box<dyn WorkerHandle>> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "worker processes require fork(2)",
        ))
    }
}

#[cfg(unix)]
mod unix {
    use super::{ProcessSpawner, WorkerHandle};
    use nix::{
        errno::Errno,
        sys::{
            signal::{Signal, kill},
            wait::{WaitPidFlag, WaitStatus, waitpid},
        },
        unistd::{ForkResult, Pid, fork},
    };
    use std::{
        io,
        panic::{self, AssertUnwindSafe},
    };

    /// Spawns workers with `fork(2)`.
    ///
    /// The child inherits the listening socket and a copy of the primary's
    /// memory, including the processor.
    #[derive(Debug, Default, Clone, Copy)]
    pub struct ForkSpawner;

    impl ProcessSpawner for ForkSpawner {
        fn spawn(
            &self,
            index: usize,
            entry: &mut dyn FnMut() -> i32,
        ) -> io::Result<Box<dyn WorkerHandle>> {
            // SAFETY: the child only runs `entry`, which builds a fresh
            // runtime and never touches locks held by other threads of the
            // parent, then exits without returning to the caller.
            match unsafe { fork() }? {
                ForkResult::Parent { child } => {
                    tracing::debug!(worker = index, pid = child.as_raw(), "Forked worker");
                    Ok(Box::new(ProcessHandle { pid: child }))
                }
                ForkResult::Child => {
                    let code = panic::catch_unwind(AssertUnwindSafe(entry)).unwrap_or(1);
                    std::process::exit(code);
                }
            }
        }
    }

    /// A forked worker process.
    #[derive(Debug, Clone, Copy)]
    pub struct ProcessHandle {
        pid: Pid,
    }

    impl WorkerHandle for ProcessHandle {
        fn id(&self) -> u32 {
            self.pid.as_raw().unsigned_abs()
        }

        fn terminate(&mut self) -> io::Result<()> {
            match kill(self.pid, Signal::SIGTERM) {
                // Already gone.
                Ok(()) | Err(Errno::ESRCH) => Ok(()),
                Err(e) => Err(e.into()),
            }
        }

        fn try_wait(&mut self) -> io::Result<bool> {
            match waitpid(self.pid, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => Ok(false),
                // Reaped now, or by someone else already.
                Ok(_) | Err(Errno::ECHILD) => Ok(true),
                Err(e) => Err(e.into()),
            }
        }
    }
}
