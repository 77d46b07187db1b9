//! The pre-forking server and its worker pool.
//!
//! [`Server`] binds one listening socket, spawns `worker_count - 1` worker
//! processes that inherit it, and then serves on the calling thread as
//! worker 0. Every worker accepts from the same socket and the kernel hands
//! each incoming connection to exactly one of them.
//!
//! ## Lifecycle
//!
//! ```text
//! Idle --serve--> Serving --stop / interrupt--> Stopped
//!   \------------------stop---------------------/
//! ```
//!
//! Configuration may only change while idle. A stopped server cannot serve
//! again.

use super::worker::{ProcessSpawner, Worker, WorkerContext};
use crate::server::{
    lifecycle::PostForkHook,
    service::{PipelineFactories, SessionHandler},
};
use parking_lot::Mutex;
use prefork_core::{Error, Processor, Result};
use std::{
    net::{SocketAddr, TcpListener},
    sync::Arc,
    thread,
    time::{Duration, Instant},
};
use tokio_util::sync::CancellationToken;

/// Logger name used when none is configured.
pub const DEFAULT_LOGGER: &str = "prefork";

/// How long [`Server::serve`] waits for terminated workers to exit.
pub const REAP_TIMEOUT: Duration = Duration::from_secs(1);

const REAP_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Serving,
    Stopped,
}

struct Settings {
    worker_count: usize,
    post_fork_hook: Option<PostForkHook>,
    state: State,
    workers: Vec<Worker>,
    terminated: Vec<Worker>,
    local_addr: Option<SocketAddr>,
}

/// A pre-forking RPC server.
///
/// Share it behind an [`Arc`] to call [`stop`](Self::stop) from another
/// thread while [`serve`](Self::serve) blocks.
pub struct Server {
    addr: String,
    handler: SessionHandler,
    spawner: Box<dyn ProcessSpawner>,
    shutdown: CancellationToken,
    settings: Mutex<Settings>,
}

impl Server {
    /// Creates an idle server that will listen on `addr` unless
    /// [`serve`](Self::serve) is given a listener.
    ///
    /// The worker count defaults to the number of CPUs.
    pub fn new(
        addr: impl Into<String>,
        factories: PipelineFactories,
        processor: Arc<dyn Processor>,
    ) -> Self {
        Self {
            addr: addr.into(),
            handler: SessionHandler::new(factories, processor, DEFAULT_LOGGER),
            spawner: default_spawner(),
            shutdown: CancellationToken::new(),
            settings: Mutex::new(Settings {
                worker_count: num_cpus::get().max(1),
                post_fork_hook: None,
                state: State::Idle,
                workers: Vec::new(),
                terminated: Vec::new(),
                local_addr: None,
            }),
        }
    }

    /// Names the logger attached to every reported error.
    #[must_use]
    pub fn with_logger(mut self, logger: impl Into<Arc<str>>) -> Self {
        self.handler = self.handler.with_logger(logger);
        self
    }

    /// Replaces the mechanism used to create worker processes.
    #[must_use]
    pub fn with_spawner<S>(mut self, spawner: S) -> Self
    where
        S: ProcessSpawner + 'static,
    {
        self.spawner = Box::new(spawner);
        self
    }

    /// Sets how many processes serve, including the primary.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if `count` is zero or the server is
    /// no longer idle.
    pub fn set_worker_count(&self, count: usize) -> Result<()> {
        if count == 0 {
            return Err(Error::configuration("worker count must be at least 1"));
        }
        let mut settings = self.settings.lock();
        ensure_idle(settings.state, "worker count")?;
        settings.worker_count = count;
        Ok(())
    }

    /// Sets the callback every worker runs before accepting connections.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if the server is no longer idle.
    pub fn set_post_fork_hook<F>(&self, hook: F) -> Result<()>
    where
        F: Fn() + Send + Sync + 'static,
    {
        let mut settings = self.settings.lock();
        ensure_idle(settings.state, "post-fork hook")?;
        settings.post_fork_hook = Some(PostForkHook::new(hook));
        Ok(())
    }

    pub fn worker_count(&self) -> usize {
        self.settings.lock().worker_count
    }

    pub fn is_serving(&self) -> bool {
        self.settings.lock().state == State::Serving
    }

    /// Address the server is listening on, once serving.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.settings.lock().local_addr
    }

    /// Process ids of the spawned workers, excluding the primary.
    pub fn worker_ids(&self) -> Vec<u32> {
        self.settings
            .lock()
            .workers
            .iter()
            .map(|worker| worker.handle.id())
            .collect()
    }

    /// Starts the pool and serves on the calling thread as worker 0.
    ///
    /// Binds the configured address when `listener` is `None`. Blocks until
    /// the primary is interrupted or [`stop`](Self::stop) is called, then
    /// returns the primary's exit code. Must not be called from within an
    /// async runtime.
    ///
    /// # Errors
    ///
    /// - [`Error::ServiceShutdown`] if the server was stopped.
    /// - [`Error::Configuration`] if the server is already serving.
    /// - [`Error::Listen`] if the address cannot be bound.
    /// - [`Error::Spawn`] if a worker cannot be created. Workers spawned
    ///   before the failure are terminated.
    pub fn serve(&self, listener: Option<TcpListener>) -> Result<i32> {
        let (worker_count, post_fork_hook) = {
            let mut settings = self.settings.lock();
            match settings.state {
                State::Stopped => return Err(Error::ServiceShutdown),
                State::Serving => return Err(Error::configuration("server is already serving")),
                State::Idle => settings.state = State::Serving,
            }
            (settings.worker_count, settings.post_fork_hook.clone())
        };

        let listener = match self.listener(listener) {
            Ok(listener) => listener,
            Err(e) => {
                self.settings.lock().state = State::Idle;
                return Err(e);
            }
        };

        tracing::info!("Starting {worker_count} workers");

        for index in 1..worker_count {
            if self.shutdown.is_cancelled() {
                break;
            }
            if let Err(e) = self.spawn_worker(index, &listener, post_fork_hook.clone()) {
                self.abort_spawn();
                self.reap_workers();
                return Err(e);
            }
        }

        let code = WorkerContext {
            index: 0,
            listener,
            handler: self.handler.clone(),
            post_fork_hook,
            shutdown: self.shutdown.clone(),
        }
        .run();

        // The primary is done serving; take the rest of the pool down with it.
        self.stop();
        self.reap_workers();
        Ok(code)
    }

    /// Terminates every spawned worker and makes the primary return from
    /// [`serve`](Self::serve).
    ///
    /// Does not wait for workers to exit; [`serve`](Self::serve) reaps them
    /// before it returns. Calling it again, or before serving, only marks the
    /// server stopped. Must be called from the primary process.
    pub fn stop(&self) {
        let workers = {
            let mut settings = self.settings.lock();
            settings.state = State::Stopped;
            std::mem::take(&mut settings.workers)
        };
        self.terminate(workers);
        self.shutdown.cancel();
    }

    fn terminate(&self, workers: Vec<Worker>) {
        let mut terminated = Vec::with_capacity(workers.len());
        for mut worker in workers {
            if let Err(e) = worker.handle.terminate() {
                tracing::warn!(
                    worker = worker.index,
                    pid = worker.handle.id(),
                    "Failed to terminate worker: {e}"
                );
            }
            terminated.push(worker);
        }
        self.settings.lock().terminated.extend(terminated);
    }

    /// Polls terminated workers until they have all exited or
    /// [`REAP_TIMEOUT`] passes.
    fn reap_workers(&self) {
        let mut pending = std::mem::take(&mut self.settings.lock().terminated);
        let deadline = Instant::now() + REAP_TIMEOUT;

        loop {
            pending.retain_mut(|worker| match worker.handle.try_wait() {
                Ok(exited) => !exited,
                Err(e) => {
                    tracing::warn!(worker = worker.index, "Failed to reap worker: {e}");
                    false
                }
            });
            if pending.is_empty() || Instant::now() >= deadline {
                break;
            }
            thread::sleep(REAP_INTERVAL);
        }

        for worker in pending {
            tracing::warn!(
                worker = worker.index,
                pid = worker.handle.id(),
                "Worker did not exit after termination"
            );
        }
    }

    fn listener(&self, listener: Option<TcpListener>) -> Result<TcpListener> {
        let listener = match listener {
            Some(listener) => listener,
            None => TcpListener::bind(&self.addr).map_err(|source| Error::Listen {
                addr: self.addr.clone(),
                source,
            })?,
        };
        let local_addr = listener.local_addr()?;
        self.settings.lock().local_addr = Some(local_addr);
        tracing::info!(addr = %local_addr, "Listening");
        Ok(listener)
    }

    fn spawn_worker(
        &self,
        index: usize,
        listener: &TcpListener,
        post_fork_hook: Option<PostForkHook>,
    ) -> Result<()> {
        let spawn_error = |source| Error::Spawn { index, source };
        let mut context = Some(WorkerContext {
            index,
            listener: listener.try_clone().map_err(spawn_error)?,
            handler: self.handler.clone(),
            post_fork_hook,
            shutdown: self.shutdown.clone(),
        });
        let mut entry = move || context.take().map_or(1, WorkerContext::run);

        let handle = self
            .spawner
            .spawn(index, &mut entry)
            .map_err(spawn_error)?;

        let mut settings = self.settings.lock();
        if settings.state == State::Stopped {
            // Stopped while this worker was being created.
            drop(settings);
            self.terminate(vec![Worker { index, handle }]);
            return Ok(());
        }
        settings.workers.push(Worker { index, handle });
        Ok(())
    }

    fn abort_spawn(&self) {
        let workers = {
            let mut settings = self.settings.lock();
            settings.state = State::Idle;
            std::mem::take(&mut settings.workers)
        };
        self.terminate(workers);
    }
}

fn ensure_idle(state: State, what: &str) -> Result<()> {
    match state {
        State::Idle => Ok(()),
        State::Serving | State::Stopped => Err(Error::configuration(format!(
            "cannot change the {what} once the server has started"
        ))),
    }
}

#[cfg(unix)]
fn default_spawner() -> Box<dyn ProcessSpawner> {
    Box::new(super::worker::ForkSpawner)
}

#[cfg(not(unix))]
fn default_spawner() -> Box<dyn ProcessSpawner> {
    Box::new(super::worker::UnsupportedSpawner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::{pool::WorkerHandle, service::EchoProcessor, testing::CapturedEvents};
    use std::io;

    #[derive(Debug)]
    struct FakeHandle {
        id: u32,
        terminated: Arc<Mutex<Vec<u32>>>,
        reaped: Arc<Mutex<Vec<u32>>>,
    }

    impl WorkerHandle for FakeHandle {
        fn id(&self) -> u32 {
            self.id
        }

        fn terminate(&mut self) -> io::Result<()> {
            self.terminated.lock().push(self.id);
            Ok(())
        }

        fn try_wait(&mut self) -> io::Result<bool> {
            // Exits on the second poll after termination.
            let polls = self.reaped.lock().iter().filter(|id| **id == self.id).count();
            self.reaped.lock().push(self.id);
            Ok(polls >= 1)
        }
    }

    /// Records spawns without creating processes. Fails at `fail_at`.
    #[derive(Clone, Default)]
    struct FakeSpawner {
        spawned: Arc<Mutex<Vec<usize>>>,
        terminated: Arc<Mutex<Vec<u32>>>,
        reaped: Arc<Mutex<Vec<u32>>>,
        fail_at: Option<usize>,
    }

    impl ProcessSpawner for FakeSpawner {
        fn spawn(
            &self,
            index: usize,
            _entry: &mut dyn FnMut() -> i32,
        ) -> io::Result<Box<dyn WorkerHandle>> {
            if self.fail_at == Some(index) {
                return Err(io::Error::other("out of processes"));
            }
            self.spawned.lock().push(index);
            Ok(Box::new(FakeHandle {
                id: 1000 + index as u32,
                terminated: self.terminated.clone(),
                reaped: self.reaped.clone(),
            }))
        }
    }

    fn server(spawner: FakeSpawner) -> Arc<Server> {
        Arc::new(
            Server::new(
                "127.0.0.1:0",
                PipelineFactories::default(),
                Arc::new(EchoProcessor),
            )
            .with_spawner(spawner),
        )
    }

    fn wait_until(cond: impl Fn() -> bool) {
        while !cond() {
            thread::sleep(Duration::from_millis(5));
        }
    }

    /// Serves on a background thread and waits until the primary listens.
    fn serve_in_background(
        server: &Arc<Server>,
        events: &CapturedEvents,
    ) -> thread::JoinHandle<Result<i32>> {
        let handle = thread::spawn({
            let server = server.clone();
            let events = events.clone();
            move || {
                let _guard = events.set_default();
                server.serve(None)
            }
        });
        wait_until(|| server.local_addr().is_some());
        handle
    }

    #[test]
    fn default_worker_count_is_cpu_count() {
        let server = server(FakeSpawner::default());
        assert_eq!(server.worker_count(), num_cpus::get());
    }

    #[test]
    fn zero_workers_is_rejected() {
        let server = server(FakeSpawner::default());
        assert!(matches!(
            server.set_worker_count(0),
            Err(Error::Configuration { .. })
        ));
        assert_eq!(server.worker_count(), num_cpus::get());
    }

    #[test]
    fn spawns_all_but_the_primary_then_stops() {
        let spawner = FakeSpawner::default();
        let server = server(spawner.clone());
        server.set_worker_count(3).expect("idle server");

        let events = CapturedEvents::default();
        let handle = serve_in_background(&server, &events);
        wait_until(|| server.worker_ids().len() == 2);

        assert!(server.is_serving());
        assert_eq!(*spawner.spawned.lock(), vec![1, 2]);
        assert_eq!(server.worker_ids(), vec![1001, 1002]);

        assert!(matches!(
            server.set_worker_count(5),
            Err(Error::Configuration { .. })
        ));
        assert!(matches!(
            server.set_post_fork_hook(|| {}),
            Err(Error::Configuration { .. })
        ));

        server.stop();
        assert_eq!(handle.join().expect("serve thread").expect("serve"), 0);
        assert_eq!(*spawner.terminated.lock(), vec![1001, 1002]);
        // Each worker is polled until it has exited.
        assert_eq!(*spawner.reaped.lock(), vec![1001, 1002, 1001, 1002]);
        assert!(server.worker_ids().is_empty());
        assert!(!server.is_serving());
        assert!(
            events
                .messages()
                .iter()
                .any(|message| message == "Starting 3 workers")
        );
    }

    #[test]
    fn primary_runs_the_post_fork_hook() {
        let server = server(FakeSpawner::default());
        server.set_worker_count(1).expect("idle server");
        let calls = Arc::new(Mutex::new(0_usize));
        server
            .set_post_fork_hook({
                let calls = calls.clone();
                move || *calls.lock() += 1
            })
            .expect("idle server");

        let handle = serve_in_background(&server, &CapturedEvents::default());
        server.stop();
        assert_eq!(handle.join().expect("serve thread").expect("serve"), 0);
        assert_eq!(*calls.lock(), 1);
    }

    #[test]
    fn spawn_failure_terminates_started_workers() {
        let spawner = FakeSpawner {
            fail_at: Some(2),
            ..FakeSpawner::default()
        };
        let server = server(spawner.clone());
        server.set_worker_count(4).expect("idle server");

        let err = server.serve(None).unwrap_err();
        assert!(matches!(err, Error::Spawn { index: 2, .. }));
        assert_eq!(*spawner.spawned.lock(), vec![1]);
        assert_eq!(*spawner.terminated.lock(), vec![1001]);
        assert_eq!(*spawner.reaped.lock(), vec![1001, 1001]);
        assert!(!server.is_serving());
    }

    #[test]
    fn serve_after_stop_is_rejected() {
        let server = server(FakeSpawner::default());
        server.stop();
        assert!(matches!(server.serve(None), Err(Error::ServiceShutdown)));
        // Stopping twice is harmless.
        server.stop();
    }

    #[test]
    fn bind_failure_is_a_listen_error() {
        let server = Server::new(
            "127.0.0.1:99999",
            PipelineFactories::default(),
            Arc::new(EchoProcessor),
        )
        .with_spawner(FakeSpawner::default());

        assert!(matches!(server.serve(None), Err(Error::Listen { .. })));
        assert!(!server.is_serving());
    }
}
