//! The set of workers behind the process's acceptors.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::config::WorkerConfig;
use crate::lifecycle::shutdown::ConnectionHandler;
use crate::net::listener::{Acceptor, ConnectionDispatch};
use crate::observability::logging::LogReopener;
use crate::tls::key::TicketKeySet;
use crate::tls::manager::KeySetSink;
use crate::worker::handle::{Worker, WorkerCommand, WorkerError, WorkerHandle};
use crate::worker::service::ConnectionService;

/// Hands accepted connections to workers in turn.
pub struct RoundRobinDispatch {
    workers: Arc<Vec<WorkerHandle>>,
    counter: AtomicUsize,
}

impl RoundRobinDispatch {
    fn new(workers: Arc<Vec<WorkerHandle>>) -> Self {
        Self {
            workers,
            counter: AtomicUsize::new(0),
        }
    }
}

impl ConnectionDispatch for RoundRobinDispatch {
    fn dispatch(&self, stream: std::net::TcpStream, peer: SocketAddr) {
        if self.workers.is_empty() {
            return;
        }
        let index = self.counter.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        self.workers[index].dispatch(stream, peer);
    }
}

/// Acceptors plus workers; the concrete `ConnectionHandler`.
pub struct WorkerPool {
    acceptors: Mutex<Vec<Acceptor>>,
    workers: Arc<Vec<WorkerHandle>>,
    dispatch: Arc<RoundRobinDispatch>,
}

impl WorkerPool {
    /// Start the workers, then begin accepting on `acceptors`.
    ///
    /// One worker runs inline on the current runtime; more run on their own
    /// threads.
    pub fn start(
        mut acceptors: Vec<Acceptor>,
        config: &WorkerConfig,
        service: Arc<dyn ConnectionService>,
        logs: Arc<dyn LogReopener>,
        initial_keys: Option<Arc<TicketKeySet>>,
    ) -> Result<Arc<Self>, WorkerError> {
        let num_workers = config.num_workers.max(1);
        let mut workers = Vec::with_capacity(num_workers);

        if num_workers == 1 {
            let worker = Worker::new(0, service, logs, initial_keys);
            workers.push(WorkerHandle::spawn_inline(worker));
        } else {
            for index in 0..num_workers {
                let worker = Worker::new(index, service.clone(), logs.clone(), initial_keys.clone());
                workers.push(WorkerHandle::spawn_thread(worker)?);
            }
        }
        tracing::info!(workers = num_workers, "Workers started");

        let workers = Arc::new(workers);
        let dispatch = Arc::new(RoundRobinDispatch::new(workers.clone()));
        for acceptor in &mut acceptors {
            acceptor.enable(dispatch.clone())?;
        }

        Ok(Arc::new(Self {
            acceptors: Mutex::new(acceptors),
            workers,
            dispatch,
        }))
    }

    pub fn workers(&self) -> &[WorkerHandle] {
        &self.workers
    }

    fn broadcast(&self, command: impl Fn() -> WorkerCommand) {
        for worker in self.workers.iter() {
            worker.send(command());
        }
    }
}

impl KeySetSink for WorkerPool {
    fn set_ticket_keys_to_workers(&self, keys: Option<Arc<TicketKeySet>>) {
        self.broadcast(|| WorkerCommand::SetTicketKeys(keys.clone()));
    }
}

impl ConnectionHandler for WorkerPool {
    fn disable_acceptors(&self) {
        for acceptor in self.acceptors.lock().expect("acceptor mutex poisoned").iter_mut() {
            acceptor.disable();
        }
    }

    fn accept_pending_connections(&self) {
        for acceptor in self.acceptors.lock().expect("acceptor mutex poisoned").iter_mut() {
            acceptor.accept_pending(self.dispatch.as_ref());
        }
    }

    fn graceful_shutdown_workers(&self) {
        self.broadcast(|| WorkerCommand::GracefulShutdown);
    }

    fn worker_reopen_log_files(&self) {
        self.broadcast(|| WorkerCommand::ReopenLog);
    }

    fn single_worker_connections(&self) -> u64 {
        match self.workers.as_slice() {
            [only] if only.is_inline() => only.open_connections(),
            _ => 0,
        }
    }

    fn join_workers(&self) {
        for worker in self.workers.iter() {
            worker.join();
        }
        tracing::info!("Workers joined");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use std::io::Read;

    use futures_util::future::BoxFuture;
    use tokio::io::AsyncWriteExt;

    use crate::lifecycle::shutdown::{LoopControl, ShutdownCoordinator};
    use crate::observability::logging::StderrLog;
    use crate::worker::service::{DiscardService, IncomingConnection};

    /// Writes a greeting and closes.
    struct Greeter;

    impl ConnectionService for Greeter {
        fn serve(&self, conn: IncomingConnection) -> BoxFuture<'static, ()> {
            let mut stream = conn.stream;
            Box::pin(async move {
                let _ = stream.write_all(b"hello").await;
            })
        }
    }

    fn pool_with(num_workers: usize, service: Arc<dyn ConnectionService>) -> (Arc<WorkerPool>, SocketAddr) {
        let acceptor = Acceptor::bind("127.0.0.1:0").unwrap();
        let addr = acceptor.local_addr();
        let config = WorkerConfig {
            num_workers,
            ..WorkerConfig::default()
        };
        let pool = WorkerPool::start(vec![acceptor], &config, service, Arc::new(StderrLog), None).unwrap();
        (pool, addr)
    }

    fn pool(num_workers: usize) -> (Arc<WorkerPool>, SocketAddr) {
        pool_with(num_workers, Arc::new(DiscardService))
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn single_worker_counts_connections() {
        let (pool, addr) = pool(1);
        let client = tokio::net::TcpStream::connect(addr).await.unwrap();
        eventually(|| pool.single_worker_connections() == 1).await;

        drop(client);
        eventually(|| pool.single_worker_connections() == 0).await;
    }

    #[tokio::test]
    async fn round_robin_spreads_connections() {
        let (pool, addr) = pool(2);
        assert_eq!(pool.single_worker_connections(), 0);

        let _a = tokio::net::TcpStream::connect(addr).await.unwrap();
        let _b = tokio::net::TcpStream::connect(addr).await.unwrap();
        eventually(|| pool.workers().iter().all(|w| w.open_connections() == 1)).await;

        pool.disable_acceptors();
        pool.accept_pending_connections();
        pool.graceful_shutdown_workers();
        let joined = pool.clone();
        tokio::task::spawn_blocking(move || joined.join_workers()).await.unwrap();
        assert!(pool.workers().iter().all(|w| w.open_connections() == 0));
    }

    #[tokio::test]
    async fn backlog_reaches_worker_after_disable() {
        let (pool, addr) = pool(1);
        pool.disable_acceptors();
        tokio::task::yield_now().await;

        let _client = std::net::TcpStream::connect(addr).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(pool.single_worker_connections(), 0);

        pool.accept_pending_connections();
        assert_eq!(pool.single_worker_connections(), 1);
    }

    #[tokio::test]
    async fn backlogged_client_holds_single_worker_shutdown() {
        let (pool, addr) = pool_with(1, Arc::new(Greeter));
        pool.disable_acceptors();
        tokio::task::yield_now().await;

        let mut client = std::net::TcpStream::connect(addr).unwrap();
        client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let mut coordinator = ShutdownCoordinator::new(1, pool.clone(), Arc::new(StderrLog));
        assert_eq!(coordinator.graceful_shutdown(), LoopControl::Continue);
        assert_eq!(pool.single_worker_connections(), 1);

        eventually(|| pool.single_worker_connections() == 0).await;
        assert_eq!(coordinator.reevaluate(), LoopControl::Break);
        pool.join_workers();

        let mut greeting = Vec::new();
        client.read_to_end(&mut greeting).unwrap();
        assert_eq!(greeting, b"hello");
    }
}
