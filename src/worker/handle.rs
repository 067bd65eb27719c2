//! A single worker and the handle used to command it.
//!
//! # Responsibilities
//! - Own a worker's connections and its copy of the ticket keys
//! - Run inline on the caller's runtime or on a dedicated thread
//! - Drain: stop taking commands, wait for open connections, exit

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};

use crate::net::connection::{ConnectionGuard, ConnectionTracker};
use crate::observability::logging::LogReopener;
use crate::observability::metrics;
use crate::tls::key::TicketKeySet;
use crate::tls::store::TicketKeyStore;
use crate::worker::service::{ConnectionService, IncomingConnection};

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("failed to spawn worker thread {index}: {source}")]
    Spawn {
        index: usize,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to start listener: {0}")]
    Listener(#[from] crate::net::listener::ListenerError),
}

/// Message to a worker.
#[derive(Debug)]
pub enum WorkerCommand {
    /// An accepted connection. It is counted from the moment it is queued,
    /// so a drain cannot finish while it still sits in the channel.
    Connection {
        stream: std::net::TcpStream,
        peer: SocketAddr,
        guard: ConnectionGuard,
    },
    SetTicketKeys(Option<Arc<TicketKeySet>>),
    GracefulShutdown,
    ReopenLog,
}

pub struct Worker {
    index: usize,
    service: Arc<dyn ConnectionService>,
    tracker: ConnectionTracker,
    keys: TicketKeyStore,
    logs: Arc<dyn LogReopener>,
    drain: watch::Sender<bool>,
}

impl Worker {
    pub fn new(
        index: usize,
        service: Arc<dyn ConnectionService>,
        logs: Arc<dyn LogReopener>,
        initial_keys: Option<Arc<TicketKeySet>>,
    ) -> Self {
        let (drain, _) = watch::channel(false);
        Self {
            index,
            service,
            tracker: ConnectionTracker::new(),
            keys: TicketKeyStore::with_keys(initial_keys),
            logs,
            drain,
        }
    }

    /// Process commands until told to shut down, then wait for open
    /// connections to finish.
    pub async fn run(self, mut commands: mpsc::UnboundedReceiver<WorkerCommand>) {
        tracing::debug!(worker = self.index, "Worker started");

        while let Some(command) = commands.recv().await {
            match command {
                WorkerCommand::Connection { stream, peer, guard } => self.serve(stream, peer, guard),
                WorkerCommand::SetTicketKeys(keys) => {
                    tracing::debug!(worker = self.index, keys = keys.as_ref().map_or(0, |set| set.len()), "Ticket keys updated");
                    self.keys.store(keys);
                }
                WorkerCommand::ReopenLog => {
                    tracing::info!(worker = self.index, "Reopening log files: worker thread");
                    if let Err(e) = self.logs.reopen_log_files() {
                        tracing::error!(worker = self.index, error = %e, "Failed to reopen log files");
                    }
                }
                WorkerCommand::GracefulShutdown => {
                    tracing::info!(
                        worker = self.index,
                        open = self.tracker.active_count(),
                        "Worker draining"
                    );
                    self.drain.send_replace(true);
                    break;
                }
            }
        }

        // connections queued behind the shutdown are already counted
        commands.close();
        while let Ok(command) = commands.try_recv() {
            if let WorkerCommand::Connection { stream, peer, guard } = command {
                self.serve(stream, peer, guard);
            }
        }

        self.tracker.wait_idle().await;
        tracing::info!(worker = self.index, "Worker finished");
    }

    fn serve(&self, stream: std::net::TcpStream, peer: SocketAddr, guard: ConnectionGuard) {
        let stream = match register(stream) {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!(worker = self.index, peer = %peer, error = %e, "Failed to register connection");
                return;
            }
        };

        metrics::record_worker_connections(self.index, self.tracker.active_count());
        tracing::debug!(worker = self.index, connection_id = %guard.id(), peer = %peer, "Connection accepted");

        let session = self.service.serve(IncomingConnection {
            stream,
            peer,
            id: guard.id(),
            ticket_keys: self.keys.load(),
            drain: self.drain.subscribe(),
        });
        let tracker = self.tracker.clone();
        let index = self.index;
        tokio::spawn(async move {
            session.await;
            drop(guard);
            metrics::record_worker_connections(index, tracker.active_count());
        });
    }
}

/// Move an accepted std stream onto the current runtime.
fn register(stream: std::net::TcpStream) -> std::io::Result<TcpStream> {
    stream.set_nonblocking(true)?;
    TcpStream::from_std(stream)
}

enum WorkerTask {
    Inline(tokio::task::JoinHandle<()>),
    Thread(std::thread::JoinHandle<()>),
}

/// Sending side of a running worker.
pub struct WorkerHandle {
    index: usize,
    commands: mpsc::UnboundedSender<WorkerCommand>,
    tracker: ConnectionTracker,
    task: Mutex<Option<WorkerTask>>,
}

impl WorkerHandle {
    /// Run `worker` as a task on the current runtime.
    pub fn spawn_inline(worker: Worker) -> Self {
        let (commands, rx) = mpsc::unbounded_channel();
        let index = worker.index;
        let tracker = worker.tracker.clone();
        let task = tokio::spawn(worker.run(rx));
        Self {
            index,
            commands,
            tracker,
            task: Mutex::new(Some(WorkerTask::Inline(task))),
        }
    }

    /// Run `worker` on its own thread with its own single-threaded runtime.
    pub fn spawn_thread(worker: Worker) -> Result<Self, WorkerError> {
        let (commands, rx) = mpsc::unbounded_channel();
        let index = worker.index;
        let tracker = worker.tracker.clone();

        let thread = std::thread::Builder::new()
            .name(format!("worker-{}", index))
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        tracing::error!(worker = index, error = %e, "Failed to build worker runtime");
                        return;
                    }
                };
                runtime.block_on(worker.run(rx));
            })
            .map_err(|source| WorkerError::Spawn { index, source })?;

        Ok(Self {
            index,
            commands,
            tracker,
            task: Mutex::new(Some(WorkerTask::Thread(thread))),
        })
    }

    pub fn is_inline(&self) -> bool {
        matches!(
            *self.task.lock().expect("worker task mutex poisoned"),
            Some(WorkerTask::Inline(_))
        )
    }

    /// Queue a command. A worker that already exited drops it.
    pub fn send(&self, command: WorkerCommand) {
        if self.commands.send(command).is_err() {
            tracing::debug!(worker = self.index, "Worker has exited; command dropped");
        }
    }

    /// Count `stream` as open on this worker and queue it.
    pub fn dispatch(&self, stream: std::net::TcpStream, peer: SocketAddr) {
        let guard = self.tracker.track();
        self.send(WorkerCommand::Connection { stream, peer, guard });
    }

    /// Connections queued or being served.
    pub fn open_connections(&self) -> u64 {
        self.tracker.active_count()
    }

    /// Wait for a threaded worker to exit. An inline worker ends with the
    /// event loop, so its task is just stopped.
    pub fn join(&self) {
        let task = self.task.lock().expect("worker task mutex poisoned").take();
        match task {
            Some(WorkerTask::Thread(thread)) => {
                if thread.join().is_err() {
                    tracing::error!(worker = self.index, "Worker thread panicked");
                }
            }
            Some(WorkerTask::Inline(task)) => task.abort(),
            None => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;
    use tokio::sync::oneshot;

    use crate::observability::logging::StderrLog;
    use crate::worker::service::DiscardService;

    /// Reports the key count it saw, then behaves like `DiscardService`.
    struct KeyProbe(Mutex<Option<oneshot::Sender<usize>>>);

    impl ConnectionService for KeyProbe {
        fn serve(&self, conn: IncomingConnection) -> futures_util::future::BoxFuture<'static, ()> {
            if let Some(tx) = self.0.lock().unwrap().take() {
                let _ = tx.send(conn.ticket_keys.as_ref().map_or(0, |set| set.len()));
            }
            DiscardService.serve(conn)
        }
    }

    /// Writes a greeting and closes.
    struct Greeter;

    impl ConnectionService for Greeter {
        fn serve(&self, conn: IncomingConnection) -> futures_util::future::BoxFuture<'static, ()> {
            let mut stream = conn.stream;
            Box::pin(async move {
                let _ = stream.write_all(b"hello").await;
            })
        }
    }

    async fn connected_pair() -> (tokio::net::TcpStream, std::net::TcpStream, SocketAddr) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = tokio::net::TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
        let (server, peer) = listener.accept().await.unwrap();
        (client, server.into_std().unwrap(), peer)
    }

    fn keys(n: usize) -> Arc<TicketKeySet> {
        use crate::tls::key::{TicketCipher, TicketKey};
        Arc::new(TicketKeySet::new(
            (0..n)
                .map(|i| Arc::new(TicketKey::from_parts(TicketCipher::Aes128Cbc, [i as u8; 16], &[0; 16], &[0; 16]).unwrap()))
                .collect(),
        ))
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
    async fn inline_worker_drains_then_exits() {
        let worker = Worker::new(0, Arc::new(DiscardService), Arc::new(StderrLog), None);
        let handle = WorkerHandle::spawn_inline(worker);
        assert!(handle.is_inline());

        let (mut client, server, peer) = connected_pair().await;
        handle.dispatch(server, peer);
        eventually(|| handle.open_connections() == 1).await;

        client.write_all(b"ignored").await.unwrap();
        handle.send(WorkerCommand::GracefulShutdown);

        // drain signal closes the idle connection
        eventually(|| handle.open_connections() == 0).await;
    }

    #[tokio::test]
    async fn connections_see_latest_keys() {
        let (tx, rx) = oneshot::channel();
        let worker = Worker::new(0, Arc::new(KeyProbe(Mutex::new(Some(tx)))), Arc::new(StderrLog), Some(keys(1)));
        let handle = WorkerHandle::spawn_inline(worker);

        handle.send(WorkerCommand::SetTicketKeys(Some(keys(3))));
        let (_client, server, peer) = connected_pair().await;
        handle.dispatch(server, peer);

        assert_eq!(rx.await.unwrap(), 3);
    }

    #[tokio::test]
    async fn threaded_worker_joins_after_shutdown() {
        let worker = Worker::new(1, Arc::new(DiscardService), Arc::new(StderrLog), None);
        let handle = WorkerHandle::spawn_thread(worker).unwrap();
        assert!(!handle.is_inline());

        let (client, server, peer) = connected_pair().await;
        handle.dispatch(server, peer);
        eventually(|| handle.open_connections() == 1).await;

        drop(client);
        handle.send(WorkerCommand::GracefulShutdown);
        tokio::task::spawn_blocking(move || handle.join()).await.unwrap();
    }

    #[tokio::test]
    async fn queued_connection_counts_before_worker_runs() {
        let (_client, server, peer) = connected_pair().await;
        let worker = Worker::new(0, Arc::new(DiscardService), Arc::new(StderrLog), None);
        let handle = WorkerHandle::spawn_inline(worker);

        // the inline task has not been polled yet
        handle.dispatch(server, peer);
        assert_eq!(handle.open_connections(), 1);
    }

    #[tokio::test]
    async fn connection_queued_behind_shutdown_is_served() {
        let (mut client, server, peer) = connected_pair().await;
        let worker = Worker::new(0, Arc::new(Greeter), Arc::new(StderrLog), None);
        let handle = WorkerHandle::spawn_inline(worker);

        handle.send(WorkerCommand::GracefulShutdown);
        handle.dispatch(server, peer);
        assert_eq!(handle.open_connections(), 1);

        let mut greeting = [0u8; 5];
        tokio::io::AsyncReadExt::read_exact(&mut client, &mut greeting).await.unwrap();
        assert_eq!(&greeting, b"hello");
        eventually(|| handle.open_connections() == 0).await;
    }
}
