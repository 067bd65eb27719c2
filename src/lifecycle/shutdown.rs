//! Graceful shutdown coordination.
//!
//! ```text
//! Running ──graceful-shutdown──▶ Draining ──no open connections──▶ Terminated
//! ```
//! Entering Draining stops the acceptors, hands the backlog to the workers and
//! tells every worker to drain. A single inline worker keeps the loop alive
//! until its last connection closes; with several workers the main loop ends
//! right away and the worker threads drain on their own.

use std::sync::Arc;

use crate::ipc::ControlOpcode;
use crate::observability::logging::LogReopener;
use crate::observability::metrics;
use crate::tls::manager::KeySetSink;

/// Shutdown progress. Only moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ShutdownState {
    Running,
    Draining,
    Terminated,
}

/// Whether the event loop should keep running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopControl {
    Continue,
    Break,
}

/// Acceptors and workers as seen by the shutdown logic.
pub trait ConnectionHandler: KeySetSink {
    /// Stop accepting new connections on every listener.
    fn disable_acceptors(&self);

    /// Hand connections already queued in the listen backlog to a worker,
    /// then close the listeners.
    fn accept_pending_connections(&self);

    /// Tell every worker to finish its open connections and stop.
    fn graceful_shutdown_workers(&self);

    /// Ask every worker to reopen its log files.
    fn worker_reopen_log_files(&self);

    /// Open connections on the inline worker; 0 when workers run on threads.
    fn single_worker_connections(&self) -> u64;

    /// Block until every worker has finished.
    fn join_workers(&self);
}

pub struct ShutdownCoordinator {
    num_workers: usize,
    handler: Arc<dyn ConnectionHandler>,
    logs: Arc<dyn LogReopener>,
    state: ShutdownState,
}

impl ShutdownCoordinator {
    pub fn new(num_workers: usize, handler: Arc<dyn ConnectionHandler>, logs: Arc<dyn LogReopener>) -> Self {
        Self {
            num_workers,
            handler,
            logs,
            state: ShutdownState::Running,
        }
    }

    pub fn state(&self) -> ShutdownState {
        self.state
    }

    pub fn dispatch(&mut self, opcode: ControlOpcode) -> LoopControl {
        metrics::record_control_opcode(opcode.name());
        match opcode {
            ControlOpcode::GracefulShutdown => self.graceful_shutdown(),
            ControlOpcode::ReopenLog => {
                self.reopen_log();
                self.loop_control()
            }
        }
    }

    /// Enter Draining. Repeated calls do nothing.
    pub fn graceful_shutdown(&mut self) -> LoopControl {
        if self.state != ShutdownState::Running {
            return self.loop_control();
        }

        tracing::info!("Graceful shutdown signal received");
        self.state = ShutdownState::Draining;

        self.handler.disable_acceptors();
        // backlog must reach a worker before the workers are told to drain
        self.handler.accept_pending_connections();
        self.handler.graceful_shutdown_workers();

        self.reevaluate()
    }

    /// Decide whether a draining loop may end now.
    pub fn reevaluate(&mut self) -> LoopControl {
        if self.state == ShutdownState::Draining {
            if self.num_workers == 1 {
                let open = self.handler.single_worker_connections();
                if open > 0 {
                    tracing::debug!(open, "Waiting for worker connections to close");
                    return LoopControl::Continue;
                }
            }
            tracing::info!("All pending connections handed off; leaving event loop");
            self.state = ShutdownState::Terminated;
        }
        self.loop_control()
    }

    pub fn reopen_log(&self) {
        tracing::info!("Reopening log files: worker process (thread main)");
        if let Err(e) = self.logs.reopen_log_files() {
            tracing::error!(error = %e, "Failed to reopen log files");
        }
        if self.num_workers > 1 {
            self.handler.worker_reopen_log_files();
        }
    }

    fn loop_control(&self) -> LoopControl {
        if self.state == ShutdownState::Terminated {
            LoopControl::Break
        } else {
            LoopControl::Continue
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex;

    use crate::observability::logging::{LogError, StderrLog};
    use crate::tls::key::TicketKeySet;

    /// Records every call in order.
    #[derive(Default)]
    pub(crate) struct RecordingHandler {
        pub calls: Mutex<Vec<&'static str>>,
        pub open: AtomicU64,
    }

    impl RecordingHandler {
        pub(crate) fn calls(&self) -> Vec<&'static str> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, call: &'static str) {
            self.calls.lock().unwrap().push(call);
        }
    }

    impl KeySetSink for RecordingHandler {
        fn set_ticket_keys_to_workers(&self, _keys: Option<Arc<TicketKeySet>>) {
            self.record("set_ticket_keys");
        }
    }

    impl ConnectionHandler for RecordingHandler {
        fn disable_acceptors(&self) {
            self.record("disable_acceptors");
        }
        fn accept_pending_connections(&self) {
            self.record("accept_pending");
        }
        fn graceful_shutdown_workers(&self) {
            self.record("shutdown_workers");
        }
        fn worker_reopen_log_files(&self) {
            self.record("worker_reopen_log");
        }
        fn single_worker_connections(&self) -> u64 {
            self.open.load(Ordering::SeqCst)
        }
        fn join_workers(&self) {
            self.record("join");
        }
    }

    #[derive(Default)]
    struct CountingLog(AtomicU64);

    impl LogReopener for CountingLog {
        fn reopen_log_files(&self) -> Result<(), LogError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn coordinator(num_workers: usize) -> (ShutdownCoordinator, Arc<RecordingHandler>) {
        let handler = Arc::new(RecordingHandler::default());
        (
            ShutdownCoordinator::new(num_workers, handler.clone(), Arc::new(StderrLog)),
            handler,
        )
    }

    #[test]
    fn drain_steps_run_in_order() {
        let (mut coordinator, handler) = coordinator(4);
        assert_eq!(coordinator.dispatch(ControlOpcode::GracefulShutdown), LoopControl::Break);
        assert_eq!(coordinator.state(), ShutdownState::Terminated);
        assert_eq!(
            handler.calls(),
            vec!["disable_acceptors", "accept_pending", "shutdown_workers"]
        );
    }

    #[test]
    fn repeated_shutdown_is_noop() {
        let (mut coordinator, handler) = coordinator(1);
        handler.open.store(3, Ordering::SeqCst);

        assert_eq!(coordinator.dispatch(ControlOpcode::GracefulShutdown), LoopControl::Continue);
        assert_eq!(coordinator.dispatch(ControlOpcode::GracefulShutdown), LoopControl::Continue);
        assert_eq!(coordinator.state(), ShutdownState::Draining);

        let disables = handler.calls().iter().filter(|c| **c == "disable_acceptors").count();
        assert_eq!(disables, 1);
    }

    #[test]
    fn single_worker_waits_for_connections() {
        let (mut coordinator, handler) = coordinator(1);
        handler.open.store(2, Ordering::SeqCst);

        assert_eq!(coordinator.graceful_shutdown(), LoopControl::Continue);
        assert_eq!(coordinator.reevaluate(), LoopControl::Continue);

        handler.open.store(1, Ordering::SeqCst);
        assert_eq!(coordinator.reevaluate(), LoopControl::Continue);

        handler.open.store(0, Ordering::SeqCst);
        assert_eq!(coordinator.reevaluate(), LoopControl::Break);
        assert_eq!(coordinator.state(), ShutdownState::Terminated);
    }

    #[test]
    fn multi_worker_ignores_connection_count() {
        let (mut coordinator, handler) = coordinator(2);
        handler.open.store(10, Ordering::SeqCst);
        assert_eq!(coordinator.graceful_shutdown(), LoopControl::Break);
    }

    #[test]
    fn reevaluate_while_running_keeps_running() {
        let (mut coordinator, _handler) = coordinator(1);
        assert_eq!(coordinator.reevaluate(), LoopControl::Continue);
        assert_eq!(coordinator.state(), ShutdownState::Running);
    }

    #[test]
    fn reopen_log_reaches_workers_only_when_threaded() {
        let logs = Arc::new(CountingLog::default());
        let handler = Arc::new(RecordingHandler::default());

        let mut single = ShutdownCoordinator::new(1, handler.clone(), logs.clone());
        assert_eq!(single.dispatch(ControlOpcode::ReopenLog), LoopControl::Continue);
        assert!(handler.calls().is_empty());

        let mut multi = ShutdownCoordinator::new(3, handler.clone(), logs.clone());
        multi.dispatch(ControlOpcode::ReopenLog);
        assert_eq!(handler.calls(), vec!["worker_reopen_log"]);
        assert_eq!(logs.0.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn reopen_then_shutdown_in_stream_order() {
        let logs = Arc::new(CountingLog::default());
        let handler = Arc::new(RecordingHandler::default());
        let mut coordinator = ShutdownCoordinator::new(2, handler.clone(), logs.clone());

        let controls: Vec<_> = [
            ControlOpcode::ReopenLog,
            ControlOpcode::GracefulShutdown,
            ControlOpcode::GracefulShutdown,
        ]
        .into_iter()
        .map(|op| coordinator.dispatch(op))
        .collect();

        assert_eq!(controls, vec![LoopControl::Continue, LoopControl::Break, LoopControl::Break]);
        assert_eq!(
            handler.calls(),
            vec!["worker_reopen_log", "disable_acceptors", "accept_pending", "shutdown_workers"]
        );
        assert_eq!(logs.0.load(Ordering::SeqCst), 1);
    }
}
