//! OS signal handling for the supervising process.
//!
//! # Responsibilities
//! - Register signal handlers (SIGQUIT, SIGUSR1, SIGINT, SIGTERM)
//! - Translate signals into control channel actions for the worker
//!
//! # Design Decisions
//! - Uses Tokio's signal handling (async-safe)
//! - The worker itself never handles these signals; the supervisor forwards
//!   them as opcodes so a signal aimed at the process group acts once
//! - SIGINT/SIGTERM close the channel, which the worker treats as immediate
//!   shutdown

use std::io;

use tokio::signal::unix::{signal, Signal, SignalKind};

use crate::ipc::ControlOpcode;

/// Signals the supervisor listens for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorSignal {
    Quit,
    Usr1,
    Interrupt,
    Terminate,
}

/// What the supervisor does with the worker's control channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorAction {
    Send(ControlOpcode),
    CloseChannel,
}

pub fn translate(signal: SupervisorSignal) -> SupervisorAction {
    match signal {
        SupervisorSignal::Quit => SupervisorAction::Send(ControlOpcode::GracefulShutdown),
        SupervisorSignal::Usr1 => SupervisorAction::Send(ControlOpcode::ReopenLog),
        SupervisorSignal::Interrupt | SupervisorSignal::Terminate => SupervisorAction::CloseChannel,
    }
}

/// Registered signal streams.
pub struct SignalTranslator {
    quit: Signal,
    usr1: Signal,
    interrupt: Signal,
    terminate: Signal,
}

impl SignalTranslator {
    /// Register all handlers. Must be called inside a tokio runtime.
    pub fn install() -> io::Result<Self> {
        Ok(Self {
            quit: signal(SignalKind::quit())?,
            usr1: signal(SignalKind::user_defined1())?,
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
        })
    }

    /// Wait for the next signal and translate it.
    pub async fn next(&mut self) -> SupervisorAction {
        let received = tokio::select! {
            _ = self.quit.recv() => SupervisorSignal::Quit,
            _ = self.usr1.recv() => SupervisorSignal::Usr1,
            _ = self.interrupt.recv() => SupervisorSignal::Interrupt,
            _ = self.terminate.recv() => SupervisorSignal::Terminate,
        };
        tracing::debug!(signal = ?received, "Signal received");
        translate(received)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signals_map_to_opcodes() {
        assert_eq!(
            translate(SupervisorSignal::Quit),
            SupervisorAction::Send(ControlOpcode::GracefulShutdown)
        );
        assert_eq!(
            translate(SupervisorSignal::Usr1),
            SupervisorAction::Send(ControlOpcode::ReopenLog)
        );
        assert_eq!(translate(SupervisorSignal::Interrupt), SupervisorAction::CloseChannel);
        assert_eq!(translate(SupervisorSignal::Terminate), SupervisorAction::CloseChannel);
    }
}
