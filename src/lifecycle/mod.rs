//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (event_loop.rs):
//!     Key supply → Start workers → Control channel watcher → OCSP proceed
//!
//! Shutdown (shutdown.rs):
//!     graceful-shutdown opcode → Stop accepting → Hand off backlog
//!         → Drain workers → Exit loop → Join workers
//!     control channel closed → Exit loop immediately
//!
//! Signals (signals.rs, supervisor side):
//!     SIGQUIT → graceful-shutdown opcode
//!     SIGUSR1 → reopen-log opcode
//!     SIGINT/SIGTERM → close the control channel
//! ```
//!
//! # Design Decisions
//! - Ordered startup: keys exist before the first connection is accepted
//! - Ordered shutdown: stop accept, drain backlog, drain workers, close
//! - Shutdown state only moves forward

pub mod event_loop;
pub mod shutdown;
#[cfg(unix)]
pub mod signals;

pub use event_loop::{LoopExit, OcspUpdater, WorkerProcess};
pub use shutdown::{ConnectionHandler, LoopControl, ShutdownCoordinator, ShutdownState};
