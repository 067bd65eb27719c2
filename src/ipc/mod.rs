//! Inter-process control subsystem.
//!
//! # Data Flow
//! ```text
//! supervising process (proxy-ctl)
//!     → one byte per command over a pipe or Unix socket
//!     → control.rs (read, decode opcodes in stream order)
//!     → ShutdownCoordinator::dispatch
//! ```
//!
//! # Design Decisions
//! - No framing and no acknowledgment; the byte is the whole message
//! - End of stream means the supervisor is gone: shut down immediately

pub mod control;

pub use control::{send_opcode, ControlChannel, ControlChannelError, ControlOpcode};
