//! Worker subsystem.
//!
//! # Data Flow
//! ```text
//! Acceptor (main loop)
//!     → pool.rs RoundRobinDispatch
//!     → WorkerCommand::Connection over an unbounded channel
//!     → handle.rs Worker (inline task, or own thread + runtime)
//!     → service.rs ConnectionService
//!
//! Key manager → WorkerPool::set_ticket_keys_to_workers
//!     → WorkerCommand::SetTicketKeys → worker's TicketKeyStore
//! ```
//!
//! # Design Decisions
//! - A connection counts as open from the moment it is queued, so a drain
//!   never finishes ahead of connections still in a worker's channel
//! - Workers never share mutable state; keys arrive as snapshots
//! - A draining worker finishes its open connections before exiting

pub mod handle;
pub mod pool;
pub mod service;

pub use handle::{Worker, WorkerCommand, WorkerError, WorkerHandle};
pub use pool::WorkerPool;
pub use service::{ConnectionService, DiscardService, IncomingConnection};
