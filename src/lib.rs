//! Worker process runtime for a TLS-terminating reverse proxy.
//!
//! Manages TLS session ticket keys (local rotation, static files or a shared
//! memcached), relays commands from the supervising process, and drains
//! listeners and workers on graceful shutdown.

// Core subsystems
pub mod config;
pub mod ipc;
pub mod net;
pub mod tls;
pub mod worker;

// Cross-cutting concerns
pub mod lifecycle;
pub mod observability;
pub mod resilience;

pub use config::schema::ProxyConfig;
pub use lifecycle::{LoopExit, WorkerProcess};
