//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → listener.rs (accept loop, round-robin dispatch to a worker)
//!     → connection.rs (per-worker open connection tracking)
//!     → worker's ConnectionService
//!
//! Ticket key fetch
//!     → memcached.rs (get over the text protocol, with a deadline)
//! ```
//!
//! # Design Decisions
//! - Accepting stops before draining; queued clients are still served
//! - Each connection is tracked so a draining worker knows when it is done
//! - Cache replies are parsed with bounded reads only

pub mod connection;
pub mod listener;
pub mod memcached;
