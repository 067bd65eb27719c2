//! TLS session ticket key subsystem.
//!
//! # Data Flow
//! ```text
//! KeySupply::select (once, at start-up)
//!     → Auto:      rotation timer → TicketKeyManager::renew
//!     → Static:    key_file.rs → published once
//!     → Networked: fetch timer → fetcher.rs → codec.rs → TicketKeyManager::apply
//!
//! TicketKeyManager::publish
//!     → store.rs (atomic snapshot, read lock-free)
//!     → KeySetSink (push to worker threads)
//! ```
//!
//! # Design Decisions
//! - Key sets are immutable snapshots behind `Arc`; rotation builds a new one
//! - Wire decoding goes through a bounds-checked cursor only
//! - Bad or missing networked keys degrade to "keep last good set"

pub mod codec;
pub mod fetcher;
pub mod key;
pub mod key_file;
pub mod manager;
pub mod store;

pub use key::{SystemRandom, TicketCipher, TicketKey, TicketKeySet};
pub use manager::{KeySetSink, KeySupply, TicketKeyManager};
pub use store::TicketKeyStore;
