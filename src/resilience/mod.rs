//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Cache fetch fails with a network error:
//!     → backoff.rs (pick a jittered delay)
//!     → fetch schedule arms a one-shot retry timer
//! ```
//!
//! # Design Decisions
//! - Every external call has a deadline; the cache client enforces it
//! - Jitter keeps many workers from retrying a shared cache in lockstep

pub mod backoff;
