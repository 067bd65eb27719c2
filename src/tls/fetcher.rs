//! Ticket keys from a networked cache.
//!
//! # Data Flow
//! ```text
//! fetch timer / retry timer
//!     → NetworkedKeyFetcher::fetch (spawned cache get, tagged with a sequence number)
//!     → FetchCompletion over an mpsc channel (arrival order)
//!     → FetchSchedule::on_completion (retry / miss / success policy)
//!     → FetchAction applied by the key manager
//! ```
//!
//! # Design Decisions
//! - Decode failures are treated as a miss, never as fatal
//! - Network errors are retried with jittered backoff before counting as a miss
//! - Completions apply in arrival order unless sequencing is enabled

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use thiserror::Error;
use tokio::sync::mpsc;
use zeroize::Zeroizing;

use crate::config::MemcachedConfig;
use crate::observability::metrics;
use crate::resilience::backoff::retry_delay;
use crate::tls::codec::decode_wire;
use crate::tls::key::{TicketCipher, TicketKeySet};

/// Longest delay between network error retries.
const MAX_RETRY_DELAY_SECS: u64 = 60;

/// Failure of a single cache lookup.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    #[error("key not found")]
    NotFound,

    #[error("network error: {0}")]
    Network(String),
}

/// A key-value cache holding the encoded key set.
pub trait TicketKeyCache: Send + Sync + 'static {
    fn get(&self, key: &str) -> BoxFuture<'static, Result<Vec<u8>, CacheError>>;
}

/// Classified result of one fetch.
#[derive(Debug)]
pub enum FetchOutcome {
    Success(TicketKeySet),
    NotFound,
    NetworkError(String),
}

#[derive(Debug)]
pub struct FetchCompletion {
    pub seq: u64,
    pub outcome: FetchOutcome,
}

/// Issues cache lookups and reports their completions on a channel.
pub struct NetworkedKeyFetcher {
    cache: Arc<dyn TicketKeyCache>,
    key: String,
    cipher: TicketCipher,
    next_seq: u64,
    completions: mpsc::UnboundedSender<FetchCompletion>,
}

impl NetworkedKeyFetcher {
    /// Create a fetcher.
    ///
    /// Returns the fetcher and a receiver for fetch completions.
    pub fn new(
        cache: Arc<dyn TicketKeyCache>,
        key: impl Into<String>,
        cipher: TicketCipher,
    ) -> (Self, mpsc::UnboundedReceiver<FetchCompletion>) {
        let (completions, rx) = mpsc::unbounded_channel();
        (
            Self {
                cache,
                key: key.into(),
                cipher,
                next_seq: 0,
                completions,
            },
            rx,
        )
    }

    /// Start one lookup. Returns its sequence number.
    pub fn fetch(&mut self) -> u64 {
        self.next_seq += 1;
        let seq = self.next_seq;
        let request = self.cache.get(&self.key);
        let cipher = self.cipher;
        let tx = self.completions.clone();

        tracing::debug!(seq, key = %self.key, "Memcached: tls ticket key get request sent");

        tokio::spawn(async move {
            let outcome = classify(request.await, cipher);
            // the receiver is gone once the event loop has exited
            let _ = tx.send(FetchCompletion { seq, outcome });
        });
        seq
    }
}

/// Map a raw cache reply to an outcome. Malformed or empty values are misses.
pub fn classify(reply: Result<Vec<u8>, CacheError>, cipher: TicketCipher) -> FetchOutcome {
    match reply {
        Ok(value) => {
            let value = Zeroizing::new(value);
            match decode_wire(&value, cipher) {
                Ok(set) if set.is_empty() => {
                    tracing::warn!("Memcached: tls ticket key value holds no keys");
                    FetchOutcome::NotFound
                }
                Ok(set) => FetchOutcome::Success(set),
                Err(e) => {
                    tracing::warn!(error = %e, "Memcached: malformed tls ticket key value");
                    FetchOutcome::NotFound
                }
            }
        }
        Err(CacheError::NotFound) => FetchOutcome::NotFound,
        Err(CacheError::Network(e)) => FetchOutcome::NetworkError(e),
    }
}

/// What the key manager should do with a completion.
#[derive(Debug)]
pub enum FetchAction {
    /// Publish a freshly fetched set.
    Publish(Arc<TicketKeySet>),
    /// Drop the active set; too many consecutive misses.
    Invalidate,
    /// Keep serving the current snapshot.
    Keep,
}

#[derive(Debug)]
pub struct FetchDecision {
    pub action: FetchAction,
    /// Fetch again after this delay, besides the periodic timer.
    pub retry_after: Option<Duration>,
}

/// Retry and miss accounting across fetches.
#[derive(Debug)]
pub struct FetchSchedule {
    max_retry: u32,
    max_fail: u32,
    sequenced: bool,
    retry_count: u32,
    fail_count: u32,
    last_applied: Option<u64>,
}

impl FetchSchedule {
    pub fn new(config: &MemcachedConfig) -> Self {
        Self {
            max_retry: config.max_retry,
            max_fail: config.max_fail,
            sequenced: config.sequenced,
            retry_count: 0,
            fail_count: 0,
            last_applied: None,
        }
    }

    pub fn on_completion(&mut self, completion: FetchCompletion) -> FetchDecision {
        let FetchCompletion { seq, outcome } = completion;
        match outcome {
            FetchOutcome::Success(set) => {
                if self.sequenced && self.last_applied.is_some_and(|last| seq < last) {
                    tracing::debug!(seq, last_applied = ?self.last_applied, "Memcached: discarding stale tls ticket key fetch");
                    metrics::record_fetch("stale");
                    return FetchDecision {
                        action: FetchAction::Keep,
                        retry_after: None,
                    };
                }

                self.retry_count = 0;
                self.fail_count = 0;
                self.last_applied = Some(seq);
                tracing::info!(seq, keys = set.len(), "Memcached: tls ticket key get success");
                metrics::record_fetch("success");
                FetchDecision {
                    action: FetchAction::Publish(Arc::new(set)),
                    retry_after: None,
                }
            }
            FetchOutcome::NetworkError(error) => {
                self.retry_count += 1;
                if self.retry_count >= self.max_retry {
                    tracing::warn!(
                        retries = self.retry_count,
                        error = %error,
                        "Memcached: tls ticket key get retry all failed"
                    );
                    return self.not_found();
                }

                let delay = retry_delay(self.retry_count, MAX_RETRY_DELAY_SECS);
                tracing::warn!(
                    error = %error,
                    retry_in_secs = delay.as_secs(),
                    "Memcached: tls ticket key get failed due to network error, retrying"
                );
                metrics::record_fetch("network_error");
                FetchDecision {
                    action: FetchAction::Keep,
                    retry_after: Some(delay),
                }
            }
            FetchOutcome::NotFound => self.not_found(),
        }
    }

    fn not_found(&mut self) -> FetchDecision {
        self.retry_count = 0;
        self.fail_count += 1;
        metrics::record_fetch("not_found");

        if self.max_fail > 0 && self.fail_count >= self.max_fail {
            self.fail_count = 0;
            tracing::warn!("Memcached: could not get tls ticket keys; disabling tls tickets");
            return FetchDecision {
                action: FetchAction::Invalidate,
                retry_after: None,
            };
        }

        tracing::warn!("Memcached: tls ticket key get failed, keeping current keys until next fetch");
        FetchDecision {
            action: FetchAction::Keep,
            retry_after: None,
        }
    }
}
