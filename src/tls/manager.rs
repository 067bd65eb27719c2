//! Ticket key supply, rotation and publication.
//!
//! # Responsibilities
//! - Pick the key supply mode once at start-up
//! - Rotate generated keys with bounded history
//! - Publish each new set to the shared store and to the workers
//!
//! # Design Decisions
//! - A failed generation publishes no keys at all rather than a stale set
//! - Publication replaces the whole snapshot; nothing is mutated in place

use std::sync::Arc;
use std::time::Duration;

use crate::config::{MemcachedConfig, TlsConfig};
use crate::observability::metrics;
use crate::tls::fetcher::FetchAction;
use crate::tls::key::{GenerationError, KeyMaterialSource, TicketCipher, TicketKey, TicketKeySet};
use crate::tls::key_file::load_key_files;
use crate::tls::store::TicketKeyStore;

/// Receives every published key set, e.g. to push it to worker threads.
pub trait KeySetSink: Send + Sync {
    fn set_ticket_keys_to_workers(&self, keys: Option<Arc<TicketKeySet>>);
}

/// Where ticket keys come from for the lifetime of the process.
#[derive(Debug)]
pub enum KeySupply {
    /// TLS is off; no keys exist.
    Disabled,
    /// Generate locally, rotating on a timer.
    Auto { interval: Duration },
    /// Loaded once from key files; never rotated.
    Static(TicketKeySet),
    /// Fetched periodically from memcached.
    Networked(MemcachedConfig),
}

impl KeySupply {
    pub fn select(config: &TlsConfig) -> Self {
        if !config.enabled {
            return KeySupply::Disabled;
        }
        if let Some(memcached) = &config.memcached {
            return KeySupply::Networked(memcached.clone());
        }
        let auto = KeySupply::Auto {
            interval: config.rotation_interval(),
        };
        if config.ticket_key_files.is_empty() {
            return auto;
        }

        if config.ticket_key_cipher.is_none() {
            tracing::warn!(
                "Ticket key cipher was not given explicitly; using {}. Pin ticket_key_cipher so \
                 future default changes do not invalidate existing key files",
                config.cipher()
            );
        }
        match load_key_files(&config.ticket_key_files, config.cipher()) {
            Ok(set) => KeySupply::Static(set),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to load ticket key files; using internal session ticket key generator");
                auto
            }
        }
    }
}

/// Owns the active key set and its publication.
pub struct TicketKeyManager {
    cipher: TicketCipher,
    max_keys: usize,
    store: TicketKeyStore,
    sink: Option<Arc<dyn KeySetSink>>,
}

impl TicketKeyManager {
    pub fn new(config: &TlsConfig) -> Self {
        Self {
            cipher: config.cipher(),
            max_keys: config.max_ticket_keys(),
            store: TicketKeyStore::new(),
            sink: None,
        }
    }

    /// Build the next set: a fresh key at index 0 followed by the previous
    /// keys, truncated to `max_keys`.
    pub fn rotate(
        previous: Option<&TicketKeySet>,
        cipher: TicketCipher,
        max_keys: usize,
        rng: &mut dyn KeyMaterialSource,
    ) -> Result<TicketKeySet, GenerationError> {
        let fresh = Arc::new(TicketKey::generate(cipher, rng)?);
        let max_keys = max_keys.max(1);

        let mut keys = Vec::with_capacity(max_keys);
        keys.push(fresh);
        if let Some(previous) = previous {
            keys.extend(previous.keys().iter().take(max_keys - 1).cloned());
        }
        Ok(TicketKeySet::new(keys))
    }

    /// Rotate from the active set and publish the result. On failure the
    /// active set is invalidated.
    pub fn renew(&self, rng: &mut dyn KeyMaterialSource) {
        let previous = self.store.load();
        match Self::rotate(previous.as_deref(), self.cipher, self.max_keys, rng) {
            Ok(set) => {
                tracing::info!(keys = set.len(), "Ticket keys renewed");
                set.log_layout();
                metrics::record_rotation("success");
                self.publish(Some(Arc::new(set)));
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to generate ticket key; disabling ticket keys");
                metrics::record_rotation("failure");
                self.publish(None);
            }
        }
    }

    /// Replace the active snapshot and push it to the workers.
    pub fn publish(&self, keys: Option<Arc<TicketKeySet>>) {
        metrics::record_active_keys(keys.as_ref().map_or(0, |set| set.len()));
        self.store.store(keys.clone());
        if let Some(sink) = &self.sink {
            sink.set_ticket_keys_to_workers(keys);
        }
    }

    /// Route future publications to `sink` as well.
    pub fn attach(&mut self, sink: Arc<dyn KeySetSink>) {
        self.sink = Some(sink);
    }

    /// Act on a cache fetch decision.
    pub fn apply(&self, action: FetchAction) {
        match action {
            FetchAction::Publish(set) => {
                set.log_layout();
                self.publish(Some(set));
            }
            FetchAction::Invalidate => self.publish(None),
            FetchAction::Keep => {}
        }
    }

    pub fn active(&self) -> Option<Arc<TicketKeySet>> {
        self.store.load()
    }

    pub fn store(&self) -> &TicketKeyStore {
        &self.store
    }

    pub fn cipher(&self) -> TicketCipher {
        self.cipher
    }
}
