//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for a worker
//! process. All types derive Serde traits for deserialization from config files.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::tls::key::TicketCipher;

/// Root configuration for a worker process.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ProxyConfig {
    /// Listening sockets.
    pub listener: ListenerConfig,

    /// Worker pool sizing and drain behavior.
    pub workers: WorkerConfig,

    /// TLS session ticket settings.
    pub tls: TlsConfig,

    /// Where control opcodes come from.
    pub control: ControlConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind addresses (e.g., "0.0.0.0:3000", "[::]:3000").
    pub bind_addresses: Vec<String>,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_addresses: vec!["127.0.0.1:3000".to_string()],
        }
    }
}

/// Worker configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Number of workers. One worker runs inline on the main event loop;
    /// more than one run on dedicated threads.
    pub num_workers: usize,

    /// How often a draining single-worker process re-checks its open
    /// connection count, in milliseconds.
    pub drain_check_interval_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            num_workers: 1,
            drain_check_interval_ms: 100,
        }
    }
}

impl WorkerConfig {
    pub fn drain_check_interval(&self) -> Duration {
        Duration::from_millis(self.drain_check_interval_ms)
    }
}

/// TLS session ticket configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TlsConfig {
    /// Terminate TLS on the listeners. When false no ticket keys exist.
    pub enabled: bool,

    /// Ticket cipher. Unset means aes-128-cbc.
    pub ticket_key_cipher: Option<TicketCipher>,

    /// Session resumption timeout in seconds (default 12 hours).
    /// Its whole hours bound how many ticket keys are retained.
    pub session_timeout_secs: u64,

    /// Interval between automatic key rotations in seconds.
    pub ticket_key_rotation_secs: u64,

    /// Static ticket key files; the first one encrypts.
    pub ticket_key_files: Vec<PathBuf>,

    /// Disable OCSP stapling updates.
    pub no_ocsp: bool,

    /// Fetch ticket keys from memcached instead of generating them.
    pub memcached: Option<MemcachedConfig>,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ticket_key_cipher: None,
            session_timeout_secs: 12 * 60 * 60,
            ticket_key_rotation_secs: 60 * 60,
            ticket_key_files: Vec::new(),
            no_ocsp: false,
            memcached: None,
        }
    }
}

impl TlsConfig {
    /// Effective ticket cipher.
    pub fn cipher(&self) -> TicketCipher {
        self.ticket_key_cipher.unwrap_or_default()
    }

    /// Maximum number of retained ticket keys: the session timeout in whole
    /// hours, never less than one.
    pub fn max_ticket_keys(&self) -> usize {
        ((self.session_timeout_secs / 3600) as usize).max(1)
    }

    pub fn rotation_interval(&self) -> Duration {
        Duration::from_secs(self.ticket_key_rotation_secs)
    }
}

/// Memcached-backed ticket key distribution.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MemcachedConfig {
    /// Memcached address (e.g., "127.0.0.1:11211").
    pub address: String,

    /// Cache key holding the encoded key set.
    pub key: String,

    /// Interval between fetches in seconds.
    pub interval_secs: u64,

    /// Consecutive network errors before a fetch counts as "not found".
    pub max_retry: u32,

    /// Consecutive "not found" results before the active keys are dropped.
    /// Zero keeps serving the last good set indefinitely.
    pub max_fail: u32,

    /// Per-request timeout in seconds.
    pub request_timeout_secs: u64,

    /// Discard successful fetches older than the last applied one.
    pub sequenced: bool,
}

impl Default for MemcachedConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:11211".to_string(),
            key: "tls-ticket-key".to_string(),
            interval_secs: 600,
            max_retry: 3,
            max_fail: 0,
            request_timeout_secs: 5,
            sequenced: false,
        }
    }
}

impl MemcachedConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Control channel configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ControlConfig {
    /// Unix socket of the supervising process. Unset reads standard input.
    pub socket: Option<PathBuf>,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Log file; reopened on the reopen-log command. Unset logs to stderr.
    pub log_file: Option<PathBuf>,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_file: None,
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9090".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_keep_twelve_keys() {
        let config = ProxyConfig::default();
        assert_eq!(config.tls.max_ticket_keys(), 12);
        assert_eq!(config.tls.cipher(), TicketCipher::Aes128Cbc);
        assert_eq!(config.tls.rotation_interval(), Duration::from_secs(3600));
    }

    #[test]
    fn short_session_timeout_still_keeps_one_key() {
        let tls = TlsConfig {
            session_timeout_secs: 600,
            ..TlsConfig::default()
        };
        assert_eq!(tls.max_ticket_keys(), 1);
    }

    #[test]
    fn parses_partial_toml() {
        let config: ProxyConfig = toml::from_str(
            r#"
            [workers]
            num_workers = 4

            [tls]
            ticket_key_cipher = "aes-256-cbc"

            [tls.memcached]
            address = "10.0.0.5:11211"
            sequenced = true
            "#,
        )
        .unwrap();

        assert_eq!(config.workers.num_workers, 4);
        assert_eq!(config.tls.cipher(), TicketCipher::Aes256Cbc);
        let memcached = config.tls.memcached.unwrap();
        assert_eq!(memcached.address, "10.0.0.5:11211");
        assert_eq!(memcached.max_retry, 3);
        assert!(memcached.sequenced);
        assert_eq!(config.listener.bind_addresses, vec!["127.0.0.1:3000"]);
    }
}
