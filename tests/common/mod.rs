//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::future::Future;
use std::io::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;

use proxy_worker::config::ProxyConfig;
use proxy_worker::tls::codec::encode_wire;
use proxy_worker::tls::{TicketCipher, TicketKey, TicketKeySet};

/// Start a programmable mock memcached. `f` produces the value for each
/// `get`; `None` answers with a miss.
pub async fn start_mock_memcached<F, Fut>(f: F) -> SocketAddr
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Option<Vec<u8>>> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let f = Arc::new(f);

    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((socket, _)) => {
                    let f = f.clone();
                    tokio::spawn(async move {
                        let mut reader = BufReader::new(socket);
                        let mut request = String::new();
                        if reader.read_line(&mut request).await.is_err() {
                            return;
                        }
                        let key = request
                            .trim_end()
                            .strip_prefix("get ")
                            .unwrap_or_default()
                            .to_string();

                        let mut reply = Vec::new();
                        if let Some(value) = f(key.clone()).await {
                            reply.extend_from_slice(format!("VALUE {} 0 {}\r\n", key, value.len()).as_bytes());
                            reply.extend_from_slice(&value);
                            reply.extend_from_slice(b"\r\n");
                        }
                        reply.extend_from_slice(b"END\r\n");
                        let _ = reader.get_mut().write_all(&reply).await;
                        let _ = reader.get_mut().shutdown().await;
                    });
                }
                Err(_) => break,
            }
        }
    });
    addr
}

/// A key set whose key names are the given bytes, repeated.
pub fn key_set(names: &[u8]) -> TicketKeySet {
    TicketKeySet::new(
        names
            .iter()
            .map(|&n| {
                Arc::new(TicketKey::from_parts(TicketCipher::Aes128Cbc, [n; 16], &[n; 16], &[n; 16]).unwrap())
            })
            .collect(),
    )
}

/// Wire encoding of `key_set(names)`.
pub fn encoded_keys(names: &[u8]) -> Vec<u8> {
    encode_wire(&key_set(names), TicketCipher::Aes128Cbc).unwrap()
}

/// Write a 48-byte aes-128-cbc key file filled with `byte`.
pub fn write_key_file(byte: u8) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(&[byte; 48]).unwrap();
    file
}

/// Defaults, but listening on an ephemeral loopback port.
pub fn test_config() -> ProxyConfig {
    let mut config = ProxyConfig::default();
    config.listener.bind_addresses = vec!["127.0.0.1:0".to_string()];
    config.workers.drain_check_interval_ms = 10;
    config
}

/// Poll `check` until it holds, failing after two seconds.
pub async fn eventually(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
