//! Minimal memcached text protocol client.
//!
//! Only `get` is spoken:
//! ```text
//! → get <key>\r\n
//! ← VALUE <key> <flags> <bytes> [<cas>]\r\n<data>\r\nEND\r\n
//! ← END\r\n                          (miss)
//! ```
//! Every read is bounded; a reply that does not fit the grammar is a
//! network-class error, never a panic.

use std::time::Duration;

use futures_util::future::BoxFuture;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use crate::config::MemcachedConfig;
use crate::tls::fetcher::{CacheError, TicketKeyCache};

/// Longest reply line accepted (header or terminator).
const MAX_LINE_LEN: u64 = 512;

/// Largest value accepted; memcached's own default item limit.
const MAX_VALUE_LEN: usize = 1024 * 1024;

#[derive(Debug, Error)]
enum MemcachedError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("protocol error: {0}")]
    Protocol(&'static str),

    #[error("server error: {0}")]
    Server(String),

    #[error("miss")]
    Miss,
}

impl From<MemcachedError> for CacheError {
    fn from(e: MemcachedError) -> Self {
        match e {
            MemcachedError::Miss => CacheError::NotFound,
            other => CacheError::Network(other.to_string()),
        }
    }
}

/// One-request-per-connection memcached client.
#[derive(Debug, Clone)]
pub struct MemcachedClient {
    address: String,
    timeout: Duration,
}

impl MemcachedClient {
    pub fn new(address: impl Into<String>, timeout: Duration) -> Self {
        Self {
            address: address.into(),
            timeout,
        }
    }

    pub fn from_config(config: &MemcachedConfig) -> Self {
        Self::new(config.address.clone(), config.request_timeout())
    }

    /// Fetch one value, bounded by the request timeout.
    pub async fn get_value(&self, key: &str) -> Result<Vec<u8>, CacheError> {
        match tokio::time::timeout(self.timeout, self.request(key)).await {
            Ok(result) => result.map_err(CacheError::from),
            Err(_) => Err(MemcachedError::Timeout(self.timeout).into()),
        }
    }

    async fn request(&self, key: &str) -> Result<Vec<u8>, MemcachedError> {
        let mut stream = TcpStream::connect(&self.address).await?;
        stream.write_all(format!("get {}\r\n", key).as_bytes()).await?;
        stream.flush().await?;

        let mut reader = BufReader::new(stream);
        let header = read_line(&mut reader).await?;
        if header == b"END" {
            return Err(MemcachedError::Miss);
        }
        let len = parse_value_header(&header, key)?;
        if len > MAX_VALUE_LEN {
            return Err(MemcachedError::Protocol("value too large"));
        }

        let mut data = vec![0u8; len + 2];
        reader.read_exact(&mut data).await?;
        if !data.ends_with(b"\r\n") {
            return Err(MemcachedError::Protocol("value not terminated by CRLF"));
        }
        data.truncate(len);

        if read_line(&mut reader).await? != b"END" {
            return Err(MemcachedError::Protocol("missing END after value"));
        }
        Ok(data)
    }
}

impl TicketKeyCache for MemcachedClient {
    fn get(&self, key: &str) -> BoxFuture<'static, Result<Vec<u8>, CacheError>> {
        let client = self.clone();
        let key = key.to_owned();
        Box::pin(async move { client.get_value(&key).await })
    }
}

/// Read one CRLF-terminated line without the terminator.
async fn read_line<R>(reader: &mut R) -> Result<Vec<u8>, MemcachedError>
where
    R: tokio::io::AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    let n = (&mut *reader).take(MAX_LINE_LEN).read_until(b'\n', &mut line).await?;
    if n == 0 {
        return Err(MemcachedError::Protocol("connection closed before reply"));
    }
    if !line.ends_with(b"\r\n") {
        return Err(MemcachedError::Protocol("reply line too long or unterminated"));
    }
    line.truncate(line.len() - 2);

    if line == b"ERROR" || line.starts_with(b"SERVER_ERROR") || line.starts_with(b"CLIENT_ERROR") {
        return Err(MemcachedError::Server(String::from_utf8_lossy(&line).into_owned()));
    }
    Ok(line)
}

/// Parse `VALUE <key> <flags> <bytes> [<cas>]`, returning the byte count.
fn parse_value_header(line: &[u8], key: &str) -> Result<usize, MemcachedError> {
    let line = std::str::from_utf8(line).map_err(|_| MemcachedError::Protocol("non-UTF-8 header"))?;
    let mut fields = line.split(' ');

    if fields.next() != Some("VALUE") {
        return Err(MemcachedError::Protocol("unexpected reply"));
    }
    if fields.next() != Some(key) {
        return Err(MemcachedError::Protocol("reply for a different key"));
    }
    fields
        .next()
        .and_then(|flags| flags.parse::<u32>().ok())
        .ok_or(MemcachedError::Protocol("bad flags field"))?;
    let len = fields
        .next()
        .and_then(|bytes| bytes.parse::<usize>().ok())
        .ok_or(MemcachedError::Protocol("bad length field"))?;

    // optional cas unique, nothing after it
    if fields.next().is_some_and(|cas| cas.parse::<u64>().is_err()) || fields.next().is_some() {
        return Err(MemcachedError::Protocol("trailing fields in header"));
    }
    Ok(len)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// Serve one connection: read the request line, then write `reply`.
    async fn serve_once(reply: Vec<u8>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut reader = BufReader::new(socket);
            let mut request = String::new();
            reader.read_line(&mut request).await.unwrap();
            assert_eq!(request, "get tls-ticket-key\r\n");
            reader.get_mut().write_all(&reply).await.unwrap();
        });
        addr
    }

    fn client(addr: String) -> MemcachedClient {
        MemcachedClient::new(addr, Duration::from_secs(5))
    }

    #[test]
    fn parses_value_headers() {
        assert_eq!(parse_value_header(b"VALUE k 0 48", "k").unwrap(), 48);
        assert_eq!(parse_value_header(b"VALUE k 7 80 12345", "k").unwrap(), 80);
        assert!(parse_value_header(b"VALUE other 0 48", "k").is_err());
        assert!(parse_value_header(b"VALUE k 0", "k").is_err());
        assert!(parse_value_header(b"VALUE k x 48", "k").is_err());
        assert!(parse_value_header(b"VALUE k 0 48 1 extra", "k").is_err());
        assert!(parse_value_header(b"STORED", "k").is_err());
    }

    #[tokio::test]
    async fn value_reply_yields_bytes() {
        let mut reply = b"VALUE tls-ticket-key 0 5\r\n".to_vec();
        reply.extend_from_slice(b"a\r\nbc\r\nEND\r\n");
        let addr = serve_once(reply).await;

        assert_eq!(client(addr).get_value("tls-ticket-key").await.unwrap(), b"a\r\nbc");
    }

    #[tokio::test]
    async fn end_alone_is_not_found() {
        let addr = serve_once(b"END\r\n".to_vec()).await;
        assert_eq!(
            client(addr).get_value("tls-ticket-key").await,
            Err(CacheError::NotFound)
        );
    }

    #[tokio::test]
    async fn short_value_is_network_error() {
        let addr = serve_once(b"VALUE tls-ticket-key 0 48\r\nabc".to_vec()).await;
        assert!(matches!(
            client(addr).get_value("tls-ticket-key").await,
            Err(CacheError::Network(_))
        ));
    }

    #[tokio::test]
    async fn server_error_is_network_error() {
        let addr = serve_once(b"SERVER_ERROR out of memory\r\n".to_vec()).await;
        match client(addr).get_value("tls-ticket-key").await {
            Err(CacheError::Network(msg)) => assert!(msg.contains("out of memory")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn refused_connection_is_network_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        assert!(matches!(
            client(addr).get_value("tls-ticket-key").await,
            Err(CacheError::Network(_))
        ));
    }

    #[tokio::test]
    async fn silent_server_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let _held = tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
        });

        let client = MemcachedClient::new(addr, Duration::from_millis(100));
        match client.get_value("tls-ticket-key").await {
            Err(CacheError::Network(msg)) => assert!(msg.contains("timed out")),
            other => panic!("unexpected {:?}", other),
        }
    }
}
