//! The request path a worker hands connections to.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::watch;

use crate::net::connection::ConnectionId;
use crate::tls::key::TicketKeySet;

/// A connection accepted by a worker, with what it needs to serve it.
pub struct IncomingConnection {
    pub stream: TcpStream,
    pub peer: SocketAddr,
    pub id: ConnectionId,
    /// Ticket keys current when the connection arrived.
    pub ticket_keys: Option<Arc<TicketKeySet>>,
    /// Flips to `true` when the worker starts draining.
    pub drain: watch::Receiver<bool>,
}

/// Serves one connection to completion.
pub trait ConnectionService: Send + Sync + 'static {
    fn serve(&self, conn: IncomingConnection) -> BoxFuture<'static, ()>;
}

/// Reads and discards until the peer closes or the worker drains.
#[derive(Debug, Default, Clone, Copy)]
pub struct DiscardService;

impl ConnectionService for DiscardService {
    fn serve(&self, conn: IncomingConnection) -> BoxFuture<'static, ()> {
        let IncomingConnection {
            mut stream,
            peer,
            id,
            ticket_keys,
            mut drain,
        } = conn;

        Box::pin(async move {
            tracing::debug!(
                connection_id = %id,
                peer = %peer,
                ticket_keys = ticket_keys.as_ref().map_or(0, |set| set.len()),
                "Serving connection"
            );

            let mut buf = [0u8; 4096];
            loop {
                tokio::select! {
                    read = stream.read(&mut buf) => match read {
                        Ok(0) => break,
                        Ok(_) => continue,
                        Err(e) => {
                            tracing::debug!(connection_id = %id, error = %e, "Read failed");
                            break;
                        }
                    },
                    _ = drain.wait_for(|draining| *draining) => break,
                }
            }
        })
    }
}
