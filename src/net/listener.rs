//! Listening sockets.
//!
//! # Responsibilities
//! - Bind to configured address(es)
//! - Accept incoming TCP connections and hand them to a dispatcher
//! - Stop accepting on shutdown without dropping queued clients
//!
//! # Design Decisions
//! - The nonblocking std listener is the owner of the socket; the accept task
//!   works on a registered clone of it
//! - Disabling aborts the accept task but keeps the socket open so the backlog
//!   can still be drained with plain nonblocking accepts

use std::io;
use std::net::{SocketAddr, TcpListener as StdTcpListener, TcpStream as StdTcpStream};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use crate::config::ListenerConfig;

/// Pause after an accept error (e.g. out of file descriptors) before retrying.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("invalid bind address {address}: {source}")]
    Address {
        address: String,
        #[source]
        source: std::net::AddrParseError,
    },

    #[error("failed to bind {address}: {source}")]
    Bind {
        address: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("failed to start accepting on {address}: {source}")]
    Register {
        address: SocketAddr,
        #[source]
        source: io::Error,
    },
}

/// Receives accepted connections.
///
/// Streams are handed over as std sockets so they can move to a worker
/// running on another runtime.
pub trait ConnectionDispatch: Send + Sync {
    fn dispatch(&self, stream: StdTcpStream, peer: SocketAddr);
}

/// One listening socket.
pub struct Acceptor {
    listener: Option<StdTcpListener>,
    local_addr: SocketAddr,
    task: Option<JoinHandle<()>>,
}

impl Acceptor {
    /// Bind a nonblocking listener.
    pub fn bind(address: &str) -> Result<Self, ListenerError> {
        let addr: SocketAddr = address.parse().map_err(|source| ListenerError::Address {
            address: address.to_string(),
            source,
        })?;
        let bind_error = |source| ListenerError::Bind { address: addr, source };

        let listener = StdTcpListener::bind(addr).map_err(bind_error)?;
        listener.set_nonblocking(true).map_err(bind_error)?;
        let local_addr = listener.local_addr().map_err(bind_error)?;

        tracing::info!(address = %local_addr, "Listener bound");

        Ok(Self {
            listener: Some(listener),
            local_addr,
            task: None,
        })
    }

    /// Bind every configured address, failing on the first error.
    pub fn bind_all(config: &ListenerConfig) -> Result<Vec<Self>, ListenerError> {
        config.bind_addresses.iter().map(|a| Self::bind(a)).collect()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_accepting(&self) -> bool {
        self.task.is_some()
    }

    /// Start the accept task. Must be called inside a tokio runtime.
    pub fn enable(&mut self, dispatch: Arc<dyn ConnectionDispatch>) -> Result<(), ListenerError> {
        let Some(listener) = &self.listener else {
            return Ok(());
        };
        if self.is_accepting() {
            return Ok(());
        }

        let register_error = |source| ListenerError::Register {
            address: self.local_addr,
            source,
        };
        let listener = TcpListener::from_std(listener.try_clone().map_err(register_error)?)
            .map_err(register_error)?;

        let local_addr = self.local_addr;
        self.task = Some(tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => match stream.into_std() {
                        Ok(stream) => dispatch.dispatch(stream, peer),
                        Err(e) => tracing::warn!(peer = %peer, error = %e, "Failed to detach accepted stream"),
                    },
                    Err(e) => {
                        tracing::warn!(address = %local_addr, error = %e, "Accept failed");
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    }
                }
            }
        }));
        Ok(())
    }

    /// Stop the accept task. Connections queued in the backlog stay there.
    pub fn disable(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            tracing::debug!(address = %self.local_addr, "Acceptor disabled");
        }
    }

    /// Accept everything already queued, hand it to `dispatch`, then close
    /// the socket. Returns how many connections were handed over.
    pub fn accept_pending(&mut self, dispatch: &dyn ConnectionDispatch) -> usize {
        self.disable();
        let Some(listener) = self.listener.take() else {
            return 0;
        };

        let mut accepted = 0;
        loop {
            match listener.accept() {
                Ok((stream, peer)) => {
                    dispatch.dispatch(stream, peer);
                    accepted += 1;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::warn!(address = %self.local_addr, error = %e, "Accept failed while draining backlog");
                    break;
                }
            }
        }

        tracing::info!(address = %self.local_addr, accepted, "Listener closed");
        accepted
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        self.disable();
    }
}
