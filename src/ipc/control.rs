//! Control channel from the supervising process.

use std::io;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Bytes read per readiness notification.
const READ_BUF_LEN: usize = 1024;

/// Command sent by the supervising process. One byte each on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlOpcode {
    GracefulShutdown,
    ReopenLog,
}

impl ControlOpcode {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(ControlOpcode::GracefulShutdown),
            2 => Some(ControlOpcode::ReopenLog),
            _ => None,
        }
    }

    pub fn as_byte(self) -> u8 {
        match self {
            ControlOpcode::GracefulShutdown => 1,
            ControlOpcode::ReopenLog => 2,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ControlOpcode::GracefulShutdown => "graceful_shutdown",
            ControlOpcode::ReopenLog => "reopen_log",
        }
    }
}

#[derive(Debug, Error)]
pub enum ControlChannelError {
    /// The supervisor closed its end. Fatal.
    #[error("control channel closed by peer")]
    Closed,

    /// A read failed. The channel stays usable.
    #[error("failed to read from control channel: {0}")]
    Read(#[source] io::Error),
}

/// Reader half of the control channel.
pub struct ControlChannel<R> {
    reader: R,
    buf: Box<[u8; READ_BUF_LEN]>,
}

impl<R: AsyncRead + Unpin> ControlChannel<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buf: Box::new([0; READ_BUF_LEN]),
        }
    }

    /// Wait for the next chunk of bytes and decode it, in stream order.
    ///
    /// Interrupted reads are retried. Unknown bytes are skipped.
    pub async fn read_opcodes(&mut self) -> Result<Vec<ControlOpcode>, ControlChannelError> {
        let n = loop {
            match self.reader.read(&mut self.buf[..]).await {
                Ok(n) => break n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(ControlChannelError::Read(e)),
            }
        };
        if n == 0 {
            return Err(ControlChannelError::Closed);
        }

        Ok(self.buf[..n]
            .iter()
            .filter_map(|&byte| {
                let opcode = ControlOpcode::from_byte(byte);
                if opcode.is_none() {
                    tracing::debug!(byte, "Ignoring unknown control opcode");
                }
                opcode
            })
            .collect())
    }
}

/// Write one command to a worker's control channel.
pub async fn send_opcode<W>(writer: &mut W, opcode: ControlOpcode) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&[opcode.as_byte()]).await?;
    writer.flush().await
}
