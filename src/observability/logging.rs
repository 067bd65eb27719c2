//! Structured logging.
//!
//! # Responsibilities
//! - Initialize the tracing subscriber from config
//! - Write to stderr or to a log file that can be reopened in place
//! - Serve the reopen-log command
//!
//! # Design Decisions
//! - The file handle lives in an `ArcSwap`; reopen swaps in a fresh handle and
//!   in-flight writes finish against the old one
//! - A failed reopen keeps the previous handle

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use thiserror::Error;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::EnvFilter;

use crate::config::ObservabilityConfig;

#[derive(Debug, Error)]
pub enum LogError {
    #[error("failed to open log file {}: {source}", path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to install log subscriber: {0}")]
    Init(#[from] TryInitError),
}

/// Something that can reopen the process's log files.
pub trait LogReopener: Send + Sync {
    fn reopen_log_files(&self) -> Result<(), LogError>;
}

/// Log file whose handle can be replaced while the subscriber keeps writing.
#[derive(Debug, Clone)]
pub struct ReopenableLogFile {
    path: PathBuf,
    file: Arc<ArcSwap<File>>,
}

impl ReopenableLogFile {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, LogError> {
        let path = path.into();
        let file = open_append(&path)?;
        Ok(Self {
            path,
            file: Arc::new(ArcSwap::from_pointee(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Open the path again and swap the new handle in.
    pub fn reopen(&self) -> Result<(), LogError> {
        let file = open_append(&self.path)?;
        self.file.store(Arc::new(file));
        Ok(())
    }
}

fn open_append(path: &Path) -> Result<File, LogError> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|source| LogError::Open {
            path: path.to_path_buf(),
            source,
        })
}

impl LogReopener for ReopenableLogFile {
    fn reopen_log_files(&self) -> Result<(), LogError> {
        self.reopen()?;
        tracing::info!(path = %self.path.display(), "Reopened log file");
        Ok(())
    }
}

/// Writer handed out per event; pins the handle current at creation.
pub struct LogFileWriter(Arc<File>);

impl Write for LogFileWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        (&*self.0).write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        (&*self.0).flush()
    }
}

impl<'a> MakeWriter<'a> for ReopenableLogFile {
    type Writer = LogFileWriter;

    fn make_writer(&'a self) -> Self::Writer {
        LogFileWriter(self.file.load_full())
    }
}

/// Logging to stderr; there is nothing to reopen.
#[derive(Debug, Default, Clone, Copy)]
pub struct StderrLog;

impl LogReopener for StderrLog {
    fn reopen_log_files(&self) -> Result<(), LogError> {
        tracing::debug!("Logging to stderr, nothing to reopen");
        Ok(())
    }
}

/// Install the global subscriber. Returns the reopen handle for the
/// reopen-log command.
pub fn init_logging(config: &ObservabilityConfig) -> Result<Arc<dyn LogReopener>, LogError> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    match &config.log_file {
        Some(path) => {
            let file = ReopenableLogFile::open(path)?;
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(file.clone())
                        .with_ansi(false),
                )
                .try_init()?;
            Ok(Arc::new(file))
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
                .try_init()?;
            Ok(Arc::new(StderrLog))
        }
    }
}
