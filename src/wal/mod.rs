//! Write-ahead log pipeline
//!
//! Two dedicated threads move committed work to disk: the log
//! serializer drains redo buffers handed over at commit and encodes
//! them into writer buffers; the disk writer persists those buffers
//! and fires commit callbacks once their records are durable. Commit
//! order, log order, and callback order all coincide.

mod disk_writer;
mod manager;
pub mod reader;
pub mod record;
mod serializer;

pub use manager::{LogConfig, LogManager};
pub use reader::{BufferedLogReader, ReplayRecord};

use thiserror::Error;

/// WAL operation errors
#[derive(Error, Debug)]
pub enum WalError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Unknown record tag encountered during replay; fatal
    #[error("corrupt record tag {tag:#x}")]
    CorruptRecord { tag: u8 },

    /// The log ended mid-record
    #[error("truncated record: expected {expected} more bytes")]
    Truncated { expected: usize },

    /// The log manager has not been started
    #[error("log manager is not running")]
    NotStarted,

    /// The log manager is already running
    #[error("log manager is already running")]
    AlreadyStarted,
}

/// Result type for WAL operations
pub type WalResult<T> = Result<T, WalError>;
