//! Transaction management
//!
//! Provides MVCC transaction coordination with:
//! - Timestamp ordering from a single monotonic counter with an
//!   embedded running bit
//! - Commit/abort with in-place version chain maintenance
//! - Durable commit acknowledgment through the WAL pipeline
//! - Completed-transaction handoff to the garbage collector

pub mod context;
mod manager;
mod timestamp;

pub use context::{RedoBuffer, TransactionContext, UndoBuffer};
pub use manager::TransactionManager;
pub use timestamp::Timestamp;

use thiserror::Error;

/// Callback invoked once a transaction's commit record is durable.
pub type CommitCallback = Box<dyn FnOnce() + Send + 'static>;

/// An action whose execution is deferred until no running transaction
/// predates its submission.
pub type DeferredAction = Box<dyn FnOnce() + Send + 'static>;

/// Transaction operation errors
#[derive(Error, Debug)]
pub enum TransactionError {
    /// The transaction was aborted by a write-write conflict
    #[error("transaction aborted by a write-write conflict")]
    Aborted,

    /// The transaction has already committed or aborted
    #[error("transaction is already completed")]
    AlreadyCompleted,
}

/// Result type for transaction operations
pub type TransactionResult<T> = Result<T, TransactionError>;
