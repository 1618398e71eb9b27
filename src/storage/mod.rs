//! Storage subsystem
//!
//! Block-resident tuples with per-slot version chains, the record
//! buffer pools transactions write through, and the garbage collector
//! that reclaims versions, slots, and transactions.

pub mod block;
pub mod data_table;
pub mod garbage_collector;
pub mod gc_thread;
pub mod projection;
pub mod record_buffer;
pub mod undo;

pub use block::{Block, BlockStore, TupleSlot};
pub use data_table::DataTable;
pub use garbage_collector::{GarbageCollectedIndex, GarbageCollector};
pub use gc_thread::{GarbageCollectorThread, DEFAULT_GC_PERIOD};
pub use projection::{
    live_varlen_buffers, AttrSpec, AttrValue, BlockLayout, ColId, ProjectedRow, VarlenBuffer,
    VarlenEntry,
};
pub use record_buffer::{RecordBufferSegment, SegmentPool, SEGMENT_SIZE};
pub use undo::{DeltaKind, UndoRecord, UndoRegistry};

use thiserror::Error;

/// Storage operation errors
#[derive(Error, Debug)]
pub enum StorageError {
    /// The block store is at its bound
    #[error("block store exhausted: {limit} blocks allocated")]
    BlocksExhausted { limit: usize },

    /// The operating transaction has been aborted
    #[error("transaction is aborted")]
    TransactionAborted,
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;
