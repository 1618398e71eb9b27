//! Per-transaction state
//!
//! A [`TransactionContext`] owns the transaction's undo and redo
//! buffers plus the loose varlen pointers awaiting reclamation. The
//! context is shared (`Arc`) between the transaction manager, the WAL
//! pipeline, and the garbage collector; the GC drops the final
//! reference once the transaction is provably unobservable.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use crate::storage::block::TupleSlot;
use crate::storage::data_table::DataTable;
use crate::storage::projection::{ProjectedRow, VarlenBuffer};
use crate::storage::record_buffer::{RecordBuffer, SegmentPool};
use crate::storage::undo::{DeltaKind, UndoRecord, UndoRegistry};
use crate::txn::Timestamp;
use crate::wal::record::LogRecord;

/// A transaction's append-only undo buffer.
pub type UndoBuffer = RecordBuffer<Arc<UndoRecord>>;

/// A transaction's append-only redo buffer.
pub type RedoBuffer = RecordBuffer<LogRecord>;

/// State owned by one transaction.
pub struct TransactionContext {
    begin: Timestamp,
    finish: AtomicU64,
    aborted: AtomicBool,
    /// Set by the WAL pipeline once this transaction's commit callback
    /// has run; precondition for deallocation.
    log_processed: AtomicBool,
    undo: Mutex<UndoBuffer>,
    /// Taken at commit (handed to the WAL) or discarded at abort.
    redo: Mutex<Option<RedoBuffer>>,
    /// Varlen buffers superseded by this transaction's writes, freed
    /// when the transaction is deallocated.
    loose_varlens: Mutex<Vec<Arc<VarlenBuffer>>>,
}

impl TransactionContext {
    pub(crate) fn new(
        begin: Timestamp,
        undo_pool: Arc<SegmentPool<Arc<UndoRecord>>>,
        redo_pool: Arc<SegmentPool<LogRecord>>,
    ) -> Self {
        Self {
            begin,
            finish: AtomicU64::new(Timestamp::NONE.to_bits()),
            aborted: AtomicBool::new(false),
            log_processed: AtomicBool::new(false),
            undo: Mutex::new(UndoBuffer::new(undo_pool)),
            redo: Mutex::new(Some(RedoBuffer::new(redo_pool))),
            loose_varlens: Mutex::new(Vec::new()),
        }
    }

    /// The begin timestamp (running form).
    pub fn begin_ts(&self) -> Timestamp {
        self.begin
    }

    /// The commit or abort timestamp; [`Timestamp::NONE`] while running.
    pub fn finish_ts(&self) -> Timestamp {
        Timestamp::from_bits(self.finish.load(Ordering::Acquire))
    }

    pub(crate) fn set_finish(&self, ts: Timestamp) {
        self.finish.store(ts.to_bits(), Ordering::Release);
    }

    /// Whether this transaction has been aborted.
    pub fn aborted(&self) -> bool {
        self.aborted.load(Ordering::Acquire)
    }

    pub(crate) fn set_aborted(&self) {
        self.aborted.store(true, Ordering::Release);
    }

    /// Whether the WAL pipeline has acknowledged this transaction.
    pub fn log_processed(&self) -> bool {
        self.log_processed.load(Ordering::Acquire)
    }

    pub(crate) fn mark_log_processed(&self) {
        self.log_processed.store(true, Ordering::Release);
    }

    /// Whether a version with timestamp `ts` is visible to this
    /// transaction: its own writes, or versions committed no later
    /// than its begin.
    pub fn can_see(&self, ts: Timestamp) -> bool {
        ts == self.begin || (ts.is_committed() && !ts.newer_than(self.begin))
    }

    /// Whether this transaction has performed any write.
    pub fn has_writes(&self) -> bool {
        !self.undo.lock().is_empty()
    }

    /// Stage an undo record for a write about to be applied.
    pub(crate) fn stage_undo(
        &self,
        registry: &UndoRegistry,
        kind: DeltaKind,
        table: &Arc<DataTable>,
        slot: TupleSlot,
        delta: Option<ProjectedRow>,
    ) -> Arc<UndoRecord> {
        let record = registry.register(kind, table, slot, delta, self.begin);
        self.undo.lock().push(record.clone());
        record
    }

    /// Discard the most recently staged undo record after a failed
    /// version pointer CAS; the record was never linked, so nothing
    /// can reference it.
    pub(crate) fn discard_last_undo(&self, registry: &UndoRegistry) {
        if let Some(record) = self.undo.lock().pop_last() {
            registry.unregister(record.id());
        }
    }

    /// Append a redo record. A no-op after the transaction finished.
    pub(crate) fn stage_redo(&self, record: LogRecord) {
        if let Some(redo) = self.redo.lock().as_mut() {
            redo.push(record);
        }
    }

    /// Take the redo buffer for WAL handoff or discard.
    pub(crate) fn take_redo_buffer(&self) -> Option<RedoBuffer> {
        self.redo.lock().take()
    }

    /// The undo buffer, locked.
    pub(crate) fn undo_buffer(&self) -> MutexGuard<'_, UndoBuffer> {
        self.undo.lock()
    }

    /// Queue a superseded varlen buffer for reclamation with this
    /// transaction.
    pub(crate) fn add_loose_varlen(&self, buffer: Arc<VarlenBuffer>) {
        self.loose_varlens.lock().push(buffer);
    }

    /// Number of loose varlen buffers held.
    pub fn loose_varlen_count(&self) -> usize {
        self.loose_varlens.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> TransactionContext {
        TransactionContext::new(
            Timestamp::running(10),
            Arc::new(SegmentPool::new(16)),
            Arc::new(SegmentPool::new(16)),
        )
    }

    #[test]
    fn test_visibility_rules() {
        let txn = context();
        // Own write.
        assert!(txn.can_see(Timestamp::running(10)));
        // Committed before begin.
        assert!(txn.can_see(Timestamp::committed(5)));
        // Committed after begin.
        assert!(!txn.can_see(Timestamp::committed(15)));
        // Someone else's uncommitted write.
        assert!(!txn.can_see(Timestamp::running(4)));
        assert!(!txn.can_see(Timestamp::running(12)));
    }

    #[test]
    fn test_fresh_context_flags() {
        let txn = context();
        assert!(!txn.aborted());
        assert!(!txn.log_processed());
        assert!(!txn.has_writes());
        assert_eq!(txn.finish_ts(), Timestamp::NONE);
    }

    #[test]
    fn test_redo_taken_once() {
        let txn = context();
        assert!(txn.take_redo_buffer().is_some());
        assert!(txn.take_redo_buffer().is_none());
    }
}
