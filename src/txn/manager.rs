//! Transaction manager - central coordinator for transactions
//!
//! Manages the transaction lifecycle:
//! - BEGIN: allocate a running timestamp, register in the running table
//! - COMMIT: stamp a commit timestamp, flip version visibility, hand
//!   the redo buffer to the WAL pipeline
//! - ABORT: roll back and unlink every undo record
//!
//! Completed transactions are queued for the garbage collector, which
//! owns their final deallocation.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_skiplist::SkipSet;
use parking_lot::Mutex;

use crate::storage::record_buffer::SegmentPool;
use crate::storage::undo::{UndoRecord, UndoRegistry};
use crate::txn::context::TransactionContext;
use crate::txn::{
    CommitCallback, DeferredAction, Timestamp, TransactionError, TransactionResult,
};
use crate::wal::record::{CommitRecord, LogRecord};
use crate::wal::LogManager;

/// Transaction manager - coordinates all transaction operations
pub struct TransactionManager {
    /// Global timestamp counter. Starts at 1; raw value 0 means
    /// "no transaction".
    time: AtomicU64,

    /// Begin timestamps of currently running transactions, ordered so
    /// the oldest is cheap to find.
    running: SkipSet<Timestamp>,

    /// Serializes the commit critical section so WAL order equals
    /// commit timestamp order.
    commit_latch: Mutex<()>,

    /// Committed and aborted transactions awaiting the GC.
    completed: Mutex<VecDeque<Arc<TransactionContext>>>,

    /// Actions queued for the GC's deferred-action phase.
    deferred: Mutex<VecDeque<(Timestamp, DeferredAction)>>,

    undo_pool: Arc<SegmentPool<Arc<UndoRecord>>>,
    redo_pool: Arc<SegmentPool<LogRecord>>,
    registry: Arc<UndoRegistry>,

    /// WAL handoff target; `None` runs with logging disabled, in which
    /// case commits are acknowledged synchronously.
    log_manager: Option<Arc<LogManager>>,
}

impl TransactionManager {
    /// Create a transaction manager whose record buffers are bounded
    /// at `pool_size` segments per buffer type.
    pub fn new(pool_size: usize, log_manager: Option<Arc<LogManager>>) -> Self {
        Self {
            time: AtomicU64::new(1),
            running: SkipSet::new(),
            commit_latch: Mutex::new(()),
            completed: Mutex::new(VecDeque::new()),
            deferred: Mutex::new(VecDeque::new()),
            undo_pool: Arc::new(SegmentPool::new(pool_size)),
            redo_pool: Arc::new(SegmentPool::new(pool_size)),
            registry: Arc::new(UndoRegistry::new()),
            log_manager,
        }
    }

    /// The undo record registry shared with tables and the GC.
    pub fn undo_registry(&self) -> &Arc<UndoRegistry> {
        &self.registry
    }

    /// Begin a new transaction.
    pub fn begin(&self) -> Arc<TransactionContext> {
        let begin = Timestamp::running(self.time.fetch_add(1, Ordering::AcqRel));
        self.running.insert(begin);
        Arc::new(TransactionContext::new(
            begin,
            self.undo_pool.clone(),
            self.redo_pool.clone(),
        ))
    }

    /// Commit a transaction, returning its commit timestamp.
    ///
    /// `callback` runs exactly once, after the commit record is
    /// durable (immediately for read-only transactions and when
    /// logging is disabled). Committing an aborted transaction is an
    /// error; the caller should `abort` instead.
    pub fn commit(
        &self,
        txn: &Arc<TransactionContext>,
        callback: CommitCallback,
    ) -> TransactionResult<Timestamp> {
        if txn.aborted() {
            return Err(TransactionError::Aborted);
        }
        if txn.finish_ts() != Timestamp::NONE {
            return Err(TransactionError::AlreadyCompleted);
        }

        if !txn.has_writes() {
            // Read-only: no commit record, acknowledge synchronously.
            let commit_ts = Timestamp::committed(self.time.fetch_add(1, Ordering::AcqRel));
            txn.set_finish(commit_ts);
            self.running.remove(&txn.begin_ts());
            self.completed.lock().push_back(txn.clone());
            callback();
            txn.mark_log_processed();
            return Ok(commit_ts);
        }

        // The critical section keeps the WAL totally ordered by commit
        // timestamp: timestamp rewrite plus redo handoff are atomic
        // with respect to other commits.
        let guard = self.commit_latch.lock();
        let commit_ts = Timestamp::committed(self.time.fetch_add(1, Ordering::AcqRel));
        txn.set_finish(commit_ts);

        // Flip visibility for readers: every undo record this
        // transaction linked now carries the commit timestamp.
        for record in txn.undo_buffer().iter() {
            record.set_timestamp(commit_ts);
        }

        match (&self.log_manager, txn.take_redo_buffer()) {
            (Some(log_manager), Some(mut redo)) => {
                redo.push(LogRecord::Commit(CommitRecord {
                    txn_begin: txn.begin_ts(),
                    commit_ts,
                    callback,
                    txn: txn.clone(),
                }));
                log_manager.add_buffer_to_flush_queue(redo);
            }
            (_, redo) => {
                // Logging disabled: acknowledge synchronously.
                drop(redo);
                callback();
                txn.mark_log_processed();
            }
        }

        self.running.remove(&txn.begin_ts());
        self.completed.lock().push_back(txn.clone());
        drop(guard);

        Ok(commit_ts)
    }

    /// Abort a transaction, rolling back and unlinking its writes.
    ///
    /// No commit record is emitted and the commit callback (never
    /// supplied here) is never invoked; the redo buffer is discarded.
    pub fn abort(&self, txn: &Arc<TransactionContext>) -> TransactionResult<()> {
        if txn.finish_ts() != Timestamp::NONE {
            return Err(TransactionError::AlreadyCompleted);
        }
        txn.set_aborted();
        let abort_ts = Timestamp::committed(self.time.fetch_add(1, Ordering::AcqRel));
        txn.set_finish(abort_ts);

        // Newest first, so each record is at its chain head when
        // unlinked.
        {
            let undo = txn.undo_buffer();
            for record in undo.iter().rev() {
                if let Some(table) = record.table() {
                    table.rollback_undo_record(record);
                    table.unlink_undo_record(record);
                }
            }
        }

        drop(txn.take_redo_buffer());
        // Aborted transactions never hit the WAL.
        txn.mark_log_processed();

        self.running.remove(&txn.begin_ts());
        self.completed.lock().push_back(txn.clone());
        Ok(())
    }

    /// Move-return the completed transaction queue; the manager
    /// retains no references afterwards.
    pub fn completed_transactions_for_gc(&self) -> VecDeque<Arc<TransactionContext>> {
        std::mem::take(&mut *self.completed.lock())
    }

    /// The minimum begin timestamp among running transactions, or the
    /// current time if none are running.
    pub fn oldest_running_start_time(&self) -> Timestamp {
        self.running
            .front()
            .map(|entry| *entry.value())
            .unwrap_or_else(|| Timestamp::running(self.time.load(Ordering::Acquire)))
    }

    /// The current value of the timestamp counter, in committed form.
    pub fn current_time(&self) -> Timestamp {
        Timestamp::committed(self.time.load(Ordering::Acquire))
    }

    /// Queue an action to run once every transaction running at
    /// submission time has finished.
    pub fn defer_action(&self, action: DeferredAction) {
        let now = self.current_time();
        self.deferred.lock().push_back((now, action));
    }

    /// Move-return the queued deferred actions.
    pub fn deferred_actions_for_gc(&self) -> VecDeque<(Timestamp, DeferredAction)> {
        std::mem::take(&mut *self.deferred.lock())
    }

    /// Number of currently running transactions.
    pub fn running_count(&self) -> usize {
        self.running.len()
    }
}
