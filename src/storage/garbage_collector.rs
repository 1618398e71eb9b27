//! Garbage collector for versions, slots, and transactions
//!
//! A single GC tick runs deferred actions, deallocates transactions
//! whose unlink predates the oldest running transaction, unlinks the
//! version chains of newly completed transactions, and finally runs
//! every registered index's GC hook. Two ticks fully reclaim a
//! transaction: one to unlink, one to deallocate.

use std::collections::{BinaryHeap, HashSet, VecDeque};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::storage::block::TupleSlot;
use crate::storage::data_table::DataTable;
use crate::storage::projection::AttrValue;
use crate::storage::undo::{DeltaKind, UndoRecord, UndoRegistry, NULL_UNDO};
use crate::txn::context::TransactionContext;
use crate::txn::{DeferredAction, Timestamp, TransactionManager};

/// Hook for indexes that defer physical deletion to the GC.
pub trait GarbageCollectedIndex: Send + Sync {
    /// Reclaim index entries no running transaction can observe.
    fn perform_garbage_collection(&self);
}

struct DeferredEntry {
    ts: Timestamp,
    action: DeferredAction,
}

// Min-heap on submission timestamp.
impl PartialEq for DeferredEntry {
    fn eq(&self, other: &Self) -> bool {
        self.ts == other.ts
    }
}

impl Eq for DeferredEntry {}

impl PartialOrd for DeferredEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DeferredEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other.ts.cmp(&self.ts)
    }
}

struct GcState {
    /// When GC last unlinked anything; the deallocation safety horizon.
    last_unlinked: Timestamp,
    to_deallocate: VecDeque<Arc<TransactionContext>>,
    to_unlink: VecDeque<Arc<TransactionContext>>,
    deferred: BinaryHeap<DeferredEntry>,
}

/// Garbage collector over one transaction manager's completed work.
pub struct GarbageCollector {
    txn_manager: Arc<TransactionManager>,
    registry: Arc<UndoRegistry>,
    state: Mutex<GcState>,
    /// Shared during the per-tick traversal, exclusive during
    /// registration changes.
    indexes: RwLock<Vec<Arc<dyn GarbageCollectedIndex>>>,
}

impl GarbageCollector {
    /// Create a collector for `txn_manager`'s transactions.
    pub fn new(txn_manager: Arc<TransactionManager>) -> Self {
        let registry = txn_manager.undo_registry().clone();
        Self {
            txn_manager,
            registry,
            state: Mutex::new(GcState {
                last_unlinked: Timestamp::NONE,
                to_deallocate: VecDeque::new(),
                to_unlink: VecDeque::new(),
                deferred: BinaryHeap::new(),
            }),
            indexes: RwLock::new(Vec::new()),
        }
    }

    /// Run one GC tick. Returns `(deallocated, unlinked)` transaction
    /// counts.
    pub fn perform_garbage_collection(&self) -> (u32, u32) {
        let mut state = self.state.lock();
        self.process_deferred_actions(&mut state);
        let deallocated = self.process_deallocate_queue(&mut state);
        tracing::trace!(deallocated, "gc deallocate phase");
        let unlinked = self.process_unlink_queue(&mut state);
        tracing::trace!(unlinked, "gc unlink phase");
        if unlinked > 0 {
            // Only move the horizon when something was unlinked;
            // otherwise deallocation becomes overly conservative.
            state.last_unlinked = self.txn_manager.current_time();
        }
        drop(state);
        self.process_indexes();
        (deallocated, unlinked)
    }

    /// Register an index for the per-tick GC hook. Registering the
    /// same index twice is a caller bug.
    pub fn register_index_for_gc(&self, index: Arc<dyn GarbageCollectedIndex>) {
        let mut indexes = self.indexes.write();
        assert!(
            !indexes.iter().any(|i| Arc::ptr_eq(i, &index)),
            "index already registered for GC"
        );
        indexes.push(index);
    }

    /// Unregister an index. Unregistering an unknown index is a
    /// caller bug.
    pub fn unregister_index_for_gc(&self, index: &Arc<dyn GarbageCollectedIndex>) {
        let mut indexes = self.indexes.write();
        let position = indexes.iter().position(|i| Arc::ptr_eq(i, index));
        match position {
            Some(position) => {
                indexes.swap_remove(position);
            }
            None => panic!("index was never registered for GC"),
        }
    }

    /// Phase 1: run every deferred action whose submission time is at
    /// or before the oldest running transaction.
    fn process_deferred_actions(&self, state: &mut GcState) {
        for (ts, action) in self.txn_manager.deferred_actions_for_gc() {
            state.deferred.push(DeferredEntry { ts, action });
        }
        let oldest = self.txn_manager.oldest_running_start_time();
        while let Some(front) = state.deferred.peek() {
            if front.ts.newer_than(oldest) {
                break;
            }
            if let Some(entry) = state.deferred.pop() {
                (entry.action)();
            }
        }
    }

    /// Phase 2: free transactions unlinked before the oldest running
    /// transaction began, once the WAL is done with them.
    fn process_deallocate_queue(&self, state: &mut GcState) -> u32 {
        let oldest = self.txn_manager.oldest_running_start_time();
        let mut deallocated = 0;

        if oldest.newer_than(state.last_unlinked) {
            // Everything here was unlinked before the oldest running
            // transaction began; no one can hold a reference.
            let mut requeue = VecDeque::new();
            while let Some(txn) = state.to_deallocate.pop_front() {
                if txn.log_processed() {
                    self.deallocate_transaction(txn);
                    deallocated += 1;
                } else {
                    // The WAL may still read this transaction's varlens.
                    requeue.push_front(txn);
                }
            }
            state.to_deallocate = requeue;
        }

        deallocated
    }

    /// Phase 3: truncate version chains of newly completed
    /// transactions that are behind the oldest running transaction.
    fn process_unlink_queue(&self, state: &mut GcState) -> u32 {
        let oldest = self.txn_manager.oldest_running_start_time();

        let completed = self.txn_manager.completed_transactions_for_gc();
        state.to_unlink.extend(completed);

        let mut unlinked = 0;
        let mut requeue = VecDeque::new();
        // Chains are newest-to-oldest and the safety horizon is read
        // once, so each chain needs truncating at most once per tick.
        let mut visited_slots: HashSet<TupleSlot> = HashSet::new();

        while let Some(txn) = state.to_unlink.pop_front() {
            if !txn.has_writes() {
                // Read-only, or aborted before its first write; nothing
                // is linked anywhere, so it can be freed immediately.
                self.deallocate_transaction(txn);
                unlinked += 1;
            } else if oldest.newer_than(txn.finish_ts()) {
                let aborted = txn.aborted();
                {
                    let undo = txn.undo_buffer();
                    for record in undo.iter() {
                        if let Some(table) = record.table() {
                            if visited_slots.insert(record.slot()) {
                                self.truncate_version_chain(&table, record.slot(), oldest);
                            }
                            // Deleted slots and superseded varlens are
                            // reclaimed unless the abort already rolled
                            // the versions back into visibility.
                            if !aborted {
                                self.reclaim_buffer_if_varlen(&txn, record, &table);
                                self.reclaim_slot_if_deleted(record, &table);
                            }
                        }
                    }
                }
                state.to_deallocate.push_front(txn);
                unlinked += 1;
            } else {
                // Still visible to some running transaction.
                requeue.push_front(txn);
            }
        }

        state.to_unlink = requeue;
        unlinked
    }

    /// Phase 4: give every registered index a chance to reclaim.
    fn process_indexes(&self) {
        let indexes = self.indexes.read();
        for index in indexes.iter() {
            index.perform_garbage_collection();
        }
    }

    /// Cut every chain node at `slot` that no running transaction can
    /// observe.
    fn truncate_version_chain(&self, table: &Arc<DataTable>, slot: TupleSlot, oldest: Timestamp) {
        'restart: loop {
            let head_ptr = table.atomic_read_version_ptr(slot);
            if head_ptr == NULL_UNDO {
                // Legitimate: the previous head aborted and the chain
                // emptied under us.
                return;
            }
            let Some(head) = self.registry.resolve(head_ptr) else {
                return;
            };

            // The head needs a CAS: contention with running writers
            // happens here. If even the head is behind the horizon the
            // whole chain goes.
            if oldest.newer_than(head.timestamp()) {
                if !table.compare_and_swap_version_ptr(slot, head_ptr, NULL_UNDO) {
                    continue 'restart;
                }
                return;
            }

            // Interior links are stable under single-threaded GC; no
            // CAS needed past the head.
            let mut curr = head.clone();
            loop {
                let next_ptr = curr.next();
                if next_ptr == NULL_UNDO {
                    return;
                }
                let Some(next) = self.registry.resolve(next_ptr) else {
                    return;
                };
                if oldest.newer_than(next.timestamp()) {
                    break;
                }
                curr = next;
            }
            // Everything below `curr` is invisible to all running
            // transactions; chains are newest-to-oldest.
            curr.set_next(NULL_UNDO);

            // If the head was uncommitted and has since been replaced
            // (the running transaction aborted), retry.
            if Arc::ptr_eq(&curr, &head)
                && !head.timestamp().is_committed()
                && table.atomic_read_version_ptr(slot) != head_ptr
            {
                continue 'restart;
            }
            return;
        }
    }

    /// Return a deleted tuple's slot to its block's free list.
    fn reclaim_slot_if_deleted(&self, record: &UndoRecord, table: &Arc<DataTable>) {
        if record.kind() == DeltaKind::Delete {
            table.deallocate(record.slot());
        }
    }

    /// Move superseded varlen payloads onto the transaction's loose
    /// pointer list; they are freed when the transaction is
    /// deallocated in phase 2.
    fn reclaim_buffer_if_varlen(
        &self,
        txn: &Arc<TransactionContext>,
        record: &UndoRecord,
        table: &Arc<DataTable>,
    ) {
        let layout = table.layout();
        match record.kind() {
            // No varlen logically existed before an insert.
            DeltaKind::Insert => {}
            DeltaKind::Delete => {
                for col in 0..layout.num_columns() {
                    if !layout.is_varlen(col) {
                        continue;
                    }
                    if let Some(AttrValue::Varlen(entry)) =
                        table.access_with_null_check(record.slot(), col)
                    {
                        if entry.needs_reclaim() {
                            if let Some(buffer) = entry.buffer() {
                                txn.add_loose_varlen(buffer.clone());
                            }
                        }
                    }
                }
            }
            DeltaKind::Update => {
                let Some(delta) = record.delta() else { return };
                for (col, value) in delta.columns() {
                    if !layout.is_varlen(col) {
                        continue;
                    }
                    if let Some(AttrValue::Varlen(entry)) = value {
                        if entry.needs_reclaim() {
                            if let Some(buffer) = entry.buffer() {
                                txn.add_loose_varlen(buffer.clone());
                            }
                        }
                    }
                }
            }
        }
    }

    /// Drop the final reference to a finished transaction, releasing
    /// its undo records and loose varlen buffers.
    fn deallocate_transaction(&self, txn: Arc<TransactionContext>) {
        {
            let undo = txn.undo_buffer();
            for record in undo.iter() {
                self.registry.unregister(record.id());
            }
        }
        drop(txn);
    }
}
