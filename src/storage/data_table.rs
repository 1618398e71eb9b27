//! MVCC data table primitives
//!
//! The table stores materialized tuples in blocks and maintains one
//! version chain per slot, headed by an atomic pointer. Writers stage
//! an undo record, link it at the head with a compare-and-swap, and
//! only then mutate the tuple in place; a failed CAS is a write-write
//! conflict and dooms the writing transaction. Readers reconstruct
//! the visible version by applying before-image deltas down the chain.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::storage::block::{Block, BlockStore, TupleData, TupleSlot};
use crate::storage::projection::{AttrValue, BlockLayout, ColId, ProjectedRow};
use crate::storage::undo::{DeltaKind, UndoPtr, UndoRecord, UndoRegistry, NULL_UNDO};
use crate::storage::{StorageError, StorageResult};
use crate::txn::context::TransactionContext;
use crate::wal::record::{DeleteRecord, LogRecord, RedoRecord};

/// An MVCC table over block-resident tuples.
pub struct DataTable {
    db_oid: u32,
    oid: u32,
    layout: BlockLayout,
    block_store: Arc<BlockStore>,
    registry: Arc<UndoRegistry>,
    blocks: RwLock<Vec<Arc<Block>>>,
}

fn apply_delta(values: &mut [Option<AttrValue>], delta: &ProjectedRow) {
    for (col, value) in delta.columns() {
        values[col as usize] = value.cloned();
    }
}

impl DataTable {
    /// Create an empty table.
    pub fn new(
        db_oid: u32,
        oid: u32,
        layout: BlockLayout,
        block_store: Arc<BlockStore>,
        registry: Arc<UndoRegistry>,
    ) -> Self {
        Self {
            db_oid,
            oid,
            layout,
            block_store,
            registry,
            blocks: RwLock::new(Vec::new()),
        }
    }

    /// The owning database oid.
    pub fn db_oid(&self) -> u32 {
        self.db_oid
    }

    /// This table's oid.
    pub fn oid(&self) -> u32 {
        self.oid
    }

    /// The table's column layout.
    pub fn layout(&self) -> &BlockLayout {
        &self.layout
    }

    /// Acquire-load the version chain head for a slot.
    pub fn atomic_read_version_ptr(&self, slot: TupleSlot) -> UndoPtr {
        match self.find_block(slot.block()) {
            Some(block) => block.slot(slot.offset()).version.load(Ordering::Acquire),
            None => NULL_UNDO,
        }
    }

    /// Compare-and-swap the version chain head for a slot.
    pub fn compare_and_swap_version_ptr(
        &self,
        slot: TupleSlot,
        expected: UndoPtr,
        new: UndoPtr,
    ) -> bool {
        let Some(block) = self.find_block(slot.block()) else {
            return false;
        };
        block
            .slot(slot.offset())
            .version
            .compare_exchange(expected, new, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Insert a new tuple, returning its slot.
    pub fn insert(
        self: &Arc<Self>,
        txn: &TransactionContext,
        row: ProjectedRow,
    ) -> StorageResult<TupleSlot> {
        if txn.aborted() {
            return Err(StorageError::TransactionAborted);
        }

        let (block, offset) = self.claim_slot()?;
        let slot = TupleSlot::new(block.id(), offset);

        let mut values = vec![None; self.layout.num_columns() as usize];
        apply_delta(&mut values, &row);
        *block.slot(offset).tuple.write() = Some(TupleData { deleted: false, values });

        let undo = txn.stage_undo(&self.registry, DeltaKind::Insert, self, slot, None);
        let installed = self.compare_and_swap_version_ptr(slot, NULL_UNDO, undo.id());
        debug_assert!(installed, "freshly claimed slot had a version chain");

        txn.stage_redo(LogRecord::Redo(RedoRecord {
            txn_begin: txn.begin_ts(),
            db_oid: self.db_oid,
            table_oid: self.oid,
            slot,
            delta: row,
        }));
        Ok(slot)
    }

    /// Apply an update delta to a tuple. Returns `false` on a
    /// write-write conflict, marking the transaction aborted.
    pub fn update(
        self: &Arc<Self>,
        txn: &TransactionContext,
        slot: TupleSlot,
        delta: &ProjectedRow,
    ) -> bool {
        if txn.aborted() {
            return false;
        }
        let Some(block) = self.find_block(slot.block()) else {
            txn.set_aborted();
            return false;
        };
        let slot_state = block.slot(slot.offset());

        let head = slot_state.version.load(Ordering::Acquire);
        if self.has_conflict(txn, head) {
            txn.set_aborted();
            return false;
        }

        // Before-image of the columns the delta touches.
        let before = {
            let guard = slot_state.tuple.read();
            let Some(tuple) = guard.as_ref() else {
                txn.set_aborted();
                return false;
            };
            if tuple.deleted {
                txn.set_aborted();
                return false;
            }
            ProjectedRow::from_columns(
                delta
                    .col_ids()
                    .iter()
                    .map(|&col| (col, tuple.values[col as usize].clone()))
                    .collect(),
            )
        };

        let undo = txn.stage_undo(&self.registry, DeltaKind::Update, self, slot, Some(before));
        undo.set_next(head);
        if slot_state
            .version
            .compare_exchange(head, undo.id(), Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            // Lost the race; the staged record was never linked.
            txn.discard_last_undo(&self.registry);
            txn.set_aborted();
            return false;
        }

        {
            let mut guard = slot_state.tuple.write();
            if let Some(tuple) = guard.as_mut() {
                apply_delta(&mut tuple.values, delta);
            }
        }

        txn.stage_redo(LogRecord::Redo(RedoRecord {
            txn_begin: txn.begin_ts(),
            db_oid: self.db_oid,
            table_oid: self.oid,
            slot,
            delta: delta.clone(),
        }));
        true
    }

    /// Logically delete a tuple. Returns `false` on a write-write
    /// conflict, marking the transaction aborted.
    pub fn delete(self: &Arc<Self>, txn: &TransactionContext, slot: TupleSlot) -> bool {
        if txn.aborted() {
            return false;
        }
        let Some(block) = self.find_block(slot.block()) else {
            txn.set_aborted();
            return false;
        };
        let slot_state = block.slot(slot.offset());

        let head = slot_state.version.load(Ordering::Acquire);
        if self.has_conflict(txn, head) {
            txn.set_aborted();
            return false;
        }

        // Full before-image so an abort can resurrect the tuple.
        let before = {
            let guard = slot_state.tuple.read();
            let Some(tuple) = guard.as_ref() else {
                txn.set_aborted();
                return false;
            };
            if tuple.deleted {
                txn.set_aborted();
                return false;
            }
            ProjectedRow::from_columns(
                (0..self.layout.num_columns())
                    .map(|col| (col as ColId, tuple.values[col as usize].clone()))
                    .collect(),
            )
        };

        let undo = txn.stage_undo(&self.registry, DeltaKind::Delete, self, slot, Some(before));
        undo.set_next(head);
        if slot_state
            .version
            .compare_exchange(head, undo.id(), Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            txn.discard_last_undo(&self.registry);
            txn.set_aborted();
            return false;
        }

        {
            let mut guard = slot_state.tuple.write();
            if let Some(tuple) = guard.as_mut() {
                tuple.deleted = true;
            }
        }

        txn.stage_redo(LogRecord::Delete(DeleteRecord {
            txn_begin: txn.begin_ts(),
            db_oid: self.db_oid,
            table_oid: self.oid,
            slot,
        }));
        true
    }

    /// Materialize the version of a tuple visible to `txn`, or `None`
    /// if no visible version exists.
    pub fn select(&self, txn: &TransactionContext, slot: TupleSlot) -> Option<ProjectedRow> {
        let block = self.find_block(slot.block())?;
        let slot_state = block.slot(slot.offset());

        loop {
            let head = slot_state.version.load(Ordering::Acquire);
            let (mut values, mut deleted) = {
                let guard = slot_state.tuple.read();
                let tuple = guard.as_ref()?;
                (tuple.values.clone(), tuple.deleted)
            };
            // A writer may have installed a new version while we were
            // copying; retry so the copy and the chain agree.
            if slot_state.version.load(Ordering::Acquire) != head {
                continue;
            }

            // Roll the copy back until the first visible version.
            let mut present = true;
            let mut ptr = head;
            while ptr != NULL_UNDO {
                let Some(record) = self.registry.resolve(ptr) else {
                    // The tail was truncated beneath us; what remains is
                    // older than every running transaction.
                    break;
                };
                if txn.can_see(record.timestamp()) {
                    break;
                }
                match record.kind() {
                    DeltaKind::Update => {
                        if let Some(delta) = record.delta() {
                            apply_delta(&mut values, delta);
                        }
                    }
                    DeltaKind::Delete => {
                        deleted = false;
                        if let Some(delta) = record.delta() {
                            apply_delta(&mut values, delta);
                        }
                    }
                    DeltaKind::Insert => {
                        present = false;
                        break;
                    }
                }
                ptr = record.next();
            }

            if !present || deleted {
                return None;
            }
            return Some(ProjectedRow::from_columns(
                (0..self.layout.num_columns())
                    .map(|col| (col as ColId, values[col as usize].clone()))
                    .collect(),
            ));
        }
    }

    /// Return a slot to its block's free list. The caller has proved
    /// no version of the tuple is live.
    pub fn deallocate(&self, slot: TupleSlot) {
        if let Some(block) = self.find_block(slot.block()) {
            block.deallocate(slot.offset());
        }
    }

    /// Read one column of the base tuple, `None` if the slot is vacant
    /// or the column is null. Deleted tuples are still readable here;
    /// the GC scans them for varlen payloads.
    pub fn access_with_null_check(&self, slot: TupleSlot, col: ColId) -> Option<AttrValue> {
        let block = self.find_block(slot.block())?;
        let guard = block.slot(slot.offset()).tuple.read();
        guard.as_ref()?.values[col as usize].clone()
    }

    /// Roll back the tuple mutation described by `record`.
    pub(crate) fn rollback_undo_record(&self, record: &UndoRecord) {
        let Some(block) = self.find_block(record.slot().block()) else {
            return;
        };
        let mut guard = block.slot(record.slot().offset()).tuple.write();
        let Some(tuple) = guard.as_mut() else {
            return;
        };
        match record.kind() {
            DeltaKind::Insert => tuple.deleted = true,
            DeltaKind::Update => {
                if let Some(delta) = record.delta() {
                    apply_delta(&mut tuple.values, delta);
                }
            }
            DeltaKind::Delete => {
                tuple.deleted = false;
                if let Some(delta) = record.delta() {
                    apply_delta(&mut tuple.values, delta);
                }
            }
        }
    }

    /// Unlink `record` from its slot's version chain: CAS at the head,
    /// pointer surgery in the interior.
    pub(crate) fn unlink_undo_record(&self, record: &UndoRecord) {
        let Some(block) = self.find_block(record.slot().block()) else {
            return;
        };
        let slot_state = block.slot(record.slot().offset());
        loop {
            let head = slot_state.version.load(Ordering::Acquire);
            if head == record.id() {
                if slot_state
                    .version
                    .compare_exchange(head, record.next(), Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    return;
                }
                // A new writer installed itself above us; retry.
                continue;
            }
            let mut ptr = head;
            while ptr != NULL_UNDO {
                let Some(curr) = self.registry.resolve(ptr) else {
                    break;
                };
                if curr.next() == record.id() {
                    curr.set_next(record.next());
                    return;
                }
                ptr = curr.next();
            }
            // Not on the chain any more; already unlinked.
            return;
        }
    }

    fn has_conflict(&self, txn: &TransactionContext, head: UndoPtr) -> bool {
        if head == NULL_UNDO {
            return false;
        }
        let Some(record) = self.registry.resolve(head) else {
            // Truncated chain: every version is older than any running
            // transaction, so no conflict is possible.
            return false;
        };
        let ts = record.timestamp();
        if ts.is_committed() {
            // Committed after this transaction began.
            ts.newer_than(txn.begin_ts())
        } else {
            // Someone else's uncommitted write.
            ts != txn.begin_ts()
        }
    }

    fn claim_slot(&self) -> StorageResult<(Arc<Block>, u32)> {
        {
            let blocks = self.blocks.read();
            for block in blocks.iter().rev() {
                if let Some(offset) = block.try_allocate() {
                    return Ok((block.clone(), offset));
                }
            }
        }
        let block = self.block_store.allocate_block()?;
        let Some(offset) = block.try_allocate() else {
            // Zero-capacity blocks are a configuration bug.
            return Err(StorageError::BlocksExhausted { limit: 0 });
        };
        self.blocks.write().push(block.clone());
        Ok((block, offset))
    }

    fn find_block(&self, id: u32) -> Option<Arc<Block>> {
        self.blocks.read().iter().find(|b| b.id() == id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::projection::AttrSpec;
    use crate::storage::record_buffer::SegmentPool;
    use crate::txn::Timestamp;

    struct Fixture {
        registry: Arc<UndoRegistry>,
        table: Arc<DataTable>,
        undo_pool: Arc<SegmentPool<Arc<UndoRecord>>>,
        redo_pool: Arc<SegmentPool<LogRecord>>,
    }

    impl Fixture {
        fn new() -> Self {
            let registry = Arc::new(UndoRegistry::new());
            let table = Arc::new(DataTable::new(
                1,
                1,
                BlockLayout::new(vec![AttrSpec::Fixed(8), AttrSpec::Fixed(4)]),
                Arc::new(BlockStore::new(8, 16)),
                registry.clone(),
            ));
            Self {
                registry,
                table,
                undo_pool: Arc::new(SegmentPool::new(64)),
                redo_pool: Arc::new(SegmentPool::new(64)),
            }
        }

        fn txn(&self, begin: u64) -> TransactionContext {
            TransactionContext::new(
                Timestamp::running(begin),
                self.undo_pool.clone(),
                self.redo_pool.clone(),
            )
        }

        fn commit(&self, txn: &TransactionContext, commit_raw: u64) {
            let commit_ts = Timestamp::committed(commit_raw);
            for record in txn.undo_buffer().iter() {
                record.set_timestamp(commit_ts);
            }
            txn.set_finish(commit_ts);
        }
    }

    fn row(a: u64, b: u32) -> ProjectedRow {
        ProjectedRow::from_columns(vec![
            (0, Some(AttrValue::Fixed(a.to_le_bytes().to_vec()))),
            (1, Some(AttrValue::Fixed(b.to_le_bytes().to_vec()))),
        ])
    }

    fn col0(value: u64) -> ProjectedRow {
        ProjectedRow::from_columns(vec![(0, Some(AttrValue::Fixed(value.to_le_bytes().to_vec())))])
    }

    #[test]
    fn test_insert_visible_to_self() {
        let fx = Fixture::new();
        let txn = fx.txn(10);
        let slot = fx.table.insert(&txn, row(1, 2)).unwrap();

        let selected = fx.table.select(&txn, slot).unwrap();
        assert_eq!(selected.value_at(0), Some(&AttrValue::Fixed(1u64.to_le_bytes().to_vec())));
    }

    #[test]
    fn test_uncommitted_insert_invisible_to_others() {
        let fx = Fixture::new();
        let writer = fx.txn(10);
        let slot = fx.table.insert(&writer, row(1, 2)).unwrap();

        let reader = fx.txn(11);
        assert!(fx.table.select(&reader, slot).is_none());
    }

    #[test]
    fn test_committed_insert_visible_to_later_txn() {
        let fx = Fixture::new();
        let writer = fx.txn(10);
        let slot = fx.table.insert(&writer, row(1, 2)).unwrap();
        fx.commit(&writer, 12);

        let later = fx.txn(13);
        assert!(fx.table.select(&later, slot).is_some());

        // A snapshot from before the commit still cannot see it.
        let earlier = fx.txn(11);
        assert!(fx.table.select(&earlier, slot).is_none());
    }

    #[test]
    fn test_update_preserves_old_version() {
        let fx = Fixture::new();
        let writer = fx.txn(10);
        let slot = fx.table.insert(&writer, row(1, 2)).unwrap();
        fx.commit(&writer, 11);

        let old_reader = fx.txn(12);
        let updater = fx.txn(13);
        assert!(fx.table.update(&updater, slot, &col0(99)));
        fx.commit(&updater, 14);

        // The earlier reader sees the pre-update value.
        let seen = fx.table.select(&old_reader, slot).unwrap();
        assert_eq!(seen.value_at(0), Some(&AttrValue::Fixed(1u64.to_le_bytes().to_vec())));

        // A later reader sees the update.
        let new_reader = fx.txn(15);
        let seen = fx.table.select(&new_reader, slot).unwrap();
        assert_eq!(seen.value_at(0), Some(&AttrValue::Fixed(99u64.to_le_bytes().to_vec())));
    }

    #[test]
    fn test_write_write_conflict_aborts() {
        let fx = Fixture::new();
        let writer = fx.txn(10);
        let slot = fx.table.insert(&writer, row(1, 2)).unwrap();
        fx.commit(&writer, 11);

        let t1 = fx.txn(12);
        let t2 = fx.txn(13);
        assert!(fx.table.update(&t1, slot, &col0(50)));
        assert!(!fx.table.update(&t2, slot, &col0(60)));
        assert!(t2.aborted());
        // The failed staging left no undo record behind.
        assert!(t2.undo_buffer().is_empty());
    }

    #[test]
    fn test_conflict_with_newer_committed_version() {
        let fx = Fixture::new();
        let writer = fx.txn(10);
        let slot = fx.table.insert(&writer, row(1, 2)).unwrap();
        fx.commit(&writer, 11);

        let stale = fx.txn(12);
        let fresh = fx.txn(13);
        assert!(fx.table.update(&fresh, slot, &col0(70)));
        fx.commit(&fresh, 14);

        // `stale` began before `fresh` committed; its write must fail.
        assert!(!fx.table.update(&stale, slot, &col0(80)));
        assert!(stale.aborted());
    }

    #[test]
    fn test_delete_hides_tuple() {
        let fx = Fixture::new();
        let writer = fx.txn(10);
        let slot = fx.table.insert(&writer, row(1, 2)).unwrap();
        fx.commit(&writer, 11);

        let deleter = fx.txn(12);
        assert!(fx.table.delete(&deleter, slot));
        fx.commit(&deleter, 14);

        // Deleted for transactions after the delete committed.
        let after = fx.txn(15);
        assert!(fx.table.select(&after, slot).is_none());

        // Still visible to a snapshot from before the delete.
        let before = fx.txn(13);
        assert!(fx.table.select(&before, slot).is_some());
    }

    #[test]
    fn test_update_after_delete_conflicts() {
        let fx = Fixture::new();
        let writer = fx.txn(10);
        let slot = fx.table.insert(&writer, row(1, 2)).unwrap();
        fx.commit(&writer, 11);

        let deleter = fx.txn(12);
        assert!(fx.table.delete(&deleter, slot));
        fx.commit(&deleter, 13);

        let updater = fx.txn(14);
        assert!(!fx.table.update(&updater, slot, &col0(5)));
        assert!(updater.aborted());
    }

    #[test]
    fn test_rollback_and_unlink_restores_tuple() {
        let fx = Fixture::new();
        let writer = fx.txn(10);
        let slot = fx.table.insert(&writer, row(1, 2)).unwrap();
        fx.commit(&writer, 11);

        let updater = fx.txn(12);
        assert!(fx.table.update(&updater, slot, &col0(42)));

        // Roll back and unlink, newest first, as abort does.
        let records: Vec<_> = updater.undo_buffer().iter().cloned().collect();
        for record in records.iter().rev() {
            fx.table.rollback_undo_record(record);
            fx.table.unlink_undo_record(record);
        }

        // The chain head is the insert again and the value is restored.
        let head = fx.table.atomic_read_version_ptr(slot);
        let head_record = fx.registry.resolve(head).unwrap();
        assert_eq!(head_record.kind(), DeltaKind::Insert);

        let reader = fx.txn(13);
        let seen = fx.table.select(&reader, slot).unwrap();
        assert_eq!(seen.value_at(0), Some(&AttrValue::Fixed(1u64.to_le_bytes().to_vec())));
    }

    #[test]
    fn test_version_chain_ordering() {
        let fx = Fixture::new();
        let writer = fx.txn(10);
        let slot = fx.table.insert(&writer, row(1, 2)).unwrap();
        fx.commit(&writer, 11);

        for i in 0..3u64 {
            let updater = fx.txn(20 + i);
            assert!(fx.table.update(&updater, slot, &col0(i)));
            fx.commit(&updater, 30 + i);
        }

        // Newest to oldest down the chain.
        let mut ptr = fx.table.atomic_read_version_ptr(slot);
        let mut last: Option<Timestamp> = None;
        while ptr != NULL_UNDO {
            let record = fx.registry.resolve(ptr).unwrap();
            if let Some(last) = last {
                assert!(last.newer_than(record.timestamp()));
            }
            last = Some(record.timestamp());
            ptr = record.next();
        }
    }
}
