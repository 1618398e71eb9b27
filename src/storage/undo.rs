//! Undo records and the version chain registry
//!
//! Each write stages an [`UndoRecord`] holding the before-image needed
//! to roll the write back. Records are linked into per-slot version
//! chains, newest to oldest. Chain pointers are `u64` handles issued
//! by the [`UndoRegistry`] rather than raw pointers, so the head
//! pointer and the `next` links stay plain atomics that support
//! compare-and-swap, and a handle that outlives its record resolves to
//! nothing instead of dangling.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;

use crate::storage::block::TupleSlot;
use crate::storage::data_table::DataTable;
use crate::storage::projection::ProjectedRow;
use crate::storage::record_buffer::BufferRecord;
use crate::txn::Timestamp;

/// Handle to an undo record; `NULL_UNDO` terminates a chain.
pub type UndoPtr = u64;

/// The null chain pointer.
pub const NULL_UNDO: UndoPtr = 0;

/// The kind of write an undo record reverses.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeltaKind {
    Insert,
    Update,
    Delete,
}

/// One node of a version chain.
pub struct UndoRecord {
    id: UndoPtr,
    kind: DeltaKind,
    /// The writing transaction's begin timestamp until commit, the
    /// commit timestamp after.
    timestamp: AtomicU64,
    table: Weak<DataTable>,
    slot: TupleSlot,
    /// Next-older record in the chain.
    next: AtomicU64,
    /// Before-image of the touched columns (update) or of the whole
    /// tuple (delete). Inserts carry no delta.
    delta: Option<ProjectedRow>,
}

impl UndoRecord {
    /// This record's registry handle.
    pub fn id(&self) -> UndoPtr {
        self.id
    }

    /// The kind of write this record reverses.
    pub fn kind(&self) -> DeltaKind {
        self.kind
    }

    /// The slot this record's version chain belongs to.
    pub fn slot(&self) -> TupleSlot {
        self.slot
    }

    /// The owning table, unless it has been dropped.
    pub fn table(&self) -> Option<Arc<DataTable>> {
        self.table.upgrade()
    }

    /// The before-image delta, if any.
    pub fn delta(&self) -> Option<&ProjectedRow> {
        self.delta.as_ref()
    }

    /// The record's current timestamp.
    pub fn timestamp(&self) -> Timestamp {
        Timestamp::from_bits(self.timestamp.load(Ordering::Acquire))
    }

    /// Overwrite the timestamp; called once per record at commit.
    pub(crate) fn set_timestamp(&self, ts: Timestamp) {
        self.timestamp.store(ts.to_bits(), Ordering::Release);
    }

    /// The next-older record in the chain.
    pub fn next(&self) -> UndoPtr {
        self.next.load(Ordering::Acquire)
    }

    /// Store a new chain successor. Interior links are only written by
    /// the installing writer and the single-threaded GC.
    pub(crate) fn set_next(&self, next: UndoPtr) {
        self.next.store(next, Ordering::Release);
    }
}

impl BufferRecord for Arc<UndoRecord> {
    fn size_bytes(&self) -> usize {
        48 + self.delta.as_ref().map_or(0, ProjectedRow::approximate_size)
    }
}

/// Issues undo record handles and resolves them back to records.
///
/// Records are registered when staged and unregistered when the
/// garbage collector deallocates the owning transaction; a reader
/// holding a handle to an already-unregistered record sees the chain
/// as ended, which is exactly the state GC proved safe.
pub struct UndoRegistry {
    records: RwLock<HashMap<UndoPtr, Arc<UndoRecord>>>,
    // Handle 0 is the null pointer.
    next_id: AtomicU64,
}

impl UndoRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Build and register a record with a fresh handle.
    pub(crate) fn register(
        &self,
        kind: DeltaKind,
        table: &Arc<DataTable>,
        slot: TupleSlot,
        delta: Option<ProjectedRow>,
        ts: Timestamp,
    ) -> Arc<UndoRecord> {
        let id = self.next_id.fetch_add(1, Ordering::AcqRel);
        let record = Arc::new(UndoRecord {
            id,
            kind,
            timestamp: AtomicU64::new(ts.to_bits()),
            table: Arc::downgrade(table),
            slot,
            next: AtomicU64::new(NULL_UNDO),
            delta,
        });
        self.records.write().insert(id, record.clone());
        record
    }

    /// Resolve a handle, or `None` if the record has been reclaimed.
    pub fn resolve(&self, ptr: UndoPtr) -> Option<Arc<UndoRecord>> {
        if ptr == NULL_UNDO {
            return None;
        }
        self.records.read().get(&ptr).cloned()
    }

    /// Drop a record's registration.
    pub(crate) fn unregister(&self, ptr: UndoPtr) {
        self.records.write().remove(&ptr);
    }

    /// Number of registered records.
    pub fn record_count(&self) -> usize {
        self.records.read().len()
    }
}

impl Default for UndoRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::data_table::DataTable;
    use crate::storage::projection::{AttrSpec, BlockLayout};
    use crate::storage::BlockStore;

    fn test_table(registry: &Arc<UndoRegistry>) -> Arc<DataTable> {
        let store = Arc::new(BlockStore::new(4, 8));
        Arc::new(DataTable::new(
            1,
            1,
            BlockLayout::new(vec![AttrSpec::Fixed(8)]),
            store,
            registry.clone(),
        ))
    }

    #[test]
    fn test_register_resolve_unregister() {
        let registry = Arc::new(UndoRegistry::new());
        let table = test_table(&registry);
        let slot = TupleSlot::new(1, 0);

        let record = registry.register(DeltaKind::Insert, &table, slot, None, Timestamp::running(5));
        assert_ne!(record.id(), NULL_UNDO);
        assert_eq!(registry.record_count(), 1);

        let resolved = registry.resolve(record.id()).unwrap();
        assert_eq!(resolved.slot(), slot);
        assert_eq!(resolved.kind(), DeltaKind::Insert);
        assert!(!resolved.timestamp().is_committed());

        registry.unregister(record.id());
        assert!(registry.resolve(record.id()).is_none());
        assert_eq!(registry.record_count(), 0);
    }

    #[test]
    fn test_null_never_resolves() {
        let registry = UndoRegistry::new();
        assert!(registry.resolve(NULL_UNDO).is_none());
    }

    #[test]
    fn test_timestamp_rewrite() {
        let registry = Arc::new(UndoRegistry::new());
        let table = test_table(&registry);
        let record = registry.register(
            DeltaKind::Update,
            &table,
            TupleSlot::new(1, 0),
            None,
            Timestamp::running(3),
        );

        record.set_timestamp(Timestamp::committed(9));
        assert!(record.timestamp().is_committed());
        assert_eq!(record.timestamp().raw(), 9);
    }

    #[test]
    fn test_chain_linking() {
        let registry = Arc::new(UndoRegistry::new());
        let table = test_table(&registry);
        let slot = TupleSlot::new(1, 0);

        let older = registry.register(DeltaKind::Update, &table, slot, None, Timestamp::committed(2));
        let newer = registry.register(DeltaKind::Update, &table, slot, None, Timestamp::running(4));

        newer.set_next(older.id());
        assert_eq!(newer.next(), older.id());
        assert_eq!(older.next(), NULL_UNDO);
    }
}
