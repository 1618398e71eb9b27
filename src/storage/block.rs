//! Blocks, tuple slots, and the block store
//!
//! A block is a fixed-capacity array of tuple slots. Each slot pairs
//! the materialized tuple with an atomic version pointer that heads
//! the slot's version chain. The block store is a bounded allocator
//! of blocks.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::storage::projection::AttrValue;
use crate::storage::{StorageError, StorageResult};

/// A physical row location: block id plus slot offset within the block.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TupleSlot {
    block: u32,
    offset: u32,
}

impl TupleSlot {
    /// Create a slot handle.
    pub fn new(block: u32, offset: u32) -> Self {
        Self { block, offset }
    }

    /// The owning block id.
    pub fn block(&self) -> u32 {
        self.block
    }

    /// The slot offset within the block.
    pub fn offset(&self) -> u32 {
        self.offset
    }

    /// Pack into the wire representation.
    pub fn to_u64(self) -> u64 {
        (u64::from(self.block) << 32) | u64::from(self.offset)
    }

    /// Unpack from the wire representation.
    pub fn from_u64(packed: u64) -> Self {
        Self {
            block: (packed >> 32) as u32,
            offset: packed as u32,
        }
    }
}

/// The materialized tuple stored in a slot.
///
/// Values span the full table layout; `None` means null. A deleted
/// tuple keeps its values until the garbage collector reclaims the
/// slot, because the delete's varlen payloads are scanned from here.
#[derive(Debug)]
pub(crate) struct TupleData {
    pub(crate) deleted: bool,
    pub(crate) values: Vec<Option<AttrValue>>,
}

/// One tuple slot: version chain head plus latched tuple storage.
pub(crate) struct Slot {
    pub(crate) version: AtomicU64,
    pub(crate) tuple: RwLock<Option<TupleData>>,
}

impl Slot {
    fn new() -> Self {
        Self {
            version: AtomicU64::new(0),
            tuple: RwLock::new(None),
        }
    }
}

/// A fixed-capacity array of tuple slots.
pub struct Block {
    id: u32,
    slots: Vec<Slot>,
    /// Offsets reclaimed by the garbage collector, reused before
    /// bumping `next_unused`.
    free: Mutex<Vec<u32>>,
    next_unused: AtomicU32,
}

impl Block {
    pub(crate) fn new(id: u32, capacity: u32) -> Self {
        Self {
            id,
            slots: (0..capacity).map(|_| Slot::new()).collect(),
            free: Mutex::new(Vec::new()),
            next_unused: AtomicU32::new(0),
        }
    }

    /// The block id.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Claim a free slot offset, or `None` if the block is full.
    pub(crate) fn try_allocate(&self) -> Option<u32> {
        if let Some(offset) = self.free.lock().pop() {
            return Some(offset);
        }
        let offset = self.next_unused.fetch_add(1, Ordering::AcqRel);
        if (offset as usize) < self.slots.len() {
            Some(offset)
        } else {
            // Undo the overshoot so the counter does not creep.
            self.next_unused.fetch_sub(1, Ordering::AcqRel);
            None
        }
    }

    /// Return a slot offset to the free list and clear its tuple.
    pub(crate) fn deallocate(&self, offset: u32) {
        let slot = self.slot(offset);
        *slot.tuple.write() = None;
        slot.version.store(0, Ordering::Release);
        self.free.lock().push(offset);
    }

    pub(crate) fn slot(&self, offset: u32) -> &Slot {
        &self.slots[offset as usize]
    }
}

struct BlockStoreState {
    allocated: usize,
    next_id: u32,
}

/// Bounded allocator of blocks.
pub struct BlockStore {
    max_blocks: usize,
    block_capacity: u32,
    state: Mutex<BlockStoreState>,
}

impl BlockStore {
    /// Create a store bounded at `max_blocks`, each holding
    /// `block_capacity` slots.
    pub fn new(max_blocks: usize, block_capacity: u32) -> Self {
        Self {
            max_blocks,
            block_capacity,
            state: Mutex::new(BlockStoreState { allocated: 0, next_id: 1 }),
        }
    }

    /// Allocate a fresh block.
    pub fn allocate_block(&self) -> StorageResult<Arc<Block>> {
        let mut state = self.state.lock();
        if state.allocated >= self.max_blocks {
            return Err(StorageError::BlocksExhausted { limit: self.max_blocks });
        }
        state.allocated += 1;
        let id = state.next_id;
        state.next_id += 1;
        Ok(Arc::new(Block::new(id, self.block_capacity)))
    }

    /// Return a block to the store.
    pub fn deallocate_block(&self, _block: &Arc<Block>) {
        let mut state = self.state.lock();
        debug_assert!(state.allocated > 0);
        state.allocated = state.allocated.saturating_sub(1);
    }

    /// Number of blocks currently allocated.
    pub fn allocated(&self) -> usize {
        self.state.lock().allocated
    }
}
