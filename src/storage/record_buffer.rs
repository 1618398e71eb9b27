//! Per-transaction record buffers and the bounded segment pool
//!
//! Transactions append undo and redo entries into chains of
//! fixed-budget segments drawn from a shared pool. Segments are
//! recycled through the pool; when the pool is at its bound, `get`
//! blocks until another transaction releases a segment.

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

/// Byte budget of one record buffer segment.
pub const SEGMENT_SIZE: usize = 4096;

/// A record that can be stored in a buffer segment.
pub trait BufferRecord {
    /// Approximate in-memory size used for segment accounting.
    fn size_bytes(&self) -> usize;
}

/// A fixed-budget append-only run of records.
pub struct RecordBufferSegment<T> {
    records: Vec<T>,
    bytes_used: usize,
}

impl<T: BufferRecord> RecordBufferSegment<T> {
    fn new() -> Self {
        Self { records: Vec::new(), bytes_used: 0 }
    }

    /// Append a record, or hand it back if the segment is full. The
    /// first record always fits so oversized records cannot wedge a
    /// buffer.
    pub fn try_push(&mut self, record: T) -> Result<(), T> {
        let size = record.size_bytes();
        if !self.records.is_empty() && self.bytes_used + size > SEGMENT_SIZE {
            return Err(record);
        }
        self.bytes_used += size;
        self.records.push(record);
        Ok(())
    }

    /// Records in append order.
    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.records.iter()
    }

    /// Drain records in append order, retaining capacity.
    pub fn drain(&mut self) -> std::vec::Drain<'_, T> {
        self.bytes_used = 0;
        self.records.drain(..)
    }

    fn pop(&mut self) -> Option<T> {
        let record = self.records.pop();
        if let Some(record) = &record {
            self.bytes_used -= record.size_bytes();
        }
        record
    }

    /// Whether the segment holds no records.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Number of records in the segment.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    fn clear(&mut self) {
        self.records.clear();
        self.bytes_used = 0;
    }
}

struct PoolState<T> {
    free: Vec<RecordBufferSegment<T>>,
    created: usize,
}

/// Bounded pool of record buffer segments.
pub struct SegmentPool<T> {
    state: Mutex<PoolState<T>>,
    available: Condvar,
    max_segments: usize,
}

impl<T: BufferRecord> SegmentPool<T> {
    /// Create a pool bounded at `max_segments` live segments.
    pub fn new(max_segments: usize) -> Self {
        Self {
            state: Mutex::new(PoolState { free: Vec::new(), created: 0 }),
            available: Condvar::new(),
            max_segments,
        }
    }

    /// Take a segment, blocking while the pool is exhausted.
    pub fn get(&self) -> RecordBufferSegment<T> {
        let mut state = self.state.lock();
        loop {
            if let Some(segment) = state.free.pop() {
                return segment;
            }
            if state.created < self.max_segments {
                state.created += 1;
                return RecordBufferSegment::new();
            }
            self.available.wait(&mut state);
        }
    }

    /// Return a segment for reuse.
    pub fn release(&self, mut segment: RecordBufferSegment<T>) {
        segment.clear();
        self.state.lock().free.push(segment);
        self.available.notify_one();
    }

    /// Number of segments handed out and not yet returned.
    pub fn outstanding(&self) -> usize {
        let state = self.state.lock();
        state.created - state.free.len()
    }
}

/// An append-only buffer backed by a chain of pooled segments.
///
/// Dropping the buffer returns its segments to the pool.
pub struct RecordBuffer<T: BufferRecord> {
    pool: Arc<SegmentPool<T>>,
    segments: Vec<RecordBufferSegment<T>>,
}

impl<T: BufferRecord> RecordBuffer<T> {
    /// Create an empty buffer drawing from `pool`.
    pub fn new(pool: Arc<SegmentPool<T>>) -> Self {
        Self { pool, segments: Vec::new() }
    }

    /// Append a record, growing the segment chain as needed.
    pub fn push(&mut self, record: T) {
        let record = match self.segments.last_mut() {
            Some(segment) => match segment.try_push(record) {
                Ok(()) => return,
                Err(record) => record,
            },
            None => record,
        };
        let mut segment = self.pool.get();
        let pushed = segment.try_push(record);
        debug_assert!(pushed.is_ok());
        self.segments.push(segment);
    }

    /// Remove and return the most recently appended record.
    pub fn pop_last(&mut self) -> Option<T> {
        loop {
            match self.segments.last_mut() {
                None => return None,
                Some(segment) => {
                    if let Some(record) = segment.pop() {
                        return Some(record);
                    }
                }
            }
            if let Some(empty) = self.segments.pop() {
                self.pool.release(empty);
            }
        }
    }

    /// Records in append order.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &T> {
        self.segments.iter().flat_map(|s| s.iter())
    }

    /// Drain all records in append order, retaining the segments.
    pub fn drain_records(&mut self) -> impl Iterator<Item = T> + '_ {
        self.segments.iter_mut().flat_map(|s| s.drain())
    }

    /// Whether the buffer holds no records.
    pub fn is_empty(&self) -> bool {
        self.segments.iter().all(|s| s.is_empty())
    }

    /// Number of records in the buffer.
    pub fn len(&self) -> usize {
        self.segments.iter().map(|s| s.len()).sum()
    }
}

impl<T: BufferRecord> Drop for RecordBuffer<T> {
    fn drop(&mut self) {
        for segment in self.segments.drain(..) {
            self.pool.release(segment);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TestRecord(usize);

    impl BufferRecord for TestRecord {
        fn size_bytes(&self) -> usize {
            self.0
        }
    }

    #[test]
    fn test_segment_fills_and_rejects() {
        let mut segment: RecordBufferSegment<TestRecord> = RecordBufferSegment::new();
        assert!(segment.try_push(TestRecord(SEGMENT_SIZE - 10)).is_ok());
        assert!(segment.try_push(TestRecord(100)).is_err());
        assert_eq!(segment.len(), 1);
    }

    #[test]
    fn test_oversized_record_fits_empty_segment() {
        let mut segment: RecordBufferSegment<TestRecord> = RecordBufferSegment::new();
        assert!(segment.try_push(TestRecord(SEGMENT_SIZE * 2)).is_ok());
    }

    #[test]
    fn test_buffer_spills_to_new_segment() {
        let pool = Arc::new(SegmentPool::new(16));
        let mut buffer = RecordBuffer::new(pool.clone());
        for _ in 0..5 {
            buffer.push(TestRecord(SEGMENT_SIZE / 2 + 1));
        }
        assert_eq!(buffer.len(), 5);
        assert_eq!(pool.outstanding(), 5);

        drop(buffer);
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn test_buffer_iteration_order() {
        let pool = Arc::new(SegmentPool::new(16));
        let mut buffer = RecordBuffer::new(pool);
        for i in 0..10 {
            buffer.push(TestRecord(SEGMENT_SIZE / 3 + i));
        }
        let sizes: Vec<usize> = buffer.iter().map(|r| r.0).collect();
        let expected: Vec<usize> = (0..10).map(|i| SEGMENT_SIZE / 3 + i).collect();
        assert_eq!(sizes, expected);

        let reversed: Vec<usize> = buffer.iter().rev().map(|r| r.0).collect();
        let mut expected_rev = expected;
        expected_rev.reverse();
        assert_eq!(reversed, expected_rev);
    }

    #[test]
    fn test_pop_last_crosses_segments() {
        let pool = Arc::new(SegmentPool::new(16));
        let mut buffer = RecordBuffer::new(pool);
        buffer.push(TestRecord(SEGMENT_SIZE - 1));
        buffer.push(TestRecord(SEGMENT_SIZE - 2));
        assert_eq!(buffer.pop_last().map(|r| r.0), Some(SEGMENT_SIZE - 2));
        assert_eq!(buffer.pop_last().map(|r| r.0), Some(SEGMENT_SIZE - 1));
        assert_eq!(buffer.pop_last().map(|r| r.0), None);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_pool_recycles_segments() {
        let pool: SegmentPool<TestRecord> = SegmentPool::new(4);
        let a = pool.get();
        let b = pool.get();
        assert_eq!(pool.outstanding(), 2);
        pool.release(a);
        pool.release(b);
        assert_eq!(pool.outstanding(), 0);
        let _c = pool.get();
        assert_eq!(pool.outstanding(), 1);
    }
}
