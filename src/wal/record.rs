//! Log record types and their wire encoding
//!
//! Record layout (all integers little-endian):
//! ```text
//! +------------+-------------+-----------+------------------------+
//! | total_size | record_type | txn_begin | type-specific body     |
//! |  4 bytes   |   1 byte    |  8 bytes  |                        |
//! +------------+-------------+-----------+------------------------+
//! ```
//!
//! - `total_size` covers everything after itself
//! - COMMIT: commit_ts (8 bytes)
//! - REDO/DELETE: db_oid (4), table_oid (4), tuple_slot (8)
//! - REDO additionally: num_cols (2), col_ids (2 each), null bitmap
//!   (ceil(n/8), bit set = not null), then per-column payloads —
//!   fixed-width attributes bit-exact, varlen attributes prefixed
//!   with a 4-byte length. Pointers are never written.

use std::sync::Arc;

use crate::storage::block::TupleSlot;
use crate::storage::projection::{AttrValue, ProjectedRow};
use crate::storage::record_buffer::BufferRecord;
use crate::txn::context::TransactionContext;
use crate::txn::{CommitCallback, Timestamp};

/// Wire tag for a redo record.
pub const RECORD_TYPE_REDO: u8 = 0;
/// Wire tag for a delete record.
pub const RECORD_TYPE_DELETE: u8 = 1;
/// Wire tag for a commit record.
pub const RECORD_TYPE_COMMIT: u8 = 2;

/// Durable image of an insert or update.
pub struct RedoRecord {
    pub txn_begin: Timestamp,
    pub db_oid: u32,
    pub table_oid: u32,
    pub slot: TupleSlot,
    pub delta: ProjectedRow,
}

/// Durable image of a delete.
pub struct DeleteRecord {
    pub txn_begin: Timestamp,
    pub db_oid: u32,
    pub table_oid: u32,
    pub slot: TupleSlot,
}

/// Commit marker carrying the durable acknowledgment callback.
pub struct CommitRecord {
    pub txn_begin: Timestamp,
    pub commit_ts: Timestamp,
    pub callback: CommitCallback,
    pub txn: Arc<TransactionContext>,
}

/// A record in a transaction's redo buffer.
pub enum LogRecord {
    Redo(RedoRecord),
    Delete(DeleteRecord),
    Commit(CommitRecord),
}

impl RedoRecord {
    /// Encode the body (everything after `total_size`).
    pub fn encode_body(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.body_len());
        buf.push(RECORD_TYPE_REDO);
        buf.extend_from_slice(&self.txn_begin.to_bits().to_le_bytes());
        buf.extend_from_slice(&self.db_oid.to_le_bytes());
        buf.extend_from_slice(&self.table_oid.to_le_bytes());
        buf.extend_from_slice(&self.slot.to_u64().to_le_bytes());
        buf.extend_from_slice(&self.delta.num_columns().to_le_bytes());
        for col in self.delta.col_ids() {
            buf.extend_from_slice(&col.to_le_bytes());
        }
        buf.extend_from_slice(&self.delta.null_bitmap());
        for i in 0..self.delta.num_columns() as usize {
            match self.delta.value_at(i) {
                None => {}
                Some(AttrValue::Fixed(bytes)) => buf.extend_from_slice(bytes),
                Some(AttrValue::Varlen(entry)) => {
                    buf.extend_from_slice(&(entry.len() as u32).to_le_bytes());
                    buf.extend_from_slice(entry.as_bytes());
                }
            }
        }
        buf
    }

    fn body_len(&self) -> usize {
        let n = self.delta.num_columns() as usize;
        let payloads: usize = (0..n)
            .map(|i| match self.delta.value_at(i) {
                None => 0,
                Some(AttrValue::Fixed(bytes)) => bytes.len(),
                Some(AttrValue::Varlen(entry)) => 4 + entry.len(),
            })
            .sum();
        1 + 8 + 4 + 4 + 8 + 2 + 2 * n + n.div_ceil(8) + payloads
    }
}

impl DeleteRecord {
    /// Encode the body (everything after `total_size`).
    pub fn encode_body(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(25);
        buf.push(RECORD_TYPE_DELETE);
        buf.extend_from_slice(&self.txn_begin.to_bits().to_le_bytes());
        buf.extend_from_slice(&self.db_oid.to_le_bytes());
        buf.extend_from_slice(&self.table_oid.to_le_bytes());
        buf.extend_from_slice(&self.slot.to_u64().to_le_bytes());
        buf
    }
}

impl CommitRecord {
    /// Encode the body (everything after `total_size`). The callback
    /// is not part of the wire format.
    pub fn encode_body(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(17);
        buf.push(RECORD_TYPE_COMMIT);
        buf.extend_from_slice(&self.txn_begin.to_bits().to_le_bytes());
        buf.extend_from_slice(&self.commit_ts.to_bits().to_le_bytes());
        buf
    }
}

impl LogRecord {
    /// The wire tag for this record.
    pub fn record_type(&self) -> u8 {
        match self {
            LogRecord::Redo(_) => RECORD_TYPE_REDO,
            LogRecord::Delete(_) => RECORD_TYPE_DELETE,
            LogRecord::Commit(_) => RECORD_TYPE_COMMIT,
        }
    }

    /// The begin timestamp of the transaction that produced the record.
    pub fn txn_begin(&self) -> Timestamp {
        match self {
            LogRecord::Redo(r) => r.txn_begin,
            LogRecord::Delete(d) => d.txn_begin,
            LogRecord::Commit(c) => c.txn_begin,
        }
    }
}

impl BufferRecord for LogRecord {
    fn size_bytes(&self) -> usize {
        4 + match self {
            LogRecord::Redo(r) => r.body_len(),
            LogRecord::Delete(_) => 25,
            LogRecord::Commit(_) => 17,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::projection::{ColId, VarlenEntry};

    fn redo_with(delta: ProjectedRow) -> RedoRecord {
        RedoRecord {
            txn_begin: Timestamp::running(7),
            db_oid: 1,
            table_oid: 2,
            slot: TupleSlot::new(3, 4),
            delta,
        }
    }

    #[test]
    fn test_redo_body_len_matches_encoding() {
        let delta = ProjectedRow::from_columns(vec![
            (0 as ColId, Some(AttrValue::Fixed(vec![1, 2, 3, 4]))),
            (1, None),
            (2, Some(AttrValue::Varlen(VarlenEntry::from_bytes(b"abcdef")))),
        ]);
        let record = redo_with(delta);
        assert_eq!(record.encode_body().len(), record.body_len());
    }

    #[test]
    fn test_delete_body_layout() {
        let record = DeleteRecord {
            txn_begin: Timestamp::running(9),
            db_oid: 5,
            table_oid: 6,
            slot: TupleSlot::new(1, 2),
        };
        let body = record.encode_body();
        assert_eq!(body.len(), 25);
        assert_eq!(body[0], RECORD_TYPE_DELETE);
        assert_eq!(
            u64::from_le_bytes(body[1..9].try_into().unwrap()),
            Timestamp::running(9).to_bits()
        );
    }

    #[test]
    fn test_commit_body_layout() {
        let pool = std::sync::Arc::new(crate::storage::record_buffer::SegmentPool::new(4));
        let redo_pool = std::sync::Arc::new(crate::storage::record_buffer::SegmentPool::new(4));
        let txn = std::sync::Arc::new(TransactionContext::new(
            Timestamp::running(3),
            pool,
            redo_pool,
        ));
        let record = CommitRecord {
            txn_begin: Timestamp::running(3),
            commit_ts: Timestamp::committed(8),
            callback: Box::new(|| {}),
            txn,
        };
        let body = record.encode_body();
        assert_eq!(body.len(), 17);
        assert_eq!(body[0], RECORD_TYPE_COMMIT);
        assert_eq!(
            u64::from_le_bytes(body[9..17].try_into().unwrap()),
            Timestamp::committed(8).to_bits()
        );
    }
}
