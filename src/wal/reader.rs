//! Sequential reader for the flat log format
//!
//! The log is a bare sequence of records: no file header, no
//! checksums, no segmentation markers. The reader yields typed
//! records until the stream has fewer than four bytes left, and
//! treats an unknown record tag as fatal corruption.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use crate::storage::block::TupleSlot;
use crate::storage::projection::{AttrSpec, AttrValue, BlockLayout, ColId, ProjectedRow, VarlenEntry};
use crate::txn::Timestamp;
use crate::wal::record::{RECORD_TYPE_COMMIT, RECORD_TYPE_DELETE, RECORD_TYPE_REDO};
use crate::wal::{WalError, WalResult};

/// A record read back from the log.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplayRecord {
    Redo {
        txn_begin: Timestamp,
        db_oid: u32,
        table_oid: u32,
        slot: TupleSlot,
        delta: ProjectedRow,
    },
    Delete {
        txn_begin: Timestamp,
        db_oid: u32,
        table_oid: u32,
        slot: TupleSlot,
    },
    Commit {
        txn_begin: Timestamp,
        commit_ts: Timestamp,
    },
}

impl ReplayRecord {
    /// The begin timestamp of the transaction that produced the record.
    pub fn txn_begin(&self) -> Timestamp {
        match self {
            ReplayRecord::Redo { txn_begin, .. }
            | ReplayRecord::Delete { txn_begin, .. }
            | ReplayRecord::Commit { txn_begin, .. } => *txn_begin,
        }
    }

    /// Whether this is a commit record.
    pub fn is_commit(&self) -> bool {
        matches!(self, ReplayRecord::Commit { .. })
    }
}

/// Reads records sequentially from a log file.
pub struct BufferedLogReader {
    reader: BufReader<File>,
    layout: BlockLayout,
}

impl BufferedLogReader {
    /// Open a log file for replay. Redo payload widths are resolved
    /// against `layout`.
    pub fn open(path: &Path, layout: BlockLayout) -> WalResult<Self> {
        let file = File::open(path)?;
        Ok(Self { reader: BufReader::new(file), layout })
    }

    /// Read the next record, or `None` at end of stream.
    pub fn next_record(&mut self) -> WalResult<Option<ReplayRecord>> {
        let mut size_buf = [0u8; 4];
        match read_up_to(&mut self.reader, &mut size_buf)? {
            0 => return Ok(None),
            4 => {}
            // Fewer than four bytes left terminates the stream.
            _ => return Ok(None),
        }
        let size = u32::from_le_bytes(size_buf) as usize;

        let mut body = vec![0u8; size];
        let got = read_up_to(&mut self.reader, &mut body)?;
        if got < size {
            return Err(WalError::Truncated { expected: size - got });
        }

        let mut cursor = Cursor::new(&body);
        let tag = cursor.read_u8()?;
        let txn_begin = Timestamp::from_bits(cursor.read_u64()?);
        match tag {
            RECORD_TYPE_COMMIT => {
                let commit_ts = Timestamp::from_bits(cursor.read_u64()?);
                Ok(Some(ReplayRecord::Commit { txn_begin, commit_ts }))
            }
            RECORD_TYPE_DELETE => {
                let db_oid = cursor.read_u32()?;
                let table_oid = cursor.read_u32()?;
                let slot = TupleSlot::from_u64(cursor.read_u64()?);
                Ok(Some(ReplayRecord::Delete { txn_begin, db_oid, table_oid, slot }))
            }
            RECORD_TYPE_REDO => {
                let db_oid = cursor.read_u32()?;
                let table_oid = cursor.read_u32()?;
                let slot = TupleSlot::from_u64(cursor.read_u64()?);
                let delta = self.read_delta(&mut cursor)?;
                Ok(Some(ReplayRecord::Redo { txn_begin, db_oid, table_oid, slot, delta }))
            }
            tag => Err(WalError::CorruptRecord { tag }),
        }
    }

    fn read_delta(&self, cursor: &mut Cursor<'_>) -> WalResult<ProjectedRow> {
        let num_cols = cursor.read_u16()? as usize;
        let mut col_ids = Vec::with_capacity(num_cols);
        for _ in 0..num_cols {
            col_ids.push(cursor.read_u16()? as ColId);
        }
        let bitmap = cursor.read_bytes(num_cols.div_ceil(8))?.to_vec();

        let mut columns = Vec::with_capacity(num_cols);
        for (i, col) in col_ids.into_iter().enumerate() {
            if bitmap[i / 8] & (1 << (i % 8)) == 0 {
                columns.push((col, None));
                continue;
            }
            let value = match self.layout.attr(col) {
                AttrSpec::Varlen => {
                    let len = cursor.read_u32()? as usize;
                    let bytes = cursor.read_bytes(len)?;
                    AttrValue::Varlen(VarlenEntry::from_bytes(bytes))
                }
                AttrSpec::Fixed(width) => {
                    AttrValue::Fixed(cursor.read_bytes(width as usize)?.to_vec())
                }
            };
            columns.push((col, Some(value)));
        }
        Ok(ProjectedRow::from_columns(columns))
    }
}

/// Read as many bytes as the stream yields, up to `buf.len()`.
fn read_up_to(reader: &mut impl Read, buf: &mut [u8]) -> WalResult<usize> {
    let mut total = 0;
    while total < buf.len() {
        let got = reader.read(&mut buf[total..])?;
        if got == 0 {
            break;
        }
        total += got;
    }
    Ok(total)
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn read_bytes(&mut self, len: usize) -> WalResult<&'a [u8]> {
        if self.pos + len > self.bytes.len() {
            return Err(WalError::Truncated { expected: self.pos + len - self.bytes.len() });
        }
        let slice = &self.bytes[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn read_u8(&mut self) -> WalResult<u8> {
        Ok(self.read_bytes(1)?[0])
    }

    fn read_u16(&mut self) -> WalResult<u16> {
        let bytes = self.read_bytes(2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    fn read_u32(&mut self) -> WalResult<u32> {
        let b = self.read_bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_u64(&mut self) -> WalResult<u64> {
        let b = self.read_bytes(8)?;
        Ok(u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
    }
}
