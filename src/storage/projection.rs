//! Row projections and attribute values
//!
//! A [`ProjectedRow`] is a compact projection over a subset of a
//! table's columns: sorted column ids, a null bitmap, and per-column
//! values. Fixed-width attributes are carried as their exact bytes;
//! variable-length attributes are [`VarlenEntry`] values, inlined up
//! to 12 bytes and stored out of line above that.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Column identifier within a table layout.
pub type ColId = u16;

/// Varlen payloads at or below this size are stored inline.
pub const VARLEN_INLINE_THRESHOLD: usize = 12;

/// Gauge of out-of-line varlen buffers currently alive.
static LIVE_VARLEN_BUFFERS: AtomicUsize = AtomicUsize::new(0);

/// Number of out-of-line varlen buffers that have not been freed yet.
pub fn live_varlen_buffers() -> usize {
    LIVE_VARLEN_BUFFERS.load(Ordering::Acquire)
}

/// Physical description of one column.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AttrSpec {
    /// Fixed-width attribute of the given size in bytes.
    Fixed(u8),
    /// Variable-length attribute.
    Varlen,
}

/// Physical layout of a table's columns.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockLayout {
    attrs: Vec<AttrSpec>,
}

impl BlockLayout {
    /// Create a layout from per-column attribute specs.
    pub fn new(attrs: Vec<AttrSpec>) -> Self {
        debug_assert!(!attrs.is_empty(), "layout must have at least one column");
        debug_assert!(attrs.len() <= u16::MAX as usize);
        Self { attrs }
    }

    /// Number of columns in the layout.
    pub fn num_columns(&self) -> u16 {
        self.attrs.len() as u16
    }

    /// The attribute spec for a column.
    pub fn attr(&self, col: ColId) -> AttrSpec {
        self.attrs[col as usize]
    }

    /// Whether a column is variable-length.
    pub fn is_varlen(&self, col: ColId) -> bool {
        matches!(self.attrs[col as usize], AttrSpec::Varlen)
    }

    /// The width of a fixed-width column, or `None` for varlen columns.
    pub fn fixed_size(&self, col: ColId) -> Option<u8> {
        match self.attrs[col as usize] {
            AttrSpec::Fixed(size) => Some(size),
            AttrSpec::Varlen => None,
        }
    }
}

/// An out-of-line varlen payload.
///
/// Reference counted so a payload superseded by a newer version can
/// sit on a transaction's loose pointer list until the garbage
/// collector deallocates that transaction.
#[derive(Debug)]
pub struct VarlenBuffer {
    bytes: Box<[u8]>,
}

impl VarlenBuffer {
    /// Allocate a buffer holding the given bytes.
    pub fn allocate(bytes: &[u8]) -> Arc<Self> {
        LIVE_VARLEN_BUFFERS.fetch_add(1, Ordering::AcqRel);
        Arc::new(Self { bytes: bytes.into() })
    }

    /// The payload bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl Drop for VarlenBuffer {
    fn drop(&mut self) {
        LIVE_VARLEN_BUFFERS.fetch_sub(1, Ordering::AcqRel);
    }
}

#[derive(Clone, Debug)]
enum VarlenKind {
    Inline { len: u8, bytes: [u8; VARLEN_INLINE_THRESHOLD] },
    Outline { buffer: Arc<VarlenBuffer>, owned: bool },
}

/// A variable-length attribute value.
#[derive(Clone, Debug)]
pub struct VarlenEntry {
    kind: VarlenKind,
}

impl VarlenEntry {
    /// Build an entry from raw bytes, inlining when small enough.
    pub fn from_bytes(payload: &[u8]) -> Self {
        if payload.len() <= VARLEN_INLINE_THRESHOLD {
            let mut bytes = [0u8; VARLEN_INLINE_THRESHOLD];
            bytes[..payload.len()].copy_from_slice(payload);
            Self {
                kind: VarlenKind::Inline { len: payload.len() as u8, bytes },
            }
        } else {
            Self {
                kind: VarlenKind::Outline { buffer: VarlenBuffer::allocate(payload), owned: true },
            }
        }
    }

    /// Build an entry referencing an existing buffer without taking
    /// responsibility for reclaiming it.
    pub fn borrowed(buffer: Arc<VarlenBuffer>) -> Self {
        Self {
            kind: VarlenKind::Outline { buffer, owned: false },
        }
    }

    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        match &self.kind {
            VarlenKind::Inline { len, .. } => *len as usize,
            VarlenKind::Outline { buffer, .. } => buffer.as_bytes().len(),
        }
    }

    /// Whether the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The payload bytes.
    pub fn as_bytes(&self) -> &[u8] {
        match &self.kind {
            VarlenKind::Inline { len, bytes } => &bytes[..*len as usize],
            VarlenKind::Outline { buffer, .. } => buffer.as_bytes(),
        }
    }

    /// Whether this entry owns an out-of-line buffer that must be
    /// handed to the garbage collector when the value is superseded.
    pub fn needs_reclaim(&self) -> bool {
        matches!(&self.kind, VarlenKind::Outline { owned: true, .. })
    }

    /// The out-of-line buffer, if any.
    pub fn buffer(&self) -> Option<&Arc<VarlenBuffer>> {
        match &self.kind {
            VarlenKind::Inline { .. } => None,
            VarlenKind::Outline { buffer, .. } => Some(buffer),
        }
    }
}

impl PartialEq for VarlenEntry {
    fn eq(&self, other: &Self) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}

impl Eq for VarlenEntry {}

/// A single attribute value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AttrValue {
    /// Fixed-width attribute as its exact bytes.
    Fixed(Vec<u8>),
    /// Variable-length attribute.
    Varlen(VarlenEntry),
}

impl AttrValue {
    /// Approximate in-memory size, used for buffer segment accounting.
    pub(crate) fn approximate_size(&self) -> usize {
        match self {
            AttrValue::Fixed(bytes) => bytes.len(),
            AttrValue::Varlen(entry) => entry.len().min(VARLEN_INLINE_THRESHOLD) + 8,
        }
    }
}

/// A projection over a subset of a table's columns.
///
/// Column ids are kept sorted; a `None` value means the column is
/// null in this projection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProjectedRow {
    col_ids: Vec<ColId>,
    values: Vec<Option<AttrValue>>,
}

impl ProjectedRow {
    /// Build a projection from `(column id, value)` pairs. Pairs are
    /// sorted by column id; ids must be unique.
    pub fn from_columns(mut columns: Vec<(ColId, Option<AttrValue>)>) -> Self {
        columns.sort_by_key(|(col, _)| *col);
        debug_assert!(
            columns.windows(2).all(|w| w[0].0 < w[1].0),
            "duplicate column id in projection"
        );
        let (col_ids, values) = columns.into_iter().unzip();
        Self { col_ids, values }
    }

    /// Number of columns in the projection.
    pub fn num_columns(&self) -> u16 {
        self.col_ids.len() as u16
    }

    /// The sorted column ids.
    pub fn col_ids(&self) -> &[ColId] {
        &self.col_ids
    }

    /// The value at projection index `i`, or `None` if null.
    pub fn value_at(&self, i: usize) -> Option<&AttrValue> {
        self.values[i].as_ref()
    }

    /// Whether the column at projection index `i` is null.
    pub fn is_null(&self, i: usize) -> bool {
        self.values[i].is_none()
    }

    /// Iterate `(column id, value)` pairs in column id order.
    pub fn columns(&self) -> impl Iterator<Item = (ColId, Option<&AttrValue>)> {
        self.col_ids
            .iter()
            .copied()
            .zip(self.values.iter().map(|v| v.as_ref()))
    }

    /// The null bitmap: bit `i` set means column `i` is *not* null.
    pub fn null_bitmap(&self) -> Vec<u8> {
        let mut bitmap = vec![0u8; self.col_ids.len().div_ceil(8)];
        for (i, value) in self.values.iter().enumerate() {
            if value.is_some() {
                bitmap[i / 8] |= 1 << (i % 8);
            }
        }
        bitmap
    }

    /// Approximate in-memory size, used for buffer segment accounting.
    pub(crate) fn approximate_size(&self) -> usize {
        let values: usize = self
            .values
            .iter()
            .flatten()
            .map(AttrValue::approximate_size)
            .sum();
        self.col_ids.len() * 2 + self.null_bitmap().len() + values
    }
}
