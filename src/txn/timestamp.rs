//! Logical timestamps with an embedded running bit
//!
//! All timestamps are drawn from a single monotonic 64-bit counter.
//! Bit 63 distinguishes a *running* transaction's begin timestamp (1)
//! from a *committed* timestamp (0). Every ordering decision in the
//! engine goes through [`Timestamp::newer_than`] so the
//! running/committed distinction lives in exactly one place.

use std::fmt;

/// Bit 63 marks a timestamp as belonging to a still-running transaction.
const RUNNING_BIT: u64 = 1 << 63;

/// A logical timestamp: 63 bits of counter value plus the running bit.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Sentinel meaning "no transaction". The global counter starts at 1,
    /// so no real timestamp ever carries a raw value of 0.
    pub const NONE: Timestamp = Timestamp(0);

    /// A committed timestamp for the given counter value.
    pub fn committed(raw: u64) -> Self {
        debug_assert!(raw & RUNNING_BIT == 0, "counter overflowed into the running bit");
        Timestamp(raw)
    }

    /// A running (begin) timestamp for the given counter value.
    pub fn running(raw: u64) -> Self {
        debug_assert!(raw & RUNNING_BIT == 0, "counter overflowed into the running bit");
        Timestamp(raw | RUNNING_BIT)
    }

    /// Reconstruct a timestamp from its wire representation.
    pub fn from_bits(bits: u64) -> Self {
        Timestamp(bits)
    }

    /// The wire representation: raw counter value plus the running bit.
    pub fn to_bits(self) -> u64 {
        self.0
    }

    /// The counter value with the running bit masked off.
    pub fn raw(self) -> u64 {
        self.0 & !RUNNING_BIT
    }

    /// Whether this timestamp belongs to a committed transaction.
    pub fn is_committed(self) -> bool {
        self.0 & RUNNING_BIT == 0
    }

    /// Whether `self` is strictly newer than `other`.
    ///
    /// Compares the 63-bit masked counter values; on a masked tie a
    /// running timestamp is newer than a committed one. Because the
    /// counter is shared, masked values order events regardless of
    /// which form they were handed out in.
    pub fn newer_than(self, other: Timestamp) -> bool {
        let (a, b) = (self.raw(), other.raw());
        if a != b {
            return a > b;
        }
        !self.is_committed() && other.is_committed()
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_committed() {
            write!(f, "committed({})", self.raw())
        } else {
            write!(f, "running({})", self.raw())
        }
    }
}
