//! TalonDB - the concurrency and durability core of a multi-version
//! OLTP storage engine
//!
//! Features:
//! - MVCC with newest-to-oldest version chains and timestamp ordering
//! - Two-stage asynchronous write-ahead log with durable commit callbacks
//! - Cooperative garbage collection of versions, slots, and transactions

pub mod storage;
pub mod txn;
pub mod wal;
