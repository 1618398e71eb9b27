//! Shared workload harness for integration tests
//!
//! Simulates an OLTP mix of updates and selects over a small table,
//! optionally bookkeeping every committed delta and commit timestamp
//! so tests can cross-check the durable log against what actually
//! happened.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use rand::Rng;

use talondb::storage::{
    AttrSpec, AttrValue, BlockLayout, BlockStore, DataTable, ProjectedRow, TupleSlot, VarlenEntry,
};
use talondb::txn::{Timestamp, TransactionManager};

/// Workload shape knobs.
pub struct WorkloadConfig {
    pub num_txns: u32,
    pub txn_length: u32,
    /// Probability that an operation is an update (the rest select).
    pub update_ratio: f64,
    pub num_threads: u32,
    pub bookkeeping: bool,
}

/// What one committed transaction did.
pub struct CommittedTxn {
    pub begin: Timestamp,
    pub commit: Timestamp,
    /// Staged deltas keyed by slot; at most one write per slot per
    /// transaction, so log records match one-to-one.
    pub updates: HashMap<TupleSlot, ProjectedRow>,
}

/// Outcome of a workload run.
pub struct WorkloadResult {
    pub committed: Vec<CommittedTxn>,
    pub aborted: u32,
    pub callbacks_fired: Arc<AtomicUsize>,
    /// Commit timestamps of writing transactions, in callback order.
    pub callback_order: Arc<Mutex<Vec<Timestamp>>>,
}

/// A populated table plus the transaction manager driving it.
pub struct WorkloadHarness {
    pub manager: Arc<TransactionManager>,
    pub table: Arc<DataTable>,
    pub slots: Vec<TupleSlot>,
    /// The transaction that populated the table.
    pub bootstrap: CommittedTxn,
}

/// Layout used by every harness table: two fixed columns and one
/// varlen column.
pub fn harness_layout() -> BlockLayout {
    BlockLayout::new(vec![AttrSpec::Fixed(8), AttrSpec::Fixed(4), AttrSpec::Varlen])
}

fn random_value(rng: &mut impl Rng, layout: &BlockLayout, col: u16) -> Option<AttrValue> {
    // A sprinkling of nulls keeps the bitmap paths honest.
    if rng.gen_bool(0.1) {
        return None;
    }
    Some(match layout.fixed_size(col) {
        Some(width) => {
            let mut bytes = vec![0u8; width as usize];
            rng.fill(bytes.as_mut_slice());
            AttrValue::Fixed(bytes)
        }
        None => {
            // Straddle the inline threshold in both directions.
            let len = rng.gen_range(0..24);
            let mut bytes = vec![0u8; len];
            rng.fill(bytes.as_mut_slice());
            AttrValue::Varlen(VarlenEntry::from_bytes(&bytes))
        }
    })
}

fn random_full_row(rng: &mut impl Rng, layout: &BlockLayout) -> ProjectedRow {
    ProjectedRow::from_columns(
        (0..layout.num_columns())
            .map(|col| (col, random_value(rng, layout, col)))
            .collect(),
    )
}

fn random_delta(rng: &mut impl Rng, layout: &BlockLayout) -> ProjectedRow {
    let mut cols: Vec<u16> = (0..layout.num_columns()).collect();
    let keep = rng.gen_range(1..=cols.len());
    for _ in 0..cols.len() - keep {
        let idx = rng.gen_range(0..cols.len());
        cols.swap_remove(idx);
    }
    ProjectedRow::from_columns(
        cols.into_iter()
            .map(|col| (col, random_value(rng, layout, col)))
            .collect(),
    )
}

impl WorkloadHarness {
    /// Populate a fresh table with `initial_table_size` rows through a
    /// single bootstrap transaction.
    pub fn new(manager: Arc<TransactionManager>, initial_table_size: u32) -> Self {
        let layout = harness_layout();
        let table = Arc::new(DataTable::new(
            1,
            1,
            layout.clone(),
            Arc::new(BlockStore::new(64, 1024)),
            manager.undo_registry().clone(),
        ));

        let mut rng = rand::thread_rng();
        let txn = manager.begin();
        let mut slots = Vec::with_capacity(initial_table_size as usize);
        let mut updates = HashMap::new();
        for _ in 0..initial_table_size {
            let row = random_full_row(&mut rng, &layout);
            let slot = table.insert(&txn, row.clone()).unwrap();
            updates.insert(slot, row);
            slots.push(slot);
        }
        let commit = manager.commit(&txn, Box::new(|| {})).unwrap();
        let bootstrap = CommittedTxn { begin: txn.begin_ts(), commit, updates };

        Self { manager, table, slots, bootstrap }
    }

    /// Run the configured mix over worker threads.
    pub fn run(&self, config: &WorkloadConfig) -> WorkloadResult {
        let committed = Mutex::new(Vec::new());
        let aborted = AtomicU32::new(0);
        let callbacks_fired = Arc::new(AtomicUsize::new(0));
        let callback_order = Arc::new(Mutex::new(Vec::new()));
        let next_txn = AtomicU32::new(0);

        std::thread::scope(|scope| {
            for _ in 0..config.num_threads {
                scope.spawn(|| {
                    let mut rng = rand::thread_rng();
                    while next_txn.fetch_add(1, Ordering::SeqCst) < config.num_txns {
                        let outcome = self.run_one_transaction(
                            config,
                            &mut rng,
                            &callbacks_fired,
                            &callback_order,
                        );
                        match outcome {
                            Some(txn) => {
                                if config.bookkeeping {
                                    committed.lock().unwrap().push(txn);
                                }
                            }
                            None => {
                                aborted.fetch_add(1, Ordering::SeqCst);
                            }
                        }
                    }
                });
            }
        });

        WorkloadResult {
            committed: committed.into_inner().unwrap(),
            aborted: aborted.load(Ordering::SeqCst),
            callbacks_fired,
            callback_order,
        }
    }

    fn run_one_transaction(
        &self,
        config: &WorkloadConfig,
        rng: &mut impl Rng,
        callbacks_fired: &Arc<AtomicUsize>,
        callback_order: &Arc<Mutex<Vec<Timestamp>>>,
    ) -> Option<CommittedTxn> {
        let layout = harness_layout();
        let txn = self.manager.begin();
        let mut updates = HashMap::new();

        for _ in 0..config.txn_length {
            if txn.aborted() {
                break;
            }
            let slot = self.slots[rng.gen_range(0..self.slots.len())];
            if rng.gen_bool(config.update_ratio) {
                if updates.contains_key(&slot) {
                    // One write per slot per transaction keeps the
                    // bookkeeping one-to-one with log records.
                    continue;
                }
                let delta = random_delta(rng, &layout);
                if self.table.update(&txn, slot, &delta) {
                    updates.insert(slot, delta);
                }
            } else {
                self.table.select(&txn, slot);
            }
        }

        if txn.aborted() {
            self.manager.abort(&txn).unwrap();
            return None;
        }

        let fired = callbacks_fired.clone();
        let order = callback_order.clone();
        let txn_for_callback = txn.clone();
        let commit = self
            .manager
            .commit(
                &txn,
                Box::new(move || {
                    fired.fetch_add(1, Ordering::SeqCst);
                    if txn_for_callback.has_writes() {
                        order
                            .lock()
                            .unwrap()
                            .push(txn_for_callback.finish_ts());
                    }
                }),
            )
            .unwrap();

        Some(CommittedTxn { begin: txn.begin_ts(), commit, updates })
    }
}
