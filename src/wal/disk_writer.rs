//! Disk log writer task (pipeline stage B)
//!
//! Pops filled buffers from the serializer, appends their bytes to
//! the log file, and syncs when the persist interval elapses, the
//! unpersisted-byte threshold is crossed, a persist was requested, or
//! the pipeline is shutting down. Commit callbacks run only after a
//! successful sync, in the order the serializer observed their commit
//! records; no acknowledgment can precede durability.

use std::fs::File;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::Sender;

use crate::wal::manager::{CommitEntry, DegradedState, FilledQueue, LogBuffer};

pub(crate) struct DiskLogWriterTask {
    file: File,
    filled: Arc<FilledQueue>,
    empty_buffers: Sender<LogBuffer>,
    degraded: Arc<DegradedState>,
    run: Arc<AtomicBool>,
    persist_interval: Duration,
    persist_threshold: u64,
    /// Bytes written to the file since the last sync.
    unpersisted: u64,
    /// Length of the file up to the last fully written buffer; a
    /// failed write truncates back to here so no torn record survives.
    written_len: u64,
    /// Callbacks covered by those bytes, in serialization order.
    pending_callbacks: Vec<CommitEntry>,
}

impl DiskLogWriterTask {
    pub(crate) fn new(
        file: File,
        filled: Arc<FilledQueue>,
        empty_buffers: Sender<LogBuffer>,
        degraded: Arc<DegradedState>,
        run: Arc<AtomicBool>,
        persist_interval: Duration,
        persist_threshold: u64,
    ) -> Self {
        let written_len = file.metadata().map(|m| m.len()).unwrap_or(0);
        Self {
            file,
            filled,
            empty_buffers,
            degraded,
            run,
            persist_interval,
            persist_threshold,
            unpersisted: 0,
            written_len,
            pending_callbacks: Vec::new(),
        }
    }

    pub(crate) fn run(mut self) {
        tracing::info!("disk log writer task started");
        loop {
            let timed_out = {
                // While degraded, always back off for the persist
                // interval instead of spinning on a failing disk.
                let degraded = self.is_degraded();
                let mut persist = self.filled.persist.lock();
                let work_ready = persist.pending
                    || !self.queue_empty()
                    || !self.run.load(Ordering::Acquire);
                if work_ready && !degraded {
                    false
                } else {
                    self.filled
                        .writer_cv
                        .wait_for(&mut persist, self.persist_interval)
                        .timed_out()
                }
            };

            self.write_buffers();

            let requested = self.filled.persist.lock().pending;
            if timed_out
                || self.unpersisted > self.persist_threshold
                || requested
                || !self.run.load(Ordering::Acquire)
            {
                self.persist();
                let mut persist = self.filled.persist.lock();
                persist.pending = false;
                self.filled.persist_cv.notify_all();
            }

            if !self.run.load(Ordering::Acquire) && self.queue_empty() && !self.is_degraded() {
                break;
            }
        }
        // Belt and braces: nothing accepted may be left behind.
        self.write_buffers();
        self.persist();
        tracing::info!("disk log writer task stopped");
        // The log file closes here, after every callback has fired.
    }

    fn queue_empty(&self) -> bool {
        self.filled.queue.lock().is_empty()
    }

    fn is_degraded(&self) -> bool {
        *self.degraded.flag.lock()
    }

    /// Drain the filled queue into the log file, collecting callbacks
    /// and recycling buffers.
    fn write_buffers(&mut self) {
        loop {
            let logs = self.filled.queue.lock().pop_front();
            let Some(mut logs) = logs else { break };
            match self.file.write_all(&logs.buffer.bytes) {
                Ok(()) => {
                    self.unpersisted += logs.buffer.bytes.len() as u64;
                    self.written_len += logs.buffer.bytes.len() as u64;
                    self.pending_callbacks.append(&mut logs.commits);
                    logs.buffer.bytes.clear();
                    let _ = self.empty_buffers.send(logs.buffer);
                    self.clear_degraded();
                }
                Err(error) => {
                    tracing::error!(%error, "log write failed; entering degraded mode");
                    // Chop any torn tail so the retry cannot leave a
                    // duplicated partial record behind.
                    let _ = self.file.set_len(self.written_len);
                    self.filled.queue.lock().push_front(logs);
                    self.set_degraded();
                    // Retried next wakeup.
                    break;
                }
            }
        }
    }

    /// Sync the file and acknowledge every covered commit, in order.
    fn persist(&mut self) {
        if self.unpersisted == 0 && self.pending_callbacks.is_empty() {
            return;
        }
        match self.file.sync_data() {
            Ok(()) => {
                let acknowledged = self.pending_callbacks.len();
                for entry in self.pending_callbacks.drain(..) {
                    (entry.callback)();
                    entry.txn.mark_log_processed();
                }
                if acknowledged > 0 {
                    tracing::debug!(acknowledged, bytes = self.unpersisted, "log sync complete");
                }
                self.unpersisted = 0;
                self.clear_degraded();
            }
            Err(error) => {
                tracing::error!(%error, "log sync failed; entering degraded mode");
                self.set_degraded();
            }
        }
    }

    fn set_degraded(&self) {
        let mut flag = self.degraded.flag.lock();
        if !*flag {
            *flag = true;
            tracing::warn!("commit handoff blocked until the log can persist again");
        }
    }

    fn clear_degraded(&self) {
        let mut flag = self.degraded.flag.lock();
        if *flag {
            *flag = false;
            tracing::info!("log pipeline recovered from degraded mode");
            self.degraded.cleared.notify_all();
        }
    }
}
