//! Log serializer task (pipeline stage A)
//!
//! Drains the FIFO of redo buffers handed over at commit, encodes
//! each record into the current writer buffer, and hands filled
//! buffers - together with the commit callbacks they cover - to the
//! disk writer. A single serializer thread keeps the log totally
//! ordered: records are encoded in exactly the order commits handed
//! them over.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::Receiver;

use crate::wal::manager::{CommitEntry, FilledQueue, FlushQueue, LogBuffer, SerializedLogs};
use crate::wal::record::LogRecord;

pub(crate) struct LogSerializerTask {
    flush: Arc<FlushQueue>,
    filled: Arc<FilledQueue>,
    empty_buffers: Receiver<LogBuffer>,
    run: Arc<AtomicBool>,
    interval: Duration,
    /// Buffer currently being filled.
    current: Option<LogBuffer>,
    /// Callbacks for commit records in `current`.
    commits: Vec<CommitEntry>,
}

impl LogSerializerTask {
    pub(crate) fn new(
        flush: Arc<FlushQueue>,
        filled: Arc<FilledQueue>,
        empty_buffers: Receiver<LogBuffer>,
        run: Arc<AtomicBool>,
        interval: Duration,
    ) -> Self {
        Self {
            flush,
            filled,
            empty_buffers,
            run,
            interval,
            current: None,
            commits: Vec::new(),
        }
    }

    pub(crate) fn run(mut self) {
        tracing::info!("log serializer task started");
        loop {
            {
                let mut queue = self.flush.queue.lock();
                if queue.is_empty() && self.run.load(Ordering::Acquire) {
                    let _ = self.flush.signal.wait_for(&mut queue, self.interval);
                }
            }
            self.process();
            if !self.run.load(Ordering::Acquire) {
                break;
            }
        }
        // Shutdown drains whatever commits raced the stop signal.
        self.process();
        tracing::info!("log serializer task stopped");
    }

    /// Drain the input FIFO and serialize every record, in order.
    fn process(&mut self) {
        let mut buffers = 0u32;
        loop {
            let buffer = self.flush.queue.lock().pop_front();
            let Some(mut buffer) = buffer else { break };
            buffers += 1;
            for record in buffer.drain_records() {
                self.serialize_record(record);
            }
            // Dropping the redo buffer releases its segments to the pool.
        }
        // The batch ends here; hand over a partial buffer rather than
        // sit on acknowledged commits.
        self.hand_filled_buffer();
        if buffers > 0 {
            tracing::debug!(buffers, "serialized redo buffers");
        }
        let queue = self.flush.queue.lock();
        self.flush.drained.notify_all();
        drop(queue);
    }

    fn serialize_record(&mut self, record: LogRecord) {
        match record {
            LogRecord::Redo(redo) => self.write_record(&redo.encode_body()),
            LogRecord::Delete(delete) => self.write_record(&delete.encode_body()),
            LogRecord::Commit(commit) => {
                self.write_record(&commit.encode_body());
                self.commits.push(CommitEntry {
                    callback: commit.callback,
                    txn: commit.txn,
                });
            }
        }
    }

    /// Append a length-prefixed record to the current writer buffer,
    /// rotating buffers when full.
    fn write_record(&mut self, body: &[u8]) {
        let total = 4 + body.len();
        if self.current.as_ref().is_some_and(|b| b.would_overflow(total)) {
            self.hand_filled_buffer();
        }
        if self.current.is_none() {
            match self.empty_buffers.recv() {
                Ok(buffer) => self.current = Some(buffer),
                Err(_) => {
                    // Channel torn down mid-shutdown; nothing to write into.
                    tracing::error!("writer buffer pool disconnected");
                    return;
                }
            }
        }
        if let Some(buffer) = self.current.as_mut() {
            buffer.bytes.extend_from_slice(&(body.len() as u32).to_le_bytes());
            buffer.bytes.extend_from_slice(body);
        }
    }

    /// Push the current buffer and its callbacks to the disk writer.
    fn hand_filled_buffer(&mut self) {
        let Some(buffer) = self.current.take() else { return };
        if buffer.bytes.is_empty() {
            self.current = Some(buffer);
            return;
        }
        let commits = std::mem::take(&mut self.commits);
        self.filled.queue.lock().push_back(SerializedLogs { buffer, commits });
        self.filled.writer_cv.notify_one();
    }
}
