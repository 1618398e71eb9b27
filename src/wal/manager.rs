//! Log manager: configuration, lifecycle, and the queues joining the
//! serializer and disk writer stages

use std::collections::VecDeque;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};

use crate::txn::context::{RedoBuffer, TransactionContext};
use crate::txn::CommitCallback;
use crate::wal::disk_writer::DiskLogWriterTask;
use crate::wal::serializer::LogSerializerTask;
use crate::wal::{WalError, WalResult};

/// Capacity of one writer buffer.
pub(crate) const LOG_BUFFER_CAPACITY: usize = 4096;

/// Log manager configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Path of the log file
    pub log_file_path: PathBuf,
    /// Number of writer buffers in the pool
    pub num_buffers: usize,
    /// How often the serializer drains its input FIFO
    pub serialization_interval: Duration,
    /// How often the disk writer syncs regardless of volume
    pub persist_interval: Duration,
    /// Unpersisted bytes that force an early sync
    pub persist_threshold: u64,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            log_file_path: PathBuf::from("wal.log"),
            num_buffers: 100,
            serialization_interval: Duration::from_millis(10),
            persist_interval: Duration::from_millis(20),
            persist_threshold: 1 << 20, // 1MB
        }
    }
}

/// A byte buffer records are serialized into.
pub(crate) struct LogBuffer {
    pub(crate) bytes: Vec<u8>,
}

impl LogBuffer {
    fn new() -> Self {
        Self { bytes: Vec::with_capacity(LOG_BUFFER_CAPACITY) }
    }

    /// Whether `len` more bytes would overflow the buffer's capacity.
    pub(crate) fn would_overflow(&self, len: usize) -> bool {
        !self.bytes.is_empty() && self.bytes.len() + len > LOG_BUFFER_CAPACITY
    }
}

/// A durable acknowledgment waiting on a sync.
pub(crate) struct CommitEntry {
    pub(crate) callback: CommitCallback,
    pub(crate) txn: Arc<TransactionContext>,
}

/// A filled writer buffer plus the commit callbacks it covers.
pub(crate) struct SerializedLogs {
    pub(crate) buffer: LogBuffer,
    pub(crate) commits: Vec<CommitEntry>,
}

/// The serializer's input FIFO of redo buffers handed over at commit.
pub(crate) struct FlushQueue {
    pub(crate) queue: Mutex<VecDeque<RedoBuffer>>,
    /// Wakes the serializer early.
    pub(crate) signal: Condvar,
    /// Broadcast after every drain; `force_flush` waits on it.
    pub(crate) drained: Condvar,
}

pub(crate) struct PersistRequest {
    pub(crate) pending: bool,
}

/// The filled-buffer queue plus the disk writer's wakeup plumbing.
pub(crate) struct FilledQueue {
    pub(crate) queue: Mutex<VecDeque<SerializedLogs>>,
    /// Guarded by `persist`; the disk writer waits here.
    pub(crate) writer_cv: Condvar,
    pub(crate) persist: Mutex<PersistRequest>,
    /// Broadcast once a requested persist completes.
    pub(crate) persist_cv: Condvar,
}

/// Set when the disk writer cannot make progress (e.g. disk full).
/// While degraded, commit handoff blocks, so no acknowledgment can
/// outrun durability.
pub(crate) struct DegradedState {
    pub(crate) flag: Mutex<bool>,
    pub(crate) cleared: Condvar,
}

/// Two-stage write-ahead log manager.
pub struct LogManager {
    config: LogConfig,
    run: Arc<AtomicBool>,
    flush: Arc<FlushQueue>,
    filled: Arc<FilledQueue>,
    degraded: Arc<DegradedState>,
    empty_tx: Sender<LogBuffer>,
    empty_rx: Receiver<LogBuffer>,
    serializer_handle: Mutex<Option<JoinHandle<()>>>,
    writer_handle: Mutex<Option<JoinHandle<()>>>,
}

impl LogManager {
    /// Create a stopped log manager.
    pub fn new(config: LogConfig) -> Self {
        let (empty_tx, empty_rx) = bounded(config.num_buffers);
        Self {
            config,
            run: Arc::new(AtomicBool::new(false)),
            flush: Arc::new(FlushQueue {
                queue: Mutex::new(VecDeque::new()),
                signal: Condvar::new(),
                drained: Condvar::new(),
            }),
            filled: Arc::new(FilledQueue {
                queue: Mutex::new(VecDeque::new()),
                writer_cv: Condvar::new(),
                persist: Mutex::new(PersistRequest { pending: false }),
                persist_cv: Condvar::new(),
            }),
            degraded: Arc::new(DegradedState {
                flag: Mutex::new(false),
                cleared: Condvar::new(),
            }),
            empty_tx,
            empty_rx,
            serializer_handle: Mutex::new(None),
            writer_handle: Mutex::new(None),
        }
    }

    /// Start the serializer and disk writer threads.
    pub fn start(&self) -> WalResult<()> {
        if self.run.swap(true, Ordering::AcqRel) {
            return Err(WalError::AlreadyStarted);
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.config.log_file_path)?;

        for _ in 0..self.config.num_buffers {
            // The channel is sized to hold exactly the pool.
            let _ = self.empty_tx.send(LogBuffer::new());
        }

        let writer = DiskLogWriterTask::new(
            file,
            self.filled.clone(),
            self.empty_tx.clone(),
            self.degraded.clone(),
            self.run.clone(),
            self.config.persist_interval,
            self.config.persist_threshold,
        );
        let writer_handle = std::thread::Builder::new()
            .name("disk-log-writer".into())
            .spawn(move || writer.run())?;

        let serializer = LogSerializerTask::new(
            self.flush.clone(),
            self.filled.clone(),
            self.empty_rx.clone(),
            self.run.clone(),
            self.config.serialization_interval,
        );
        let serializer_handle = std::thread::Builder::new()
            .name("log-serializer".into())
            .spawn(move || serializer.run())?;

        *self.writer_handle.lock() = Some(writer_handle);
        *self.serializer_handle.lock() = Some(serializer_handle);
        tracing::info!(path = %self.config.log_file_path.display(), "log manager started");
        Ok(())
    }

    /// Hand a transaction's redo buffer to the serializer. Blocks
    /// while the pipeline is degraded, so commit cannot outrun a full
    /// disk.
    pub fn add_buffer_to_flush_queue(&self, buffer: RedoBuffer) {
        debug_assert!(self.run.load(Ordering::Acquire), "log manager not started");
        {
            let mut degraded = self.degraded.flag.lock();
            while *degraded {
                self.degraded.cleared.wait(&mut degraded);
            }
        }
        self.flush.queue.lock().push_back(buffer);
        self.flush.signal.notify_one();
    }

    /// Block until everything accepted so far is durable.
    pub fn force_flush(&self) {
        if !self.run.load(Ordering::Acquire) {
            return;
        }
        // Wait for the serializer to drain its FIFO.
        {
            let mut queue = self.flush.queue.lock();
            self.flush.signal.notify_one();
            while !queue.is_empty() {
                self.flush.drained.wait(&mut queue);
            }
        }
        // Then ask the disk writer for a persist and wait it out.
        let mut persist = self.filled.persist.lock();
        persist.pending = true;
        self.filled.writer_cv.notify_one();
        while persist.pending {
            self.filled.persist_cv.wait(&mut persist);
        }
    }

    /// Whether the disk writer is currently unable to make progress.
    pub fn is_degraded(&self) -> bool {
        *self.degraded.flag.lock()
    }

    /// Drain outstanding records, persist them, fire their callbacks,
    /// and stop both pipeline threads. The log file is closed last.
    pub fn persist_and_stop(&self) -> WalResult<()> {
        if !self.run.swap(false, Ordering::AcqRel) {
            return Err(WalError::NotStarted);
        }

        // Stop in pipeline order: serializer drains its FIFO first.
        self.flush.signal.notify_all();
        if let Some(handle) = self.serializer_handle.lock().take() {
            let _ = handle.join();
        }

        self.filled.writer_cv.notify_all();
        if let Some(handle) = self.writer_handle.lock().take() {
            let _ = handle.join();
        }
        debug_assert!(self.filled.queue.lock().is_empty());

        // Drop the pooled buffers; `start` repopulates the queue.
        while self.empty_rx.try_recv().is_ok() {}
        tracing::info!("log manager stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = LogConfig::default();
        assert_eq!(config.num_buffers, 100);
        assert_eq!(config.serialization_interval, Duration::from_millis(10));
        assert_eq!(config.persist_interval, Duration::from_millis(20));
        assert_eq!(config.persist_threshold, 1 << 20);
    }

    #[test]
    fn test_start_twice_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let manager = LogManager::new(LogConfig {
            log_file_path: dir.path().join("test.log"),
            ..LogConfig::default()
        });
        manager.start().unwrap();
        assert!(matches!(manager.start(), Err(WalError::AlreadyStarted)));
        manager.persist_and_stop().unwrap();
    }

    #[test]
    fn test_stop_without_start_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let manager = LogManager::new(LogConfig {
            log_file_path: dir.path().join("test.log"),
            ..LogConfig::default()
        });
        assert!(matches!(manager.persist_and_stop(), Err(WalError::NotStarted)));
    }

    #[test]
    fn test_restart_after_stop() {
        let dir = tempfile::tempdir().unwrap();
        let manager = LogManager::new(LogConfig {
            log_file_path: dir.path().join("test.log"),
            ..LogConfig::default()
        });
        manager.start().unwrap();
        manager.persist_and_stop().unwrap();
        manager.start().unwrap();
        manager.persist_and_stop().unwrap();
    }

    #[test]
    fn test_log_buffer_overflow_check() {
        let mut buffer = LogBuffer::new();
        // Empty buffers accept anything.
        assert!(!buffer.would_overflow(LOG_BUFFER_CAPACITY * 2));
        buffer.bytes.extend_from_slice(&[0u8; 100]);
        assert!(buffer.would_overflow(LOG_BUFFER_CAPACITY));
        assert!(!buffer.would_overflow(10));
    }
}
