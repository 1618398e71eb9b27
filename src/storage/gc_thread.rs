//! Dedicated garbage collection thread
//!
//! Ticks the collector every `gc_period`. Stopping runs two final
//! ticks so a quiesced system is fully reclaimed (one tick unlinks,
//! the next deallocates).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::storage::garbage_collector::GarbageCollector;

/// Default interval between GC ticks.
pub const DEFAULT_GC_PERIOD: Duration = Duration::from_millis(10);

/// Owns the GC loop on its own thread.
pub struct GarbageCollectorThread {
    gc: Arc<GarbageCollector>,
    run: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl GarbageCollectorThread {
    /// Spawn the GC loop, ticking every `gc_period`.
    pub fn new(gc: Arc<GarbageCollector>, gc_period: Duration) -> Self {
        let run = Arc::new(AtomicBool::new(true));
        let handle = {
            let gc = gc.clone();
            let run = run.clone();
            std::thread::Builder::new()
                .name("garbage-collector".into())
                .spawn(move || {
                    tracing::info!("garbage collector thread started");
                    while run.load(Ordering::Acquire) {
                        gc.perform_garbage_collection();
                        std::thread::sleep(gc_period);
                    }
                    tracing::info!("garbage collector thread stopped");
                })
                .ok()
        };
        Self { gc, run, handle }
    }

    /// Stop the loop and run the final reclamation ticks.
    pub fn stop(&mut self) {
        self.run.store(false, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        // One tick to unlink stragglers, one to deallocate them.
        self.gc.perform_garbage_collection();
        self.gc.perform_garbage_collection();
    }
}

impl Drop for GarbageCollectorThread {
    fn drop(&mut self) {
        self.stop();
    }
}
