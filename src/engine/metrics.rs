//! SHALE - Engine Metrics & Observability
//! Provides atomic counters for tracking engine operations
//! in a lock-free, thread-safe manner using `AtomicU64`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Atomic operation counters for the Shale engine.
///
/// All counters use `Ordering::Relaxed`; they are read for reporting only.
#[derive(Debug)]
pub struct EngineMetrics {
    /// Total number of `get` operations.
    pub gets: AtomicU64,
    /// Total number of `put` operations.
    pub puts: AtomicU64,
    /// Total number of `delete` operations.
    pub deletes: AtomicU64,
    /// Total number of scans started.
    pub scans: AtomicU64,
    /// Write transactions committed.
    pub commits: AtomicU64,
    /// Write transactions rolled back, explicitly or after a failure.
    pub rollbacks: AtomicU64,
    /// Pages copied out of the file.
    pub page_reads: AtomicU64,
    /// Pages written by commits, meta pages included.
    pub pages_written: AtomicU64,
    /// Bytes written by commits.
    pub bytes_written: AtomicU64,
    /// Opens that fell back to the older meta page.
    pub meta_recoveries: AtomicU64,
    /// Timestamp when the engine was opened.
    engine_started: Instant,
}

impl EngineMetrics {
    /// Create a new metrics instance with all counters at zero.
    pub fn new() -> Self {
        Self {
            gets: AtomicU64::new(0),
            puts: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
            scans: AtomicU64::new(0),
            commits: AtomicU64::new(0),
            rollbacks: AtomicU64::new(0),
            page_reads: AtomicU64::new(0),
            pages_written: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
            meta_recoveries: AtomicU64::new(0),
            engine_started: Instant::now(),
        }
    }

    pub fn record_get(&self) {
        self.gets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_put(&self) {
        self.puts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delete(&self) {
        self.deletes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_scan(&self) {
        self.scans.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_commit(&self) {
        self.commits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rollback(&self) {
        self.rollbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_page_read(&self) {
        self.page_reads.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one logical page written to the file.
    pub fn record_page_write(&self, pages: usize, bytes: usize) {
        self.pages_written.fetch_add(pages as u64, Ordering::Relaxed);
        self.bytes_written.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_meta_recovery(&self) {
        self.meta_recoveries.fetch_add(1, Ordering::Relaxed);
    }

    /// Get engine uptime in seconds.
    pub fn uptime_secs(&self) -> f64 {
        self.engine_started.elapsed().as_secs_f64()
    }

    /// Get total number of key operations (gets + puts + deletes + scans).
    pub fn total_ops(&self) -> u64 {
        self.gets.load(Ordering::Relaxed)
            + self.puts.load(Ordering::Relaxed)
            + self.deletes.load(Ordering::Relaxed)
            + self.scans.load(Ordering::Relaxed)
    }

    /// Get operations per second since engine start.
    pub fn ops_per_sec(&self) -> f64 {
        let uptime = self.uptime_secs();
        if uptime < 0.001 {
            return 0.0;
        }
        self.total_ops() as f64 / uptime
    }

    /// Format metrics as a human-readable report.
    pub fn report(&self) -> String {
        format!(
            "\n═══ SHALE Engine Metrics ═══\n\
             Operations:\n\
               gets:      {}\n\
               puts:      {}\n\
               deletes:   {}\n\
               scans:     {}\n\
             Transactions:\n\
               commits:   {}\n\
               rollbacks: {}\n\
             Throughput:\n\
               total ops: {}\n\
               ops/sec:   {:.2}\n\
             I/O:\n\
               page reads:    {}\n\
               pages written: {}\n\
               written:       {} bytes\n\
             Recovery:\n\
               meta recoveries: {}\n\
             Uptime: {:.2}s",
            self.gets.load(Ordering::Relaxed),
            self.puts.load(Ordering::Relaxed),
            self.deletes.load(Ordering::Relaxed),
            self.scans.load(Ordering::Relaxed),
            self.commits.load(Ordering::Relaxed),
            self.rollbacks.load(Ordering::Relaxed),
            self.total_ops(),
            self.ops_per_sec(),
            self.page_reads.load(Ordering::Relaxed),
            self.pages_written.load(Ordering::Relaxed),
            self.bytes_written.load(Ordering::Relaxed),
            self.meta_recoveries.load(Ordering::Relaxed),
            self.uptime_secs(),
        )
    }
}

impl Default for EngineMetrics {
    fn default() -> Self {
        Self::new()
    }
}
