use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Snapshot of I/O counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IoStats {
    pub read_ops: u64,
    pub read_bytes: u64,
    pub write_ops: u64,
    pub write_bytes: u64,
}

impl fmt::Display for IoStats {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "read {} ops / {} bytes, write {} ops / {} bytes",
            self.read_ops, self.read_bytes, self.write_ops, self.write_bytes
        )
    }
}

/// Shared I/O counters; clones count into the same totals.
#[derive(Clone, Debug, Default)]
pub struct IoStatsTracker {
    inner: Arc<Counters>,
}

#[derive(Debug, Default)]
struct Counters {
    read_ops: AtomicU64,
    read_bytes: AtomicU64,
    write_ops: AtomicU64,
    write_bytes: AtomicU64,
}

impl IoStatsTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_read(&self, bytes: u64) {
        self.inner.read_ops.fetch_add(1, Ordering::Relaxed);
        self.inner.read_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_write(&self, bytes: u64) {
        self.inner.write_ops.fetch_add(1, Ordering::Relaxed);
        self.inner.write_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Returns (ops, bytes).
    pub fn get_read_stats(&self) -> (u64, u64) {
        (
            self.inner.read_ops.load(Ordering::Relaxed),
            self.inner.read_bytes.load(Ordering::Relaxed),
        )
    }

    /// Returns (ops, bytes).
    pub fn get_write_stats(&self) -> (u64, u64) {
        (
            self.inner.write_ops.load(Ordering::Relaxed),
            self.inner.write_bytes.load(Ordering::Relaxed),
        )
    }

    pub fn get_detailed_stats(&self) -> IoStats {
        let (read_ops, read_bytes) = self.get_read_stats();
        let (write_ops, write_bytes) = self.get_write_stats();
        IoStats {
            read_ops,
            read_bytes,
            write_ops,
            write_bytes,
        }
    }
}
