//! Lock-free device request counters.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use vbd_types::Direction;

/// Pad a value to 64 bytes to avoid false sharing between hot counters
/// updated on different CPU cores.
#[repr(C, align(64))]
pub struct CacheLinePadded<T>(pub T);

impl<T: std::fmt::Debug> std::fmt::Debug for CacheLinePadded<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Per-device request counters, updated on every dispatch and completion.
#[repr(C)]
pub struct DeviceMetrics {
    admitted: CacheLinePadded<AtomicU64>,
    completed_ok: CacheLinePadded<AtomicU64>,
    completed_err: CacheLinePadded<AtomicU64>,
    rejected: CacheLinePadded<AtomicU64>,
    bytes_read: CacheLinePadded<AtomicU64>,
    bytes_written: CacheLinePadded<AtomicU64>,
}

impl DeviceMetrics {
    #[must_use]
    pub fn new() -> Self {
        Self {
            admitted: CacheLinePadded(AtomicU64::new(0)),
            completed_ok: CacheLinePadded(AtomicU64::new(0)),
            completed_err: CacheLinePadded(AtomicU64::new(0)),
            rejected: CacheLinePadded(AtomicU64::new(0)),
            bytes_read: CacheLinePadded(AtomicU64::new(0)),
            bytes_written: CacheLinePadded(AtomicU64::new(0)),
        }
    }

    pub(crate) fn record_admitted(&self) {
        self.admitted.0.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_rejected(&self) {
        self.rejected.0.fetch_add(1, Ordering::Relaxed);
    }

    /// Bytes are only counted for requests that completed successfully.
    pub(crate) fn record_completion(&self, ok: bool, direction: Direction, bytes: u64) {
        if !ok {
            self.completed_err.0.fetch_add(1, Ordering::Relaxed);
            return;
        }
        self.completed_ok.0.fetch_add(1, Ordering::Relaxed);
        match direction {
            Direction::Read => self.bytes_read.0.fetch_add(bytes, Ordering::Relaxed),
            Direction::Write => self.bytes_written.0.fetch_add(bytes, Ordering::Relaxed),
        };
    }

    /// Snapshot of all counters.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            admitted: self.admitted.0.load(Ordering::Relaxed),
            completed_ok: self.completed_ok.0.load(Ordering::Relaxed),
            completed_err: self.completed_err.0.load(Ordering::Relaxed),
            rejected: self.rejected.0.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.0.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.0.load(Ordering::Relaxed),
        }
    }
}

impl Default for DeviceMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for DeviceMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("DeviceMetrics")
            .field(&self.snapshot())
            .finish()
    }
}

/// Point-in-time snapshot of [`DeviceMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub admitted: u64,
    pub completed_ok: u64,
    pub completed_err: u64,
    /// Requests turned away because the device was deleting or deleted.
    pub rejected: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn snapshot_initially_zero() {
        assert_eq!(DeviceMetrics::new().snapshot(), MetricsSnapshot::default());
    }

    #[test]
    fn failed_completion_counts_no_bytes() {
        let m = DeviceMetrics::new();
        m.record_admitted();
        m.record_admitted();
        m.record_completion(true, Direction::Write, 512);
        m.record_completion(false, Direction::Read, 512);
        m.record_rejected();
        let s = m.snapshot();
        assert_eq!(s.admitted, 2);
        assert_eq!(s.completed_ok, 1);
        assert_eq!(s.completed_err, 1);
        assert_eq!(s.rejected, 1);
        assert_eq!(s.bytes_written, 512);
        assert_eq!(s.bytes_read, 0);
    }

    #[test]
    fn cache_line_padded_alignment() {
        let padded = CacheLinePadded(AtomicU64::new(0));
        let ptr = std::ptr::addr_of!(padded) as usize;
        assert_eq!(ptr % 64, 0);
    }

    #[test]
    fn concurrent_updates_are_not_lost() {
        let metrics = Arc::new(DeviceMetrics::new());
        let barrier = Arc::new(std::sync::Barrier::new(8));
        std::thread::scope(|s| {
            for _ in 0..8 {
                let m = Arc::clone(&metrics);
                let b = Arc::clone(&barrier);
                s.spawn(move || {
                    b.wait();
                    for _ in 0..1000 {
                        m.record_admitted();
                        m.record_completion(true, Direction::Read, 512);
                    }
                });
            }
        });
        let s = metrics.snapshot();
        assert_eq!(s.admitted, 8000);
        assert_eq!(s.completed_ok, 8000);
        assert_eq!(s.bytes_read, 8000 * 512);
    }
}
