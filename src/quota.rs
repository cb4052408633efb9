use std::sync::atomic::{AtomicU64, Ordering};

/// Default hard cap on bytes downloaded in one session: 3.38 GB.
pub const DEFAULT_HARD_CAP: u64 = 3_380_000_000;

/// Default soft threshold past which the coordinator is asked to slow down: 800 MB.
pub const DEFAULT_SOFT_THRESHOLD: u64 = 800_000_000;

/// Signal returned after accounting a completed transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaSignal {
    /// Under the soft threshold.
    Ok,
    /// Past the soft threshold. Informational only; fetching may continue.
    SlowDown,
    /// The hard cap has been reached. No new fetches may be issued.
    Exceeded,
}

/// Tracks cumulative downloaded bytes against a soft threshold and a hard cap.
///
/// The counter is atomic so concurrent fetch tasks can report without
/// additional locking. A tracker can be owned by a single capture session or
/// shared across sessions through an `Arc`, which is how callers choose
/// whether quota accounting persists between captures.
#[derive(Debug)]
pub struct QuotaTracker {
    bytes: AtomicU64,
    hard_cap: u64,
    soft_threshold: u64,
}

impl QuotaTracker {
    pub fn new(hard_cap: u64, soft_threshold: u64) -> Self {
        Self {
            bytes: AtomicU64::new(0),
            hard_cap,
            soft_threshold,
        }
    }

    /// Adds `bytes` to the running total and reports the resulting signal.
    pub fn report(&self, bytes: u64) -> QuotaSignal {
        let total = self.bytes.fetch_add(bytes, Ordering::SeqCst).saturating_add(bytes);
        let signal = self.classify(total);
        if signal == QuotaSignal::Exceeded {
            tracing::warn!(total, hard_cap = self.hard_cap, "download quota exhausted");
        } else if signal == QuotaSignal::SlowDown && total.saturating_sub(bytes) <= self.soft_threshold {
            tracing::info!(total, soft_threshold = self.soft_threshold, "soft quota threshold passed");
        }
        signal
    }

    /// Signal for the current total, without accounting anything new.
    pub fn current_signal(&self) -> QuotaSignal {
        self.classify(self.bytes.load(Ordering::SeqCst))
    }

    /// True once the hard cap has been reached. New fetches must be refused.
    pub fn is_exhausted(&self) -> bool {
        self.bytes.load(Ordering::SeqCst) >= self.hard_cap
    }

    pub fn bytes_downloaded(&self) -> u64 {
        self.bytes.load(Ordering::SeqCst)
    }

    pub fn hard_cap(&self) -> u64 {
        self.hard_cap
    }

    /// Resets the running total, e.g. between sessions sharing one tracker.
    pub fn reset(&self) {
        self.bytes.store(0, Ordering::SeqCst);
    }

    fn classify(&self, total: u64) -> QuotaSignal {
        if total >= self.hard_cap {
            QuotaSignal::Exceeded
        } else if total > self.soft_threshold {
            QuotaSignal::SlowDown
        } else {
            QuotaSignal::Ok
        }
    }
}

impl Default for QuotaTracker {
    fn default() -> Self {
        Self::new(DEFAULT_HARD_CAP, DEFAULT_SOFT_THRESHOLD)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_under_soft_threshold_is_ok() {
        let tracker = QuotaTracker::new(1000, 500);
        assert_eq!(tracker.report(100), QuotaSignal::Ok);
        assert_eq!(tracker.report(400), QuotaSignal::Ok);
        assert_eq!(tracker.bytes_downloaded(), 500);
    }

    #[test]
    fn test_past_soft_threshold_slows_down() {
        let tracker = QuotaTracker::new(1000, 500);
        assert_eq!(tracker.report(501), QuotaSignal::SlowDown);
        assert!(!tracker.is_exhausted());
    }

    #[test]
    fn test_exactly_at_cap_then_next_report_exceeds() {
        let tracker = QuotaTracker::new(1000, 500);
        tracker.report(600);
        tracker.report(400);
        assert_eq!(tracker.bytes_downloaded(), 1000);
        assert_eq!(tracker.report(1), QuotaSignal::Exceeded);
        assert!(tracker.is_exhausted());
    }

    #[test]
    fn test_one_byte_under_cap_is_not_exceeded() {
        let tracker = QuotaTracker::new(1000, 500);
        let signal = tracker.report(999);
        assert!(signal == QuotaSignal::Ok || signal == QuotaSignal::SlowDown);
        assert!(!tracker.is_exhausted());
    }

    #[test]
    fn test_reset_clears_total() {
        let tracker = QuotaTracker::new(1000, 500);
        tracker.report(1000);
        assert!(tracker.is_exhausted());
        tracker.reset();
        assert!(!tracker.is_exhausted());
        assert_eq!(tracker.bytes_downloaded(), 0);
    }

    #[test]
    fn test_concurrent_reports_are_accounted() {
        use std::sync::Arc;
        let tracker = Arc::new(QuotaTracker::new(u64::MAX, u64::MAX - 1));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let tracker = tracker.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..1000 {
                    tracker.report(3);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(tracker.bytes_downloaded(), 8 * 1000 * 3);
    }
}
