use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// A source of wall-clock timestamps for TTL accounting.
///
/// Queues compare two readings of the same clock to learn how long they were
/// disconnected, so implementations must be anchored to the UNIX epoch: the
/// disconnect stamp taken before a restart and the reading taken after it
/// have to be comparable.
pub trait Clock: Send + Sync + 'static {
    /// Returns the current timestamp in nanoseconds since the UNIX epoch.
    fn now(&self) -> u64;
}

/// Wall clock read from `SystemTime`. Used unless a manager is given another.
///
/// Readings before the epoch come back as 0. NTP steps can make a later
/// reading smaller than an earlier one; `connect` charges such intervals as 0.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|since_epoch| u64::try_from(since_epoch.as_nanos()).unwrap_or(u64::MAX))
            .unwrap_or(0)
    }
}

/// A clock that only moves when told to.
///
/// Lets callers simulate disconnected intervals without sleeping.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ns: AtomicU64,
}

impl ManualClock {
    pub fn new(start_ns: u64) -> Self {
        Self {
            now_ns: AtomicU64::new(start_ns),
        }
    }

    /// Starts at the current system time.
    pub fn from_system() -> Self {
        Self::new(SystemClock.now())
    }

    pub fn set(&self, now_ns: u64) {
        self.now_ns.store(now_ns, Ordering::Release);
    }

    pub fn advance(&self, by: Duration) {
        let by = u64::try_from(by.as_nanos()).unwrap_or(u64::MAX);
        let _ = self
            .now_ns
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |ns| {
                Some(ns.saturating_add(by))
            });
    }
}

impl Clock for ManualClock {
    fn now(&self) -> u64 {
        self.now_ns.load(Ordering::Acquire)
    }
}

/// Seconds between two readings, clamped at zero.
pub(crate) fn elapsed_secs(since_ns: u64, now_ns: u64) -> f64 {
    now_ns.saturating_sub(since_ns) as f64 / 1_000_000_000.0
}
