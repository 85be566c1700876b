#![doc(issue_tracker_base_url = "https://github.com/chainbound/xdpcheck/issues/")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

use std::time::{Duration, Instant, SystemTime};

mod task;
pub use task::JoinMap;

/// Returns the current UNIX timestamp in microseconds.
#[inline]
pub fn unix_micros() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or_default()
}

/// A fixed point in time after which an operation must give up.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    at: Instant,
}

impl Deadline {
    /// Creates a deadline `timeout` from now.
    pub fn after(timeout: Duration) -> Self {
        Self { at: Instant::now() + timeout }
    }

    /// Time left before the deadline, zero if it already passed.
    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }

    pub fn is_elapsed(&self) -> bool {
        self.remaining().is_zero()
    }
}

#[allow(non_upper_case_globals)]
pub mod constants {
    pub const KiB: u32 = 1024;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deadline_elapses() {
        let deadline = Deadline::after(Duration::ZERO);
        assert!(deadline.is_elapsed());

        let deadline = Deadline::after(Duration::from_secs(60));
        assert!(!deadline.is_elapsed());
        assert!(deadline.remaining() <= Duration::from_secs(60));
    }

    #[test]
    fn unix_micros_is_monotonic_enough() {
        let a = unix_micros();
        let b = unix_micros();
        assert!(b >= a);
    }
}
