//! Per-connection elapsed-time accounting.
//!
//! Every restartable client record carries a delay measured from the
//! previous record. The receiver's elapsed time must match the sender's
//! cumulative delay exactly for restarts to align, so addition normalizes
//! nanoseconds and comparison is strict lexicographic on (sec, nsec).

use std::fmt::{Display, Formatter};

use crate::protocol::TimeSpec;

const NSEC_PER_SEC: i32 = 1_000_000_000;

/// Monotonic per-connection clock, advanced by the sum of all record
/// delays observed. Ordering is lexicographic on (secs, nsecs).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct ElapsedTime {
    pub secs: i64,
    pub nsecs: i32,
}

impl ElapsedTime {
    /// Construct from a seconds/nanoseconds pair.
    #[must_use]
    pub fn new(secs: i64, nsecs: i32) -> Self {
        Self { secs, nsecs }
    }

    /// Add `delay` with nanosecond carry.
    pub fn advance(&mut self, delay: &TimeSpec) {
        self.secs += delay.tv_sec;
        self.nsecs += delay.tv_nsec;
        while self.nsecs >= NSEC_PER_SEC {
            self.secs += 1;
            self.nsecs -= NSEC_PER_SEC;
        }
    }
}

impl From<&TimeSpec> for ElapsedTime {
    fn from(ts: &TimeSpec) -> Self {
        Self {
            secs: ts.tv_sec,
            nsecs: ts.tv_nsec,
        }
    }
}

impl Display for ElapsedTime {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {}]", self.secs, self.nsecs)
    }
}
