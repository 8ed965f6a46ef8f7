//! Unit tests for elapsed-time accounting.
//!
//! Covers nanosecond carry, strict lexicographic ordering, and the
//! property that processing any sequence of delays leaves the clock at
//! exactly their sum.

use proptest::prelude::*;

use audit_logd::elapsed::ElapsedTime;
use audit_logd::protocol::TimeSpec;

// ── Carry behavior ──────────────────────────────────────────────────────────

/// Adding two delays whose nanoseconds sum past one second carries into
/// the seconds field.
#[test]
fn advance_carries_into_seconds() {
    let mut clock = ElapsedTime::default();
    clock.advance(&TimeSpec::new(0, 500_000_000));
    clock.advance(&TimeSpec::new(1, 0));
    assert_eq!(clock, ElapsedTime::new(1, 500_000_000));

    clock.advance(&TimeSpec::new(0, 999_999_999));
    assert_eq!(clock, ElapsedTime::new(2, 499_999_999));
}

/// A zero delay leaves the clock untouched.
#[test]
fn zero_delay_is_identity() {
    let mut clock = ElapsedTime::new(3, 250_000_000);
    clock.advance(&TimeSpec::new(0, 0));
    assert_eq!(clock, ElapsedTime::new(3, 250_000_000));
}

// ── Ordering ────────────────────────────────────────────────────────────────

/// Comparison is lexicographic on (seconds, nanoseconds).
#[test]
fn ordering_is_lexicographic() {
    assert!(ElapsedTime::new(1, 0) > ElapsedTime::new(0, 999_999_999));
    assert!(ElapsedTime::new(2, 1) > ElapsedTime::new(2, 0));
    assert!(ElapsedTime::new(2, 0) < ElapsedTime::new(2, 1));
    assert_eq!(ElapsedTime::new(5, 42), ElapsedTime::new(5, 42));
}

// ── Property: clock equals the sum of all delays ────────────────────────────

proptest! {
    /// After processing delays d₁…dₙ the clock equals Σdᵢ exactly, with
    /// correct nanosecond carry, and never decreases along the way.
    #[test]
    fn clock_equals_sum_of_delays(
        delays in prop::collection::vec((0i64..1_000, 0i32..1_000_000_000), 0..64)
    ) {
        let mut clock = ElapsedTime::default();
        let mut prev = clock;
        let mut total_nsecs: i128 = 0;

        for (sec, nsec) in &delays {
            clock.advance(&TimeSpec::new(*sec, *nsec));
            prop_assert!(clock >= prev, "clock must be monotonic");
            prev = clock;
            total_nsecs += i128::from(*sec) * 1_000_000_000 + i128::from(*nsec);
        }

        let expected = ElapsedTime::new(
            i64::try_from(total_nsecs / 1_000_000_000).unwrap(),
            i32::try_from(total_nsecs % 1_000_000_000).unwrap(),
        );
        prop_assert_eq!(clock, expected);
    }
}
