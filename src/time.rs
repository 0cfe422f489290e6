//! Duration value type used throughout the loop APIs.

use std::ops::{Add, Mul, Neg, Sub};
use std::time::Duration;

/// An amount of time, expressed as a signed number of nanoseconds.
///
/// `TimeAmount` is the unit in which deadlines and delays are handed to an
/// event loop. Unlike [`std::time::Duration`] it is signed, so subtracting
/// two amounts always has a meaning; a negative amount passed as a delay is
/// treated as "due now".
///
/// Amounts are totally ordered by their nanosecond count. Arithmetic that
/// overflows the signed 64-bit range is a programming error on the caller's
/// side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimeAmount {
    nanos: i64,
}

impl TimeAmount {
    /// An amount of zero length.
    pub const ZERO: TimeAmount = TimeAmount { nanos: 0 };

    /// Creates an amount of `n` nanoseconds.
    pub const fn nanoseconds(n: i64) -> TimeAmount {
        TimeAmount { nanos: n }
    }

    /// Creates an amount of `n` microseconds.
    pub const fn microseconds(n: i64) -> TimeAmount {
        TimeAmount { nanos: n * 1_000 }
    }

    /// Creates an amount of `n` milliseconds.
    pub const fn milliseconds(n: i64) -> TimeAmount {
        TimeAmount { nanos: n * 1_000_000 }
    }

    /// Creates an amount of `n` seconds.
    pub const fn seconds(n: i64) -> TimeAmount {
        TimeAmount { nanos: n * 1_000_000_000 }
    }

    /// Creates an amount of `n` minutes.
    pub const fn minutes(n: i64) -> TimeAmount {
        TimeAmount { nanos: n * 60 * 1_000_000_000 }
    }

    /// Creates an amount of `n` hours.
    pub const fn hours(n: i64) -> TimeAmount {
        TimeAmount { nanos: n * 3_600 * 1_000_000_000 }
    }

    /// The number of nanoseconds this amount represents.
    pub const fn as_nanos(self) -> i64 {
        self.nanos
    }

    /// Converts into a [`Duration`], clamping negative amounts to zero.
    pub fn as_duration(self) -> Duration {
        if self.nanos <= 0 {
            Duration::from_nanos(0)
        } else {
            Duration::from_nanos(self.nanos as u64)
        }
    }
}

impl From<Duration> for TimeAmount {
    /// Saturates at `i64::MAX` nanoseconds for durations beyond the signed
    /// 64-bit range (roughly 292 years).
    fn from(d: Duration) -> TimeAmount {
        let nanos = d.as_nanos();
        if nanos > i64::max_value() as u128 {
            TimeAmount { nanos: i64::max_value() }
        } else {
            TimeAmount { nanos: nanos as i64 }
        }
    }
}

impl Add for TimeAmount {
    type Output = TimeAmount;

    fn add(self, rhs: TimeAmount) -> TimeAmount {
        TimeAmount { nanos: self.nanos + rhs.nanos }
    }
}

impl Sub for TimeAmount {
    type Output = TimeAmount;

    fn sub(self, rhs: TimeAmount) -> TimeAmount {
        TimeAmount { nanos: self.nanos - rhs.nanos }
    }
}

impl Mul<i64> for TimeAmount {
    type Output = TimeAmount;

    fn mul(self, rhs: i64) -> TimeAmount {
        TimeAmount { nanos: self.nanos * rhs }
    }
}

impl Neg for TimeAmount {
    type Output = TimeAmount;

    fn neg(self) -> TimeAmount {
        TimeAmount { nanos: -self.nanos }
    }
}
