//! Monotonic time values
//!
//! `TimeSpec` is the dispatcher's time currency: a (seconds, nanoseconds)
//! pair with saturating arithmetic and a pair of infinity sentinels. All
//! dispatcher deadlines are absolute values of the monotonic clock read via
//! [`now`].
//!
//! Representation: for non-negative values `nsec` lies in `[0, 10^9)`. A
//! negative value carries its sign on `sec` when the whole-second part is
//! nonzero and on `nsec` otherwise, so `-1.5s` is `{-1, 500_000_000}` and
//! `-0.5s` is `{0, -500_000_000}`.

use core::cmp::Ordering;
use core::fmt;
use std::sync::OnceLock;
use std::time::{Duration, Instant};

/// Nanoseconds per second
pub const NANOS_PER_SEC: i64 = 1_000_000_000;

/// A second/nanosecond time value or interval
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimeSpec {
    pub sec: i64,
    pub nsec: i32,
}

impl TimeSpec {
    /// The zero interval
    pub const ZERO: TimeSpec = TimeSpec { sec: 0, nsec: 0 };

    /// "Wait forever" sentinel; also the one-shot marker for timer intervals
    pub const INFINITY: TimeSpec = TimeSpec {
        sec: i64::MAX,
        nsec: (NANOS_PER_SEC - 1) as i32,
    };

    /// Negative saturation sentinel
    pub const NEG_INFINITY: TimeSpec = TimeSpec {
        sec: i64::MIN,
        nsec: 0,
    };

    #[inline]
    pub const fn new(sec: i64, nsec: i32) -> Self {
        TimeSpec { sec, nsec }
    }

    #[inline]
    pub const fn from_secs(sec: i64) -> Self {
        TimeSpec { sec, nsec: 0 }
    }

    #[inline]
    pub const fn from_millis(ms: i64) -> Self {
        TimeSpec {
            sec: ms / 1_000,
            nsec: ((ms % 1_000) * 1_000_000) as i32,
        }
    }

    #[inline]
    pub const fn from_micros(us: i64) -> Self {
        TimeSpec {
            sec: us / 1_000_000,
            nsec: ((us % 1_000_000) * 1_000) as i32,
        }
    }

    /// Total value in nanoseconds. Infinity maps to the sentinel's own
    /// nanosecond count, which saturating arithmetic preserves.
    pub fn to_nanos(self) -> i128 {
        let sec = self.sec as i128;
        let nsec = self.nsec as i128;
        if sec < 0 {
            // sign-magnitude: sec carries the sign, nsec is the magnitude
            // of the fractional part
            -((-sec) * NANOS_PER_SEC as i128 + nsec.abs())
        } else {
            sec * NANOS_PER_SEC as i128 + nsec
        }
    }

    /// Build a normalised value from total nanoseconds, saturating at the
    /// infinity sentinels.
    pub fn from_nanos(nanos: i128) -> Self {
        const INF: i128 = (i64::MAX as i128) * NANOS_PER_SEC as i128 + (NANOS_PER_SEC - 1) as i128;
        const NEG_INF: i128 = -((-(i64::MIN as i128)) * NANOS_PER_SEC as i128);
        if nanos >= INF {
            return TimeSpec::INFINITY;
        }
        if nanos <= NEG_INF {
            return TimeSpec::NEG_INFINITY;
        }

        let mag = nanos.abs();
        let sec = (mag / NANOS_PER_SEC as i128) as i64;
        let nsec = (mag % NANOS_PER_SEC as i128) as i32;
        if nanos >= 0 {
            TimeSpec { sec, nsec }
        } else if sec != 0 {
            TimeSpec { sec: -sec, nsec }
        } else {
            TimeSpec { sec: 0, nsec: -nsec }
        }
    }

    /// Saturating addition
    #[inline]
    pub fn add(self, other: TimeSpec) -> TimeSpec {
        if self.is_infinite() || other.is_infinite() {
            // infinity is absorbing; opposite infinities cancel to zero is
            // meaningless here, so positive wins deterministically
            if self == TimeSpec::NEG_INFINITY || other == TimeSpec::NEG_INFINITY {
                if self == TimeSpec::INFINITY || other == TimeSpec::INFINITY {
                    return TimeSpec::INFINITY;
                }
                return TimeSpec::NEG_INFINITY;
            }
            return TimeSpec::INFINITY;
        }
        TimeSpec::from_nanos(self.to_nanos() + other.to_nanos())
    }

    /// Saturating subtraction
    #[inline]
    pub fn sub(self, other: TimeSpec) -> TimeSpec {
        if self.is_infinite() {
            return self;
        }
        if other == TimeSpec::INFINITY {
            return TimeSpec::NEG_INFINITY;
        }
        if other == TimeSpec::NEG_INFINITY {
            return TimeSpec::INFINITY;
        }
        TimeSpec::from_nanos(self.to_nanos() - other.to_nanos())
    }

    #[inline]
    pub fn is_infinite(self) -> bool {
        self == TimeSpec::INFINITY || self == TimeSpec::NEG_INFINITY
    }

    #[inline]
    pub fn is_negative(self) -> bool {
        self.sec < 0 || self.nsec < 0
    }

    /// A value is well-formed when its nanosecond field is in range and the
    /// sign convention holds (negative nsec only with a zero second part).
    pub fn is_valid(self) -> bool {
        let n = self.nsec as i64;
        if n <= -NANOS_PER_SEC || n >= NANOS_PER_SEC {
            return false;
        }
        if self.sec != 0 && n < 0 {
            return false;
        }
        true
    }

    /// Convert to a `Duration` for use with std timed waits. Negative values
    /// clamp to zero; `None` means "wait forever".
    pub fn to_duration(self) -> Option<Duration> {
        if self == TimeSpec::INFINITY {
            return None;
        }
        let nanos = self.to_nanos();
        if nanos <= 0 {
            return Some(Duration::ZERO);
        }
        Some(Duration::new(
            (nanos / NANOS_PER_SEC as i128) as u64,
            (nanos % NANOS_PER_SEC as i128) as u32,
        ))
    }
}

impl From<Duration> for TimeSpec {
    fn from(d: Duration) -> Self {
        TimeSpec::from_nanos(d.as_nanos() as i128)
    }
}

impl PartialOrd for TimeSpec {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimeSpec {
    fn cmp(&self, other: &Self) -> Ordering {
        self.to_nanos().cmp(&other.to_nanos())
    }
}

impl fmt::Display for TimeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == TimeSpec::INFINITY {
            write!(f, "+inf")
        } else if *self == TimeSpec::NEG_INFINITY {
            write!(f, "-inf")
        } else {
            write!(f, "{}.{:09}s", self.sec, self.nsec.unsigned_abs())
        }
    }
}

/// Epoch for the process-wide monotonic clock
static CLOCK_EPOCH: OnceLock<Instant> = OnceLock::new();

/// The instant backing `TimeSpec::ZERO` of the monotonic clock
#[inline]
pub fn clock_epoch() -> Instant {
    *CLOCK_EPOCH.get_or_init(Instant::now)
}

/// Current monotonic time as a `TimeSpec`
///
/// Monotonic since the first call in the process; cheap enough for the
/// worker selection loop.
#[inline]
pub fn now() -> TimeSpec {
    TimeSpec::from(clock_epoch().elapsed())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalisation_carry() {
        let a = TimeSpec::from_millis(900);
        let b = TimeSpec::from_millis(300);
        assert_eq!(a.add(b), TimeSpec::new(1, 200_000_000));
    }

    #[test]
    fn test_borrow() {
        let a = TimeSpec::from_secs(2);
        let b = TimeSpec::from_millis(500);
        assert_eq!(a.sub(b), TimeSpec::new(1, 500_000_000));
    }

    #[test]
    fn test_negative_forms() {
        // -0.5s: sign on nsec
        let v = TimeSpec::from_millis(500).sub(TimeSpec::from_secs(1));
        assert_eq!(v, TimeSpec::new(0, -500_000_000));
        // -1.5s: sign on sec
        let v = TimeSpec::from_millis(500).sub(TimeSpec::from_secs(2));
        assert_eq!(v, TimeSpec::new(-1, 500_000_000));
        assert_eq!(v.to_nanos(), -1_500_000_000);
    }

    #[test]
    fn test_saturation() {
        let inf = TimeSpec::INFINITY;
        assert_eq!(inf.add(TimeSpec::from_secs(1)), inf);
        assert_eq!(TimeSpec::from_secs(1).add(inf), inf);
        assert_eq!(TimeSpec::from_secs(1).sub(inf), TimeSpec::NEG_INFINITY);
        let near = TimeSpec::new(i64::MAX, 0);
        assert_eq!(near.add(TimeSpec::from_secs(10)), inf);
    }

    #[test]
    fn test_ordering() {
        let a = TimeSpec::from_millis(10);
        let b = TimeSpec::from_millis(20);
        assert!(a < b);
        assert!(b < TimeSpec::INFINITY);
        assert!(TimeSpec::NEG_INFINITY < a);
        assert!(TimeSpec::new(0, -1) < TimeSpec::ZERO);
    }

    #[test]
    fn test_validity() {
        assert!(TimeSpec::ZERO.is_valid());
        assert!(TimeSpec::INFINITY.is_valid());
        assert!(TimeSpec::new(0, -5).is_valid());
        assert!(!TimeSpec::new(1, -5).is_valid());
        assert!(!TimeSpec::new(0, 1_000_000_000).is_valid());
    }

    #[test]
    fn test_to_duration() {
        assert_eq!(TimeSpec::INFINITY.to_duration(), None);
        assert_eq!(
            TimeSpec::from_millis(1500).to_duration(),
            Some(Duration::from_millis(1500))
        );
        assert_eq!(
            TimeSpec::from_secs(-1).to_duration(),
            Some(Duration::ZERO)
        );
    }

    #[test]
    fn test_now_monotonic() {
        let t1 = now();
        std::thread::sleep(Duration::from_micros(200));
        let t2 = now();
        assert!(t2 > t1);
    }
}
