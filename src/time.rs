//! Simulated time. A `Timestamp` is a (real time, causality) pair: the causality
//! counter orders events that share the same real time, which is how zero-delay
//! transition chains stay deterministic across engines.

use std::cmp::Ordering;
use std::fmt;

/// A point in simulated time.
///
/// Total order is lexicographic on `(time, causality)`. The scheduler and the
/// message heaps order on the full pair; imminence, message delivery and
/// termination compare only the `time` field.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Default)]
pub struct Timestamp {
    pub time: u64,
    pub causality: u64,
}

impl Timestamp {
    pub const fn new(time: u64, causality: u64) -> Self {
        Self { time, causality }
    }

    /// Plain time value, causality zero.
    pub const fn from_time(time: u64) -> Self {
        Self { time, causality: 0 }
    }

    pub const fn zero() -> Self {
        Self { time: 0, causality: 0 }
    }

    /// Sentinel that compares greater than every finite timestamp.
    pub const fn infinity() -> Self {
        Self { time: u64::MAX, causality: u64::MAX }
    }

    /// The minimum positive tick. A time advance of epsilon keeps real time
    /// fixed and bumps the causality counter.
    pub const fn epsilon() -> Self {
        Self { time: 0, causality: 1 }
    }

    pub fn is_infinite(&self) -> bool {
        self.time == u64::MAX
    }

    pub fn is_zero(&self) -> bool {
        self.time == 0 && self.causality == 0
    }

    /// Advance this timestamp by a time-advance value.
    ///
    /// Infinity is absorbing on both sides. A zero-time advance bumps the
    /// causality counter; a real advance resets it. Additions saturate into
    /// the infinity sentinel rather than wrapping.
    pub fn advance(&self, ta: Timestamp) -> Timestamp {
        if self.is_infinite() || ta.is_infinite() {
            return Timestamp::infinity();
        }
        if ta.time == 0 {
            let bump = ta.causality.max(1);
            return Timestamp::new(self.time, self.causality.saturating_add(bump));
        }
        match self.time.checked_add(ta.time) {
            Some(t) if t < u64::MAX => Timestamp::new(t, 0),
            _ => Timestamp::infinity(),
        }
    }

    /// Elapsed real time since `earlier`. Causality is not part of elapsed time.
    pub fn since(&self, earlier: Timestamp) -> Timestamp {
        debug_assert!(self.time >= earlier.time, "elapsed time ran backwards");
        Timestamp::from_time(self.time.saturating_sub(earlier.time))
    }

    /// Comparison on the real-time field only, ignoring causality.
    pub fn time_lt(&self, other: &Timestamp) -> bool {
        self.time < other.time
    }

    pub fn time_le(&self, other: &Timestamp) -> bool {
        self.time <= other.time
    }
}

impl Ord for Timestamp {
    fn cmp(&self, other: &Self) -> Ordering {
        self.time
            .cmp(&other.time)
            .then_with(|| self.causality.cmp(&other.causality))
    }
}

impl PartialOrd for Timestamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_infinite() {
            write!(f, "inf")
        } else if self.causality == 0 {
            write!(f, "{}", self.time)
        } else {
            write!(f, "{}:{}", self.time, self.causality)
        }
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
