//! Media timestamps as signed 100 ns tick counts.
//!
//! Every timestamp in the crate — cache keys, worker demand marks, public
//! request times — is a `TimeCode`. Floating point only appears at the
//! ffmpeg/ffprobe argument boundary.

use std::fmt;
use std::ops::{Add, Neg, Sub};
use std::time::Duration;

/// A signed media duration/timestamp in 100 ns ticks.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct TimeCode(i64);

impl TimeCode {
    pub const ZERO: TimeCode = TimeCode(0);
    pub const MAX: TimeCode = TimeCode(i64::MAX);

    pub const TICKS_PER_SECOND: i64 = 10_000_000;
    pub const TICKS_PER_MILLISECOND: i64 = 10_000;

    pub const fn from_ticks(ticks: i64) -> Self {
        TimeCode(ticks)
    }

    pub const fn from_millis(millis: i64) -> Self {
        TimeCode(millis * Self::TICKS_PER_MILLISECOND)
    }

    pub const fn from_secs(secs: i64) -> Self {
        TimeCode(secs * Self::TICKS_PER_SECOND)
    }

    pub fn from_secs_f64(secs: f64) -> Self {
        let ticks = secs * Self::TICKS_PER_SECOND as f64;
        if ticks >= i64::MAX as f64 {
            Self::MAX
        } else if ticks <= i64::MIN as f64 {
            TimeCode(i64::MIN)
        } else {
            TimeCode(ticks as i64)
        }
    }

    /// Timestamp of frame `index` at `fps` frames per second.
    pub fn from_frames(index: u32, fps: f64) -> Self {
        Self::from_secs_f64(index as f64 / fps)
    }

    /// Duration of one frame at `fps`, never less than one tick.
    pub fn frame_duration(fps: f64) -> Self {
        TimeCode(Self::from_secs_f64(1.0 / fps).0.max(1))
    }

    pub const fn ticks(self) -> i64 {
        self.0
    }

    pub fn as_secs_f64(self) -> f64 {
        self.0 as f64 / Self::TICKS_PER_SECOND as f64
    }

    pub const fn as_millis(self) -> i64 {
        self.0 / Self::TICKS_PER_MILLISECOND
    }

    pub const fn is_negative(self) -> bool {
        self.0 < 0
    }

    pub const fn abs(self) -> Self {
        TimeCode(self.0.abs())
    }

    pub fn saturating_add(self, rhs: Self) -> Self {
        TimeCode(self.0.saturating_add(rhs.0))
    }

    pub fn saturating_sub(self, rhs: Self) -> Self {
        TimeCode(self.0.saturating_sub(rhs.0))
    }

    /// Scale by a factor, saturating at the tick range.
    pub fn mul_f64(self, factor: f64) -> Self {
        let scaled = self.0 as f64 * factor;
        if scaled >= i64::MAX as f64 {
            Self::MAX
        } else if scaled <= i64::MIN as f64 {
            TimeCode(i64::MIN)
        } else {
            TimeCode(scaled as i64)
        }
    }

    pub fn clamp(self, min: Self, max: Self) -> Self {
        TimeCode(self.0.clamp(min.0, max.0))
    }

    pub fn min(self, other: Self) -> Self {
        TimeCode(self.0.min(other.0))
    }

    pub fn max(self, other: Self) -> Self {
        TimeCode(self.0.max(other.0))
    }

    /// Largest multiple of `quantum` that is ≤ self (floor, correct for
    /// negative values too).
    pub fn quantize(self, quantum: TimeCode) -> Self {
        let q = quantum.0.max(1);
        TimeCode(self.0.div_euclid(q) * q)
    }

    /// Lossy conversion for wall-clock comparisons; negative becomes zero.
    pub fn to_duration(self) -> Duration {
        if self.0 <= 0 {
            Duration::ZERO
        } else {
            Duration::from_nanos(self.0 as u64 * 100)
        }
    }
}

impl Add for TimeCode {
    type Output = TimeCode;

    fn add(self, rhs: Self) -> Self {
        self.saturating_add(rhs)
    }
}

impl Sub for TimeCode {
    type Output = TimeCode;

    fn sub(self, rhs: Self) -> Self {
        self.saturating_sub(rhs)
    }
}

impl Neg for TimeCode {
    type Output = TimeCode;

    fn neg(self) -> Self {
        TimeCode(self.0.saturating_neg())
    }
}

impl fmt::Display for TimeCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.3}s", self.as_secs_f64())
    }
}

impl fmt::Debug for TimeCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TimeCode({})", self)
    }
}
