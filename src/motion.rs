//! Playback speed estimation.
//!
//! Instantaneous speed is media-time delta over wall-clock delta, smoothed
//! with an EMA. The estimate is only meaningful when both deltas sit inside
//! plausible windows; outside them the sample carries `has_signal = false`
//! and callers fall back to the 1.0 default.

use std::time::Duration;

use crate::timecode::TimeCode;

/// Upper bound of the adaptive speed range; instantaneous samples are
/// clamped to twice this before smoothing.
pub const MAX_ADAPTIVE_SPEED: f64 = 4.0;

const EMA_ALPHA: f64 = 0.25;
/// Media jumps beyond this are scene changes, not playback; the EMA resets.
const RESET_DELTA: TimeCode = TimeCode::from_millis(4000);
/// Requests further apart than this say nothing about playback cadence.
const MAX_WALL_GAP: Duration = Duration::from_millis(1200);

#[derive(Debug, Clone, Copy)]
pub struct MotionSample {
    /// Smoothed playback speed (media seconds per wall second).
    pub speed: f64,
    /// Whether this request produced a usable speed observation.
    pub has_signal: bool,
}

#[derive(Debug)]
pub struct MotionEstimator {
    smoothed: f64,
}

impl MotionEstimator {
    pub fn new() -> Self {
        MotionEstimator { smoothed: 1.0 }
    }

    pub fn smoothed(&self) -> f64 {
        self.smoothed
    }

    /// Forget history (seek landed somewhere unrelated).
    pub fn reset(&mut self) {
        self.smoothed = 1.0;
    }

    /// Fold one request into the estimate.
    pub fn observe(&mut self, media_delta: TimeCode, wall_elapsed: Duration) -> MotionSample {
        if media_delta.abs() > RESET_DELTA {
            self.reset();
            return MotionSample {
                speed: self.smoothed,
                has_signal: false,
            };
        }
        if wall_elapsed.is_zero() || wall_elapsed > MAX_WALL_GAP {
            return MotionSample {
                speed: self.smoothed,
                has_signal: false,
            };
        }

        let instant = (media_delta.as_secs_f64() / wall_elapsed.as_secs_f64())
            .clamp(-2.0 * MAX_ADAPTIVE_SPEED, 2.0 * MAX_ADAPTIVE_SPEED);
        self.smoothed = self.smoothed * (1.0 - EMA_ALPHA) + instant * EMA_ALPHA;
        MotionSample {
            speed: self.smoothed,
            has_signal: true,
        }
    }
}

impl Default for MotionEstimator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(v: i64) -> TimeCode {
        TimeCode::from_millis(v)
    }

    #[test]
    fn steady_playback_converges_to_unit_speed() {
        let mut est = MotionEstimator::new();
        est.smoothed = 0.0;
        for _ in 0..32 {
            let sample = est.observe(ms(16), Duration::from_millis(16));
            assert!(sample.has_signal);
        }
        assert!((est.smoothed() - 1.0).abs() < 0.01);
    }

    #[test]
    fn double_speed_detected() {
        let mut est = MotionEstimator::new();
        for _ in 0..32 {
            est.observe(ms(33), Duration::from_millis(16));
        }
        assert!(est.smoothed() > 1.9 && est.smoothed() < 2.2);
    }

    #[test]
    fn large_media_jump_resets() {
        let mut est = MotionEstimator::new();
        for _ in 0..16 {
            est.observe(ms(33), Duration::from_millis(16));
        }
        let sample = est.observe(TimeCode::from_secs(30), Duration::from_millis(16));
        assert!(!sample.has_signal);
        assert_eq!(est.smoothed(), 1.0);
    }

    #[test]
    fn stale_wall_gap_has_no_signal_and_no_update() {
        let mut est = MotionEstimator::new();
        est.observe(ms(16), Duration::from_millis(16));
        let before = est.smoothed();
        let sample = est.observe(ms(16), Duration::from_secs(5));
        assert!(!sample.has_signal);
        assert_eq!(est.smoothed(), before);
    }

    #[test]
    fn zero_wall_gap_has_no_signal() {
        let mut est = MotionEstimator::new();
        let sample = est.observe(ms(16), Duration::ZERO);
        assert!(!sample.has_signal);
    }

    #[test]
    fn instantaneous_samples_are_clamped() {
        let mut est = MotionEstimator::new();
        // 2 s of media in 1 ms of wall clock: clamped to 8.0 per sample.
        est.observe(ms(2000), Duration::from_millis(1));
        assert!(est.smoothed() <= 1.0 * (1.0 - 0.25) + 2.0 * MAX_ADAPTIVE_SPEED * 0.25 + 1e-9);
    }
}
