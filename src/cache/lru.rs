//! LRU frame cache keyed by quantized timestamp.
//!
//! Keys are frame times floored to a quantization unit (just under one frame
//! duration), so "two frames within tolerance of each other" becomes a plain
//! key collision and a lookup scans a handful of bins instead of the whole
//! map. Recency order rides on the map's insertion order: hits refresh to the
//! back, eviction pops the front.

use linked_hash_map::LinkedHashMap;
use parking_lot::Mutex;

use crate::frame::VideoFrame;
use crate::timecode::TimeCode;

/// Thread-safe bounded frame cache for one video session.
pub struct FrameCache {
    inner: Mutex<LinkedHashMap<i64, VideoFrame>>,
    max_entries: usize,
    quantum: i64,
}

impl FrameCache {
    /// `max_entries` bounds the cache; `quantum` is the bin width (clamped to
    /// at least one tick).
    pub fn new(max_entries: usize, quantum: TimeCode) -> Self {
        FrameCache {
            inner: Mutex::new(LinkedHashMap::new()),
            max_entries: max_entries.max(1),
            quantum: quantum.ticks().max(1),
        }
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    fn bin(&self, time: TimeCode) -> i64 {
        time.ticks().div_euclid(self.quantum) * self.quantum
    }

    /// Best frame within `tolerance` of `target`, promoted to most recently
    /// used. Ties on distance keep the first bin scanned.
    pub fn try_get(&self, target: TimeCode, tolerance: TimeCode) -> Option<VideoFrame> {
        let mut inner = self.inner.lock();
        let key = self.best_key(&inner, target, tolerance)?;
        inner.get_refresh(&key).map(|frame| frame.clone())
    }

    /// Same scan as [`try_get`](Self::try_get) without touching recency.
    pub fn contains(&self, target: TimeCode, tolerance: TimeCode) -> bool {
        let inner = self.inner.lock();
        self.best_key(&inner, target, tolerance).is_some()
    }

    /// Insert at most-recently-used position. Returns false when the frame's
    /// bin is already occupied; the caller keeps (and should drop) its frame.
    /// Exceeding capacity evicts the least recently used entry.
    pub fn add(&self, frame: VideoFrame) -> bool {
        let key = self.bin(frame.time());
        let mut inner = self.inner.lock();
        if inner.contains_key(&key) {
            return false;
        }
        inner.insert(key, frame);
        while inner.len() > self.max_entries {
            inner.pop_front();
        }
        true
    }

    /// Drop every entry, returning their buffers to the pool.
    pub fn clear(&self) {
        self.inner.lock().clear();
    }

    fn best_key(
        &self,
        inner: &LinkedHashMap<i64, VideoFrame>,
        target: TimeCode,
        tolerance: TimeCode,
    ) -> Option<i64> {
        let tolerance = tolerance.abs();
        let lo = self.bin(target.saturating_sub(tolerance));
        let hi = self.bin(target.saturating_add(tolerance));

        let mut best: Option<(i64, i64)> = None; // (key, distance)
        let mut key = lo;
        while key <= hi {
            if let Some(frame) = inner.get(&key) {
                let distance = (frame.time() - target).abs().ticks();
                if distance <= tolerance.ticks() && best.map_or(true, |(_, d)| distance < d) {
                    best = Some((key, distance));
                }
            }
            match key.checked_add(self.quantum) {
                Some(next) => key = next,
                None => break,
            }
        }
        best.map(|(key, _)| key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::BitmapPool;
    use std::path::PathBuf;
    use std::sync::Arc;

    fn frame(pool: &BitmapPool, ms: i64) -> VideoFrame {
        VideoFrame::new(
            Arc::new(PathBuf::from("clip.mp4")),
            TimeCode::from_millis(ms),
            pool.rent(),
        )
    }

    fn ms(v: i64) -> TimeCode {
        TimeCode::from_millis(v)
    }

    #[test]
    fn hit_within_tolerance_miss_outside() {
        let pool = BitmapPool::new(2, 2, 8);
        let cache = FrameCache::new(4, ms(10));

        assert!(cache.add(frame(&pool, 100)));
        let hit = cache.try_get(ms(101), ms(5)).expect("within tolerance");
        assert_eq!(hit.time(), ms(100));
        assert!(cache.try_get(ms(120), ms(5)).is_none());
    }

    #[test]
    fn best_match_wins() {
        let pool = BitmapPool::new(2, 2, 8);
        let cache = FrameCache::new(8, TimeCode::from_millis(1));

        for t in [100, 105, 110] {
            assert!(cache.add(frame(&pool, t)));
        }
        let got = cache.try_get(ms(104), ms(5)).expect("hit");
        assert_eq!(got.time(), ms(105), "distance 1 beats 4 and 6");
    }

    #[test]
    fn duplicate_bin_rejected_without_replacing() {
        let pool = BitmapPool::new(2, 2, 8);
        let cache = FrameCache::new(4, ms(10));

        assert!(cache.add(frame(&pool, 100)));
        // 104 ms quantizes to the same 100 ms bin.
        assert!(!cache.add(frame(&pool, 104)));
        let kept = cache.try_get(ms(100), ms(1)).expect("original survives");
        assert_eq!(kept.time(), ms(100));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn lookup_promotes_against_eviction() {
        let pool = BitmapPool::new(2, 2, 8);
        let cache = FrameCache::new(2, ms(10));

        assert!(cache.add(frame(&pool, 0)));
        assert!(cache.add(frame(&pool, 10)));
        // Touch 0 so 10 becomes the eviction candidate.
        assert!(cache.try_get(ms(0), ms(1)).is_some());
        assert!(cache.add(frame(&pool, 20)));

        assert!(cache.try_get(ms(0), ms(1)).is_some());
        assert!(cache.try_get(ms(10), ms(1)).is_none(), "LRU entry evicted");
        assert!(cache.try_get(ms(20), ms(1)).is_some());
    }

    #[test]
    fn size_never_exceeds_bound() {
        let pool = BitmapPool::new(2, 2, 64);
        let cache = FrameCache::new(5, ms(10));

        for i in 0..40 {
            cache.add(frame(&pool, i * 10));
            assert!(cache.len() <= 5);
        }
        // Exactly the five most recent bins survive.
        for i in 35..40 {
            assert!(cache.contains(ms(i * 10), ms(1)), "frame {i} missing");
        }
        assert!(!cache.contains(ms(340), ms(1)));
    }

    #[test]
    fn returned_frame_always_within_tolerance() {
        let pool = BitmapPool::new(2, 2, 32);
        let cache = FrameCache::new(16, ms(10));
        for i in 0..16 {
            cache.add(frame(&pool, i * 17));
        }
        for probe in (0..300).step_by(7) {
            if let Some(f) = cache.try_get(ms(probe), ms(8)) {
                assert!((f.time() - ms(probe)).abs() <= ms(8));
            }
        }
    }

    #[test]
    fn eviction_returns_buffers_to_pool() {
        let pool = BitmapPool::new(2, 2, 8);
        let cache = FrameCache::new(2, ms(10));
        cache.add(frame(&pool, 0));
        cache.add(frame(&pool, 10));
        cache.add(frame(&pool, 20));
        assert_eq!(pool.available(), 1, "evicted frame's buffer came back");
        cache.clear();
        assert_eq!(pool.available(), 3);
    }

    #[test]
    fn contains_does_not_promote() {
        let pool = BitmapPool::new(2, 2, 8);
        let cache = FrameCache::new(2, ms(10));
        cache.add(frame(&pool, 0));
        cache.add(frame(&pool, 10));
        assert!(cache.contains(ms(0), ms(1)));
        cache.add(frame(&pool, 20));
        // 0 was only peeked at, so it is still the LRU entry and got evicted.
        assert!(!cache.contains(ms(0), ms(1)));
    }
}
