//! Per-file video session: the request coordinator.
//!
//! `get_frame` serves two workloads that want opposite things from the same
//! decoder: scrubbing (arbitrary seeks, lowest latency for one frame) and
//! playback (dense monotonic requests that must hit real-time rates). Each
//! request is classified, served from the cache when possible, and otherwise
//! routed to the persistent worker or a one-shot decode.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::cache::FrameCache;
use crate::cancel::CancelToken;
use crate::config::DecodeOptions;
use crate::decoder::{Decoder, FfmpegDecoder, StreamInfo};
use crate::error::{FrameError, Result};
use crate::frame::VideoFrame;
use crate::motion::{MotionEstimator, MotionSample, MAX_ADAPTIVE_SPEED};
use crate::timecode::TimeCode;
use crate::worker::{SequentialWorker, WorkerTuning};

/// Sequential/seek classification floor; ten frame durations if larger.
const SEQUENTIAL_THRESHOLD_FLOOR: TimeCode = TimeCode::from_millis(500);
/// A forward jump up to this far restarts the worker instead of seeking.
const CATCHUP_LIMIT: TimeCode = TimeCode::from_millis(2500);
const CATCHUP_WAIT: Duration = Duration::from_millis(120);
const SEQUENTIAL_WAIT: Duration = Duration::from_millis(45);
/// Longer wait while recovering from a fallback streak.
const RECOVERY_WAIT: Duration = Duration::from_millis(120);
/// Consecutive sequential fallbacks that force a worker restart.
const FALLBACK_RESTART_STREAK: u32 = 2;
const SINGLE_DECODE_ATTEMPTS: u32 = 3;
/// Tuning deltas below this are not worth signalling to the worker.
const STRATEGY_HYSTERESIS: TimeCode = TimeCode::from_millis(18);
const MIN_ADAPTIVE_SPEED: f64 = 0.35;
const LOW_HEADROOM_FRAMES: f64 = 8.0;
const HIGH_HEADROOM_FACTOR: f64 = 1.4;
const LOOK_AHEAD_GROWTH: f64 = 1.45;
const CHUNK_GROWTH: f64 = 1.18;
const HEADROOM_SHRINK: f64 = 0.85;
/// Patience for the worker to wind down during close.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy)]
enum RequestKind {
    Sequential,
    Seek { delta: Option<TimeCode> },
}

/// Look-ahead/chunk bands derived from the cache capacity: a bigger cache
/// affords a deeper decode horizon.
#[derive(Debug, Clone, Copy)]
struct AdaptiveBands {
    look_min: TimeCode,
    look_max: TimeCode,
    chunk_min: TimeCode,
    chunk_max: TimeCode,
    base_look_ahead: TimeCode,
}

impl AdaptiveBands {
    fn derive(frame_duration: TimeCode, cache_entries: usize) -> Self {
        let n = cache_entries as f64;
        let look_min = frame_duration.mul_f64((0.18 * n).clamp(8.0, 72.0));
        let look_max = frame_duration.mul_f64((0.9 * n).clamp(30.0, 220.0));
        let base_look_ahead = frame_duration.mul_f64(32.0).clamp(look_min, look_max);
        AdaptiveBands {
            look_min,
            look_max,
            chunk_min: look_min.mul_f64(0.5),
            chunk_max: look_max.mul_f64(0.5),
            base_look_ahead,
        }
    }

    fn initial(&self) -> WorkerTuning {
        WorkerTuning {
            chunk: self
                .base_look_ahead
                .mul_f64(0.5)
                .clamp(self.chunk_min, self.chunk_max),
            look_ahead: self.base_look_ahead,
        }
    }
}

struct RequestState {
    last_request: Option<(TimeCode, Instant)>,
    worker_target_time: Option<TimeCode>,
    worker_needs_restart: bool,
    fallback_streak: u32,
    motion: MotionEstimator,
    last_sample: MotionSample,
    last_delta: Option<TimeCode>,
    instructed: WorkerTuning,
}

pub struct VideoSession {
    source: Arc<PathBuf>,
    info: StreamInfo,
    frame_duration: TimeCode,
    seek_tolerance: TimeCode,
    sequential_threshold: TimeCode,
    bands: AdaptiveBands,
    decoder: Arc<dyn Decoder>,
    cache: Arc<FrameCache>,
    worker: SequentialWorker,
    frame_signal: Arc<Semaphore>,
    state: Mutex<RequestState>,
    /// Serializes restart decisions so concurrent requests cannot both
    /// observe a stopped worker and start duplicate generations.
    ready_lock: tokio::sync::Mutex<()>,
    cancel: CancelToken,
    disposed: AtomicBool,
    self_ref: Weak<VideoSession>,
}

impl VideoSession {
    /// Probe the file and build a session driving an ffmpeg child process.
    pub async fn open(path: impl AsRef<Path>, options: DecodeOptions) -> Result<Arc<Self>> {
        let path = path.as_ref().to_path_buf();
        let decoder = FfmpegDecoder::open(&path, options.clone()).await?;
        Ok(Self::with_decoder(path, Arc::new(decoder), &options))
    }

    /// Build a session over any [`Decoder`] implementation.
    pub fn with_decoder(
        path: PathBuf,
        decoder: Arc<dyn Decoder>,
        options: &DecodeOptions,
    ) -> Arc<Self> {
        let info = decoder.info().clone();
        let frame_duration = info.frame_duration();
        // One tick under a frame duration: consecutive frames land in
        // distinct bins, and anything closer than a frame counts as a hit.
        let quantum = TimeCode::from_ticks((frame_duration.ticks() - 1).max(1));
        let cache_entries = options.effective_cache_size(info.width, info.height);
        let bands = AdaptiveBands::derive(frame_duration, cache_entries);
        let cache = Arc::new(FrameCache::new(cache_entries, quantum));
        let frame_signal = Arc::new(Semaphore::new(0));
        let worker = SequentialWorker::new(
            decoder.clone(),
            cache.clone(),
            frame_signal.clone(),
            bands.initial(),
        );

        info!(
            source = %path.display(),
            width = info.width,
            height = info.height,
            fps = info.frame_rate,
            cache_entries,
            "session opened"
        );

        Arc::new_cyclic(|self_ref| VideoSession {
            source: Arc::new(path),
            frame_duration,
            seek_tolerance: quantum,
            sequential_threshold: frame_duration.mul_f64(10.0).max(SEQUENTIAL_THRESHOLD_FLOOR),
            bands,
            decoder,
            cache,
            worker,
            frame_signal,
            state: Mutex::new(RequestState {
                last_request: None,
                worker_target_time: None,
                worker_needs_restart: false,
                fallback_streak: 0,
                motion: MotionEstimator::new(),
                last_sample: MotionSample {
                    speed: 1.0,
                    has_signal: false,
                },
                last_delta: None,
                instructed: bands.initial(),
            }),
            ready_lock: tokio::sync::Mutex::new(()),
            cancel: CancelToken::new(),
            disposed: AtomicBool::new(false),
            self_ref: self_ref.clone(),
            info,
        })
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    pub fn info(&self) -> &StreamInfo {
        &self.info
    }

    /// Maximum acceptable `|returned.time − requested.time|`.
    pub fn seek_tolerance(&self) -> TimeCode {
        self.seek_tolerance
    }

    /// How far ahead of the last request the worker has decoded.
    pub fn buffered_until(&self) -> Option<TimeCode> {
        self.worker.decoded_until()
    }

    /// Frame nearest to `time`, served from cache, the sequential worker, or
    /// a one-shot decode.
    pub async fn get_frame(&self, time: TimeCode) -> Result<VideoFrame> {
        self.ensure_open()?;
        let target = self.clamp_target(time);
        let now = Instant::now();

        let kind = {
            let mut state = self.state.lock();
            match state.last_request {
                Some((last_time, last_instant)) => {
                    let delta = target - last_time;
                    state.last_sample = state
                        .motion
                        .observe(delta, now.saturating_duration_since(last_instant));
                    state.last_delta = Some(delta);
                    if delta >= TimeCode::ZERO && delta <= self.sequential_threshold {
                        RequestKind::Sequential
                    } else {
                        RequestKind::Seek { delta: Some(delta) }
                    }
                }
                None => {
                    state.last_delta = None;
                    RequestKind::Seek { delta: None }
                }
            }
        };

        if let Some(frame) = self.cache.try_get(target, self.seek_tolerance) {
            match kind {
                RequestKind::Sequential => {
                    self.state.lock().fallback_streak = 0;
                    self.ensure_worker_ready(target).await;
                }
                RequestKind::Seek { .. } => {
                    let mut state = self.state.lock();
                    state.fallback_streak = 0;
                    state.worker_needs_restart = true;
                    state.motion.reset();
                }
            }
            self.finish_request(target);
            return Ok(frame);
        }

        let frame = match kind {
            RequestKind::Seek { delta } => self.serve_seek_miss(target, delta).await?,
            RequestKind::Sequential => self.serve_sequential_miss(target).await?,
        };
        self.finish_request(target);
        Ok(frame)
    }

    /// Frame by index; `time = index / frame_rate`.
    pub async fn get_frame_at_index(&self, index: u32) -> Result<VideoFrame> {
        if self.info.frame_rate <= 0.0 {
            return Err(FrameError::InvalidArgument(format!(
                "cannot address frames by index: frame rate {} unusable",
                self.info.frame_rate
            )));
        }
        self.get_frame(TimeCode::from_frames(index, self.info.frame_rate))
            .await
    }

    /// Tear the session down: cancel everything, stop the worker with
    /// bounded patience, release cached frames. Further calls fail with
    /// [`FrameError::Disposed`].
    pub async fn close(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(source = %self.source.display(), "closing session");
        self.cancel.cancel();
        self.frame_signal.close();
        if tokio::time::timeout(CLOSE_TIMEOUT, self.worker.stop())
            .await
            .is_err()
        {
            warn!(source = %self.source.display(), "decode worker ignored shutdown");
        }
        self.cache.clear();
    }

    fn ensure_open(&self) -> Result<()> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(FrameError::Disposed);
        }
        Ok(())
    }

    fn clamp_target(&self, time: TimeCode) -> TimeCode {
        let time = time.max(TimeCode::ZERO);
        if self.info.duration > TimeCode::ZERO {
            let last_frame = (self.info.duration - self.frame_duration).max(TimeCode::ZERO);
            time.min(last_frame)
        } else {
            time
        }
    }

    fn finish_request(&self, target: TimeCode) {
        self.state.lock().last_request = Some((target, Instant::now()));
    }

    async fn serve_seek_miss(
        &self,
        target: TimeCode,
        delta: Option<TimeCode>,
    ) -> Result<VideoFrame> {
        let catchup = delta
            .map(|d| d > self.sequential_threshold && d <= CATCHUP_LIMIT)
            .unwrap_or(false);

        if catchup {
            debug!(%target, "catchup: restarting worker ahead of playback");
            self.state.lock().worker_needs_restart = true;
            self.ensure_worker_ready(target).await;
            if let Some(frame) = self.wait_for_cached_frame(target, CATCHUP_WAIT).await? {
                self.state.lock().fallback_streak = 0;
                return Ok(frame);
            }
        }

        let frame = self.decode_single_and_cache(target).await?;
        self.state.lock().worker_needs_restart = true;
        self.prime_worker(target);
        Ok(frame)
    }

    async fn serve_sequential_miss(&self, target: TimeCode) -> Result<VideoFrame> {
        self.ensure_worker_ready(target).await;

        let budget = if self.state.lock().fallback_streak > 0 {
            RECOVERY_WAIT
        } else {
            SEQUENTIAL_WAIT
        };
        if let Some(frame) = self.wait_for_cached_frame(target, budget).await? {
            self.state.lock().fallback_streak = 0;
            return Ok(frame);
        }

        let streak = {
            let mut state = self.state.lock();
            state.fallback_streak += 1;
            state.fallback_streak
        };
        warn!(%target, streak, "sequential miss fell back to single-frame decode");
        let frame = self.decode_single_and_cache(target).await?;

        if streak >= FALLBACK_RESTART_STREAK {
            {
                let mut state = self.state.lock();
                state.worker_needs_restart = true;
                state.fallback_streak = 0;
            }
            self.ensure_worker_ready(target).await;
        } else {
            self.worker.update_demand(target);
        }
        Ok(frame)
    }

    /// Make sure the worker is alive and pointed past `target`, retuning it
    /// on the way. A running worker is never restarted just because the
    /// request ran ahead of what it has decoded.
    async fn ensure_worker_ready(&self, target: TimeCode) {
        let _ready = self.ready_lock.lock().await;
        self.apply_adaptive_strategy(target);

        let marked = {
            let mut state = self.state.lock();
            let marked = state.worker_needs_restart || state.worker_target_time.is_none();
            if marked {
                state.worker_needs_restart = false;
                state.worker_target_time = Some(target);
            }
            marked
        };

        if marked || !self.worker.is_running().await {
            self.worker.ensure_started_at(target, &self.cancel).await;
            self.state.lock().worker_needs_restart = false;
        }

        {
            let mut state = self.state.lock();
            state.worker_target_time =
                Some(state.worker_target_time.map_or(target, |t| t.max(target)));
        }
        self.worker.update_demand(target);
    }

    fn apply_adaptive_strategy(&self, target: TimeCode) {
        let (sample, delta, instructed) = {
            let state = self.state.lock();
            (state.last_sample, state.last_delta, state.instructed)
        };

        let speed = if sample.has_signal && delta.map_or(false, TimeCode::is_negative) {
            MIN_ADAPTIVE_SPEED
        } else {
            sample
                .speed
                .abs()
                .clamp(MIN_ADAPTIVE_SPEED, MAX_ADAPTIVE_SPEED)
        };

        let headroom = self
            .worker
            .decoded_until()
            .map(|d| (d - target).max(TimeCode::ZERO))
            .unwrap_or(TimeCode::ZERO);

        let mut look_ahead = instructed.look_ahead;
        let mut chunk = instructed.chunk;
        if headroom <= self.frame_duration.mul_f64(LOW_HEADROOM_FRAMES) {
            look_ahead = look_ahead.mul_f64(LOOK_AHEAD_GROWTH);
            chunk = chunk.mul_f64(CHUNK_GROWTH);
        } else if headroom >= self.bands.base_look_ahead.mul_f64(HIGH_HEADROOM_FACTOR) {
            look_ahead = look_ahead.mul_f64(HEADROOM_SHRINK);
            chunk = chunk.mul_f64(HEADROOM_SHRINK);
        }

        // Faster playback raises the useful floor of the look-ahead band.
        let floor = self
            .bands
            .look_min
            .mul_f64(speed)
            .clamp(self.bands.look_min, self.bands.look_max);
        look_ahead = look_ahead.clamp(floor, self.bands.look_max);
        chunk = chunk.clamp(self.bands.chunk_min, self.bands.chunk_max);

        let drift = (look_ahead - instructed.look_ahead)
            .abs()
            .max((chunk - instructed.chunk).abs());
        if drift >= STRATEGY_HYSTERESIS {
            let applied = self.worker.update_strategy(WorkerTuning { chunk, look_ahead });
            self.state.lock().instructed = applied;
            debug!(
                look_ahead = %applied.look_ahead,
                chunk = %applied.chunk,
                speed,
                headroom = %headroom,
                "retuned decode worker"
            );
        }
    }

    /// Block (bounded) until the cache holds a match. `None` on timeout is a
    /// flow-control signal, not an error. The semaphore only says *a* frame
    /// arrived; the cache probe decides whether it was the right one.
    async fn wait_for_cached_frame(
        &self,
        target: TimeCode,
        budget: Duration,
    ) -> Result<Option<VideoFrame>> {
        let deadline = Instant::now() + budget;
        loop {
            if let Some(frame) = self.cache.try_get(target, self.seek_tolerance) {
                return Ok(Some(frame));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(FrameError::Cancelled),
                acquired = tokio::time::timeout(deadline - now, self.frame_signal.acquire()) => {
                    match acquired {
                        Ok(Ok(permit)) => permit.forget(),
                        Ok(Err(_closed)) => return Ok(None),
                        Err(_elapsed) => return Ok(self.cache.try_get(target, self.seek_tolerance)),
                    }
                }
            }
        }
    }

    /// One-shot decode with insert/lookup race resolution.
    async fn decode_single_and_cache(&self, target: TimeCode) -> Result<VideoFrame> {
        for attempt in 1..=SINGLE_DECODE_ATTEMPTS {
            match self.decoder.single_frame(target, &self.cancel).await? {
                Some(frame) => {
                    if self.cache.add(frame.clone()) {
                        self.frame_signal.add_permits(1);
                        return Ok(frame);
                    }
                    // Lost the insert race; the occupant is within tolerance.
                    if let Some(existing) = self.cache.try_get(target, self.seek_tolerance) {
                        return Ok(existing);
                    }
                    // Evicted between add and probe; decode again.
                }
                None => {
                    warn!(%target, attempt, "single-frame decode produced nothing");
                }
            }
        }
        Err(FrameError::DecodeFailed {
            path: (*self.source).clone(),
            time: target,
        })
    }

    /// Fire-and-forget worker restart after a seek, so the next playback
    /// burst finds a warm decoder.
    fn prime_worker(&self, target: TimeCode) {
        if let Some(session) = self.self_ref.upgrade() {
            tokio::spawn(async move {
                session.ensure_worker_ready(target).await;
            });
        }
    }
}

impl Drop for VideoSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adaptive_bands_scale_with_cache() {
        let fd = TimeCode::from_millis(16);
        let small = AdaptiveBands::derive(fd, 12);
        // 0.18 * 12 = 2.16 clamps to 8 frames; 0.9 * 12 = 10.8 clamps to 30.
        assert_eq!(small.look_min, fd.mul_f64(8.0));
        assert_eq!(small.look_max, fd.mul_f64(30.0));

        let big = AdaptiveBands::derive(fd, 1000);
        assert_eq!(big.look_min, fd.mul_f64(72.0));
        assert_eq!(big.look_max, fd.mul_f64(220.0));
        assert!(big.chunk_max < big.look_max);
    }

    #[test]
    fn initial_tuning_sits_inside_bands() {
        let fd = TimeCode::from_millis(16);
        for entries in [12, 64, 240, 1000] {
            let bands = AdaptiveBands::derive(fd, entries);
            let initial = bands.initial();
            assert!(initial.look_ahead >= bands.look_min);
            assert!(initial.look_ahead <= bands.look_max);
            assert!(initial.chunk >= bands.chunk_min);
            assert!(initial.chunk <= bands.chunk_max);
        }
    }
}
