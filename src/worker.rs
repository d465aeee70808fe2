//! Sequential decode worker.
//!
//! One long-lived task per session owns the continuous decode stream, pushes
//! every frame into the cache, and throttles itself so the decoded horizon
//! stays `target_look_ahead` ahead of demand. The child process is never
//! restarted to pace it: when the loop parks on the demand signal, the
//! bounded frame channel fills and the child blocks on its pipe write.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::cache::FrameCache;
use crate::cancel::CancelToken;
use crate::decoder::Decoder;
use crate::timecode::TimeCode;

/// Chunk length and look-ahead currently instructed by the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerTuning {
    pub chunk: TimeCode,
    pub look_ahead: TimeCode,
}

struct WorkerState {
    demand_time: TimeCode,
    decoded_until: Option<TimeCode>,
    tuning: WorkerTuning,
    /// Generation counter; a draining generation must not write progress
    /// into the state of the one that replaced it.
    epoch: u64,
}

struct WorkerShared {
    state: Mutex<WorkerState>,
    demand: Notify,
    frame_signal: Arc<Semaphore>,
    cache: Arc<FrameCache>,
    decoder: Arc<dyn Decoder>,
    frame_duration: TimeCode,
}

impl WorkerShared {
    fn should_wait_for_demand(&self) -> bool {
        let state = self.state.lock();
        let Some(decoded_until) = state.decoded_until else {
            return false;
        };
        let horizon = state
            .demand_time
            .saturating_add(state.tuning.look_ahead.max(state.tuning.chunk));
        decoded_until >= horizon
    }

    fn normalize(&self, tuning: WorkerTuning) -> WorkerTuning {
        let floor = tuning
            .chunk
            .max(self.frame_duration.saturating_add(self.frame_duration));
        WorkerTuning {
            chunk: tuning.chunk,
            look_ahead: tuning.look_ahead.max(floor),
        }
    }
}

/// One generation of the worker: its task plus its kill switch.
#[derive(Default)]
struct Generation {
    task: Option<JoinHandle<()>>,
    cancel: Option<CancelToken>,
}

pub struct SequentialWorker {
    shared: Arc<WorkerShared>,
    lifecycle: tokio::sync::Mutex<Generation>,
}

impl SequentialWorker {
    pub fn new(
        decoder: Arc<dyn Decoder>,
        cache: Arc<FrameCache>,
        frame_signal: Arc<Semaphore>,
        initial: WorkerTuning,
    ) -> Self {
        let frame_duration = decoder.info().frame_duration();
        let shared = Arc::new(WorkerShared {
            state: Mutex::new(WorkerState {
                demand_time: TimeCode::ZERO,
                decoded_until: None,
                tuning: initial,
                epoch: 0,
            }),
            demand: Notify::new(),
            frame_signal,
            cache,
            decoder,
            frame_duration,
        });
        SequentialWorker {
            shared,
            lifecycle: tokio::sync::Mutex::new(Generation::default()),
        }
    }

    /// Highest frame timestamp the current generation has produced.
    pub fn decoded_until(&self) -> Option<TimeCode> {
        self.shared.state.lock().decoded_until
    }

    pub fn tuning(&self) -> WorkerTuning {
        self.shared.state.lock().tuning
    }

    pub async fn is_running(&self) -> bool {
        let generation = self.lifecycle.lock().await;
        generation
            .task
            .as_ref()
            .map(|task| !task.is_finished())
            .unwrap_or(false)
    }

    /// Start a new generation at `start`. The previous generation is
    /// cancelled without being awaited; its shutdown is observed on a
    /// detached task so a tearing-down decoder never blocks this call.
    pub async fn ensure_started_at(&self, start: TimeCode, session_cancel: &CancelToken) {
        let mut generation = self.lifecycle.lock().await;
        let previous_task = generation.task.take();
        let previous_cancel = generation.cancel.take();

        let epoch = {
            let mut state = self.shared.state.lock();
            state.decoded_until = None;
            state.demand_time = start;
            state.epoch += 1;
            state.epoch
        };
        self.shared.demand.notify_one();

        let cancel = session_cancel.child();
        debug!(%start, epoch, "starting decode worker generation");
        let task = tokio::spawn(run_generation(self.shared.clone(), start, epoch, cancel.clone()));
        generation.task = Some(task);
        generation.cancel = Some(cancel);
        drop(generation);

        if let Some(cancel) = previous_cancel {
            cancel.cancel();
        }
        if let Some(task) = previous_task {
            tokio::spawn(async move {
                let _ = task.await;
            });
        }
    }

    /// Advance demand monotonically and wake the run loop.
    pub fn update_demand(&self, time: TimeCode) {
        {
            let mut state = self.shared.state.lock();
            state.demand_time = state.demand_time.max(time);
        }
        self.shared.demand.notify_one();
    }

    /// Install new tuning. Look-ahead is kept at least one chunk (and two
    /// frame durations) so the loop can never throttle itself to a standstill.
    pub fn update_strategy(&self, tuning: WorkerTuning) -> WorkerTuning {
        let normalized = self.shared.normalize(tuning);
        {
            let mut state = self.shared.state.lock();
            state.tuning = normalized;
        }
        self.shared.demand.notify_one();
        normalized
    }

    /// Cancel the current generation and wait for it to finish.
    pub async fn stop(&self) {
        let mut generation = self.lifecycle.lock().await;
        if let Some(cancel) = generation.cancel.take() {
            cancel.cancel();
        }
        if let Some(task) = generation.task.take() {
            let _ = task.await;
        }
    }
}

async fn run_generation(
    shared: Arc<WorkerShared>,
    start: TimeCode,
    epoch: u64,
    cancel: CancelToken,
) {
    let mut stream = match shared.decoder.decode_range(start, None, &cancel) {
        Ok(stream) => stream,
        Err(e) => {
            warn!(%start, error = %e, "decode worker failed to start");
            return;
        }
    };

    let mut produced: u64 = 0;
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = stream.next() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        let time = frame.time();
        if shared.cache.add(frame) {
            shared.frame_signal.add_permits(1);
        }
        // A rejected duplicate just dropped; its buffer is back in the pool.

        {
            let mut state = shared.state.lock();
            if state.epoch == epoch {
                state.decoded_until = Some(state.decoded_until.map_or(time, |d| d.max(time)));
            }
        }
        produced += 1;

        while shared.should_wait_for_demand() {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(produced, "decode worker generation cancelled while idle");
                    return;
                }
                _ = shared.demand.notified() => {}
            }
        }
    }
    debug!(produced, "decode worker generation finished");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tuning(chunk_ms: i64, look_ms: i64) -> WorkerTuning {
        WorkerTuning {
            chunk: TimeCode::from_millis(chunk_ms),
            look_ahead: TimeCode::from_millis(look_ms),
        }
    }

    fn shared_for_test() -> WorkerShared {
        use crate::cache::FrameCache;
        use crate::decoder::{Decoder, FrameStream, StreamInfo};
        use futures_util::future::BoxFuture;

        struct NullDecoder(StreamInfo);
        impl Decoder for NullDecoder {
            fn info(&self) -> &StreamInfo {
                &self.0
            }
            fn single_frame<'a>(
                &'a self,
                _time: TimeCode,
                _cancel: &'a CancelToken,
            ) -> BoxFuture<'a, crate::error::Result<Option<crate::frame::VideoFrame>>> {
                Box::pin(async { Ok(None) })
            }
            fn decode_range(
                &self,
                _start: TimeCode,
                _max_length: Option<TimeCode>,
                _cancel: &CancelToken,
            ) -> crate::error::Result<FrameStream> {
                let (_tx, stream) = FrameStream::channel();
                Ok(stream)
            }
        }

        let info = StreamInfo {
            width: 2,
            height: 2,
            frame_rate: 50.0,
            duration: TimeCode::from_secs(10),
        };
        WorkerShared {
            state: Mutex::new(WorkerState {
                demand_time: TimeCode::ZERO,
                decoded_until: None,
                tuning: tuning(100, 200),
                epoch: 0,
            }),
            demand: Notify::new(),
            frame_signal: Arc::new(Semaphore::new(0)),
            cache: Arc::new(FrameCache::new(4, TimeCode::from_millis(10))),
            decoder: Arc::new(NullDecoder(info)),
            frame_duration: TimeCode::from_millis(20),
        }
    }

    #[test]
    fn waits_only_past_the_demand_horizon() {
        let shared = shared_for_test();
        // Nothing decoded yet: never wait.
        assert!(!shared.should_wait_for_demand());

        shared.state.lock().decoded_until = Some(TimeCode::from_millis(150));
        assert!(!shared.should_wait_for_demand(), "under demand + look_ahead");

        shared.state.lock().decoded_until = Some(TimeCode::from_millis(200));
        assert!(shared.should_wait_for_demand(), "at the horizon");

        shared.state.lock().demand_time = TimeCode::from_millis(100);
        assert!(!shared.should_wait_for_demand(), "demand advanced");
    }

    #[test]
    fn horizon_uses_larger_of_chunk_and_look_ahead() {
        let shared = shared_for_test();
        shared.state.lock().tuning = tuning(300, 200);
        shared.state.lock().decoded_until = Some(TimeCode::from_millis(250));
        assert!(!shared.should_wait_for_demand(), "chunk dominates the horizon");
        shared.state.lock().decoded_until = Some(TimeCode::from_millis(300));
        assert!(shared.should_wait_for_demand());
    }

    #[test]
    fn normalize_keeps_look_ahead_workable() {
        let shared = shared_for_test();
        // Look-ahead smaller than the chunk gets raised to it.
        let n = shared.normalize(tuning(120, 50));
        assert_eq!(n.look_ahead, TimeCode::from_millis(120));
        // And never below two frame durations (40 ms here).
        let n = shared.normalize(tuning(10, 15));
        assert_eq!(n.look_ahead, TimeCode::from_millis(40));
        assert_eq!(n.chunk, TimeCode::from_millis(10));
    }
}
