//! Sinks that turn the decoder's raw pixel pipe into frames.
//!
//! The pipe delivers tightly packed BGRA with no framing of its own; both
//! sinks count bytes against the fixed frame size. Buffers come from the
//! session's pool and go back there if a sink is dropped mid-frame.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::frame::{PixelBuffer, VideoFrame};
use crate::pool::BitmapPool;
use crate::timecode::TimeCode;

/// Collects exactly one frame's worth of bytes; surplus is dropped.
pub struct SingleFrameSink {
    buffer: Option<PixelBuffer>,
    filled: usize,
    frame_size: usize,
}

impl SingleFrameSink {
    pub fn new(pool: &BitmapPool) -> Self {
        SingleFrameSink {
            buffer: Some(pool.rent()),
            filled: 0,
            frame_size: pool.frame_size(),
        }
    }

    pub fn write(&mut self, bytes: &[u8]) {
        let Some(buffer) = self.buffer.as_mut() else {
            return;
        };
        let room = self.frame_size - self.filled;
        let take = room.min(bytes.len());
        buffer.as_mut_slice()[self.filled..self.filled + take].copy_from_slice(&bytes[..take]);
        self.filled += take;
    }

    pub fn bytes_written(&self) -> usize {
        self.filled
    }

    pub fn has_frame(&self) -> bool {
        self.filled == self.frame_size
    }

    /// The completed buffer, at most once. Untaken buffers return to the
    /// pool when the sink drops.
    pub fn take_buffer(&mut self) -> Option<PixelBuffer> {
        if self.has_frame() {
            self.buffer.take()
        } else {
            None
        }
    }
}

/// Reassembles a continuous pipe into timestamped frames and publishes them
/// to the bounded frame channel. `write` awaiting on a full channel is what
/// stalls the pipe reader, and through it the decoder child.
pub struct ChunkSink {
    pool: BitmapPool,
    source: Arc<PathBuf>,
    start_time: TimeCode,
    frame_rate: f64,
    tx: mpsc::Sender<VideoFrame>,
    current: PixelBuffer,
    filled: usize,
    frames_emitted: u64,
}

impl ChunkSink {
    pub fn new(
        pool: BitmapPool,
        source: Arc<PathBuf>,
        start_time: TimeCode,
        frame_rate: f64,
        tx: mpsc::Sender<VideoFrame>,
    ) -> Self {
        let current = pool.rent();
        ChunkSink {
            pool,
            source,
            start_time,
            frame_rate,
            tx,
            current,
            filled: 0,
            frames_emitted: 0,
        }
    }

    /// Frames fully published so far.
    pub fn frames_emitted(&self) -> u64 {
        self.frames_emitted
    }

    /// Bytes of the frame currently being assembled.
    pub fn partial_bytes(&self) -> usize {
        self.filled
    }

    fn timestamp(&self, index: u64) -> TimeCode {
        let offset = TimeCode::from_secs_f64(index as f64 / self.frame_rate);
        self.start_time.saturating_add(offset).min(TimeCode::MAX)
    }

    /// Feed arbitrarily chunked pipe bytes. Returns false once the receiving
    /// side is gone and decoding should stop.
    pub async fn write(&mut self, mut bytes: &[u8]) -> bool {
        let frame_size = self.pool.frame_size();
        while !bytes.is_empty() {
            let take = (frame_size - self.filled).min(bytes.len());
            self.current.as_mut_slice()[self.filled..self.filled + take]
                .copy_from_slice(&bytes[..take]);
            self.filled += take;
            bytes = &bytes[take..];

            if self.filled == frame_size {
                let complete = std::mem::replace(&mut self.current, self.pool.rent());
                self.filled = 0;
                let frame = VideoFrame::new(
                    self.source.clone(),
                    self.timestamp(self.frames_emitted),
                    complete,
                );
                self.frames_emitted += 1;
                if self.tx.send(frame).await.is_err() {
                    return false;
                }
            }
        }
        true
    }
}
