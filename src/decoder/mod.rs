//! Decoder contract and the ffmpeg child-process implementation.

pub mod ffmpeg;
pub mod hwaccel;
pub mod probe;
pub mod sink;

use futures_util::future::BoxFuture;
use tokio::sync::mpsc;

use crate::cancel::CancelToken;
use crate::error::Result;
use crate::frame::VideoFrame;
use crate::pool::BYTES_PER_PIXEL;
use crate::timecode::TimeCode;

pub use ffmpeg::FfmpegDecoder;
pub use hwaccel::HwAccelApi;
pub use probe::probe_stream;

/// Fallback when the container reports no usable frame rate.
pub const DEFAULT_FRAME_RATE: f64 = 60.0;

/// Geometry and timing of the video stream, probed once per session.
#[derive(Debug, Clone)]
pub struct StreamInfo {
    pub width: u32,
    pub height: u32,
    pub frame_rate: f64,
    pub duration: TimeCode,
}

impl StreamInfo {
    pub fn frame_duration(&self) -> TimeCode {
        TimeCode::frame_duration(self.frame_rate)
    }

    /// Bytes per raw BGRA frame on the pipe.
    pub fn frame_size(&self) -> usize {
        self.width as usize * self.height as usize * BYTES_PER_PIXEL
    }
}

/// The external decoder behind two operations: one frame at a time, or a
/// seeked continuous stream. The production implementation drives an ffmpeg
/// child process; tests script their own.
pub trait Decoder: Send + Sync {
    fn info(&self) -> &StreamInfo;

    /// Decode exactly one frame at `time`. `Ok(None)` means the decoder ran
    /// but produced nothing usable (truncated output, non-zero exit).
    fn single_frame<'a>(
        &'a self,
        time: TimeCode,
        cancel: &'a CancelToken,
    ) -> BoxFuture<'a, Result<Option<VideoFrame>>>;

    /// Start a decode at `start`, producing frames in order until
    /// `max_length` of media elapses (`None` = until end of stream or
    /// cancellation). Exactly one child process per call.
    fn decode_range(
        &self,
        start: TimeCode,
        max_length: Option<TimeCode>,
        cancel: &CancelToken,
    ) -> Result<FrameStream>;
}

/// Ordered, bounded stream of decoded frames.
///
/// Holding frames unread applies back-pressure to the producer; dropping the
/// stream tears the producer down and frees anything still buffered.
pub struct FrameStream {
    rx: mpsc::Receiver<VideoFrame>,
}

impl FrameStream {
    /// Capacity of the channel between the pipe reader and the consumer.
    /// Bounds pixel memory at the decoder output and is the lever through
    /// which a stalled consumer stalls the child process.
    pub const CHANNEL_CAPACITY: usize = 8;

    pub fn channel() -> (mpsc::Sender<VideoFrame>, FrameStream) {
        let (tx, rx) = mpsc::channel(Self::CHANNEL_CAPACITY);
        (tx, FrameStream { rx })
    }

    /// Next frame in decode order, or `None` at end of stream.
    pub async fn next(&mut self) -> Option<VideoFrame> {
        self.rx.recv().await
    }
}
