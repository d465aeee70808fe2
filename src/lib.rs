//! Timestamp-addressed video frame access over an external ffmpeg decoder.
//!
//! One [`VideoSession`] per file serves both scrubbing (random single-frame
//! seeks) and sequential playback from the same bounded frame cache. A
//! persistent decoder child process, driven by an adaptive look-ahead worker,
//! keeps playback real-time; seeks fall back to one-shot decodes.

pub mod cache;
pub mod cancel;
pub mod config;
pub mod decoder;
pub mod error;
pub mod frame;
pub mod motion;
pub mod pool;
pub mod registry;
pub mod session;
pub mod timecode;
pub mod worker;

pub use cache::FrameCache;
pub use cancel::CancelToken;
pub use config::{load_settings, DecodeOptions};
pub use decoder::{probe_stream, Decoder, FfmpegDecoder, FrameStream, HwAccelApi, StreamInfo};
pub use error::{FrameError, Result};
pub use frame::VideoFrame;
pub use pool::BitmapPool;
pub use registry::FrameServer;
pub use session::VideoSession;
pub use timecode::TimeCode;
