//! Error taxonomy for the frame access core.

use std::path::PathBuf;

use thiserror::Error;

use crate::timecode::TimeCode;

pub type Result<T> = std::result::Result<T, FrameError>;

#[derive(Debug, Error)]
pub enum FrameError {
    /// Bad input at the public boundary (negative index, unknown frame rate).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The probe found nothing decodable in the file.
    #[error("no video stream found in {}", .0.display())]
    NoVideoStream(PathBuf),

    /// Single-frame decode exhausted its retries.
    #[error("decode failed for {} at {time}", path.display())]
    DecodeFailed { path: PathBuf, time: TimeCode },

    /// The decoder child process could not be started at all.
    #[error("failed to start decoder process: {0}")]
    DecoderSpawn(#[source] std::io::Error),

    /// The metadata probe process failed or produced unusable output.
    #[error("stream probe failed for {}: {reason}", path.display())]
    ProbeFailed { path: PathBuf, reason: String },

    /// Session cancellation propagated through a wait or decode.
    #[error("operation cancelled")]
    Cancelled,

    /// Operation on a session that has already been closed.
    #[error("session is closed")]
    Disposed,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
