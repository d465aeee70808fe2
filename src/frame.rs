//! Decoded frames and their pooled pixel storage.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use crate::pool::PoolInner;
use crate::timecode::TimeCode;

/// A fixed-geometry BGRA buffer rented from a [`crate::pool::BitmapPool`].
///
/// The buffer goes back to its pool when the `PixelBuffer` drops; that return
/// happens at most once, and not at all if the pool is already gone.
pub struct PixelBuffer {
    data: Option<Vec<u8>>,
    width: u32,
    height: u32,
    pool: Weak<PoolInner>,
}

impl PixelBuffer {
    pub(crate) fn new(data: Vec<u8>, width: u32, height: u32, pool: Weak<PoolInner>) -> Self {
        PixelBuffer {
            data: Some(data),
            width,
            height,
            pool,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn as_slice(&self) -> &[u8] {
        self.data.as_deref().unwrap_or(&[])
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        self.data.as_deref_mut().unwrap_or(&mut [])
    }
}

impl Drop for PixelBuffer {
    fn drop(&mut self) {
        if let (Some(data), Some(pool)) = (self.data.take(), self.pool.upgrade()) {
            pool.give_back(data);
        }
    }
}

/// One decoded picture: source path, timestamp, shared BGRA pixels.
///
/// Clones share the pixel buffer; it returns to the pool when the last clone
/// drops, so a frame evicted from the cache stays valid for a host that is
/// still holding it.
#[derive(Clone)]
pub struct VideoFrame {
    source: Arc<PathBuf>,
    time: TimeCode,
    pixels: Arc<PixelBuffer>,
}

impl VideoFrame {
    pub fn new(source: Arc<PathBuf>, time: TimeCode, pixels: PixelBuffer) -> Self {
        VideoFrame {
            source,
            time,
            pixels: Arc::new(pixels),
        }
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    pub fn time(&self) -> TimeCode {
        self.time
    }

    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.pixels.height()
    }

    /// Tightly packed BGRA rows, `width * 4` bytes each.
    pub fn data(&self) -> &[u8] {
        self.pixels.as_slice()
    }
}

impl std::fmt::Debug for VideoFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VideoFrame")
            .field("source", &self.source)
            .field("time", &self.time)
            .field("width", &self.width())
            .field("height", &self.height())
            .finish()
    }
}
