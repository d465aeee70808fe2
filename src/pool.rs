//! Bounded pool of reusable BGRA pixel buffers.
//!
//! One pool per session, one geometry per pool. Rented buffers find their way
//! back through [`PixelBuffer`]'s drop; returns above capacity or with the
//! wrong geometry are freed instead of kept.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::frame::PixelBuffer;

pub const BYTES_PER_PIXEL: usize = 4;

#[derive(Clone)]
pub struct BitmapPool {
    inner: Arc<PoolInner>,
}

pub(crate) struct PoolInner {
    width: u32,
    height: u32,
    capacity: usize,
    free: Mutex<Vec<Vec<u8>>>,
}

impl PoolInner {
    pub(crate) fn frame_size(&self) -> usize {
        self.width as usize * self.height as usize * BYTES_PER_PIXEL
    }

    /// Accept a buffer back from a dropped [`PixelBuffer`].
    pub(crate) fn give_back(&self, buffer: Vec<u8>) {
        if buffer.len() != self.frame_size() {
            return;
        }
        let mut free = self.free.lock();
        if free.len() < self.capacity {
            free.push(buffer);
        }
    }
}

impl BitmapPool {
    pub fn new(width: u32, height: u32, capacity: usize) -> Self {
        BitmapPool {
            inner: Arc::new(PoolInner {
                width,
                height,
                capacity,
                free: Mutex::new(Vec::with_capacity(capacity)),
            }),
        }
    }

    pub fn width(&self) -> u32 {
        self.inner.width
    }

    pub fn height(&self) -> u32 {
        self.inner.height
    }

    /// Bytes per frame at this pool's geometry.
    pub fn frame_size(&self) -> usize {
        self.inner.frame_size()
    }

    /// Buffers currently parked in the pool.
    pub fn available(&self) -> usize {
        self.inner.free.lock().len()
    }

    /// Rent a buffer, reusing a parked one when possible.
    pub fn rent(&self) -> PixelBuffer {
        let buffer = {
            let mut free = self.inner.free.lock();
            free.pop()
        };
        let buffer = buffer.unwrap_or_else(|| vec![0u8; self.frame_size()]);
        PixelBuffer::new(
            buffer,
            self.inner.width,
            self.inner.height,
            Arc::downgrade(&self.inner),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rent_allocates_when_empty() {
        let pool = BitmapPool::new(4, 2, 2);
        assert_eq!(pool.available(), 0);
        let buf = pool.rent();
        assert_eq!(buf.as_slice().len(), 4 * 2 * 4);
    }

    #[test]
    fn drop_returns_buffer() {
        let pool = BitmapPool::new(4, 2, 2);
        let buf = pool.rent();
        drop(buf);
        assert_eq!(pool.available(), 1);

        // The parked buffer is reused, not reallocated.
        let _again = pool.rent();
        assert_eq!(pool.available(), 0);
    }

    #[test]
    fn returns_above_capacity_are_freed() {
        let pool = BitmapPool::new(4, 2, 1);
        let a = pool.rent();
        let b = pool.rent();
        drop(a);
        drop(b);
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn return_after_pool_drop_is_harmless() {
        let pool = BitmapPool::new(4, 2, 1);
        let buf = pool.rent();
        drop(pool);
        drop(buf);
    }
}
