//! Frame caching

mod lru;

pub use lru::FrameCache;
