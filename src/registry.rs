//! Path-keyed session registry.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::info;

use crate::config::DecodeOptions;
use crate::error::Result;
use crate::frame::VideoFrame;
use crate::session::VideoSession;
use crate::timecode::TimeCode;

/// One [`VideoSession`] per file, created on first use.
pub struct FrameServer {
    options: DecodeOptions,
    sessions: Mutex<HashMap<PathBuf, Arc<VideoSession>>>,
}

impl FrameServer {
    pub fn new(options: DecodeOptions) -> Self {
        FrameServer {
            options,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub async fn get_frame(&self, path: impl AsRef<Path>, time: TimeCode) -> Result<VideoFrame> {
        self.session_for(path.as_ref()).await?.get_frame(time).await
    }

    pub async fn get_frame_at_index(
        &self,
        path: impl AsRef<Path>,
        index: u32,
    ) -> Result<VideoFrame> {
        self.session_for(path.as_ref())
            .await?
            .get_frame_at_index(index)
            .await
    }

    pub async fn session_for(&self, path: &Path) -> Result<Arc<VideoSession>> {
        if let Some(session) = self.sessions.lock().get(path) {
            return Ok(session.clone());
        }
        let opened = VideoSession::open(path, self.options.clone()).await?;
        let mut sessions = self.sessions.lock();
        // A concurrent open may have won; keep the one already registered.
        if let Some(existing) = sessions.get(path) {
            return Ok(existing.clone());
        }
        sessions.insert(path.to_path_buf(), opened.clone());
        Ok(opened)
    }

    /// Close and drop the session for one file, if any.
    pub async fn close_file(&self, path: &Path) {
        let session = self.sessions.lock().remove(path);
        if let Some(session) = session {
            session.close().await;
        }
    }

    pub async fn close_all(&self) {
        let sessions: Vec<_> = self.sessions.lock().drain().collect();
        info!(count = sessions.len(), "closing all sessions");
        for (_, session) in sessions {
            session.close().await;
        }
    }
}
