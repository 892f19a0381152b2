//! Test doubles for the RTSP frontend contracts

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::{MediaFrame, RtspSession, StreamInfo};

/// One frame captured by a mock session, with the track index it arrived on.
#[derive(Debug, Clone)]
pub struct PushedFrame {
    pub frame: MediaFrame,
    pub track_index: Option<usize>,
}

/// Scriptable in-memory session handle.
pub struct MockSession {
    id: String,
    playing: AtomicBool,
    transport_alive: AtomicBool,
    accept_frames: AtomicBool,
    info: Mutex<Option<Arc<StreamInfo>>>,
    pushed: Mutex<Vec<PushedFrame>>,
}

impl MockSession {
    pub fn new(id: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            playing: AtomicBool::new(true),
            transport_alive: AtomicBool::new(true),
            accept_frames: AtomicBool::new(true),
            info: Mutex::new(None),
            pushed: Mutex::new(Vec::new()),
        })
    }

    pub fn with_info(id: impl Into<String>, info: Arc<StreamInfo>) -> Arc<Self> {
        let session = Self::new(id);
        *session.info.lock() = Some(info);
        session
    }

    pub fn set_playing(&self, playing: bool) {
        self.playing.store(playing, Ordering::SeqCst);
    }

    pub fn set_transport_alive(&self, alive: bool) {
        self.transport_alive.store(alive, Ordering::SeqCst);
    }

    pub fn set_accept_frames(&self, accept: bool) {
        self.accept_frames.store(accept, Ordering::SeqCst);
    }

    pub fn pushed_frames(&self) -> Vec<PushedFrame> {
        self.pushed.lock().clone()
    }

    pub fn pushed_count(&self) -> usize {
        self.pushed.lock().len()
    }
}

impl RtspSession for MockSession {
    fn session_id(&self) -> &str {
        &self.id
    }

    fn is_playing(&self) -> bool {
        self.playing.load(Ordering::SeqCst)
    }

    fn transport_alive(&self) -> bool {
        self.transport_alive.load(Ordering::SeqCst)
    }

    fn push_frame(&self, frame: MediaFrame) -> bool {
        if !self.accept_frames.load(Ordering::SeqCst) {
            return false;
        }
        self.pushed.lock().push(PushedFrame {
            frame,
            track_index: None,
        });
        true
    }

    fn push_frame_track(&self, frame: MediaFrame, track_index: usize) -> bool {
        if !self.accept_frames.load(Ordering::SeqCst) {
            return false;
        }
        self.pushed.lock().push(PushedFrame {
            frame,
            track_index: Some(track_index),
        });
        true
    }

    fn stream_info(&self) -> Option<Arc<StreamInfo>> {
        self.info.lock().clone()
    }
}
