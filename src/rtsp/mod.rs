//! Contracts shared with the external RTSP frontend
//!
//! The wire protocol (request parsing, SDP, transport negotiation, RTP
//! packetization) lives outside the engine. This module defines the shapes
//! the two sides exchange: the session handle the engine drives frames into,
//! the stream registration surface, and the lifecycle callbacks the frontend
//! fires. [`StreamTable`] is the routing table a frontend consults to answer
//! DESCRIBE/SETUP for registered paths.

pub mod bridge;

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;

/// Codec of a catalog entry or emitted access unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CodecTag {
    H264,
    H265,
    Aac,
    Mp2t,
    Mkv,
}

impl CodecTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            CodecTag::H264 => "H264",
            CodecTag::H265 => "H265",
            CodecTag::Aac => "AAC",
            CodecTag::Mp2t => "MP2T",
            CodecTag::Mkv => "MKV",
        }
    }
}

impl std::fmt::Display for CodecTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Media kind of a registered stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Video,
    Audio,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Video => "video",
            MediaKind::Audio => "audio",
        }
    }
}

/// Descriptor registered with the RTSP layer for one stream path.
#[derive(Debug, Clone)]
pub struct StreamInfo {
    pub stream_path: String,
    pub media_type: MediaKind,
    pub codec: CodecTag,
    pub payload_type: u8,
    pub clock_rate: u32,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub frame_rate: Option<u32>,
    pub sample_rate: Option<u32>,
    pub channels: Option<u8>,
    pub sps: Option<Bytes>,
    pub pps: Option<Bytes>,
    pub vps: Option<Bytes>,
}

impl StreamInfo {
    /// Skeleton descriptor with only the mandatory fields set.
    pub fn new(
        stream_path: impl Into<String>,
        media_type: MediaKind,
        codec: CodecTag,
        payload_type: u8,
        clock_rate: u32,
    ) -> Self {
        Self {
            stream_path: stream_path.into(),
            media_type,
            codec,
            payload_type,
            clock_rate,
            width: None,
            height: None,
            frame_rate: None,
            sample_rate: None,
            channels: None,
            sps: None,
            pps: None,
            vps: None,
        }
    }
}

/// One access unit handed to a session for packetization.
#[derive(Debug, Clone)]
pub struct MediaFrame {
    pub data: Bytes,
    /// RTP timestamp in the stream's media clock.
    pub timestamp: u32,
    pub media_type: CodecTag,
    pub is_keyframe: bool,
}

/// Handle to one RTSP session, implemented by the frontend.
pub trait RtspSession: Send + Sync {
    /// Opaque unique session id.
    fn session_id(&self) -> &str;

    /// True while the session is in the PLAY state.
    fn is_playing(&self) -> bool;

    /// True while the underlying network transport is still valid.
    fn transport_alive(&self) -> bool;

    /// Push one access unit. Returns false when the session cannot accept it.
    fn push_frame(&self, frame: MediaFrame) -> bool;

    /// Push one access unit for a specific track of a multi-track stream.
    fn push_frame_track(&self, frame: MediaFrame, track_index: usize) -> bool {
        let _ = track_index;
        self.push_frame(frame)
    }

    /// The stream descriptor this session was set up for.
    fn stream_info(&self) -> Option<Arc<StreamInfo>>;
}

/// Stream registration surface of the RTSP frontend.
pub trait RtspServer: Send + Sync {
    /// Register a stream path. Returns false when the path is rejected.
    fn add_media_stream(&self, stream_path: &str, info: StreamInfo) -> bool;
}

/// Lifecycle callbacks fired by the RTSP frontend.
///
/// The engine consumes the five session lifecycle events; the remaining
/// callbacks are observational and default to no-ops.
pub trait RtspEventHandler: Send + Sync {
    fn on_session_created(&self, session: Arc<dyn RtspSession>) {
        let _ = session;
    }
    fn on_session_destroyed(&self, session_id: &str);
    fn on_session_start_play(&self, session: Arc<dyn RtspSession>);
    fn on_session_stop_play(&self, session_id: &str);

    fn on_play_received(&self, client_ip: &str, stream_path: &str, range: &str) {
        let _ = (client_ip, stream_path, range);
    }
    fn on_pause_received(&self, client_ip: &str, stream_path: &str) {
        let _ = (client_ip, stream_path);
    }
    fn on_teardown_received(&self, client_ip: &str, stream_path: &str) {
        let _ = (client_ip, stream_path);
    }
    fn on_client_connected(&self, client_ip: &str, user_agent: &str) {
        let _ = (client_ip, user_agent);
    }
    fn on_client_disconnected(&self, client_ip: &str) {
        let _ = client_ip;
    }
    fn on_stream_requested(&self, stream_path: &str, client_ip: &str) {
        let _ = (stream_path, client_ip);
    }
    fn on_setup_received(&self, client_ip: &str, transport: &str, stream_path: &str) {
        let _ = (client_ip, transport, stream_path);
    }
}

/// Routing table of registered streams.
///
/// The frontend answers DESCRIBE/SETUP for a path with the descriptor stored
/// here. Registration is idempotent per path; a duplicate path is rejected.
#[derive(Default)]
pub struct StreamTable {
    streams: RwLock<HashMap<String, Arc<StreamInfo>>>,
}

impl StreamTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, stream_path: &str) -> Option<Arc<StreamInfo>> {
        self.streams.read().get(stream_path).cloned()
    }

    pub fn paths(&self) -> Vec<String> {
        let mut paths: Vec<_> = self.streams.read().keys().cloned().collect();
        paths.sort();
        paths
    }

    pub fn len(&self) -> usize {
        self.streams.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.read().is_empty()
    }
}

impl RtspServer for StreamTable {
    fn add_media_stream(&self, stream_path: &str, info: StreamInfo) -> bool {
        let mut streams = self.streams.write();
        if streams.contains_key(stream_path) {
            return false;
        }
        streams.insert(stream_path.to_string(), Arc::new(info));
        true
    }
}

#[cfg(test)]
pub(crate) mod mock;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_table_registration() {
        let table = StreamTable::new();
        let info = StreamInfo::new("/a.h264", MediaKind::Video, CodecTag::H264, 96, 90000);
        assert!(table.add_media_stream("/a.h264", info.clone()));
        assert!(!table.add_media_stream("/a.h264", info));
        assert_eq!(table.len(), 1);

        let stored = table.get("/a.h264").unwrap();
        assert_eq!(stored.codec, CodecTag::H264);
        assert!(table.get("/missing").is_none());
    }

    #[test]
    fn test_codec_tag_names() {
        assert_eq!(CodecTag::H264.as_str(), "H264");
        assert_eq!(CodecTag::Mp2t.as_str(), "MP2T");
        assert_eq!(MediaKind::Audio.as_str(), "audio");
    }
}
