//! Bridge from RTSP lifecycle events to engine actions
//!
//! [`VodEngine`] owns the process-wide engine state (mapped-file cache,
//! session registry, media catalog) and translates the frontend's session
//! lifecycle callbacks into registry calls. All other callbacks are
//! observational.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::catalog::{CatalogEntry, MediaCatalog};
use crate::fs::FileCache;
use crate::readers::{ts::DEFAULT_TS_BITRATE, DEFAULT_FRAME_RATE};
use crate::rtsp::{CodecTag, RtspEventHandler, RtspSession, StreamInfo};
use crate::session::{SessionRegistry, WorkerSpec};

/// The VOD streaming engine.
pub struct VodEngine {
    cache: Arc<FileCache>,
    registry: Arc<SessionRegistry>,
    catalog: Arc<MediaCatalog>,
}

impl VodEngine {
    pub fn new(cache: Arc<FileCache>, catalog: Arc<MediaCatalog>) -> Self {
        let registry = Arc::new(SessionRegistry::new(cache.clone()));
        Self {
            cache,
            registry,
            catalog,
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn cache(&self) -> &Arc<FileCache> {
        &self.cache
    }

    pub fn catalog(&self) -> &Arc<MediaCatalog> {
        &self.catalog
    }

    /// Stop every session and drop all cached mappings.
    pub fn shutdown(&self) {
        info!("shutting down vod engine");
        self.registry.stop_all();
        self.cache.clear();
    }

    /// Codec-appropriate worker spec with the stream's rate hint.
    fn worker_spec(entry: &CatalogEntry, info: &StreamInfo) -> WorkerSpec {
        match entry.codec {
            CodecTag::H264 => WorkerSpec::H264 {
                frame_rate: info
                    .frame_rate
                    .filter(|&fps| fps > 0)
                    .unwrap_or(DEFAULT_FRAME_RATE),
            },
            CodecTag::H265 => WorkerSpec::H265 {
                frame_rate: info
                    .frame_rate
                    .filter(|&fps| fps > 0)
                    .unwrap_or(DEFAULT_FRAME_RATE),
            },
            CodecTag::Aac => WorkerSpec::Aac {
                sample_rate: info
                    .sample_rate
                    .filter(|&rate| rate > 0)
                    .unwrap_or(48_000),
            },
            CodecTag::Mp2t => WorkerSpec::Mp2t {
                bitrate: entry.ts_bitrate.unwrap_or(DEFAULT_TS_BITRATE),
            },
            CodecTag::Mkv => WorkerSpec::Mkv {
                tracks: entry.mkv_tracks.clone(),
            },
        }
    }
}

impl RtspEventHandler for VodEngine {
    fn on_session_created(&self, session: Arc<dyn RtspSession>) {
        debug!(session_id = session.session_id(), "session created");
    }

    fn on_session_destroyed(&self, session_id: &str) {
        debug!(session_id, "session destroyed");
        self.registry.stop(session_id);
    }

    fn on_session_start_play(&self, session: Arc<dyn RtspSession>) {
        let session_id = session.session_id().to_string();

        let Some(info) = session.stream_info() else {
            warn!(session_id = %session_id, "no stream info for session");
            return;
        };
        let Some(entry) = self.catalog.get(&info.stream_path) else {
            warn!(
                session_id = %session_id,
                stream = %info.stream_path,
                "media file not found for stream"
            );
            return;
        };

        let spec = Self::worker_spec(entry, &info);
        if !self.registry.start(session, &entry.file_path, spec) {
            warn!(
                session_id = %session_id,
                stream = %info.stream_path,
                "failed to start session worker"
            );
        }
    }

    fn on_session_stop_play(&self, session_id: &str) {
        debug!(session_id, "session stop play");
        self.registry.stop(session_id);
    }

    fn on_play_received(&self, client_ip: &str, stream_path: &str, range: &str) {
        debug!(client_ip, stream_path, range, "PLAY received");
    }

    fn on_pause_received(&self, client_ip: &str, stream_path: &str) {
        debug!(client_ip, stream_path, "PAUSE received");
    }

    fn on_teardown_received(&self, client_ip: &str, stream_path: &str) {
        debug!(client_ip, stream_path, "TEARDOWN received");
    }

    fn on_client_connected(&self, client_ip: &str, user_agent: &str) {
        debug!(client_ip, user_agent, "client connected");
    }

    fn on_client_disconnected(&self, client_ip: &str) {
        debug!(client_ip, "client disconnected");
    }

    fn on_stream_requested(&self, stream_path: &str, client_ip: &str) {
        debug!(stream_path, client_ip, "stream requested");
    }

    fn on_setup_received(&self, client_ip: &str, transport: &str, stream_path: &str) {
        debug!(client_ip, transport, stream_path, "SETUP received");
    }
}
