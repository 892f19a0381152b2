//! Per-session media readers
//!
//! Each reader owns a cursor over a shared [`MappedFile`](crate::fs::MappedFile)
//! and yields [`AccessUnit`]s on demand: one NAL unit (H.264/H.265), one ADTS
//! frame (AAC), one 188-byte packet (MPEG-TS) or one demuxed block (Matroska).
//! A reader is exclusively owned by its session's pacing thread; nothing here
//! is shared.

pub mod aac;
pub mod h264;
pub mod h265;
pub mod mkv;
pub mod ts;

use bytes::Bytes;

/// Default frame rate assumed for raw Annex-B streams.
pub const DEFAULT_FRAME_RATE: u32 = 25;

/// A run of unparseable bytes longer than this is fatal to the reader.
pub const MAX_RESYNC_BYTES: usize = 1024 * 1024;

/// One indivisible media payload produced by a reader.
#[derive(Debug, Clone)]
pub struct AccessUnit {
    pub data: Bytes,
    pub is_keyframe: bool,
    /// Monotonic presentation index within the stream.
    pub index: u64,
    pub timestamp_ms: u64,
}

/// One entry of the lazily built video frame index.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameInfo {
    pub offset: usize,
    pub len: usize,
    pub timestamp: f64,
    pub is_keyframe: bool,
    pub nal_type: u8,
}

/// Position and totals snapshot for logging and the catalog banner.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PlaybackInfo {
    pub current_frame: u64,
    pub current_time: f64,
    pub total_frames: usize,
    pub total_duration: f64,
}
