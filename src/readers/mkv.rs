//! Per-session Matroska reader
//!
//! Wraps a pull-based EBML/Matroska demuxer over the shared file mapping.
//! Frames for one selected track are buffered in a bounded queue (cap 50)
//! that is refilled whenever it runs below 10 entries and the demuxer has
//! not hit end of stream. AVC/HEVC tracks get their
//! length-prefixed block payloads rewritten to Annex-B; AAC tracks pass
//! through as raw frames.

use std::collections::VecDeque;
use std::io::{Read, Seek, SeekFrom};
use std::sync::Arc;

use bytes::Bytes;
use matroska_demuxer::{Frame, MatroskaFile, TrackType};
use tracing::{debug, warn};

use super::{AccessUnit, PlaybackInfo};
use crate::error::{AppError, Result};
use crate::fs::MappedFile;
use crate::media::codec_private::{self, ParameterSets};

/// Queue high-water mark; demuxing pauses once this many frames are buffered.
const MAX_BUFFER_FRAMES: usize = 50;

/// Queue low-water mark that triggers a refill.
const MIN_BUFFER_FRAMES: usize = 10;

/// Matroska codec ids the engine can stream.
pub const CODEC_ID_AVC: &str = "V_MPEG4/ISO/AVC";
pub const CODEC_ID_HEVC: &str = "V_MPEGH/ISO/HEVC";
pub const CODEC_ID_AAC: &str = "A_AAC";

/// `Read + Seek` view over a shared mapping, for feeding the demuxer.
pub(crate) struct MappedCursor {
    file: Arc<MappedFile>,
    pos: u64,
}

impl MappedCursor {
    pub(crate) fn new(file: Arc<MappedFile>) -> Self {
        Self { file, pos: 0 }
    }
}

impl Read for MappedCursor {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let data = self.file.bytes();
        let start = (self.pos as usize).min(data.len());
        let count = buf.len().min(data.len() - start);
        buf[..count].copy_from_slice(&data[start..start + count]);
        self.pos += count as u64;
        Ok(count)
    }
}

impl Seek for MappedCursor {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        let len = self.file.len() as i64;
        let target = match pos {
            SeekFrom::Start(n) => n as i64,
            SeekFrom::End(n) => len + n,
            SeekFrom::Current(n) => self.pos as i64 + n,
        };
        if target < 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "seek before start",
            ));
        }
        self.pos = target as u64;
        Ok(self.pos)
    }
}

/// Metadata for one selectable track.
#[derive(Debug, Clone, Default)]
pub struct MkvTrackInfo {
    pub track_number: u64,
    pub codec_id: String,
    pub is_video: bool,
    pub width: u32,
    pub height: u32,
    pub sample_rate: u32,
    pub channels: u8,
    /// Nominal frame duration in nanoseconds, when the track declares one.
    pub default_duration_ns: Option<u64>,
    /// Parameter sets recovered from avcC/hvcC codec-private data.
    pub parameter_sets: ParameterSets,
}

impl MkvTrackInfo {
    /// Nominal frame rate derived from the declared frame duration.
    pub fn frame_rate(&self) -> u32 {
        match self.default_duration_ns {
            Some(ns) if ns > 0 => (1_000_000_000f64 / ns as f64).round() as u32,
            _ => super::DEFAULT_FRAME_RATE,
        }
    }
}

struct QueuedFrame {
    data: Vec<u8>,
    timestamp_ms: u64,
    is_keyframe: bool,
}

/// Streaming cursor over one track of a Matroska file.
pub struct MkvReader {
    file: Arc<MappedFile>,
    demux: MatroskaFile<MappedCursor>,
    track: MkvTrackInfo,
    queue: VecDeque<QueuedFrame>,
    eos: bool,
    frame_index: u64,
    current_time_ms: u64,
    total_frames_seen: u64,
    timestamp_scale_ns: u64,
    duration_secs: f64,
}

impl MkvReader {
    /// Open the file and prepare streaming of `track_number`.
    ///
    /// Fails when the track does not exist, its codec is unsupported, or no
    /// frame for it can be buffered; a failed open fails session start.
    pub fn new(file: Arc<MappedFile>, track_number: u64) -> Result<Self> {
        let demux = MatroskaFile::open(MappedCursor::new(file.clone()))?;

        let track = find_track(&demux, track_number).ok_or_else(|| AppError::InvalidMedia {
            path: file.path().to_path_buf(),
            reason: format!("track {track_number} not found"),
        })?;

        let timestamp_scale_ns = demux.info().timestamp_scale().get();
        let duration_secs = demux
            .info()
            .duration()
            .map(|d| d * timestamp_scale_ns as f64 / 1_000_000_000.0)
            .unwrap_or(0.0);

        let mut reader = Self {
            file,
            demux,
            track,
            queue: VecDeque::new(),
            eos: false,
            frame_index: 0,
            current_time_ms: 0,
            total_frames_seen: 0,
            timestamp_scale_ns,
            duration_secs,
        };

        reader.fill_queue();
        if reader.queue.is_empty() {
            return Err(AppError::InvalidMedia {
                path: reader.file.path().to_path_buf(),
                reason: format!("no frames for track {track_number}"),
            });
        }

        debug!(
            path = %reader.file.path().display(),
            track = track_number,
            codec = %reader.track.codec_id,
            buffered = reader.queue.len(),
            "mkv reader initialized"
        );
        Ok(reader)
    }

    /// Pull demuxed frames for the selected track until the queue is full or
    /// the stream ends.
    fn fill_queue(&mut self) {
        let mut frame = Frame::default();

        while self.queue.len() < MAX_BUFFER_FRAMES && !self.eos {
            match self.demux.next_frame(&mut frame) {
                Ok(true) => {
                    if frame.track != self.track.track_number {
                        continue;
                    }

                    let timestamp_ns = frame.timestamp * self.timestamp_scale_ns;
                    self.queue.push_back(QueuedFrame {
                        data: std::mem::take(&mut frame.data),
                        timestamp_ms: timestamp_ns / 1_000_000,
                        is_keyframe: frame.is_keyframe.unwrap_or(!self.track.is_video),
                    });
                    self.total_frames_seen += 1;
                }
                Ok(false) => {
                    self.eos = true;
                }
                Err(e) => {
                    warn!(
                        path = %self.file.path().display(),
                        error = %e,
                        "mkv demux error, treating as end of stream"
                    );
                    self.eos = true;
                }
            }
        }
    }

    /// Pop the next frame, converted for elementary-stream delivery.
    pub fn read_next(&mut self) -> Option<AccessUnit> {
        if self.queue.len() < MIN_BUFFER_FRAMES && !self.eos {
            self.fill_queue();
        }

        let frame = self.queue.pop_front()?;

        let data = if self.is_annexb_video() {
            match codec_private::length_prefixed_to_annexb(
                &frame.data,
                self.track.parameter_sets.nal_length_size,
            ) {
                Some(converted) => converted,
                None => {
                    warn!(
                        path = %self.file.path().display(),
                        "bad NAL length prefix in block, passing frame through"
                    );
                    Bytes::from(frame.data)
                }
            }
        } else {
            Bytes::from(frame.data)
        };

        self.frame_index += 1;
        self.current_time_ms = frame.timestamp_ms;

        Some(AccessUnit {
            data,
            is_keyframe: frame.is_keyframe,
            index: self.frame_index - 1,
            timestamp_ms: frame.timestamp_ms,
        })
    }

    /// Rewind to the beginning by reopening the demuxer over a fresh cursor.
    pub fn reset(&mut self) -> Result<()> {
        self.demux = MatroskaFile::open(MappedCursor::new(self.file.clone()))?;
        self.queue.clear();
        self.eos = false;
        self.frame_index = 0;
        self.current_time_ms = 0;
        self.total_frames_seen = 0;
        self.fill_queue();
        Ok(())
    }

    fn is_annexb_video(&self) -> bool {
        self.track.is_video
            && (self.track.codec_id.starts_with(CODEC_ID_AVC)
                || self.track.codec_id.starts_with(CODEC_ID_HEVC))
    }

    pub fn is_eos(&self) -> bool {
        self.eos && self.queue.is_empty()
    }

    pub fn track(&self) -> &MkvTrackInfo {
        &self.track
    }

    pub fn duration_secs(&self) -> f64 {
        self.duration_secs
    }

    pub fn playback_info(&self) -> PlaybackInfo {
        PlaybackInfo {
            current_frame: self.frame_index,
            current_time: self.current_time_ms as f64 / 1000.0,
            total_frames: self.total_frames_seen as usize,
            total_duration: self.duration_secs,
        }
    }
}

/// Enumerate the streamable tracks of a Matroska file.
///
/// Used by the catalog to pick the default video and audio track and to
/// build stream registration info without keeping a demuxer alive.
pub fn probe_tracks(file: &Arc<MappedFile>) -> Result<Vec<MkvTrackInfo>> {
    let demux = MatroskaFile::open(MappedCursor::new(file.clone()))?;
    Ok(demux
        .tracks()
        .iter()
        .filter_map(|entry| track_info(entry))
        .collect())
}

fn find_track<R: Read + Seek>(demux: &MatroskaFile<R>, track_number: u64) -> Option<MkvTrackInfo> {
    demux
        .tracks()
        .iter()
        .find(|t| t.track_number().get() == track_number)
        .and_then(track_info)
}

fn track_info(entry: &matroska_demuxer::TrackEntry) -> Option<MkvTrackInfo> {
    let is_video = match entry.track_type() {
        TrackType::Video => true,
        TrackType::Audio => false,
        _ => return None,
    };

    let codec_id = entry.codec_id().to_string();
    let mut info = MkvTrackInfo {
        track_number: entry.track_number().get(),
        is_video,
        default_duration_ns: entry.default_duration().map(|d| d.get()),
        ..Default::default()
    };

    if let Some(video) = entry.video() {
        info.width = video.pixel_width().get() as u32;
        info.height = video.pixel_height().get() as u32;
    }
    if let Some(audio) = entry.audio() {
        info.sample_rate = audio.sampling_frequency() as u32;
        info.channels = audio.channels().get() as u8;
    }

    if let Some(cp) = entry.codec_private() {
        if codec_id.starts_with(CODEC_ID_AVC) {
            info.parameter_sets = codec_private::parse_avcc(cp).unwrap_or_default();
        } else if codec_id.starts_with(CODEC_ID_HEVC) {
            info.parameter_sets = codec_private::parse_hvcc(cp).unwrap_or_default();
        }
    }

    info.codec_id = codec_id;
    Some(info)
}
