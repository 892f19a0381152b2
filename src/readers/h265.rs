//! Per-session H.265 Annex-B reader
//!
//! Same shape as the H.264 reader; the differences are the two-byte NAL
//! header layout, the VCL type ranges and the extra VPS parameter set.

use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, warn};

use super::h264::normalized_unit;
use super::{AccessUnit, FrameInfo, PlaybackInfo, DEFAULT_FRAME_RATE, MAX_RESYNC_BYTES};
use crate::fs::MappedFile;
use crate::media::annexb::{find_nal, NalLayout};

const NAL_VPS: u8 = 32;
const NAL_SPS: u8 = 33;
const NAL_PPS: u8 = 34;

/// IDR_W_RADL, IDR_N_LP and CRA are decoder-resettable keyframes.
const KEYFRAME_RANGE: std::ops::RangeInclusive<u8> = 19..=21;

const PARAM_SET_WINDOW: usize = 64 * 1024;

fn is_vcl(unit_type: u8) -> bool {
    matches!(unit_type, 0..=9 | 16..=21)
}

#[derive(Default)]
struct ParameterSets {
    vps: Option<Bytes>,
    sps: Option<Bytes>,
    pps: Option<Bytes>,
}

/// Cursor over a memory-mapped H.265 Annex-B stream.
pub struct H265Reader {
    file: Arc<MappedFile>,
    offset: usize,
    unit_index: u64,
    timestamp: f64,
    frame_rate: u32,
    index: Option<Vec<FrameInfo>>,
    params: Option<ParameterSets>,
}

impl H265Reader {
    pub fn new(file: Arc<MappedFile>) -> Self {
        debug!(
            path = %file.path().display(),
            size = file.len(),
            "h265 reader created"
        );
        Self {
            file,
            offset: 0,
            unit_index: 0,
            timestamp: 0.0,
            frame_rate: DEFAULT_FRAME_RATE,
            index: None,
            params: None,
        }
    }

    /// Emit the next NAL unit, normalized to a 4-byte start code.
    pub fn read_next(&mut self) -> Option<AccessUnit> {
        let data = self.file.bytes();
        if self.offset >= data.len() {
            return None;
        }

        let nal = find_nal(data, self.offset, NalLayout::H265)?;
        if nal.offset - self.offset > MAX_RESYNC_BYTES {
            warn!(
                path = %self.file.path().display(),
                offset = self.offset,
                "giving up after oversized run of invalid bytes"
            );
            return None;
        }

        let unit = normalized_unit(data, &nal);
        self.offset = nal.offset + nal.len;
        self.unit_index += 1;
        self.timestamp = self.unit_index as f64 / self.frame_rate as f64;

        Some(AccessUnit {
            data: unit,
            is_keyframe: KEYFRAME_RANGE.contains(&nal.unit_type),
            index: self.unit_index - 1,
            timestamp_ms: (self.timestamp * 1000.0) as u64,
        })
    }

    pub fn seek_to_frame(&mut self, frame_index: usize) -> bool {
        self.ensure_index();
        let index = self.index.as_ref().expect("index built");

        let Some(entry) = index.get(frame_index) else {
            warn!(
                frame = frame_index,
                total = index.len(),
                "seek frame out of range"
            );
            return false;
        };

        self.offset = entry.offset;
        self.unit_index = frame_index as u64;
        self.timestamp = entry.timestamp;
        true
    }

    pub fn seek_to_time(&mut self, timestamp: f64) -> bool {
        self.ensure_index();
        let index = self.index.as_ref().expect("index built");

        let frame = index.partition_point(|f| f.timestamp < timestamp);
        if frame >= index.len() {
            return false;
        }
        self.seek_to_frame(frame)
    }

    pub fn reset(&mut self) {
        self.offset = 0;
        self.unit_index = 0;
        self.timestamp = 0.0;
    }

    pub fn set_frame_rate(&mut self, fps: u32) {
        if fps > 0 {
            self.frame_rate = fps;
        }
    }

    pub fn frame_rate(&self) -> u32 {
        self.frame_rate
    }

    pub fn is_eof(&self) -> bool {
        self.offset >= self.file.len()
    }

    pub fn vps(&mut self) -> Option<Bytes> {
        self.ensure_params();
        self.params.as_ref().and_then(|p| p.vps.clone())
    }

    pub fn sps(&mut self) -> Option<Bytes> {
        self.ensure_params();
        self.params.as_ref().and_then(|p| p.sps.clone())
    }

    pub fn pps(&mut self) -> Option<Bytes> {
        self.ensure_params();
        self.params.as_ref().and_then(|p| p.pps.clone())
    }

    pub fn playback_info(&mut self) -> PlaybackInfo {
        self.ensure_index();
        let index = self.index.as_ref().expect("index built");

        PlaybackInfo {
            current_frame: self.unit_index,
            current_time: self.timestamp,
            total_frames: index.len(),
            total_duration: index.last().map(|f| f.timestamp).unwrap_or(0.0),
        }
    }

    fn ensure_index(&mut self) {
        if self.index.is_some() {
            return;
        }

        let data = self.file.bytes();
        let mut index = Vec::new();
        let mut offset = 0;
        let mut frame_count = 0u64;

        while let Some(nal) = find_nal(data, offset, NalLayout::H265) {
            if is_vcl(nal.unit_type) {
                index.push(FrameInfo {
                    offset: nal.offset,
                    len: nal.len,
                    timestamp: frame_count as f64 / self.frame_rate as f64,
                    is_keyframe: KEYFRAME_RANGE.contains(&nal.unit_type),
                    nal_type: nal.unit_type,
                });
                frame_count += 1;
            }
            offset = nal.offset + nal.len;
        }

        debug!(
            path = %self.file.path().display(),
            frames = index.len(),
            "h265 frame index built"
        );
        self.index = Some(index);
    }

    /// Record the first VPS, SPS and PPS from the head of the file.
    fn ensure_params(&mut self) {
        if self.params.is_some() {
            return;
        }

        let data = self.file.bytes();
        let window = data.len().min(PARAM_SET_WINDOW);
        let mut params = ParameterSets::default();
        let mut offset = 0;

        while offset < window {
            let Some(nal) = find_nal(data, offset, NalLayout::H265) else {
                break;
            };

            match nal.unit_type {
                NAL_VPS if params.vps.is_none() => params.vps = Some(normalized_unit(data, &nal)),
                NAL_SPS if params.sps.is_none() => params.sps = Some(normalized_unit(data, &nal)),
                NAL_PPS if params.pps.is_none() => params.pps = Some(normalized_unit(data, &nal)),
                _ => {}
            }

            if params.vps.is_some() && params.sps.is_some() && params.pps.is_some() {
                break;
            }
            offset = nal.offset + nal.len;
        }

        if params.sps.is_none() || params.pps.is_none() {
            warn!(
                path = %self.file.path().display(),
                "missing parameter sets in leading window"
            );
        }
        self.params = Some(params);
    }
}
