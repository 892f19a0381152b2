//! Per-session H.264 Annex-B reader

use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use tracing::{debug, warn};

use super::{AccessUnit, FrameInfo, PlaybackInfo, DEFAULT_FRAME_RATE, MAX_RESYNC_BYTES};
use crate::fs::MappedFile;
use crate::media::annexb::{find_nal, NalLayout, NalUnit};
use crate::media::sps;

/// NAL unit types that carry video slices.
const VCL_RANGE: std::ops::RangeInclusive<u8> = 1..=5;
const NAL_IDR: u8 = 5;
const NAL_SPS: u8 = 7;
const NAL_PPS: u8 = 8;

/// Parameter-set search window at the head of the file.
const PARAM_SET_WINDOW: usize = 64 * 1024;

#[derive(Default)]
struct ParameterSets {
    sps: Option<Bytes>,
    pps: Option<Bytes>,
}

/// Cursor over a memory-mapped H.264 Annex-B stream.
///
/// The cursor advances monotonically through `read_next`; only the seek
/// operations and `reset` move it elsewhere. The frame index and parameter
/// sets are built lazily on first use.
pub struct H264Reader {
    file: Arc<MappedFile>,
    offset: usize,
    unit_index: u64,
    timestamp: f64,
    frame_rate: u32,
    index: Option<Vec<FrameInfo>>,
    params: Option<ParameterSets>,
}

impl H264Reader {
    pub fn new(file: Arc<MappedFile>) -> Self {
        debug!(
            path = %file.path().display(),
            size = file.len(),
            "h264 reader created"
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

        let nal = find_nal(data, self.offset, NalLayout::H264)?;
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
            is_keyframe: nal.unit_type == NAL_IDR,
            index: self.unit_index - 1,
            timestamp_ms: (self.timestamp * 1000.0) as u64,
        })
    }

    /// Position the cursor on frame `frame_index` of the video-slice index.
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

    /// Position the cursor on the first frame at or after `timestamp` seconds.
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

    pub fn sps(&mut self) -> Option<Bytes> {
        self.ensure_params();
        self.params.as_ref().and_then(|p| p.sps.clone())
    }

    pub fn pps(&mut self) -> Option<Bytes> {
        self.ensure_params();
        self.params.as_ref().and_then(|p| p.pps.clone())
    }

    /// Resolution from the SPS, or the 1280x720 fallback when the stream
    /// carries none or it does not decode.
    pub fn resolution(&mut self) -> (u32, u32) {
        self.sps()
            .and_then(|sps_nal| sps::parse_sps(strip_start_code(&sps_nal)))
            .map(|info| (info.width, info.height))
            .unwrap_or((1280, 720))
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

    /// Scan the whole file once and retain the video-slice NAL units.
    fn ensure_index(&mut self) {
        if self.index.is_some() {
            return;
        }

        let data = self.file.bytes();
        let mut index = Vec::new();
        let mut offset = 0;
        let mut frame_count = 0u64;

        while let Some(nal) = find_nal(data, offset, NalLayout::H264) {
            if VCL_RANGE.contains(&nal.unit_type) {
                index.push(FrameInfo {
                    offset: nal.offset,
                    len: nal.len,
                    timestamp: frame_count as f64 / self.frame_rate as f64,
                    is_keyframe: nal.unit_type == NAL_IDR,
                    nal_type: nal.unit_type,
                });
                frame_count += 1;
            }
            offset = nal.offset + nal.len;
        }

        debug!(
            path = %self.file.path().display(),
            frames = index.len(),
            "h264 frame index built"
        );
        self.index = Some(index);
    }

    /// Record the first SPS and PPS from the head of the file.
    fn ensure_params(&mut self) {
        if self.params.is_some() {
            return;
        }

        let data = self.file.bytes();
        let window = data.len().min(PARAM_SET_WINDOW);
        let mut params = ParameterSets::default();
        let mut offset = 0;

        while offset < window {
            let Some(nal) = find_nal(data, offset, NalLayout::H264) else {
                break;
            };

            match nal.unit_type {
                NAL_SPS if params.sps.is_none() => params.sps = Some(normalized_unit(data, &nal)),
                NAL_PPS if params.pps.is_none() => params.pps = Some(normalized_unit(data, &nal)),
                _ => {}
            }

            if params.sps.is_some() && params.pps.is_some() {
                break;
            }
            offset = nal.offset + nal.len;
        }

        if params.sps.is_none() || params.pps.is_none() {
            warn!(
                path = %self.file.path().display(),
                "missing SPS or PPS in leading window"
            );
        }
        self.params = Some(params);
    }
}

/// Copy a scanned NAL unit, rewriting a 3-byte start code to the 4-byte form.
pub(super) fn normalized_unit(data: &[u8], nal: &NalUnit) -> Bytes {
    let payload = &data[nal.offset + nal.start_code_len..nal.offset + nal.len];
    if nal.start_code_len == 4 {
        return Bytes::copy_from_slice(&data[nal.offset..nal.offset + nal.len]);
    }
    let mut out = BytesMut::with_capacity(4 + payload.len());
    out.put_slice(&[0x00, 0x00, 0x00, 0x01]);
    out.put_slice(payload);
    out.freeze()
}

/// Strip a leading Annex-B start code, if present.
pub(super) fn strip_start_code(data: &[u8]) -> &[u8] {
    if data.len() >= 4 && data[..4] == [0x00, 0x00, 0x00, 0x01] {
        &data[4..]
    } else if data.len() >= 3 && data[..3] == [0x00, 0x00, 0x01] {
        &data[3..]
    } else {
        data
    }
}


#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn mapped(contents: &[u8]) -> (tempfile::NamedTempFile, Arc<MappedFile>) {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(contents).unwrap();
        tmp.flush().unwrap();
        let file = Arc::new(MappedFile::open(tmp.path()).unwrap());
        (tmp, file)
    }

    #[test]
    fn test_read_sequence_and_reset_is_stable() {
        let (_tmp, file) = mapped(&test_support::annexb_stream(9));
        let mut reader = H264Reader::new(file);

        let mut first_pass = Vec::new();
        while let Some(unit) = reader.read_next() {
            assert_eq!(&unit.data[..4], &[0x00, 0x00, 0x00, 0x01]);
            // Scanning is lossless: no start code inside a unit's payload.
            assert!(!unit.data[4..].windows(3).any(|w| w == [0x00, 0x00, 0x01]));
            first_pass.push(unit.data);
        }
        assert_eq!(first_pass.len(), 12); // SPS + PPS + IDR + 9 P

        reader.reset();
        let mut second_pass = Vec::new();
        while let Some(unit) = reader.read_next() {
            second_pass.push(unit.data);
        }
        assert_eq!(first_pass, second_pass);
    }

    #[test]
    fn test_keyframe_classification() {
        let (_tmp, file) = mapped(&test_support::annexb_stream(2));
        let mut reader = H264Reader::new(file);

        let sps = reader.read_next().unwrap();
        let pps = reader.read_next().unwrap();
        let idr = reader.read_next().unwrap();
        let p = reader.read_next().unwrap();

        assert!(!sps.is_keyframe);
        assert!(!pps.is_keyframe);
        assert!(idr.is_keyframe);
        assert!(!p.is_keyframe);
    }

    #[test]
    fn test_three_byte_start_code_is_normalized() {
        let data = [0x00, 0x00, 0x01, 0x41, 0x9A, 0x01];
        let (_tmp, file) = mapped(&data);
        let mut reader = H264Reader::new(file);

        let unit = reader.read_next().unwrap();
        assert_eq!(unit.data.as_ref(), &[0x00, 0x00, 0x00, 0x01, 0x41, 0x9A, 0x01]);
        assert!(reader.read_next().is_none());
    }

    #[test]
    fn test_frame_index_offsets_and_timestamps() {
        let (_tmp, file) = mapped(&test_support::annexb_stream(4));
        let mut reader = H264Reader::new(file);

        let info = reader.playback_info();
        assert_eq!(info.total_frames, 5); // IDR + 4 P, SPS/PPS excluded

        let index = reader.index.as_ref().unwrap();
        for (i, frame) in index.iter().enumerate() {
            assert_eq!(frame.timestamp, i as f64 / 25.0);
            if i > 0 {
                assert!(frame.offset > index[i - 1].offset);
            }
        }
        assert!(index[0].is_keyframe);
        assert!(!index[1].is_keyframe);
    }

    #[test]
    fn test_seek_to_frame_and_time() {
        let (_tmp, file) = mapped(&test_support::annexb_stream(9));
        let mut reader = H264Reader::new(file);

        assert!(reader.seek_to_frame(3));
        let unit = reader.read_next().unwrap();
        // Frame 3 of the index is the third P slice.
        assert_eq!(unit.data[4] & 0x1F, 1);

        // 0.2 s at 25 fps is frame 5.
        assert!(reader.seek_to_time(0.2));
        assert_eq!(reader.playback_info().current_frame, 5);

        assert!(!reader.seek_to_frame(100));
        assert!(!reader.seek_to_time(100.0));
    }

    #[test]
    fn test_parameter_set_extraction() {
        let (_tmp, file) = mapped(&test_support::annexb_stream(1));
        let mut reader = H264Reader::new(file);

        let sps = reader.sps().unwrap();
        let pps = reader.pps().unwrap();
        assert_eq!(sps.as_ref(), &[0x00, 0x00, 0x00, 0x01, 0x67, 0x42, 0x00, 0x1F]);
        assert_eq!(pps.as_ref(), &[0x00, 0x00, 0x00, 0x01, 0x68, 0xCE, 0x38, 0x80]);
    }

    #[test]
    fn test_missing_parameter_sets_is_not_fatal() {
        // Only slices, no SPS/PPS.
        let data = [0x00, 0x00, 0x00, 0x01, 0x41, 0x9A, 0x00];
        let (_tmp, file) = mapped(&data);
        let mut reader = H264Reader::new(file);

        assert!(reader.sps().is_none());
        assert!(reader.pps().is_none());
        assert_eq!(reader.resolution(), (1280, 720));
        assert!(reader.read_next().is_some());
    }

    #[test]
    fn test_file_without_start_codes() {
        let data = [0x12u8; 64];
        let (_tmp, file) = mapped(&data);
        let mut reader = H264Reader::new(file);
        assert!(reader.read_next().is_none());
    }
}
