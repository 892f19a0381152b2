//! Per-session AAC/ADTS reader

use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, warn};

use super::{AccessUnit, PlaybackInfo, MAX_RESYNC_BYTES};
use crate::fs::MappedFile;
use crate::media::adts::{self, AdtsHeader, SAMPLES_PER_FRAME};

/// Cursor over a memory-mapped ADTS stream.
///
/// The file is analyzed once at construction: sample rate, channel count and
/// profile come from the first valid header, the frame count from a full
/// walk. Invalid stretches are skipped by resyncing on the next `0xFFF` sync
/// word, up to the fatal resync limit.
pub struct AacReader {
    file: Arc<MappedFile>,
    offset: usize,
    frame_index: u64,
    sample_rate: u32,
    channels: u8,
    profile: u8,
    total_frames: usize,
    total_duration: f64,
    valid: bool,
}

impl AacReader {
    pub fn new(file: Arc<MappedFile>) -> Self {
        let mut reader = Self {
            file,
            offset: 0,
            frame_index: 0,
            sample_rate: 0,
            channels: 0,
            profile: 0,
            total_frames: 0,
            total_duration: 0.0,
            valid: false,
        };
        reader.analyze();
        reader
    }

    /// Walk the whole file once for stream parameters and totals.
    fn analyze(&mut self) {
        let data = self.file.bytes();
        let mut offset = 0;
        let mut first_frame = true;

        while offset < data.len() {
            let Some(header) = AdtsHeader::parse(&data[offset..]) else {
                match adts::find_sync(data, offset + 1) {
                    Some(next) => {
                        offset = next;
                        continue;
                    }
                    None => break,
                }
            };

            if first_frame {
                self.sample_rate = header.sample_rate();
                self.channels = header.channel_configuration;
                self.profile = header.profile;
                first_frame = false;

                if self.sample_rate == 0 {
                    warn!(
                        path = %self.file.path().display(),
                        "invalid sampling frequency index"
                    );
                    return;
                }
            }

            self.total_frames += 1;
            offset += header.frame_length;
        }

        if self.total_frames > 0 && self.sample_rate > 0 {
            self.total_duration =
                (self.total_frames as u64 * SAMPLES_PER_FRAME as u64) as f64 / self.sample_rate as f64;
            self.valid = true;

            debug!(
                path = %self.file.path().display(),
                sample_rate = self.sample_rate,
                channels = self.channels,
                profile = self.profile_name(),
                frames = self.total_frames,
                duration = self.total_duration,
                "aac file analyzed"
            );
        } else {
            warn!(
                path = %self.file.path().display(),
                "no valid ADTS frames found"
            );
        }
    }

    /// Emit the next ADTS frame, header included.
    pub fn read_next(&mut self) -> Option<AccessUnit> {
        let data = self.file.bytes();
        let mut skipped = 0usize;

        loop {
            if self.offset >= data.len() {
                return None;
            }

            match AdtsHeader::parse(&data[self.offset..]) {
                Some(header) => {
                    let end = self.offset + header.frame_length;
                    if end > data.len() {
                        warn!(
                            path = %self.file.path().display(),
                            offset = self.offset,
                            "ADTS frame extends beyond file"
                        );
                        return None;
                    }

                    let frame = Bytes::copy_from_slice(&data[self.offset..end]);
                    self.offset = end;
                    self.frame_index += 1;

                    let timestamp_ms = (self.frame_index - 1) * SAMPLES_PER_FRAME as u64 * 1000
                        / self.sample_rate.max(1) as u64;

                    return Some(AccessUnit {
                        data: frame,
                        // Every ADTS frame is independently decodable.
                        is_keyframe: true,
                        index: self.frame_index - 1,
                        timestamp_ms,
                    });
                }
                None => {
                    let next = adts::find_sync(data, self.offset + 1)?;
                    skipped += next - self.offset;
                    if skipped > MAX_RESYNC_BYTES {
                        warn!(
                            path = %self.file.path().display(),
                            "giving up after oversized run of invalid bytes"
                        );
                        return None;
                    }
                    self.offset = next;
                }
            }
        }
    }

    pub fn reset(&mut self) {
        self.offset = 0;
        self.frame_index = 0;
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u8 {
        self.channels
    }

    pub fn profile_name(&self) -> &'static str {
        match self.profile {
            0 => "Main",
            1 => "LC",
            2 => "SSR",
            3 => "LTP",
            _ => "Unknown",
        }
    }

    /// Average bitrate in bits per second.
    pub fn bitrate(&self) -> u32 {
        if self.total_duration == 0.0 {
            return 0;
        }
        ((self.file.len() * 8) as f64 / self.total_duration) as u32
    }

    pub fn playback_info(&self) -> PlaybackInfo {
        PlaybackInfo {
            current_frame: self.frame_index,
            current_time: self.frame_index as f64 * SAMPLES_PER_FRAME as f64
                / self.sample_rate.max(1) as f64,
            total_frames: self.total_frames,
            total_duration: self.total_duration,
        }
    }
}
