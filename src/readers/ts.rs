//! Per-session MPEG-TS reader

use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, warn};

use super::{AccessUnit, PlaybackInfo, MAX_RESYNC_BYTES};
use crate::fs::MappedFile;
use crate::media::ts::{self, TS_PACKET_SIZE, TS_SYNC_BYTE};

/// Default transport bitrate assumed when the stream carries no usable PCRs.
pub const DEFAULT_TS_BITRATE: u32 = 2_000_000;

/// Cursor that walks a memory-mapped transport stream in 188-byte packets.
///
/// Alignment is re-established bytewise on the `0x47` sync byte whenever the
/// cursor drifts. Construction locates the first sync byte, counts packets
/// and estimates the mux bitrate from the first and last PCR when present.
pub struct TsReader {
    file: Arc<MappedFile>,
    offset: usize,
    packet_index: u64,
    first_sync_offset: usize,
    total_packets: usize,
    bitrate: u32,
}

impl TsReader {
    pub fn new(file: Arc<MappedFile>) -> Self {
        let mut reader = Self {
            file,
            offset: 0,
            packet_index: 0,
            first_sync_offset: 0,
            total_packets: 0,
            bitrate: DEFAULT_TS_BITRATE,
        };
        reader.analyze();
        reader
    }

    fn analyze(&mut self) {
        let data = self.file.bytes();

        let Some(first_sync) = data.iter().position(|&b| b == TS_SYNC_BYTE) else {
            warn!(path = %self.file.path().display(), "no TS sync byte found");
            return;
        };

        self.first_sync_offset = first_sync;
        self.total_packets = (data.len() - first_sync) / TS_PACKET_SIZE;
        self.bitrate = self.estimate_bitrate().unwrap_or(DEFAULT_TS_BITRATE);

        debug!(
            path = %self.file.path().display(),
            packets = self.total_packets,
            first_sync = first_sync,
            bitrate = self.bitrate,
            "ts file analyzed"
        );
    }

    /// Estimate the mux rate from the PCR span between the first and last
    /// PCR-bearing packets.
    fn estimate_bitrate(&self) -> Option<u32> {
        let data = self.file.bytes();

        let mut first: Option<(usize, u64)> = None;
        let mut last: Option<(usize, u64)> = None;

        for packet_no in 0..self.total_packets {
            let start = self.first_sync_offset + packet_no * TS_PACKET_SIZE;
            let packet = &data[start..start + TS_PACKET_SIZE];
            let Some(info) = ts::parse_packet(packet) else {
                continue;
            };
            if let Some(pcr) = info.pcr {
                if first.is_none() {
                    first = Some((packet_no, pcr));
                }
                last = Some((packet_no, pcr));
            }
        }

        let ((first_no, first_pcr), (last_no, last_pcr)) = (first?, last?);
        if last_no <= first_no {
            return None;
        }

        let span_secs = ts::pcr_delta(first_pcr, last_pcr) as f64 / 27_000_000.0;
        if span_secs <= 0.0 {
            return None;
        }

        let bytes_spanned = (last_no - first_no) * TS_PACKET_SIZE;
        Some((bytes_spanned as f64 * 8.0 / span_secs) as u32)
    }

    /// Emit the next sync-aligned 188-byte packet.
    pub fn read_next(&mut self) -> Option<AccessUnit> {
        let data = self.file.bytes();
        let start = self.offset;

        // Re-align on the sync byte if the cursor drifted.
        while self.offset < data.len() && data[self.offset] != TS_SYNC_BYTE {
            self.offset += 1;
            if self.offset - start > MAX_RESYNC_BYTES {
                warn!(
                    path = %self.file.path().display(),
                    "giving up after oversized run of invalid bytes"
                );
                return None;
            }
        }

        if self.offset + TS_PACKET_SIZE > data.len() {
            return None;
        }

        let packet = Bytes::copy_from_slice(&data[self.offset..self.offset + TS_PACKET_SIZE]);
        self.offset += TS_PACKET_SIZE;
        self.packet_index += 1;

        // 40 ms synthetic grid, matching the worker's RTP spacing.
        let timestamp_ms = (self.packet_index - 1) * 40;

        Some(AccessUnit {
            data: packet,
            is_keyframe: false,
            index: self.packet_index - 1,
            timestamp_ms,
        })
    }

    pub fn reset(&mut self) {
        self.offset = 0;
        self.packet_index = 0;
    }

    pub fn is_eof(&self) -> bool {
        self.offset >= self.file.len()
    }

    pub fn total_packets(&self) -> usize {
        self.total_packets
    }

    pub fn bitrate(&self) -> u32 {
        self.bitrate
    }

    pub fn playback_info(&self) -> PlaybackInfo {
        let total_duration = if self.bitrate > 0 {
            (self.file.len() * 8) as f64 / self.bitrate as f64
        } else {
            0.0
        };

        PlaybackInfo {
            current_frame: self.packet_index,
            current_time: self.packet_index as f64 * 0.04,
            total_frames: self.total_packets,
            total_duration,
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::media::ts::test_support::ts_packet;

    /// Transport stream of `packets` payload-only packets.
    pub fn ts_stream(packets: usize) -> Vec<u8> {
        let mut data = Vec::new();
        for i in 0..packets {
            data.extend_from_slice(&ts_packet(0x100, i as u8));
        }
        data
    }
}
