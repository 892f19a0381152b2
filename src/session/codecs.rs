//! Codec-specific streamers
//!
//! One [`Streamer`] implementation per codec. Each owns its reader over the
//! shared file mapping, paces by the codec's natural unit and synthesizes
//! RTP timestamps as `counter * increment` on the 90 kHz clock (or the
//! sample-rate-derived increment for AAC). The counter advances only after a
//! successful push, so timestamps stay strictly monotone.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use super::registry::MkvTrackKind;
use super::worker::{Streamer, WorkerCommand, WorkerStats};
use crate::error::{AppError, Result};
use crate::fs::FileCache;
use crate::readers::aac::AacReader;
use crate::readers::h264::H264Reader;
use crate::readers::h265::H265Reader;
use crate::readers::mkv::MkvReader;
use crate::readers::ts::{TsReader, DEFAULT_TS_BITRATE};
use crate::rtsp::{CodecTag, MediaFrame, RtspSession};

/// RTP video clock rate.
const VIDEO_CLOCK_RATE: u64 = 90_000;

/// Samples per AAC frame (AAC-LC).
const AAC_SAMPLES_PER_FRAME: u64 = 1024;

/// Synthetic RTP increment per TS packet: a 40 ms grid at 90 kHz.
const TS_RTP_INCREMENT: u64 = 3600;

fn clamped_fps(cell: &AtomicU32) -> u64 {
    cell.load(Ordering::SeqCst).max(1) as u64
}

/// Streams one H.264 Annex-B file, one NAL unit per tick.
pub struct H264Streamer {
    session: Arc<dyn RtspSession>,
    cache: Arc<FileCache>,
    path: PathBuf,
    frame_rate: Arc<AtomicU32>,
    reader: Option<H264Reader>,
    rtp_increment: u64,
    counter: u64,
    stats: Arc<WorkerStats>,
}

impl H264Streamer {
    pub fn new(
        session: Arc<dyn RtspSession>,
        cache: Arc<FileCache>,
        path: PathBuf,
        frame_rate: u32,
    ) -> Self {
        Self {
            session,
            cache,
            path,
            frame_rate: Arc::new(AtomicU32::new(frame_rate.max(1))),
            reader: None,
            rtp_increment: 0,
            counter: 0,
            stats: Arc::new(WorkerStats::default()),
        }
    }
}

impl Streamer for H264Streamer {
    fn initialize(&mut self) -> Result<()> {
        let file = self.cache.get(&self.path)?;
        let mut reader = H264Reader::new(file);

        let fps = clamped_fps(&self.frame_rate);
        reader.set_frame_rate(fps as u32);
        self.rtp_increment = VIDEO_CLOCK_RATE / fps;
        self.reader = Some(reader);

        debug!(
            path = %self.path.display(),
            fps,
            rtp_increment = self.rtp_increment,
            "h264 streamer initialized"
        );
        Ok(())
    }

    fn send_next(&mut self) -> bool {
        let Some(reader) = self.reader.as_mut() else {
            return false;
        };
        let Some(unit) = reader.read_next() else {
            return false;
        };

        let bytes = unit.data.len();
        let frame = MediaFrame {
            data: unit.data,
            timestamp: (self.counter * self.rtp_increment) as u32,
            media_type: CodecTag::H264,
            is_keyframe: unit.is_keyframe,
        };

        if !self.session.push_frame(frame) {
            return false;
        }
        self.counter += 1;
        self.stats.record_send(bytes);
        true
    }

    fn data_interval(&self) -> Duration {
        Duration::from_micros(1_000_000 / clamped_fps(&self.frame_rate))
    }

    fn reset_reader(&mut self) {
        if let Some(reader) = self.reader.as_mut() {
            reader.reset();
        }
    }

    fn handle_command(&mut self, command: WorkerCommand) {
        let Some(reader) = self.reader.as_mut() else {
            return;
        };
        match command {
            WorkerCommand::SeekToFrame(frame) => {
                reader.seek_to_frame(frame);
            }
            WorkerCommand::SeekToTime(timestamp) => {
                reader.seek_to_time(timestamp);
            }
            WorkerCommand::Reset => reader.reset(),
        }
    }

    fn stats(&self) -> Arc<WorkerStats> {
        self.stats.clone()
    }

    fn shared_frame_rate(&self) -> Option<Arc<AtomicU32>> {
        Some(self.frame_rate.clone())
    }
}

impl Drop for H264Streamer {
    fn drop(&mut self) {
        self.reader = None;
        self.cache.release(&self.path);
    }
}

/// Streams one H.265 Annex-B file. Identical pacing model to H.264.
pub struct H265Streamer {
    session: Arc<dyn RtspSession>,
    cache: Arc<FileCache>,
    path: PathBuf,
    frame_rate: Arc<AtomicU32>,
    reader: Option<H265Reader>,
    rtp_increment: u64,
    counter: u64,
    stats: Arc<WorkerStats>,
}

impl H265Streamer {
    pub fn new(
        session: Arc<dyn RtspSession>,
        cache: Arc<FileCache>,
        path: PathBuf,
        frame_rate: u32,
    ) -> Self {
        Self {
            session,
            cache,
            path,
            frame_rate: Arc::new(AtomicU32::new(frame_rate.max(1))),
            reader: None,
            rtp_increment: 0,
            counter: 0,
            stats: Arc::new(WorkerStats::default()),
        }
    }
}

impl Streamer for H265Streamer {
    fn initialize(&mut self) -> Result<()> {
        let file = self.cache.get(&self.path)?;
        let mut reader = H265Reader::new(file);

        let fps = clamped_fps(&self.frame_rate);
        reader.set_frame_rate(fps as u32);
        self.rtp_increment = VIDEO_CLOCK_RATE / fps;
        self.reader = Some(reader);

        debug!(
            path = %self.path.display(),
            fps,
            rtp_increment = self.rtp_increment,
            "h265 streamer initialized"
        );
        Ok(())
    }

    fn send_next(&mut self) -> bool {
        let Some(reader) = self.reader.as_mut() else {
            return false;
        };
        let Some(unit) = reader.read_next() else {
            return false;
        };

        let bytes = unit.data.len();
        let frame = MediaFrame {
            data: unit.data,
            timestamp: (self.counter * self.rtp_increment) as u32,
            media_type: CodecTag::H265,
            is_keyframe: unit.is_keyframe,
        };

        if !self.session.push_frame(frame) {
            return false;
        }
        self.counter += 1;
        self.stats.record_send(bytes);
        true
    }

    fn data_interval(&self) -> Duration {
        Duration::from_micros(1_000_000 / clamped_fps(&self.frame_rate))
    }

    fn reset_reader(&mut self) {
        if let Some(reader) = self.reader.as_mut() {
            reader.reset();
        }
    }

    fn handle_command(&mut self, command: WorkerCommand) {
        let Some(reader) = self.reader.as_mut() else {
            return;
        };
        match command {
            WorkerCommand::SeekToFrame(frame) => {
                reader.seek_to_frame(frame);
            }
            WorkerCommand::SeekToTime(timestamp) => {
                reader.seek_to_time(timestamp);
            }
            WorkerCommand::Reset => reader.reset(),
        }
    }

    fn stats(&self) -> Arc<WorkerStats> {
        self.stats.clone()
    }

    fn shared_frame_rate(&self) -> Option<Arc<AtomicU32>> {
        Some(self.frame_rate.clone())
    }
}

impl Drop for H265Streamer {
    fn drop(&mut self) {
        self.reader = None;
        self.cache.release(&self.path);
    }
}

/// Streams one ADTS file, one AAC frame per tick.
///
/// Frames are emitted on the 90 kHz clock so video and audio stay aligned
/// when muxed upstream.
pub struct AacStreamer {
    session: Arc<dyn RtspSession>,
    cache: Arc<FileCache>,
    path: PathBuf,
    sample_rate: u32,
    reader: Option<AacReader>,
    rtp_increment: u64,
    counter: u64,
    stats: Arc<WorkerStats>,
}

impl AacStreamer {
    pub fn new(
        session: Arc<dyn RtspSession>,
        cache: Arc<FileCache>,
        path: PathBuf,
        sample_rate: u32,
    ) -> Self {
        Self {
            session,
            cache,
            path,
            sample_rate: if sample_rate > 0 { sample_rate } else { 48_000 },
            reader: None,
            rtp_increment: 0,
            counter: 0,
            stats: Arc::new(WorkerStats::default()),
        }
    }
}

impl Streamer for AacStreamer {
    fn initialize(&mut self) -> Result<()> {
        let file = self.cache.get(&self.path)?;
        let reader = AacReader::new(file);

        if !reader.is_valid() {
            return Err(AppError::InvalidMedia {
                path: self.path.clone(),
                reason: "no valid ADTS frames".to_string(),
            });
        }

        // Prefer the rate the file actually declares over the hint.
        if reader.sample_rate() > 0 {
            self.sample_rate = reader.sample_rate();
        }
        self.rtp_increment = VIDEO_CLOCK_RATE * AAC_SAMPLES_PER_FRAME / self.sample_rate as u64;
        self.reader = Some(reader);

        debug!(
            path = %self.path.display(),
            sample_rate = self.sample_rate,
            rtp_increment = self.rtp_increment,
            "aac streamer initialized"
        );
        Ok(())
    }

    fn send_next(&mut self) -> bool {
        let Some(reader) = self.reader.as_mut() else {
            return false;
        };
        let Some(unit) = reader.read_next() else {
            return false;
        };

        let bytes = unit.data.len();
        let frame = MediaFrame {
            data: unit.data,
            timestamp: (self.counter * self.rtp_increment) as u32,
            media_type: CodecTag::Aac,
            is_keyframe: unit.is_keyframe,
        };

        if !self.session.push_frame(frame) {
            return false;
        }
        self.counter += 1;
        self.stats.record_send(bytes);
        true
    }

    fn data_interval(&self) -> Duration {
        Duration::from_micros(AAC_SAMPLES_PER_FRAME * 1_000_000 / self.sample_rate as u64)
    }

    fn reset_reader(&mut self) {
        if let Some(reader) = self.reader.as_mut() {
            reader.reset();
        }
    }

    fn handle_command(&mut self, command: WorkerCommand) {
        if let WorkerCommand::Reset = command {
            self.reset_reader();
        }
    }

    fn stats(&self) -> Arc<WorkerStats> {
        self.stats.clone()
    }
}

impl Drop for AacStreamer {
    fn drop(&mut self) {
        self.reader = None;
        self.cache.release(&self.path);
    }
}

/// Streams one transport stream, one 188-byte packet per tick.
///
/// Packets ride a synthetic 40 ms RTP grid; pacing follows the mux bitrate.
pub struct TsStreamer {
    session: Arc<dyn RtspSession>,
    cache: Arc<FileCache>,
    path: PathBuf,
    bitrate: u32,
    reader: Option<TsReader>,
    counter: u64,
    stats: Arc<WorkerStats>,
}

impl TsStreamer {
    pub fn new(
        session: Arc<dyn RtspSession>,
        cache: Arc<FileCache>,
        path: PathBuf,
        bitrate: u32,
    ) -> Self {
        Self {
            session,
            cache,
            path,
            bitrate,
            reader: None,
            counter: 0,
            stats: Arc::new(WorkerStats::default()),
        }
    }
}

impl Streamer for TsStreamer {
    fn initialize(&mut self) -> Result<()> {
        let file = self.cache.get(&self.path)?;
        let reader = TsReader::new(file);

        if self.bitrate == 0 {
            self.bitrate = reader.bitrate();
        }
        if self.bitrate == 0 {
            self.bitrate = DEFAULT_TS_BITRATE;
        }
        self.reader = Some(reader);

        debug!(
            path = %self.path.display(),
            bitrate = self.bitrate,
            "ts streamer initialized"
        );
        Ok(())
    }

    fn send_next(&mut self) -> bool {
        let Some(reader) = self.reader.as_mut() else {
            return false;
        };
        let Some(unit) = reader.read_next() else {
            return false;
        };

        let bytes = unit.data.len();
        let frame = MediaFrame {
            data: unit.data,
            timestamp: (self.counter * TS_RTP_INCREMENT) as u32,
            media_type: CodecTag::Mp2t,
            is_keyframe: unit.is_keyframe,
        };

        if !self.session.push_frame(frame) {
            return false;
        }
        self.counter += 1;
        self.stats.record_send(bytes);
        true
    }

    fn data_interval(&self) -> Duration {
        let bits_per_packet = (crate::media::ts::TS_PACKET_SIZE * 8) as u64;
        Duration::from_micros(bits_per_packet * 1_000_000 / self.bitrate.max(1) as u64)
    }

    fn reset_reader(&mut self) {
        if let Some(reader) = self.reader.as_mut() {
            reader.reset();
        }
    }

    fn handle_command(&mut self, command: WorkerCommand) {
        if let WorkerCommand::Reset = command {
            self.reset_reader();
        }
    }

    fn stats(&self) -> Arc<WorkerStats> {
        self.stats.clone()
    }
}

impl Drop for TsStreamer {
    fn drop(&mut self) {
        self.reader = None;
        self.cache.release(&self.path);
    }
}

/// Streams one track of a Matroska file.
///
/// Video tracks pace and timestamp like the Annex-B streamers; audio tracks
/// like the AAC streamer. Frames carry the extracted codec so downstream
/// packetizers treat them as the elementary stream they are.
pub struct MkvStreamer {
    session: Arc<dyn RtspSession>,
    cache: Arc<FileCache>,
    path: PathBuf,
    track_number: u64,
    rtsp_track_index: usize,
    kind: MkvTrackKind,
    frame_rate: Arc<AtomicU32>,
    reader: Option<MkvReader>,
    rtp_increment: u64,
    counter: u64,
    stats: Arc<WorkerStats>,
}

impl MkvStreamer {
    pub fn new(
        session: Arc<dyn RtspSession>,
        cache: Arc<FileCache>,
        path: PathBuf,
        track_number: u64,
        rtsp_track_index: usize,
        kind: MkvTrackKind,
    ) -> Self {
        let initial_fps = match kind {
            MkvTrackKind::Video { frame_rate, .. } => frame_rate.max(1),
            MkvTrackKind::Audio { .. } => 0,
        };
        Self {
            session,
            cache,
            path,
            track_number,
            rtsp_track_index,
            kind,
            frame_rate: Arc::new(AtomicU32::new(initial_fps)),
            reader: None,
            rtp_increment: 0,
            counter: 0,
            stats: Arc::new(WorkerStats::default()),
        }
    }

    fn media_type(&self) -> CodecTag {
        match self.kind {
            MkvTrackKind::Video { codec, .. } => codec,
            MkvTrackKind::Audio { .. } => CodecTag::Aac,
        }
    }
}

impl Streamer for MkvStreamer {
    fn initialize(&mut self) -> Result<()> {
        let file = self.cache.get(&self.path)?;
        let reader = MkvReader::new(file, self.track_number)?;

        self.rtp_increment = match self.kind {
            MkvTrackKind::Video { .. } => {
                let fps = clamped_fps(&self.frame_rate);
                VIDEO_CLOCK_RATE / fps
            }
            MkvTrackKind::Audio { sample_rate } => {
                VIDEO_CLOCK_RATE * AAC_SAMPLES_PER_FRAME / sample_rate.max(1) as u64
            }
        };
        self.reader = Some(reader);

        debug!(
            path = %self.path.display(),
            track = self.track_number,
            rtp_increment = self.rtp_increment,
            "mkv streamer initialized"
        );
        Ok(())
    }

    fn send_next(&mut self) -> bool {
        let Some(reader) = self.reader.as_mut() else {
            return false;
        };
        let Some(unit) = reader.read_next() else {
            return false;
        };

        let bytes = unit.data.len();
        let frame = MediaFrame {
            data: unit.data,
            timestamp: (self.counter * self.rtp_increment) as u32,
            media_type: self.media_type(),
            is_keyframe: unit.is_keyframe,
        };

        if !self.session.push_frame_track(frame, self.rtsp_track_index) {
            return false;
        }
        self.counter += 1;
        self.stats.record_send(bytes);
        true
    }

    fn data_interval(&self) -> Duration {
        match self.kind {
            MkvTrackKind::Video { .. } => {
                Duration::from_micros(1_000_000 / clamped_fps(&self.frame_rate))
            }
            MkvTrackKind::Audio { sample_rate } => {
                Duration::from_micros(AAC_SAMPLES_PER_FRAME * 1_000_000 / sample_rate.max(1) as u64)
            }
        }
    }

    fn reset_reader(&mut self) {
        if let Some(reader) = self.reader.as_mut() {
            if let Err(e) = reader.reset() {
                warn!(
                    path = %self.path.display(),
                    track = self.track_number,
                    error = %e,
                    "failed to rewind mkv reader"
                );
            }
        }
    }

    fn handle_command(&mut self, command: WorkerCommand) {
        if let WorkerCommand::Reset = command {
            self.reset_reader();
        }
    }

    fn stats(&self) -> Arc<WorkerStats> {
        self.stats.clone()
    }

    fn shared_frame_rate(&self) -> Option<Arc<AtomicU32>> {
        match self.kind {
            MkvTrackKind::Video { .. } => Some(self.frame_rate.clone()),
            MkvTrackKind::Audio { .. } => None,
        }
    }
}

impl Drop for MkvStreamer {
    fn drop(&mut self) {
        self.reader = None;
        self.cache.release(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::readers::aac::test_support::adts_stream;
    use crate::readers::h264::test_support::annexb_stream;
    use crate::readers::ts::test_support::ts_stream;
    use crate::rtsp::mock::MockSession;

    fn temp_file(contents: &[u8]) -> tempfile::NamedTempFile {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(contents).unwrap();
        tmp.flush().unwrap();
        tmp
    }

    #[test]
    fn test_h264_streamer_timestamps_are_arithmetic() {
        let tmp = temp_file(&annexb_stream(9));
        let session = MockSession::new("s1");
        let cache = Arc::new(FileCache::new());
        let mut streamer = H264Streamer::new(
            session.clone(),
            cache.clone(),
            tmp.path().to_path_buf(),
            25,
        );

        streamer.initialize().unwrap();
        assert_eq!(streamer.data_interval(), Duration::from_millis(40));

        for _ in 0..12 {
            assert!(streamer.send_next());
        }
        assert!(!streamer.send_next()); // EOF

        let frames = session.pushed_frames();
        assert_eq!(frames.len(), 12);
        for (i, pushed) in frames.iter().enumerate() {
            assert_eq!(pushed.frame.timestamp, (i as u32) * 3600);
            assert_eq!(pushed.frame.media_type, CodecTag::H264);
            assert_eq!(&pushed.frame.data[..4], &[0, 0, 0, 1]);
        }
    }

    #[test]
    fn test_h264_counter_continues_across_eof_loop() {
        let tmp = temp_file(&annexb_stream(1));
        let session = MockSession::new("s1");
        let cache = Arc::new(FileCache::new());
        let mut streamer =
            H264Streamer::new(session.clone(), cache, tmp.path().to_path_buf(), 25);
        streamer.initialize().unwrap();

        // 4 units in the file: SPS PPS IDR P.
        for _ in 0..4 {
            assert!(streamer.send_next());
        }
        assert!(!streamer.send_next());
        assert!(streamer.handle_eof());
        assert!(streamer.send_next());

        let frames = session.pushed_frames();
        assert_eq!(frames.len(), 5);
        // The counter keeps climbing after the loop point.
        assert_eq!(frames[4].frame.timestamp, 4 * 3600);
    }

    #[test]
    fn test_h264_push_failure_does_not_advance_counter() {
        let tmp = temp_file(&annexb_stream(5));
        let session = MockSession::new("s1");
        let cache = Arc::new(FileCache::new());
        let mut streamer =
            H264Streamer::new(session.clone(), cache, tmp.path().to_path_buf(), 25);
        streamer.initialize().unwrap();

        assert!(streamer.send_next());
        session.set_accept_frames(false);
        assert!(!streamer.send_next());
        session.set_accept_frames(true);
        assert!(streamer.send_next());

        let frames = session.pushed_frames();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].frame.timestamp, 0);
        assert_eq!(frames[1].frame.timestamp, 3600);
    }

    #[test]
    fn test_streamer_drop_releases_cache_entry() {
        let tmp = temp_file(&annexb_stream(2));
        let session = MockSession::new("s1");
        let cache = Arc::new(FileCache::new());
        let mut streamer =
            H264Streamer::new(session, cache.clone(), tmp.path().to_path_buf(), 25);
        streamer.initialize().unwrap();
        assert_eq!(cache.active_count(), 1);

        drop(streamer);
        assert_eq!(cache.active_count(), 0);
    }

    #[test]
    fn test_aac_streamer_pacing_and_increment() {
        let tmp = temp_file(&adts_stream(20, 32));
        let session = MockSession::new("s1");
        let cache = Arc::new(FileCache::new());
        let mut streamer =
            AacStreamer::new(session.clone(), cache, tmp.path().to_path_buf(), 48_000);
        streamer.initialize().unwrap();

        // 1024 samples at 48 kHz.
        assert_eq!(streamer.data_interval(), Duration::from_micros(21_333));

        for _ in 0..3 {
            assert!(streamer.send_next());
        }
        let frames = session.pushed_frames();
        assert_eq!(frames[0].frame.timestamp, 0);
        assert_eq!(frames[1].frame.timestamp, 1920);
        assert_eq!(frames[2].frame.timestamp, 3840);
        assert_eq!(frames[0].frame.media_type, CodecTag::Aac);
    }

    #[test]
    fn test_aac_streamer_rejects_invalid_file() {
        let tmp = temp_file(&[0u8; 128]);
        let session = MockSession::new("s1");
        let cache = Arc::new(FileCache::new());
        let mut streamer = AacStreamer::new(session, cache, tmp.path().to_path_buf(), 48_000);
        assert!(streamer.initialize().is_err());
    }

    #[test]
    fn test_ts_streamer_interval_and_timestamps() {
        let tmp = temp_file(&ts_stream(10));
        let session = MockSession::new("s1");
        let cache = Arc::new(FileCache::new());
        let mut streamer = TsStreamer::new(
            session.clone(),
            cache,
            tmp.path().to_path_buf(),
            2_000_000,
        );
        streamer.initialize().unwrap();

        // 1504 bits at 2 Mb/s.
        assert_eq!(streamer.data_interval(), Duration::from_micros(752));

        let mut sent = 0;
        while streamer.send_next() {
            sent += 1;
        }
        assert_eq!(sent, 10);

        let frames = session.pushed_frames();
        for (i, pushed) in frames.iter().enumerate() {
            assert_eq!(pushed.frame.timestamp, (i as u32) * 3600);
            assert_eq!(pushed.frame.data.len(), 188);
            assert_eq!(pushed.frame.media_type, CodecTag::Mp2t);
        }
    }
}
