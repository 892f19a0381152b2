//! Media catalog
//!
//! Scans the media directory at startup, classifies files by extension,
//! probes each with a short-lived reader to build its stream descriptor and
//! registers it with the RTSP layer. The catalog is read-only after the scan.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::{AppError, Result};
use crate::fs::FileCache;
use crate::media::sps;
use crate::readers::aac::AacReader;
use crate::readers::h264::H264Reader;
use crate::readers::h265::H265Reader;
use crate::readers::mkv::{self, MkvTrackInfo};
use crate::readers::ts::TsReader;
use crate::rtsp::{CodecTag, MediaKind, RtspServer, StreamInfo};
use crate::session::{MkvTrackKind, MkvTrackSpec};

/// Dynamic payload type used for H.264/H.265/MKV video.
const PT_VIDEO_DYNAMIC: u8 = 96;
/// Dynamic payload type for AAC audio.
const PT_AAC: u8 = 97;
/// Static payload type for MPEG-TS.
const PT_MP2T: u8 = 33;

/// RTP video clock rate.
const VIDEO_CLOCK_RATE: u32 = 90_000;

/// One discovered media file.
#[derive(Debug, Clone)]
pub struct CatalogEntry {
    pub filename: String,
    /// RTSP URL path, with a leading slash.
    pub stream_path: String,
    pub file_path: PathBuf,
    pub codec: CodecTag,
    pub info: Arc<StreamInfo>,
    /// Mux bitrate estimated at probe time (MPEG-TS only).
    pub ts_bitrate: Option<u32>,
    /// Selected tracks for Matroska files, empty otherwise.
    pub mkv_tracks: Vec<MkvTrackSpec>,
}

/// Path-keyed table of discovered media, populated once at startup.
#[derive(Default)]
pub struct MediaCatalog {
    entries: HashMap<String, CatalogEntry>,
}

impl MediaCatalog {
    /// Scan `directory`, probing and registering every recognized file.
    ///
    /// Files that fail to map, probe or register are logged and skipped; the
    /// scan itself only fails when the directory cannot be read.
    pub fn scan(
        directory: &Path,
        cache: &FileCache,
        server: &dyn RtspServer,
    ) -> Result<Self> {
        if !directory.is_dir() {
            return Err(AppError::Config(format!(
                "media directory does not exist: {}",
                directory.display()
            )));
        }

        info!(directory = %directory.display(), "scanning media directory");
        let mut catalog = Self::default();

        let dir = std::fs::read_dir(directory).map_err(|e| AppError::io(directory, e))?;
        for dir_entry in dir {
            let Ok(dir_entry) = dir_entry else {
                continue;
            };
            let file_path = dir_entry.path();
            if !file_path.is_file() {
                continue;
            }

            let Some(filename) = file_path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some(codec) = codec_from_extension(filename) else {
                debug!(file = filename, "skipping file with unsupported extension");
                continue;
            };

            if let Err(e) = catalog.add_file(&file_path, filename, codec, cache, server) {
                warn!(file = filename, error = %e, "skipping media file");
            }
            // The probe handle is released either way; the mapping is
            // re-created on first PLAY.
            cache.release(&file_path);
        }

        info!(count = catalog.entries.len(), "media scan complete");
        Ok(catalog)
    }

    fn add_file(
        &mut self,
        file_path: &Path,
        filename: &str,
        codec: CodecTag,
        cache: &FileCache,
        server: &dyn RtspServer,
    ) -> Result<()> {
        let stream_path = format!("/{filename}");

        let mut ts_bitrate = None;
        let mut mkv_tracks = Vec::new();
        let info = match codec {
            CodecTag::H264 => probe_h264(file_path, &stream_path, cache)?,
            CodecTag::H265 => probe_h265(file_path, &stream_path, cache)?,
            CodecTag::Aac => probe_aac(file_path, &stream_path, cache)?,
            CodecTag::Mp2t => {
                let (info, bitrate) = probe_ts(file_path, &stream_path, cache)?;
                ts_bitrate = Some(bitrate);
                info
            }
            CodecTag::Mkv => {
                let (info, tracks) = probe_mkv(file_path, &stream_path, cache)?;
                mkv_tracks = tracks;
                info
            }
        };

        if !server.add_media_stream(&stream_path, info.clone()) {
            return Err(AppError::StreamRegistration(stream_path));
        }

        info!(file = filename, stream = %stream_path, codec = %codec, "registered media stream");
        self.entries.insert(
            stream_path.clone(),
            CatalogEntry {
                filename: filename.to_string(),
                stream_path,
                file_path: file_path.to_path_buf(),
                codec,
                info: Arc::new(info),
                ts_bitrate,
                mkv_tracks,
            },
        );
        Ok(())
    }

    pub fn get(&self, stream_path: &str) -> Option<&CatalogEntry> {
        self.entries.get(stream_path)
    }

    pub fn entries(&self) -> impl Iterator<Item = &CatalogEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Map a filename extension to its codec, per the serving convention.
pub fn codec_from_extension(filename: &str) -> Option<CodecTag> {
    let extension = Path::new(filename).extension()?.to_str()?.to_lowercase();
    match extension.as_str() {
        "h264" | "264" => Some(CodecTag::H264),
        "h265" | "265" | "hevc" => Some(CodecTag::H265),
        "aac" => Some(CodecTag::Aac),
        "ts" | "m2ts" => Some(CodecTag::Mp2t),
        "mkv" => Some(CodecTag::Mkv),
        _ => None,
    }
}

fn probe_h264(file_path: &Path, stream_path: &str, cache: &FileCache) -> Result<StreamInfo> {
    let file = cache.get(file_path)?;
    let mut reader = H264Reader::new(file);

    let mut info = StreamInfo::new(
        stream_path,
        MediaKind::Video,
        CodecTag::H264,
        PT_VIDEO_DYNAMIC,
        VIDEO_CLOCK_RATE,
    );

    let (width, height) = reader.resolution();
    info.width = Some(width);
    info.height = Some(height);
    info.frame_rate = Some(reader.frame_rate());
    info.sps = reader.sps();
    info.pps = reader.pps();

    if let Some(sps_nal) = info.sps.as_deref() {
        if let Some(parsed) = sps::parse_sps(strip_start_code(sps_nal)) {
            debug!(
                stream = stream_path,
                profile = sps::profile_name(parsed.profile_idc),
                level = %sps::level_string(parsed.level_idc),
                width,
                height,
                "h264 stream probed"
            );
        }
    } else {
        warn!(stream = stream_path, "no SPS/PPS found, registering anyway");
    }

    let playback = reader.playback_info();
    info!(
        stream = stream_path,
        frames = playback.total_frames,
        duration_secs = playback.total_duration,
        "h264 file analyzed"
    );
    Ok(info)
}

fn probe_h265(file_path: &Path, stream_path: &str, cache: &FileCache) -> Result<StreamInfo> {
    let file = cache.get(file_path)?;
    let mut reader = H265Reader::new(file);

    let mut info = StreamInfo::new(
        stream_path,
        MediaKind::Video,
        CodecTag::H265,
        PT_VIDEO_DYNAMIC,
        VIDEO_CLOCK_RATE,
    );
    info.frame_rate = Some(reader.frame_rate());
    info.vps = reader.vps();
    info.sps = reader.sps();
    info.pps = reader.pps();

    if info.sps.is_none() {
        warn!(stream = stream_path, "no parameter sets found, registering anyway");
    }

    let playback = reader.playback_info();
    info!(
        stream = stream_path,
        frames = playback.total_frames,
        duration_secs = playback.total_duration,
        "h265 file analyzed"
    );
    Ok(info)
}

fn probe_aac(file_path: &Path, stream_path: &str, cache: &FileCache) -> Result<StreamInfo> {
    let file = cache.get(file_path)?;
    let reader = AacReader::new(file);

    if !reader.is_valid() {
        return Err(AppError::InvalidMedia {
            path: file_path.to_path_buf(),
            reason: "no valid ADTS frames".to_string(),
        });
    }

    let mut info = StreamInfo::new(
        stream_path,
        MediaKind::Audio,
        CodecTag::Aac,
        PT_AAC,
        reader.sample_rate(),
    );
    info.sample_rate = Some(reader.sample_rate());
    info.channels = Some(reader.channels());

    let playback = reader.playback_info();
    info!(
        stream = stream_path,
        sample_rate = reader.sample_rate(),
        channels = reader.channels(),
        profile = reader.profile_name(),
        bitrate = reader.bitrate(),
        frames = playback.total_frames,
        duration_secs = playback.total_duration,
        "aac file analyzed"
    );
    Ok(info)
}

fn probe_ts(
    file_path: &Path,
    stream_path: &str,
    cache: &FileCache,
) -> Result<(StreamInfo, u32)> {
    let file = cache.get(file_path)?;
    let reader = TsReader::new(file);

    if reader.total_packets() == 0 {
        return Err(AppError::InvalidMedia {
            path: file_path.to_path_buf(),
            reason: "no TS sync byte found".to_string(),
        });
    }

    let info = StreamInfo::new(
        stream_path,
        MediaKind::Video,
        CodecTag::Mp2t,
        PT_MP2T,
        VIDEO_CLOCK_RATE,
    );

    let playback = reader.playback_info();
    info!(
        stream = stream_path,
        packets = reader.total_packets(),
        bitrate = reader.bitrate(),
        duration_secs = playback.total_duration,
        "ts file analyzed"
    );
    Ok((info, reader.bitrate()))
}

fn probe_mkv(
    file_path: &Path,
    stream_path: &str,
    cache: &FileCache,
) -> Result<(StreamInfo, Vec<MkvTrackSpec>)> {
    let file = cache.get(file_path)?;
    let tracks = mkv::probe_tracks(&file)?;

    let video_selection = tracks
        .iter()
        .find_map(|t| mkv_video_codec(t).map(|codec| (t, codec)));
    let video = video_selection.map(|(t, _)| t);
    let audio = tracks
        .iter()
        .find(|t| !t.is_video && t.codec_id.starts_with(mkv::CODEC_ID_AAC));

    let mut selected = Vec::new();
    if let Some((track, codec)) = video_selection {
        selected.push(MkvTrackSpec {
            track_number: track.track_number,
            rtsp_track_index: 0,
            kind: MkvTrackKind::Video {
                codec,
                frame_rate: track.frame_rate(),
            },
        });
    }
    if let Some(track) = audio {
        selected.push(MkvTrackSpec {
            track_number: track.track_number,
            rtsp_track_index: selected.len(),
            kind: MkvTrackKind::Audio {
                sample_rate: track.sample_rate.max(1),
            },
        });
    }

    if selected.is_empty() {
        return Err(AppError::InvalidMedia {
            path: file_path.to_path_buf(),
            reason: "no streamable tracks".to_string(),
        });
    }

    let media_type = if video.is_some() {
        MediaKind::Video
    } else {
        MediaKind::Audio
    };
    let mut info = StreamInfo::new(
        stream_path,
        media_type,
        CodecTag::Mkv,
        PT_VIDEO_DYNAMIC,
        VIDEO_CLOCK_RATE,
    );

    if let Some(track) = video {
        info.width = Some(track.width);
        info.height = Some(track.height);
        info.frame_rate = Some(track.frame_rate());
        info.vps = track.parameter_sets.vps.clone();
        info.sps = track.parameter_sets.sps.clone();
        info.pps = track.parameter_sets.pps.clone();
    }
    if let Some(track) = audio {
        info.sample_rate = Some(track.sample_rate);
        info.channels = Some(track.channels);
        if video.is_none() {
            info.clock_rate = track.sample_rate.max(1);
        }
    }

    info!(
        stream = stream_path,
        tracks = selected.len(),
        video = video.map(|t| t.codec_id.as_str()).unwrap_or("-"),
        audio = audio.map(|t| t.codec_id.as_str()).unwrap_or("-"),
        "mkv file analyzed"
    );
    Ok((info, selected))
}

fn mkv_video_codec(track: &MkvTrackInfo) -> Option<CodecTag> {
    if !track.is_video {
        return None;
    }
    if track.codec_id.starts_with(mkv::CODEC_ID_AVC) {
        Some(CodecTag::H264)
    } else if track.codec_id.starts_with(mkv::CODEC_ID_HEVC) {
        Some(CodecTag::H265)
    } else {
        None
    }
}

fn strip_start_code(data: &[u8]) -> &[u8] {
    if data.len() >= 4 && data[..4] == [0, 0, 0, 1] {
        &data[4..]
    } else {
        data
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::readers::aac::test_support::adts_stream;
    use crate::readers::h264::test_support::annexb_stream;
    use crate::readers::ts::test_support::ts_stream;
    use crate::rtsp::StreamTable;

    fn write_file(dir: &Path, name: &str, contents: &[u8]) {
        let mut f = std::fs::File::create(dir.join(name)).unwrap();
        f.write_all(contents).unwrap();
    }

    #[test]
    fn test_codec_from_extension() {
        assert_eq!(codec_from_extension("a.h264"), Some(CodecTag::H264));
        assert_eq!(codec_from_extension("a.264"), Some(CodecTag::H264));
        assert_eq!(codec_from_extension("A.H264"), Some(CodecTag::H264));
        assert_eq!(codec_from_extension("a.h265"), Some(CodecTag::H265));
        assert_eq!(codec_from_extension("a.aac"), Some(CodecTag::Aac));
        assert_eq!(codec_from_extension("a.ts"), Some(CodecTag::Mp2t));
        assert_eq!(codec_from_extension("a.M2TS"), Some(CodecTag::Mp2t));
        assert_eq!(codec_from_extension("a.mkv"), Some(CodecTag::Mkv));
        assert_eq!(codec_from_extension("a.mp4"), None);
        assert_eq!(codec_from_extension("noext"), None);
    }

    #[test]
    fn test_scan_registers_recognized_files() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "movie.h264", &annexb_stream(10));
        write_file(dir.path(), "audio.aac", &adts_stream(20, 32));
        write_file(dir.path(), "capture.ts", &ts_stream(10));
        write_file(dir.path(), "notes.txt", b"not media");

        let cache = FileCache::new();
        let table = StreamTable::new();
        let catalog = MediaCatalog::scan(dir.path(), &cache, &table).unwrap();

        assert_eq!(catalog.len(), 3);
        assert_eq!(table.len(), 3);
        assert!(catalog.get("/movie.h264").is_some());
        assert!(catalog.get("/audio.aac").is_some());
        assert!(catalog.get("/capture.ts").is_some());
        assert!(catalog.get("/notes.txt").is_none());

        // Probe handles are all released after the scan.
        assert_eq!(cache.active_count(), 0);
    }

    #[test]
    fn test_scan_populates_stream_info() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "movie.h264", &annexb_stream(10));
        write_file(dir.path(), "audio.aac", &adts_stream(20, 32));
        write_file(dir.path(), "capture.ts", &ts_stream(10));

        let cache = FileCache::new();
        let table = StreamTable::new();
        let catalog = MediaCatalog::scan(dir.path(), &cache, &table).unwrap();

        let video = table.get("/movie.h264").unwrap();
        assert_eq!(video.media_type, MediaKind::Video);
        assert_eq!(video.payload_type, 96);
        assert_eq!(video.clock_rate, 90_000);
        assert_eq!(video.frame_rate, Some(25));
        assert!(video.sps.is_some());
        assert!(video.pps.is_some());

        let audio = table.get("/audio.aac").unwrap();
        assert_eq!(audio.media_type, MediaKind::Audio);
        assert_eq!(audio.payload_type, 97);
        assert_eq!(audio.clock_rate, 48_000);
        assert_eq!(audio.sample_rate, Some(48_000));
        assert_eq!(audio.channels, Some(2));

        let ts = table.get("/capture.ts").unwrap();
        assert_eq!(ts.payload_type, 33);
        assert_eq!(
            catalog.get("/capture.ts").unwrap().ts_bitrate,
            Some(2_000_000)
        );
    }

    #[test]
    fn test_scan_skips_invalid_media() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "broken.aac", &[0u8; 64]);
        write_file(dir.path(), "good.h264", &annexb_stream(3));

        let cache = FileCache::new();
        let table = StreamTable::new();
        let catalog = MediaCatalog::scan(dir.path(), &cache, &table).unwrap();

        assert_eq!(catalog.len(), 1);
        assert!(catalog.get("/good.h264").is_some());
    }

    #[test]
    fn test_scan_skips_on_registration_failure() {
        struct RejectingServer;
        impl RtspServer for RejectingServer {
            fn add_media_stream(&self, _: &str, _: StreamInfo) -> bool {
                false
            }
        }

        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "movie.h264", &annexb_stream(3));

        let cache = FileCache::new();
        let catalog = MediaCatalog::scan(dir.path(), &cache, &RejectingServer).unwrap();
        assert!(catalog.is_empty());
        assert_eq!(cache.active_count(), 0);
    }

    #[test]
    fn test_scan_missing_directory_fails() {
        let cache = FileCache::new();
        let table = StreamTable::new();
        assert!(MediaCatalog::scan(Path::new("/nonexistent/media"), &cache, &table).is_err());
    }
}
