//! Registry of active session workers

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::codecs::{AacStreamer, H264Streamer, H265Streamer, MkvStreamer, TsStreamer};
use super::worker::{SessionWorker, Streamer};
use crate::fs::FileCache;
use crate::rtsp::{CodecTag, RtspSession};

/// Kind of a selected Matroska track, with its pacing rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MkvTrackKind {
    Video { codec: CodecTag, frame_rate: u32 },
    Audio { sample_rate: u32 },
}

/// One Matroska track to stream, and the session track slot it feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MkvTrackSpec {
    pub track_number: u64,
    pub rtsp_track_index: usize,
    pub kind: MkvTrackKind,
}

/// What to stream for a session, with the codec-appropriate rate hint.
#[derive(Debug, Clone)]
pub enum WorkerSpec {
    H264 { frame_rate: u32 },
    H265 { frame_rate: u32 },
    Aac { sample_rate: u32 },
    Mp2t { bitrate: u32 },
    Mkv { tracks: Vec<MkvTrackSpec> },
}

/// Process-wide map from session id to its worker group.
///
/// Elementary streams run one worker per session; Matroska streams run one
/// worker per selected track. All registry operations serialize on a single
/// mutex; `stop` joins the pacing threads while holding it, which is safe
/// because workers never call back into the registry.
pub struct SessionRegistry {
    cache: Arc<FileCache>,
    sessions: Mutex<HashMap<String, Vec<SessionWorker>>>,
}

impl SessionRegistry {
    pub fn new(cache: Arc<FileCache>) -> Self {
        Self {
            cache,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Start streaming `file_path` to `session`.
    ///
    /// An existing worker group for the same session id is stopped and
    /// replaced. Returns false when no worker could be started; a partial
    /// Matroska group is torn down again.
    pub fn start(
        &self,
        session: Arc<dyn RtspSession>,
        file_path: &Path,
        spec: WorkerSpec,
    ) -> bool {
        let session_id = session.session_id().to_string();
        let mut sessions = self.sessions.lock();

        if let Some(existing) = sessions.get_mut(&session_id) {
            info!(session_id = %session_id, "session already active, stopping existing worker");
            for worker in existing.iter_mut() {
                worker.stop();
            }
            sessions.remove(&session_id);
        }

        let workers = self.spawn_workers(&session, file_path, spec);
        if workers.is_empty() {
            warn!(session_id = %session_id, path = %file_path.display(), "failed to start session worker");
            return false;
        }

        info!(
            session_id = %session_id,
            path = %file_path.display(),
            workers = workers.len(),
            total_active = sessions.len() + 1,
            "session started"
        );
        sessions.insert(session_id, workers);
        true
    }

    fn spawn_workers(
        &self,
        session: &Arc<dyn RtspSession>,
        file_path: &Path,
        spec: WorkerSpec,
    ) -> Vec<SessionWorker> {
        let path: PathBuf = file_path.to_path_buf();
        let mut workers = Vec::new();

        let specs: Vec<Box<dyn Streamer>> = match spec {
            WorkerSpec::H264 { frame_rate } => vec![Box::new(H264Streamer::new(
                session.clone(),
                self.cache.clone(),
                path,
                frame_rate,
            ))],
            WorkerSpec::H265 { frame_rate } => vec![Box::new(H265Streamer::new(
                session.clone(),
                self.cache.clone(),
                path,
                frame_rate,
            ))],
            WorkerSpec::Aac { sample_rate } => vec![Box::new(AacStreamer::new(
                session.clone(),
                self.cache.clone(),
                path,
                sample_rate,
            ))],
            WorkerSpec::Mp2t { bitrate } => vec![Box::new(TsStreamer::new(
                session.clone(),
                self.cache.clone(),
                path,
                bitrate,
            ))],
            WorkerSpec::Mkv { tracks } => tracks
                .into_iter()
                .map(|track| {
                    Box::new(MkvStreamer::new(
                        session.clone(),
                        self.cache.clone(),
                        path.clone(),
                        track.track_number,
                        track.rtsp_track_index,
                        track.kind,
                    )) as Box<dyn Streamer>
                })
                .collect(),
        };

        for streamer in specs {
            match SessionWorker::start(session.clone(), streamer) {
                Ok(worker) => workers.push(worker),
                Err(e) => {
                    warn!(
                        session_id = session.session_id(),
                        error = %e,
                        "worker start failed"
                    );
                    for mut worker in workers.drain(..) {
                        worker.stop();
                    }
                    return Vec::new();
                }
            }
        }

        workers
    }

    /// Stop the worker group for `session_id`. Returns false on a miss.
    ///
    /// The entry is erased only after every pacing thread has joined.
    pub fn stop(&self, session_id: &str) -> bool {
        let mut sessions = self.sessions.lock();
        let Some(workers) = sessions.get_mut(session_id) else {
            debug!(session_id, "session not found for stopping");
            return false;
        };

        for worker in workers.iter_mut() {
            worker.stop();
        }
        sessions.remove(session_id);

        info!(
            session_id,
            remaining_active = sessions.len(),
            "session stopped"
        );
        true
    }

    /// Stop every worker group.
    pub fn stop_all(&self) {
        let mut sessions = self.sessions.lock();
        info!(count = sessions.len(), "stopping all sessions");
        for (_, workers) in sessions.iter_mut() {
            for worker in workers {
                worker.stop();
            }
        }
        sessions.clear();
    }

    /// Reap worker groups whose threads have exited on their own.
    pub fn cleanup_finished(&self) -> usize {
        let mut sessions = self.sessions.lock();
        let finished: Vec<String> = sessions
            .iter()
            .filter(|(_, workers)| workers.iter().all(|w| !w.is_running()))
            .map(|(id, _)| id.clone())
            .collect();

        for id in &finished {
            if let Some(workers) = sessions.get_mut(id) {
                for worker in workers.iter_mut() {
                    worker.stop();
                }
                sessions.remove(id);
            }
            debug!(session_id = %id, "cleaned up finished session");
        }

        if !finished.is_empty() {
            info!(
                cleaned = finished.len(),
                remaining_active = sessions.len(),
                "cleaned up finished sessions"
            );
        }
        finished.len()
    }

    pub fn active_count(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn active_ids(&self) -> Vec<String> {
        self.sessions.lock().keys().cloned().collect()
    }

    pub fn is_active(&self, session_id: &str) -> bool {
        self.sessions
            .lock()
            .get(session_id)
            .is_some_and(|workers| workers.iter().any(|w| w.is_running()))
    }

    /// Total frames sent across the session's workers, for stats logging.
    pub fn frames_sent(&self, session_id: &str) -> u64 {
        self.sessions
            .lock()
            .get(session_id)
            .map(|workers| workers.iter().map(|w| w.frames_sent()).sum())
            .unwrap_or(0)
    }

    pub fn seek_to_frame(&self, session_id: &str, frame_index: usize) -> bool {
        self.with_workers(session_id, |w| w.seek_to_frame(frame_index))
    }

    pub fn seek_to_time(&self, session_id: &str, timestamp: f64) -> bool {
        self.with_workers(session_id, |w| w.seek_to_time(timestamp))
    }

    pub fn reset(&self, session_id: &str) -> bool {
        self.with_workers(session_id, |w| w.reset())
    }

    pub fn set_frame_rate(&self, session_id: &str, fps: u32) -> bool {
        self.with_workers(session_id, |w| {
            w.set_frame_rate(fps);
        })
    }

    fn with_workers(&self, session_id: &str, f: impl Fn(&SessionWorker)) -> bool {
        let sessions = self.sessions.lock();
        let Some(workers) = sessions.get(session_id) else {
            debug!(session_id, "session not found");
            return false;
        };
        for worker in workers {
            f(worker);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::time::{Duration, Instant};

    use super::*;
    use crate::readers::h264::test_support::annexb_stream;
    use crate::rtsp::mock::MockSession;

    fn temp_file(contents: &[u8]) -> tempfile::NamedTempFile {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(contents).unwrap();
        tmp.flush().unwrap();
        tmp
    }

    fn wait_for(deadline: Duration, mut check: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if check() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        false
    }

    /// High frame rate keeps the pacing tests fast.
    const TEST_FPS: u32 = 100;

    #[test]
    fn test_play_emits_paced_units_in_order() {
        let tmp = temp_file(&annexb_stream(9));
        let cache = Arc::new(FileCache::new());
        let registry = SessionRegistry::new(cache);
        let session = MockSession::new("s1");

        assert!(registry.start(
            session.clone(),
            tmp.path(),
            WorkerSpec::H264 {
                frame_rate: TEST_FPS
            },
        ));
        assert!(registry.is_active("s1"));

        // The 12-unit file loops; wait for more than one pass.
        assert!(wait_for(Duration::from_secs(5), || session.pushed_count() >= 15));
        registry.stop("s1");

        let frames = session.pushed_frames();
        let increment = 90_000 / TEST_FPS;
        for (i, pushed) in frames.iter().enumerate() {
            // Strictly increasing arithmetic RTP sequence, across the loop.
            assert_eq!(pushed.frame.timestamp, i as u32 * increment);
            assert_eq!(&pushed.frame.data[..4], &[0, 0, 0, 1]);
        }

        // First pass: SPS, PPS, IDR...
        assert_eq!(frames[0].frame.data[4] & 0x1F, 7);
        assert_eq!(frames[1].frame.data[4] & 0x1F, 8);
        assert_eq!(frames[2].frame.data[4] & 0x1F, 5);
        assert!(frames[2].frame.is_keyframe);
        // ...and the sequence restarts after unit 12.
        assert_eq!(frames[12].frame.data[4] & 0x1F, 7);
    }

    #[test]
    fn test_duplicate_start_replaces_worker() {
        let tmp = temp_file(&annexb_stream(5));
        let cache = Arc::new(FileCache::new());
        let registry = SessionRegistry::new(cache);
        let session = MockSession::new("dup");

        let spec = WorkerSpec::H264 {
            frame_rate: TEST_FPS,
        };
        assert!(registry.start(session.clone(), tmp.path(), spec.clone()));
        assert!(registry.start(session.clone(), tmp.path(), spec));
        assert_eq!(registry.active_count(), 1);
        assert!(registry.is_active("dup"));

        registry.stop_all();
        assert_eq!(registry.active_count(), 0);
    }

    #[test]
    fn test_stop_decrements_only_on_hit() {
        let tmp = temp_file(&annexb_stream(5));
        let cache = Arc::new(FileCache::new());
        let registry = SessionRegistry::new(cache);
        let session = MockSession::new("s1");

        assert!(registry.start(
            session,
            tmp.path(),
            WorkerSpec::H264 {
                frame_rate: TEST_FPS
            },
        ));
        assert_eq!(registry.active_count(), 1);

        assert!(!registry.stop("missing"));
        assert_eq!(registry.active_count(), 1);

        assert!(registry.stop("s1"));
        assert_eq!(registry.active_count(), 0);
        assert!(!registry.stop("s1"));
    }

    #[test]
    fn test_two_sessions_share_one_mapping() {
        let tmp = temp_file(&annexb_stream(20));
        let cache = Arc::new(FileCache::new());
        let registry = SessionRegistry::new(cache.clone());
        let a = MockSession::new("a");
        let b = MockSession::new("b");

        let spec = WorkerSpec::H264 {
            frame_rate: TEST_FPS,
        };
        assert!(registry.start(a.clone(), tmp.path(), spec.clone()));
        assert!(registry.start(b.clone(), tmp.path(), spec));

        assert_eq!(registry.active_count(), 2);
        assert_eq!(cache.active_count(), 1);

        assert!(wait_for(Duration::from_secs(5), || {
            a.pushed_count() >= 3 && b.pushed_count() >= 3
        }));

        // Stopping one session leaves the other streaming.
        registry.stop("a");
        let b_count = b.pushed_count();
        assert!(wait_for(Duration::from_secs(5), || {
            b.pushed_count() > b_count
        }));

        registry.stop("b");
        assert_eq!(cache.active_count(), 0);
    }

    #[test]
    fn test_dead_transport_ends_worker_and_reap_collects_it() {
        let tmp = temp_file(&annexb_stream(9));
        let cache = Arc::new(FileCache::new());
        let registry = SessionRegistry::new(cache);
        let session = MockSession::new("s1");

        assert!(registry.start(
            session.clone(),
            tmp.path(),
            WorkerSpec::H264 {
                frame_rate: TEST_FPS
            },
        ));

        session.set_transport_alive(false);
        assert!(wait_for(Duration::from_secs(5), || !registry.is_active("s1")));

        assert_eq!(registry.cleanup_finished(), 1);
        assert_eq!(registry.active_count(), 0);
    }

    #[test]
    fn test_pause_state_ends_worker() {
        let tmp = temp_file(&annexb_stream(9));
        let cache = Arc::new(FileCache::new());
        let registry = SessionRegistry::new(cache);
        let session = MockSession::new("s1");

        assert!(registry.start(
            session.clone(),
            tmp.path(),
            WorkerSpec::H264 {
                frame_rate: TEST_FPS
            },
        ));

        session.set_playing(false);
        assert!(wait_for(Duration::from_secs(5), || !registry.is_active("s1")));
        assert_eq!(registry.cleanup_finished(), 1);
    }

    #[test]
    fn test_start_fails_on_missing_file() {
        let cache = Arc::new(FileCache::new());
        let registry = SessionRegistry::new(cache);
        let session = MockSession::new("s1");

        assert!(!registry.start(
            session,
            Path::new("/nonexistent/missing.h264"),
            WorkerSpec::H264 { frame_rate: 25 },
        ));
        assert_eq!(registry.active_count(), 0);
    }

    #[test]
    fn test_seek_and_reset_are_delivered() {
        let tmp = temp_file(&annexb_stream(30));
        let cache = Arc::new(FileCache::new());
        let registry = SessionRegistry::new(cache);
        let session = MockSession::new("s1");

        assert!(registry.start(
            session.clone(),
            tmp.path(),
            WorkerSpec::H264 {
                frame_rate: TEST_FPS
            },
        ));

        assert!(registry.seek_to_frame("s1", 10));
        assert!(registry.seek_to_time("s1", 0.05));
        assert!(registry.reset("s1"));
        assert!(registry.set_frame_rate("s1", 50));

        assert!(!registry.seek_to_frame("missing", 0));
        assert!(!registry.reset("missing"));

        assert!(wait_for(Duration::from_secs(5), || session.pushed_count() >= 2));
        registry.stop("s1");
    }
}
