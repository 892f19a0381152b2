//! Worker-thread framework shared by all codec streamers

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::error::Result;
use crate::rtsp::RtspSession;

/// Floor for the per-tick sleep so the loop never spins.
const MIN_TICK_SLEEP: Duration = Duration::from_micros(500);

/// When the loop falls further behind than this many intervals, the pacing
/// clock snaps to now instead of bursting to catch up.
const CATCH_UP_INTERVALS: u32 = 5;

/// Control messages delivered to the pacing thread at tick boundaries.
///
/// The pacing thread is the sole mutator of its reader; seeks from the
/// registry are routed through this channel instead of touching the cursor
/// from another thread.
#[derive(Debug, Clone, Copy)]
pub enum WorkerCommand {
    SeekToFrame(usize),
    SeekToTime(f64),
    Reset,
}

/// Frames/bytes counters shared between a streamer and its worker handle.
#[derive(Debug, Default)]
pub struct WorkerStats {
    pub frames_sent: AtomicU64,
    pub bytes_sent: AtomicU64,
}

impl WorkerStats {
    pub fn record_send(&self, bytes: usize) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }
}

/// Codec-specific half of a session worker.
///
/// `initialize` runs on the caller's thread before the pacing thread spawns;
/// everything else runs on the pacing thread. Dropping the streamer releases
/// its reader and mapped-file reference.
pub trait Streamer: Send + 'static {
    /// Acquire the mapped file, construct the reader and precompute pacing
    /// parameters. Failure aborts worker start.
    fn initialize(&mut self) -> Result<()>;

    /// Read one access unit and push it to the session. Returns false on end
    /// of file or push failure.
    fn send_next(&mut self) -> bool;

    /// Steady interval between emissions.
    fn data_interval(&self) -> Duration;

    /// Rewind the reader to the start of the stream.
    fn reset_reader(&mut self);

    /// Called when `send_next` returns false. Returns true to keep pacing
    /// (the default loops back to the beginning), false to end the worker.
    fn handle_eof(&mut self) -> bool {
        self.reset_reader();
        true
    }

    /// Apply a control command. Streamers without an index ignore seeks.
    fn handle_command(&mut self, command: WorkerCommand) {
        let _ = command;
    }

    /// Shared statistics block, also visible through the worker handle.
    fn stats(&self) -> Arc<WorkerStats>;

    /// Shared frame-rate cell for streamers whose pacing follows a mutable
    /// frame rate. None for fixed-rate codecs.
    fn shared_frame_rate(&self) -> Option<Arc<AtomicU32>> {
        None
    }
}

/// Handle to one pacing thread.
///
/// The worker is created on PLAY and torn down on PAUSE/TEARDOWN/stop. Stop
/// sets the cooperative flag and joins; the thread observes the flag within
/// one pace interval plus sleep slack.
pub struct SessionWorker {
    session_id: String,
    stop: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
    stats: Arc<WorkerStats>,
    frame_rate: Option<Arc<AtomicU32>>,
    commands: Sender<WorkerCommand>,
    handle: Option<JoinHandle<()>>,
}

impl SessionWorker {
    /// Initialize the streamer and spawn its pacing thread.
    pub fn start(session: Arc<dyn RtspSession>, mut streamer: Box<dyn Streamer>) -> Result<Self> {
        let session_id = session.session_id().to_string();

        streamer.initialize()?;

        let stop = Arc::new(AtomicBool::new(false));
        let running = Arc::new(AtomicBool::new(true));
        let stats = streamer.stats();
        let frame_rate = streamer.shared_frame_rate();
        let (commands, command_rx) = mpsc::channel();

        let handle = {
            let stop = stop.clone();
            let running = running.clone();
            let stats = stats.clone();
            let session_id_thread = session_id.clone();
            let session_id_err = session_id.clone();
            std::thread::Builder::new()
                .name(format!("pace-{session_id}"))
                .spawn(move || {
                    pace_loop(&session_id_thread, session, streamer, &stop, &stats, command_rx);
                    running.store(false, Ordering::SeqCst);
                })
                .map_err(|e| crate::error::AppError::SessionStart {
                    session_id: session_id_err,
                    reason: format!("failed to spawn pacing thread: {e}"),
                })?
        };

        info!(session_id = %session_id, "session worker started");
        Ok(Self {
            session_id,
            stop,
            running,
            stats,
            frame_rate,
            commands,
            handle: Some(handle),
        })
    }

    /// Signal the pacing thread to stop and join it.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!(session_id = %self.session_id, "pacing thread panicked");
            }
        }
        self.running.store(false, Ordering::SeqCst);

        info!(
            session_id = %self.session_id,
            frames = self.stats.frames_sent.load(Ordering::Relaxed),
            bytes = self.stats.bytes_sent.load(Ordering::Relaxed),
            "session worker stopped"
        );
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn frames_sent(&self) -> u64 {
        self.stats.frames_sent.load(Ordering::Relaxed)
    }

    pub fn bytes_sent(&self) -> u64 {
        self.stats.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn seek_to_frame(&self, frame_index: usize) {
        let _ = self.commands.send(WorkerCommand::SeekToFrame(frame_index));
    }

    pub fn seek_to_time(&self, timestamp: f64) {
        let _ = self.commands.send(WorkerCommand::SeekToTime(timestamp));
    }

    pub fn reset(&self) {
        let _ = self.commands.send(WorkerCommand::Reset);
    }

    /// Update the pacing frame rate, when this worker paces by frame rate.
    pub fn set_frame_rate(&self, fps: u32) -> bool {
        let Some(cell) = &self.frame_rate else {
            return false;
        };
        if !(1..=120).contains(&fps) {
            warn!(session_id = %self.session_id, fps, "rejecting out-of-range frame rate");
            return false;
        }
        cell.store(fps, Ordering::SeqCst);
        true
    }
}

impl Drop for SessionWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

/// The shared pace loop.
///
/// Each tick: exit when stopped or the session is no longer playable, drain
/// pending control commands, emit when the interval elapsed, then sleep until
/// the next expected emission. The pacing clock advances by whole intervals
/// to hold the long-term rate, snapping to now only after a stall longer
/// than [`CATCH_UP_INTERVALS`].
fn pace_loop(
    session_id: &str,
    session: Arc<dyn RtspSession>,
    mut streamer: Box<dyn Streamer>,
    stop: &AtomicBool,
    stats: &WorkerStats,
    commands: Receiver<WorkerCommand>,
) {
    debug!(session_id, "pacing thread started");

    let mut last_emit = Instant::now();

    while !stop.load(Ordering::SeqCst) {
        if !session.is_playing() || !session.transport_alive() {
            debug!(session_id, "session no longer active, stopping worker");
            break;
        }

        while let Ok(command) = commands.try_recv() {
            streamer.handle_command(command);
        }

        let interval = streamer.data_interval();
        let now = Instant::now();
        let elapsed = now.duration_since(last_emit);

        if elapsed >= interval {
            if streamer.send_next() {
                if elapsed > interval * CATCH_UP_INTERVALS {
                    last_emit = now;
                } else {
                    last_emit += interval;
                }
            } else {
                if !streamer.handle_eof() {
                    debug!(session_id, "worker finished at end of stream");
                    break;
                }
                debug!(session_id, "end of stream, looping back");
                stats.frames_sent.store(0, Ordering::Relaxed);
                last_emit = Instant::now();
                continue;
            }
        }

        let remaining = interval.saturating_sub(last_emit.elapsed());
        std::thread::sleep(remaining.max(MIN_TICK_SLEEP).min(interval.max(MIN_TICK_SLEEP)));
    }

    debug!(session_id, "pacing thread finished");
}
