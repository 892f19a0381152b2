//! Per-session streaming pipeline
//!
//! Every session in the PLAY state owns one pacing thread per streamed track.
//! [`worker::SessionWorker`] drives the shared pace loop; the codec-specific
//! [`worker::Streamer`] implementations in [`codecs`] supply the reader, the
//! pace interval and the RTP timestamp synthesis. [`registry::SessionRegistry`]
//! keys the live workers by session id.

pub mod codecs;
pub mod registry;
pub mod worker;

pub use registry::{MkvTrackKind, MkvTrackSpec, SessionRegistry, WorkerSpec};
pub use worker::SessionWorker;
