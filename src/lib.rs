//! rtsp-vod - RTSP video-on-demand streaming engine
//!
//! Discovers elementary media files (H.264/H.265 Annex-B, AAC/ADTS, MPEG-TS,
//! Matroska) in a directory and serves each as an independently seekable,
//! wall-clock-paced stream of access units for an RTSP frontend to packetize.

pub mod catalog;
pub mod error;
pub mod fs;
pub mod media;
pub mod readers;
pub mod rtsp;
pub mod session;

pub use error::{AppError, Result};
pub use rtsp::bridge::VodEngine;
