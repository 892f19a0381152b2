//! Elementary-stream parsing primitives
//!
//! Stateless parsers shared by the per-session readers: Annex-B start-code
//! scanning, H.264 SPS decoding, ADTS header parsing, MPEG-TS packet and PCR
//! decoding, and avcC/hvcC codec-private conversion.

pub mod adts;
pub mod annexb;
pub mod codec_private;
pub mod sps;
pub mod ts;
