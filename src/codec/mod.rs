//! Opus encoding for the WebRTC media path
//!
//! The relay itself only moves raw PCM; encoding happens at the very end,
//! inside the transport, once per session.

pub mod encoder;
pub mod resample;

pub use encoder::{EncoderStats, OpusConfig, OpusEncoder};
