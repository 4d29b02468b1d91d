//! # Roomcast Relay
//!
//! Real-time PCM relay: fans the output of a multi-channel audio mixer out
//! to browser listeners over WebRTC.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                                 MIXER                                     │
//! │        stream "radio:ch.1"        stream "spotify:ch.2"        ...        │
//! └───────────────┬──────────────────────────────┬───────────────────────────┘
//!                 │ snapclient (PCM on stdout)    │
//!                 ▼                               ▼
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                           Relay (relay::Relay)                            │
//! │  ┌─────────────────────────────────┐  ┌─────────────────────────────────┐ │
//! │  │ ChannelSource "ch1"             │  │ ChannelSource "ch2"             │ │
//! │  │  ┌───────────┐   ┌───────────┐  │  │  ┌───────────┐   ┌───────────┐  │ │
//! │  │  │SourcePump │──▶│Broadcaster│  │  │  │SourcePump │──▶│Broadcaster│  │ │
//! │  │  │ (pump)    │   │ (audio)   │  │  │  │ (pump)    │   │ (audio)   │  │ │
//! │  │  └───────────┘   └─────┬─────┘  │  │  └───────────┘   └─────┬─────┘  │ │
//! │  └────────────────────────┼────────┘  └────────────────────────┼────────┘ │
//! │              ┌────────────┴───────────┐                        │          │
//! │              ▼                        ▼                        ▼          │
//! │  ┌───────────────────┐  ┌───────────────────┐  ┌───────────────────┐      │
//! │  │ Session "node-a"  │  │ Session "node-b"  │  │ Session "node-c"  │      │
//! │  │  ConsumerTrack    │  │  ConsumerTrack    │  │  ConsumerTrack    │      │
//! │  │  (stereo, pan)    │  │  (stereo, pan)    │  │  (stereo, pan)    │      │
//! │  │  Opus ▶ WebRTC    │  │  Opus ▶ WebRTC    │  │  Opus ▶ WebRTC    │      │
//! │  └─────────┬─────────┘  └─────────┬─────────┘  └─────────┬─────────┘      │
//! └────────────┼──────────────────────┼──────────────────────┼────────────────┘
//!              ▼                      ▼                      ▼
//!          browser                browser                browser
//! ```
//!
//! Each channel's subprocess runs only while at least one session listens
//! to it, plus a short grace period so quick channel switches reuse it.

pub mod audio;
pub mod codec;
pub mod config;
pub mod error;
pub mod pump;
pub mod relay;
pub mod rtc;
pub mod tracks;

pub use error::{Error, Result};

/// Application-wide constants
pub mod constants {
    /// Default sample rate for relayed PCM
    pub const DEFAULT_SAMPLE_RATE: u32 = 48000;

    /// Lowest accepted sample rate
    pub const MIN_SAMPLE_RATE: u32 = 8000;

    /// Highest accepted sample rate
    pub const MAX_SAMPLE_RATE: u32 = 192_000;

    /// Channel count (always interleaved stereo)
    pub const CHANNELS: usize = 2;

    /// Bytes per sample (signed 16-bit little-endian)
    pub const BYTES_PER_SAMPLE: usize = 2;

    /// Bits per sample, as passed to the PCM subprocess
    pub const SAMPLE_BITS: u32 = 16;

    /// Frame duration in milliseconds
    pub const FRAME_DURATION_MS: u32 = 20;

    /// Per-subscriber queue capacity (in frames), one second of audio
    pub const DEFAULT_QUEUE_CAPACITY: usize = 50;

    /// Default Opus bitrate in bits per second
    pub const DEFAULT_BITRATE: u32 = 256_000;

    /// Prefix for the mixer client id of each channel pump
    pub const DEFAULT_CLIENT_PREFIX: &str = "roomcast-webrtc";

    /// Seconds a listener-less channel keeps its subprocess
    pub const DEFAULT_IDLE_TIMEOUT_SECS: f64 = 10.0;

    /// STUN server used when none is configured
    pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";
}
