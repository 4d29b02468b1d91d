//! PCM frame geometry
//!
//! Everything in the relay moves in 20ms frames of interleaved
//! little-endian 16-bit stereo samples.

use bytes::Bytes;
use std::time::Duration;

use crate::constants::{
    BYTES_PER_SAMPLE, CHANNELS, FRAME_DURATION_MS, MAX_SAMPLE_RATE, MIN_SAMPLE_RATE,
};

/// One frame's worth of raw PCM bytes, shared between subscribers
pub type AudioChunk = Bytes;

/// Bytes per interleaved sample across all channels
pub const SAMPLE_WIDTH: usize = CHANNELS * BYTES_PER_SAMPLE;

/// Clamp a requested sample rate into the supported range
pub fn clamp_sample_rate(sample_rate: u32) -> u32 {
    sample_rate.clamp(MIN_SAMPLE_RATE, MAX_SAMPLE_RATE)
}

/// Samples per channel in one frame
pub fn frame_samples(sample_rate: u32) -> usize {
    sample_rate as usize * FRAME_DURATION_MS as usize / 1000
}

/// Bytes in one frame
pub fn frame_bytes(sample_rate: u32) -> usize {
    frame_samples(sample_rate) * SAMPLE_WIDTH
}

pub fn frame_duration() -> Duration {
    Duration::from_millis(FRAME_DURATION_MS as u64)
}

/// A frame handed to the transport, stamped with its position in the
/// track's sample timeline
#[derive(Debug, Clone, PartialEq)]
pub struct PcmFrame {
    pub data: Bytes,
    /// Sample count emitted by the track before this frame
    pub pts: u64,
    pub sample_rate: u32,
}

impl PcmFrame {
    pub fn new(data: Bytes, pts: u64, sample_rate: u32) -> Self {
        Self {
            data,
            pts,
            sample_rate,
        }
    }

    /// A zeroed frame at the given rate
    pub fn silence(sample_rate: u32, pts: u64) -> Self {
        Self::new(Bytes::from(vec![0u8; frame_bytes(sample_rate)]), pts, sample_rate)
    }

    /// Samples per channel
    pub fn samples(&self) -> usize {
        self.data.len() / SAMPLE_WIDTH
    }

    pub fn duration(&self) -> Duration {
        Duration::from_micros(self.samples() as u64 * 1_000_000 / self.sample_rate as u64)
    }

    /// Decode the payload into interleaved i16 samples
    pub fn to_samples(&self) -> Vec<i16> {
        decode_samples(&self.data)
    }
}

pub(crate) fn decode_samples(data: &[u8]) -> Vec<i16> {
    data.chunks_exact(BYTES_PER_SAMPLE)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}

pub(crate) fn encode_samples(samples: &[i16]) -> Bytes {
    let mut out = Vec::with_capacity(samples.len() * BYTES_PER_SAMPLE);
    for sample in samples {
        out.extend_from_slice(&sample.to_le_bytes());
    }
    Bytes::from(out)
}
