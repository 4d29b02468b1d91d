//! Opus encoder wrapper
//!
//! Encodes relay frames for the WebRTC track. Opus only runs at a few
//! fixed rates, so frames at any other rate are resampled to 48kHz first.

use bytes::Bytes;
use opus::{Application, Channels, Encoder};

use crate::codec::resample::resample_stereo;
use crate::constants::{CHANNELS, DEFAULT_BITRATE, FRAME_DURATION_MS};
use crate::error::CodecError;

/// Rates libopus accepts natively
const OPUS_RATES: [u32; 5] = [8000, 12000, 16000, 24000, 48000];

/// Rate used when the input rate is not one of [`OPUS_RATES`]
pub const OPUS_FALLBACK_RATE: u32 = 48000;

/// Largest packet we expect from one 20ms frame
const MAX_PACKET: usize = 4000;

/// Encoder configuration
#[derive(Debug, Clone)]
pub struct OpusConfig {
    /// Rate of the PCM handed to `encode`
    pub input_rate: u32,
    pub bitrate: u32,
    pub fec: bool,
    /// Expected packet loss, used to size FEC
    pub packet_loss_perc: u8,
    pub vbr: bool,
}

impl OpusConfig {
    /// Stereo music profile for `input_rate` PCM
    pub fn music(input_rate: u32) -> Self {
        Self {
            input_rate,
            bitrate: DEFAULT_BITRATE,
            fec: true,
            packet_loss_perc: 5,
            vbr: true,
        }
    }

    /// Rate the encoder itself runs at
    pub fn encoder_rate(&self) -> u32 {
        if OPUS_RATES.contains(&self.input_rate) {
            self.input_rate
        } else {
            OPUS_FALLBACK_RATE
        }
    }

    /// Samples per channel in one encoded frame
    pub fn frame_size(&self) -> usize {
        self.encoder_rate() as usize * FRAME_DURATION_MS as usize / 1000
    }
}

/// Opus encoder for 20ms interleaved stereo i16 frames
pub struct OpusEncoder {
    encoder: Encoder,
    config: OpusConfig,
    /// Encoding buffer (reused to avoid allocations)
    encode_buffer: Vec<u8>,
    frames_encoded: u64,
    bytes_produced: u64,
}

impl OpusEncoder {
    pub fn new(config: OpusConfig) -> Result<Self, CodecError> {
        let mut encoder = Encoder::new(config.encoder_rate(), Channels::Stereo, Application::Audio)
            .map_err(|e| CodecError::EncoderInit(e.to_string()))?;

        Self::configure_encoder(&mut encoder, &config)?;

        Ok(Self {
            encoder,
            config,
            encode_buffer: vec![0u8; MAX_PACKET],
            frames_encoded: 0,
            bytes_produced: 0,
        })
    }

    fn configure_encoder(encoder: &mut Encoder, config: &OpusConfig) -> Result<(), CodecError> {
        encoder
            .set_bitrate(opus::Bitrate::Bits(config.bitrate as i32))
            .map_err(|e| CodecError::EncoderInit(format!("Failed to set bitrate: {}", e)))?;

        encoder
            .set_vbr(config.vbr)
            .map_err(|e| CodecError::EncoderInit(format!("Failed to set VBR: {}", e)))?;

        encoder
            .set_inband_fec(config.fec)
            .map_err(|e| CodecError::EncoderInit(format!("Failed to set FEC: {}", e)))?;

        if config.fec {
            encoder
                .set_packet_loss_perc(config.packet_loss_perc as i32)
                .map_err(|e| CodecError::EncoderInit(format!("Failed to set packet loss: {}", e)))?;
        }

        Ok(())
    }

    /// Encode one frame of interleaved samples at the configured input rate
    pub fn encode(&mut self, samples: &[i16]) -> Result<Bytes, CodecError> {
        let expected_len = self.config.frame_size() * CHANNELS;
        let resampled;
        let pcm = if self.config.encoder_rate() == self.config.input_rate {
            samples
        } else {
            resampled = fit_frame(
                resample_stereo(samples, self.config.input_rate, self.config.encoder_rate()),
                expected_len,
            );
            &resampled[..]
        };

        if pcm.len() != expected_len {
            return Err(CodecError::InvalidFrameSize(pcm.len()));
        }

        let size = self
            .encoder
            .encode(pcm, &mut self.encode_buffer)
            .map_err(|e| CodecError::EncodingFailed(e.to_string()))?;

        self.frames_encoded += 1;
        self.bytes_produced += size as u64;

        Ok(Bytes::copy_from_slice(&self.encode_buffer[..size]))
    }

    pub fn config(&self) -> &OpusConfig {
        &self.config
    }

    pub fn stats(&self) -> EncoderStats {
        EncoderStats {
            frames_encoded: self.frames_encoded,
            bytes_produced: self.bytes_produced,
            average_frame_size: if self.frames_encoded > 0 {
                self.bytes_produced as f32 / self.frames_encoded as f32
            } else {
                0.0
            },
        }
    }
}

/// Pad with the last stereo pair or truncate to exactly `len` samples.
/// Rates that don't divide evenly into 20ms leave the resampler a
/// sample or two off.
fn fit_frame(mut samples: Vec<i16>, len: usize) -> Vec<i16> {
    let tail = match samples.len() {
        n if n >= CHANNELS => [samples[n - 2], samples[n - 1]],
        _ => [0, 0],
    };
    while samples.len() < len {
        samples.push(tail[samples.len() % CHANNELS]);
    }
    samples.truncate(len);
    samples
}

/// Encoder statistics
#[derive(Debug, Clone)]
pub struct EncoderStats {
    pub frames_encoded: u64,
    pub bytes_produced: u64,
    pub average_frame_size: f32,
}
