//! PCM plumbing: frame geometry, fan-out and per-consumer transforms

pub mod broadcaster;
pub mod frame;
pub mod transform;

pub use broadcaster::{BroadcastStats, Broadcaster, SubscriberQueue};
pub use frame::{frame_bytes, frame_samples, AudioChunk, PcmFrame};
pub use transform::{apply_pan, apply_stereo_mode, StereoMode};
