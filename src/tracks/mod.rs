//! Listener-side audio tracks

pub mod consumer;

pub use consumer::{ChannelHub, ConsumerTrack, TrackStats};
