//! Real-time transport seam
//!
//! The relay never talks to a WebRTC stack directly. A [`TransportFactory`]
//! hands out [`PeerTransport`]s; each one pulls frames from a
//! [`FrameSource`] at its own pace and reports connection state changes
//! through a callback.

pub mod sdp;
#[cfg(feature = "webrtc-transport")]
pub mod webrtc;

use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

use crate::audio::PcmFrame;
use crate::error::TransportError;

pub use sdp::{patch_answer, AudioSdpParams};

/// Peer connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl TransportState {
    /// States after which the connection will never carry media again
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Closed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Failed => "failed",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for TransportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// ICE connectivity state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IceState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

/// Callback invoked on every connection state change
pub type StateHandler = Box<dyn Fn(TransportState) + Send + Sync>;

/// Pull-based frame producer registered with a transport
#[async_trait]
pub trait FrameSource: Send + Sync {
    /// Next 20ms frame. Never fails; yields silence when there is no audio.
    async fn next_frame(&self) -> PcmFrame;
}

/// One peer connection
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Register the audio track that feeds this connection
    async fn add_track(&self, source: Arc<dyn FrameSource>) -> Result<(), TransportError>;

    /// Apply the remote offer
    async fn apply_offer(&self, sdp: &str) -> Result<(), TransportError>;

    /// Generate a local answer without committing it
    async fn create_answer(&self) -> Result<String, TransportError>;

    /// Commit the (possibly patched) answer as the local description
    async fn set_local_answer(&self, sdp: &str) -> Result<(), TransportError>;

    /// Resolves once candidate gathering has finished
    async fn gathering_complete(&self);

    /// Current local description, including gathered candidates
    async fn local_description(&self) -> Option<String>;

    fn on_state_change(&self, handler: StateHandler);

    fn connection_state(&self) -> TransportState;

    fn ice_state(&self) -> IceState;

    /// Tear down the connection. Safe to call repeatedly.
    async fn close(&self) -> Result<(), TransportError>;
}

/// Creates peer connections for new sessions
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(&self, sample_rate: u32) -> Result<Arc<dyn PeerTransport>, TransportError>;
}
