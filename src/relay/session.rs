//! One listener's peer connection and audio track

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::error::NegotiationError;
use crate::relay::diagnostics::SessionDiagnostics;
use crate::rtc::{patch_answer, AudioSdpParams, IceState, PeerTransport, TransportState};
use crate::tracks::ConsumerTrack;

/// A negotiated (or negotiating) listener session
pub struct Session {
    id: Uuid,
    node_id: String,
    transport: Arc<dyn PeerTransport>,
    track: Arc<ConsumerTrack>,
    sdp_params: AudioSdpParams,
    gather_timeout: Duration,
    closed: AtomicBool,
    created_at: DateTime<Utc>,
}

impl Session {
    pub fn new(
        node_id: impl Into<String>,
        transport: Arc<dyn PeerTransport>,
        track: Arc<ConsumerTrack>,
        sdp_params: AudioSdpParams,
        gather_timeout: Duration,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            node_id: node_id.into(),
            transport,
            track,
            sdp_params,
            gather_timeout,
            closed: AtomicBool::new(false),
            created_at: Utc::now(),
        }
    }

    /// Answer a remote offer.
    ///
    /// The returned answer requests stereo Opus at the session's rate and
    /// carries whatever candidates were gathered within the timeout.
    pub async fn negotiate(&self, offer: &str) -> Result<String, NegotiationError> {
        if self.is_closed() {
            return Err(NegotiationError::SessionClosed);
        }

        self.transport
            .apply_offer(offer)
            .await
            .map_err(NegotiationError::ApplyOffer)?;

        let answer = self
            .transport
            .create_answer()
            .await
            .map_err(NegotiationError::CreateAnswer)?;

        let patched = patch_answer(&answer, &self.sdp_params);
        self.transport
            .set_local_answer(&patched)
            .await
            .map_err(NegotiationError::CommitAnswer)?;

        if tokio::time::timeout(self.gather_timeout, self.transport.gathering_complete())
            .await
            .is_err()
        {
            tracing::warn!(node = %self.node_id, "ICE gathering did not complete before timeout");
        }

        // Re-rendered with candidates by the transport
        let answer = match self.transport.local_description().await {
            Some(local) => patch_answer(&local, &self.sdp_params),
            None => patched,
        };
        tracing::info!(node = %self.node_id, session = %self.id, "Session negotiated");
        Ok(answer)
    }

    /// Release the track's subscription and tear down the connection.
    ///
    /// Safe to call repeatedly.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.track.shutdown();
        if let Err(e) = self.transport.close().await {
            tracing::warn!(node = %self.node_id, "Error closing peer connection: {}", e);
        }
        tracing::info!(node = %self.node_id, session = %self.id, "Session closed");
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn track(&self) -> &Arc<ConsumerTrack> {
        &self.track
    }

    pub fn channel_id(&self) -> Option<String> {
        self.track.channel_id()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn connection_state(&self) -> TransportState {
        self.transport.connection_state()
    }

    pub fn ice_state(&self) -> IceState {
        self.transport.ice_state()
    }

    pub fn diagnostics(&self) -> SessionDiagnostics {
        SessionDiagnostics {
            node_id: self.node_id.clone(),
            session_id: self.id,
            connection_state: self.connection_state(),
            ice_state: self.ice_state(),
            created_at: self.created_at,
            track: self.track.stats(),
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("node_id", &self.node_id)
            .field("closed", &self.is_closed())
            .finish()
    }
}
