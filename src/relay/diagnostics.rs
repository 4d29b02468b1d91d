//! Operator-facing relay snapshot

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::audio::BroadcastStats;
use crate::pump::PumpStats;
use crate::rtc::{IceState, TransportState};
use crate::tracks::TrackStats;

/// Whole-relay snapshot
#[derive(Debug, Clone, Serialize)]
pub struct RelayDiagnostics {
    pub generated_at: DateTime<Utc>,
    pub sample_rate: u32,
    pub channels: BTreeMap<String, ChannelDiagnostics>,
    /// Sessions not bound to any channel
    pub unassigned_sessions: Vec<SessionDiagnostics>,
}

impl RelayDiagnostics {
    pub fn session_count(&self) -> usize {
        self.unassigned_sessions.len()
            + self.channels.values().map(|c| c.sessions.len()).sum::<usize>()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ChannelDiagnostics {
    pub stream_id: String,
    pub listeners: usize,
    pub teardown_pending: bool,
    pub pump: PumpStats,
    pub broadcaster: BroadcastStats,
    pub sessions: Vec<SessionDiagnostics>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionDiagnostics {
    pub node_id: String,
    pub session_id: Uuid,
    pub connection_state: TransportState,
    pub ice_state: IceState,
    pub created_at: DateTime<Utc>,
    pub track: TrackStats,
}
