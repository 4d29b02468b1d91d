//! Binding a pump's client id to an upstream stream
//!
//! The mixing server only learns which input a freshly spawned client
//! should play once we tell it. That call may fail while the client is
//! still registering, so it is retried with capped backoff until a
//! deadline. Audio flows regardless of the outcome.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::AssignmentConfig;
use crate::error::PumpError;

/// Side channel to the mixing server
#[async_trait]
pub trait StreamAssigner: Send + Sync {
    /// Route `client_id` to the upstream input `stream_id`
    async fn assign_stream(&self, client_id: &str, stream_id: &str) -> Result<(), PumpError>;
}

/// Outcome of the most recent assignment run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AssignmentStatus {
    /// No assigner configured, or nothing to assign
    #[default]
    Disabled,
    Pending,
    Assigned,
    Failed,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AssignmentState {
    pub status: AssignmentStatus,
    pub stream_id: Option<String>,
    pub attempts: u32,
    pub last_error: Option<String>,
}

/// Retry `assign_stream` until it succeeds, the deadline passes, or
/// `cancel` fires
pub(crate) async fn run_assignment(
    assigner: Arc<dyn StreamAssigner>,
    client_id: String,
    stream_id: String,
    policy: AssignmentConfig,
    cancel: CancellationToken,
    state: Arc<Mutex<AssignmentState>>,
) {
    *state.lock() = AssignmentState {
        status: AssignmentStatus::Pending,
        stream_id: Some(stream_id.clone()),
        attempts: 0,
        last_error: None,
    };

    let deadline = Instant::now() + policy.deadline();
    let mut delay = policy.initial_backoff();

    while !cancel.is_cancelled() && Instant::now() < deadline {
        state.lock().attempts += 1;
        match assigner.assign_stream(&client_id, &stream_id).await {
            Ok(()) => {
                tracing::info!(client_id = %client_id, stream = %stream_id, "Stream assigned");
                let mut state = state.lock();
                state.status = AssignmentStatus::Assigned;
                state.last_error = None;
                return;
            }
            Err(e) => {
                tracing::warn!(
                    client_id = %client_id,
                    stream = %stream_id,
                    "Failed to assign stream: {}",
                    e
                );
                state.lock().last_error = Some(e.to_string());
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
        delay = policy.next_backoff(delay);
    }

    if !cancel.is_cancelled() {
        tracing::warn!(
            client_id = %client_id,
            stream = %stream_id,
            "Giving up on stream assignment; audio continues unassigned"
        );
        state.lock().status = AssignmentStatus::Failed;
    }
}
