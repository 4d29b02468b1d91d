//! Session and channel orchestration
//!
//! The [`Relay`] maps listener ids to [`Session`]s and channel ids to
//! [`ChannelSource`]s. A channel's subprocess is started the first time a
//! session asks for it and stopped once the channel has had no listeners
//! for the idle grace period.
//!
//! All relay bookkeeping sits behind one mutex that is never held across
//! an `.await`; subprocess and network work happens after the guard is
//! dropped.

pub mod channel;
pub mod diagnostics;
pub mod session;

pub use channel::ChannelSource;
pub use diagnostics::{ChannelDiagnostics, RelayDiagnostics, SessionDiagnostics};
pub use session::Session;

use async_trait::async_trait;
use chrono::Utc;
use futures_util::future::join_all;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::audio::{Broadcaster, StereoMode, SubscriberQueue};
use crate::config::RelayConfig;
use crate::error::{NegotiationError, RelayError, Result};
use crate::pump::{ProcessLauncher, SnapclientLauncher, SourcePump, StreamAssigner};
use crate::rtc::{AudioSdpParams, TransportFactory, TransportState};
use crate::tracks::{ChannelHub, ConsumerTrack};

/// Told when a listener's session goes away on its own or is dropped
#[async_trait]
pub trait SessionObserver: Send + Sync {
    async fn session_closed(&self, node_id: &str);
}

/// Initial listener settings for a new session
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionOptions {
    pub pan: f32,
    pub stereo_mode: StereoMode,
}

/// Scheduled stop of an idle channel
struct Teardown {
    ticket: u64,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct RelayState {
    sessions: HashMap<String, Arc<Session>>,
    channels: HashMap<String, ChannelSource>,
    teardowns: HashMap<String, Teardown>,
    shutting_down: bool,
}

impl RelayState {
    /// True when `channel_id` has no subscribed listener and no session
    /// bound to it. A session counts from creation, before its track pulls.
    fn is_idle(&self, channel_id: &str) -> bool {
        self.channels.get(channel_id).is_some_and(ChannelSource::is_idle)
            && !self
                .sessions
                .values()
                .any(|session| session.channel_id().as_deref() == Some(channel_id))
    }

    fn cancel_teardown(&mut self, channel_id: &str) {
        if let Some(teardown) = self.teardowns.remove(channel_id) {
            teardown.handle.abort();
            tracing::debug!(channel = %channel_id, "Idle teardown cancelled");
        }
    }
}

struct RelayShared {
    this: Weak<RelayShared>,
    config: RelayConfig,
    factory: Arc<dyn TransportFactory>,
    launcher: Arc<dyn ProcessLauncher>,
    assigner: Option<Arc<dyn StreamAssigner>>,
    observer: Option<Arc<dyn SessionObserver>>,
    state: Mutex<RelayState>,
    next_ticket: AtomicU64,
}

/// Builder for [`Relay`]
pub struct RelayBuilder {
    config: RelayConfig,
    factory: Arc<dyn TransportFactory>,
    launcher: Arc<dyn ProcessLauncher>,
    assigner: Option<Arc<dyn StreamAssigner>>,
    observer: Option<Arc<dyn SessionObserver>>,
}

impl RelayBuilder {
    /// Replace the default snapclient launcher
    pub fn launcher(mut self, launcher: Arc<dyn ProcessLauncher>) -> Self {
        self.launcher = launcher;
        self
    }

    pub fn assigner(mut self, assigner: Arc<dyn StreamAssigner>) -> Self {
        self.assigner = Some(assigner);
        self
    }

    pub fn observer(mut self, observer: Arc<dyn SessionObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn build(self) -> Relay {
        let shared = Arc::new_cyclic(|this| RelayShared {
            this: this.clone(),
            config: self.config,
            factory: self.factory,
            launcher: self.launcher,
            assigner: self.assigner,
            observer: self.observer,
            state: Mutex::new(RelayState::default()),
            next_ticket: AtomicU64::new(0),
        });
        Relay { shared }
    }
}

/// Fans mixer channels out to WebRTC listeners
pub struct Relay {
    shared: Arc<RelayShared>,
}

impl Relay {
    pub fn new(config: RelayConfig, factory: Arc<dyn TransportFactory>) -> Self {
        Self::builder(config, factory).build()
    }

    pub fn builder(config: RelayConfig, factory: Arc<dyn TransportFactory>) -> RelayBuilder {
        RelayBuilder {
            config,
            factory,
            launcher: Arc::new(SnapclientLauncher),
            assigner: None,
            observer: None,
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.shared.config
    }

    /// Create the session for `node_id`, replacing any existing one.
    ///
    /// The channel's source is running before the session exists, so the
    /// track's first pull finds it. Call [`Relay::negotiate`] next.
    pub async fn create_session(
        &self,
        node_id: &str,
        channel_id: Option<&str>,
        stream_id: Option<&str>,
        options: SessionOptions,
    ) -> Result<Arc<Session>> {
        let shared = &self.shared;
        let channel_id = channel_id.filter(|c| !c.is_empty());
        if let Some(channel_id) = channel_id {
            shared.ensure_channel(channel_id, stream_id.unwrap_or_default()).await?;
        } else if shared.state.lock().shutting_down {
            return Err(RelayError::ShuttingDown.into());
        }

        let replaced = shared.state.lock().sessions.remove(node_id);
        if let Some(replaced) = replaced {
            tracing::info!(node = %node_id, "Replacing existing session");
            shared.close_session(&replaced).await;
        }

        let session = match shared.open_session(node_id, channel_id, options).await {
            Ok(session) => session,
            Err(e) => {
                if let Some(channel_id) = channel_id {
                    shared.schedule_teardown(channel_id);
                }
                return Err(e.into());
            }
        };

        let (displaced, shutting_down) = {
            let mut state = shared.state.lock();
            if state.shutting_down {
                (None, true)
            } else {
                (state.sessions.insert(node_id.to_string(), session.clone()), false)
            }
        };
        if shutting_down {
            shared.close_session(&session).await;
            return Err(RelayError::ShuttingDown.into());
        }
        if let Some(displaced) = displaced {
            shared.close_session(&displaced).await;
        }
        // Bring the source back if it went idle while the transport was built
        if let Some(channel_id) = channel_id {
            let missing = !shared.state.lock().channels.contains_key(channel_id);
            if missing {
                shared.ensure_channel(channel_id, stream_id.unwrap_or_default()).await?;
            }
        }

        tracing::info!(
            node = %node_id,
            channel = channel_id.unwrap_or("-"),
            session = %session.id(),
            "Session created"
        );
        Ok(session)
    }

    /// Negotiate `node_id`'s session with a remote offer.
    ///
    /// A failed negotiation removes the session; the channel source it
    /// pointed at is left to the idle teardown.
    pub async fn negotiate(&self, node_id: &str, offer: &str) -> Result<String> {
        let session = self.require_session(node_id)?;
        match session.negotiate(offer).await {
            Ok(answer) => Ok(answer),
            Err(e) => {
                tracing::warn!(node = %node_id, "Negotiation failed: {}", e);
                self.shared.remove_session(node_id, Some(session.id()), false).await;
                Err(e.into())
            }
        }
    }

    /// Move a session to another channel (or to none).
    ///
    /// A changed stream id retargets the channel's pump even when the
    /// session is already on that channel.
    pub async fn update_session_channel(
        &self,
        node_id: &str,
        channel_id: Option<&str>,
        stream_id: Option<&str>,
    ) -> Result<()> {
        let shared = &self.shared;
        let channel_id = channel_id.filter(|c| !c.is_empty());
        if let Some(channel_id) = channel_id {
            shared.ensure_channel(channel_id, stream_id.unwrap_or_default()).await?;
        }

        let Some(session) = self.session(node_id) else {
            if let Some(channel_id) = channel_id {
                shared.schedule_teardown(channel_id);
            }
            return Err(RelayError::SessionNotFound(node_id.to_string()).into());
        };

        let previous = session.channel_id();
        if previous.as_deref() == channel_id {
            return Ok(());
        }
        session.track().set_channel(channel_id.map(String::from));
        if let Some(previous) = previous.as_deref() {
            shared.schedule_teardown(previous);
        }
        tracing::info!(
            node = %node_id,
            from = previous.as_deref().unwrap_or("-"),
            to = channel_id.unwrap_or("-"),
            "Session channel changed"
        );
        Ok(())
    }

    /// Close and forget `node_id`'s session, if any
    pub async fn drop_session(&self, node_id: &str) {
        self.shared.remove_session(node_id, None, true).await;
    }

    pub fn set_pan(&self, node_id: &str, pan: f32) -> std::result::Result<(), RelayError> {
        self.require_session(node_id)?.track().set_pan(pan);
        Ok(())
    }

    pub fn set_stereo_mode(&self, node_id: &str, mode: StereoMode) -> std::result::Result<(), RelayError> {
        self.require_session(node_id)?.track().set_stereo_mode(mode);
        Ok(())
    }

    pub fn session(&self, node_id: &str) -> Option<Arc<Session>> {
        self.shared.state.lock().sessions.get(node_id).cloned()
    }

    fn require_session(&self, node_id: &str) -> std::result::Result<Arc<Session>, RelayError> {
        self.session(node_id)
            .ok_or_else(|| RelayError::SessionNotFound(node_id.to_string()))
    }

    /// Live listener count per channel
    pub fn channel_listener_counts(&self) -> HashMap<String, usize> {
        self.shared
            .state
            .lock()
            .channels
            .iter()
            .map(|(id, source)| (id.clone(), source.listeners()))
            .collect()
    }

    pub fn diagnostics(&self) -> RelayDiagnostics {
        let (sources, sessions) = {
            let state = self.shared.state.lock();
            let sources: Vec<_> = state
                .channels
                .values()
                .map(|source| {
                    (
                        source.channel_id().to_string(),
                        source.stream_id().to_string(),
                        source.listeners(),
                        state.teardowns.contains_key(source.channel_id()),
                        source.pump().clone(),
                    )
                })
                .collect();
            let sessions: Vec<_> = state.sessions.values().cloned().collect();
            (sources, sessions)
        };

        let mut channels: BTreeMap<String, ChannelDiagnostics> = sources
            .into_iter()
            .map(|(channel_id, stream_id, listeners, teardown_pending, pump)| {
                let diagnostics = ChannelDiagnostics {
                    stream_id,
                    listeners,
                    teardown_pending,
                    pump: pump.diagnostics(),
                    broadcaster: pump.broadcaster().stats(),
                    sessions: Vec::new(),
                };
                (channel_id, diagnostics)
            })
            .collect();

        let mut unassigned_sessions = Vec::new();
        for session in sessions {
            let diagnostics = session.diagnostics();
            match session.channel_id().and_then(|id| channels.get_mut(&id)) {
                Some(channel) => channel.sessions.push(diagnostics),
                None => unassigned_sessions.push(diagnostics),
            }
        }

        RelayDiagnostics {
            generated_at: Utc::now(),
            sample_rate: self.shared.config.relay.sample_rate(),
            channels,
            unassigned_sessions,
        }
    }

    /// Close every session and stop every channel. Safe to call twice.
    pub async fn shutdown(&self) {
        let (sessions, channels, teardowns) = {
            let mut state = self.shared.state.lock();
            state.shutting_down = true;
            (
                std::mem::take(&mut state.sessions),
                std::mem::take(&mut state.channels),
                std::mem::take(&mut state.teardowns),
            )
        };
        if sessions.is_empty() && channels.is_empty() && teardowns.is_empty() {
            return;
        }
        tracing::info!(
            sessions = sessions.len(),
            channels = channels.len(),
            "Shutting down relay"
        );

        for teardown in teardowns.into_values() {
            teardown.handle.abort();
        }
        join_all(sessions.values().map(|session| session.close())).await;
        join_all(channels.values().map(|source| source.pump().stop())).await;
    }
}

impl RelayShared {
    /// Make sure `channel_id` has a running source, pointing it at
    /// `stream_id` if that is non-empty and new.
    ///
    /// Concurrent callers for one channel all get the same source.
    async fn ensure_channel(&self, channel_id: &str, stream_id: &str) -> std::result::Result<(), RelayError> {
        let (pump, created, retarget) = {
            let mut state = self.state.lock();
            if state.shutting_down {
                return Err(RelayError::ShuttingDown);
            }
            state.cancel_teardown(channel_id);

            match state.channels.get_mut(channel_id) {
                Some(source) => (source.pump().clone(), false, source.retarget(stream_id)),
                None => {
                    let pump = Arc::new(self.new_pump(channel_id, stream_id));
                    state
                        .channels
                        .insert(channel_id.to_string(), ChannelSource::new(channel_id, stream_id, pump.clone()));
                    (pump, true, false)
                }
            }
        };

        if retarget {
            pump.update_stream(stream_id);
        }
        if created {
            tracing::info!(channel = %channel_id, stream = %stream_id, "Channel source created");
            pump.start().await;
        }
        Ok(())
    }

    fn new_pump(&self, channel_id: &str, stream_id: &str) -> SourcePump {
        let relay = &self.config.relay;
        SourcePump::new(
            self.config.pump.clone(),
            self.config.assignment.clone(),
            relay.sample_rate(),
            format!("{}-{}", relay.client_prefix, channel_id),
            stream_id,
            Arc::new(Broadcaster::new(relay.queue_capacity)),
            self.launcher.clone(),
            self.assigner.clone(),
        )
    }

    /// Build the transport and track for a new session
    async fn open_session(
        &self,
        node_id: &str,
        channel_id: Option<&str>,
        options: SessionOptions,
    ) -> std::result::Result<Arc<Session>, NegotiationError> {
        let sample_rate = self.config.relay.sample_rate();
        let transport = self
            .factory
            .create(sample_rate)
            .await
            .map_err(NegotiationError::Transport)?;

        let hub: Weak<RelayShared> = self.this.clone();
        let track = Arc::new(ConsumerTrack::new(hub, sample_rate, channel_id.map(String::from)));
        track.set_pan(options.pan);
        track.set_stereo_mode(options.stereo_mode);

        if let Err(e) = transport.add_track(track.clone()).await {
            track.shutdown();
            let _ = transport.close().await;
            return Err(NegotiationError::Transport(e));
        }

        let sdp_params = AudioSdpParams::new(sample_rate).with_bitrate(self.config.webrtc.bitrate);
        let session = Arc::new(Session::new(
            node_id,
            transport.clone(),
            track,
            sdp_params,
            self.config.relay.ice_gather_timeout(),
        ));

        let relay = self.this.clone();
        let node_id = node_id.to_string();
        let session_id = session.id();
        let runtime = tokio::runtime::Handle::current();
        transport.on_state_change(Box::new(move |state: TransportState| {
            if !state.is_terminal() {
                return;
            }
            let Some(relay) = relay.upgrade() else {
                return;
            };
            tracing::info!(node = %node_id, "Peer connection {}", state);
            let node_id = node_id.clone();
            runtime.spawn(async move {
                relay.remove_session(&node_id, Some(session_id), true).await;
            });
        }));

        Ok(session)
    }

    /// Remove `node_id`'s session and close it.
    ///
    /// With `expected` set, only that exact session instance is removed, so
    /// a late notification from a replaced session leaves its successor
    /// alone.
    async fn remove_session(&self, node_id: &str, expected: Option<Uuid>, notify: bool) {
        let session = {
            let mut state = self.state.lock();
            let matches = state
                .sessions
                .get(node_id)
                .is_some_and(|current| expected.map_or(true, |id| id == current.id()));
            if matches {
                state.sessions.remove(node_id)
            } else {
                None
            }
        };
        let Some(session) = session else {
            return;
        };

        self.close_session(&session).await;
        if notify {
            if let Some(observer) = &self.observer {
                observer.session_closed(node_id).await;
            }
        }
    }

    /// Close a session that is no longer in the session map
    async fn close_session(&self, session: &Session) {
        let channel_id = session.channel_id();
        session.close().await;
        if let Some(channel_id) = channel_id {
            self.schedule_teardown(&channel_id);
        }
    }

    /// Schedule an idle stop of `channel_id` unless it has listeners or a
    /// stop is already pending
    fn schedule_teardown(&self, channel_id: &str) {
        let Some(shared) = self.this.upgrade() else {
            return;
        };
        let mut state = self.state.lock();
        if state.shutting_down || state.teardowns.contains_key(channel_id) {
            return;
        }
        if !state.is_idle(channel_id) {
            return;
        }

        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        let handle = tokio::spawn(idle_teardown(shared, channel_id.to_string(), ticket));
        state.teardowns.insert(channel_id.to_string(), Teardown { ticket, handle });
        tracing::debug!(
            channel = %channel_id,
            "Channel idle, stopping in {:?}",
            self.config.relay.channel_idle_timeout()
        );
    }
}

/// Stop a channel that stayed without listeners for the grace period
async fn idle_teardown(shared: Arc<RelayShared>, channel_id: String, ticket: u64) {
    tokio::time::sleep(shared.config.relay.channel_idle_timeout()).await;

    let source = {
        let mut state = shared.state.lock();
        // Cancelled after the timer fired but before we got the lock
        if state.teardowns.get(&channel_id).map(|t| t.ticket) != Some(ticket) {
            return;
        }
        state.teardowns.remove(&channel_id);
        if state.is_idle(&channel_id) {
            state.channels.remove(&channel_id)
        } else {
            None
        }
    };

    if let Some(source) = source {
        tracing::info!(channel = %channel_id, "Channel idle, stopping source");
        source.pump().stop().await;
    }
}

impl ChannelHub for RelayShared {
    fn subscribe(&self, channel_id: &str) -> std::result::Result<Arc<SubscriberQueue>, RelayError> {
        let mut state = self.state.lock();
        let queue = state
            .channels
            .get_mut(channel_id)
            .map(ChannelSource::acquire)
            .ok_or_else(|| RelayError::ChannelNotInitialized(channel_id.to_string()))?;
        state.cancel_teardown(channel_id);
        Ok(queue)
    }

    fn unsubscribe(&self, channel_id: &str, queue: &SubscriberQueue) {
        let now_idle = match self.state.lock().channels.get_mut(channel_id) {
            Some(source) => source.release(queue),
            None => false,
        };
        if now_idle {
            self.schedule_teardown(channel_id);
        }
    }
}

impl Drop for Relay {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock();
        for (_, teardown) in state.teardowns.drain() {
            teardown.handle.abort();
        }
    }
}
