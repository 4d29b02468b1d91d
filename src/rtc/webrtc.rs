//! webrtc-rs transport binding
//!
//! One [`RTCPeerConnection`] per session with a single Opus send track.
//! Once the connection is up, a media task pulls frames from the
//! registered [`FrameSource`], encodes them and writes them to the track.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use crate::codec::{OpusConfig, OpusEncoder};
use crate::config::WebRtcConfig;
use crate::error::TransportError;
use crate::rtc::{FrameSource, IceState, PeerTransport, StateHandler, TransportFactory, TransportState};

/// RTP clock rate for Opus, whatever the PCM rate
const OPUS_CLOCK_RATE: u32 = 48000;

/// RTCP read buffer
const RTCP_BUFFER: usize = 1500;

/// Builds webrtc-rs peer connections
pub struct WebRtcTransportFactory {
    config: WebRtcConfig,
}

impl WebRtcTransportFactory {
    pub fn new(config: WebRtcConfig) -> Self {
        Self { config }
    }

    fn rtc_configuration(&self) -> RTCConfiguration {
        let ice_servers = if self.config.ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: self.config.ice_servers.clone(),
                ..Default::default()
            }]
        };
        RTCConfiguration {
            ice_servers,
            ..Default::default()
        }
    }
}

#[async_trait]
impl TransportFactory for WebRtcTransportFactory {
    async fn create(&self, sample_rate: u32) -> Result<Arc<dyn PeerTransport>, TransportError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().map_err(connection_error)?;

        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(connection_error)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let pc = Arc::new(
            api.new_peer_connection(self.rtc_configuration())
                .await
                .map_err(connection_error)?,
        );

        let transport = Arc::new(WebRtcTransport::new(pc, sample_rate, self.config.clone()));
        transport.watch_state();
        Ok(transport)
    }
}

/// A single webrtc-rs peer connection carrying one audio track
pub struct WebRtcTransport {
    pc: Arc<RTCPeerConnection>,
    sample_rate: u32,
    config: WebRtcConfig,
    state_tx: watch::Sender<TransportState>,
    handler: Arc<Mutex<Option<StateHandler>>>,
    gathering: tokio::sync::Mutex<Option<mpsc::Receiver<()>>>,
    cancel: CancellationToken,
    closed: AtomicBool,
}

impl WebRtcTransport {
    fn new(pc: Arc<RTCPeerConnection>, sample_rate: u32, config: WebRtcConfig) -> Self {
        let (state_tx, _) = watch::channel(TransportState::New);
        Self {
            pc,
            sample_rate,
            config,
            state_tx,
            handler: Arc::new(Mutex::new(None)),
            gathering: tokio::sync::Mutex::new(None),
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Forward connection state changes to the watch channel and the
    /// registered handler
    fn watch_state(&self) {
        let state_tx = self.state_tx.clone();
        let handler = self.handler.clone();
        self.pc
            .on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
                let state = map_connection_state(state);
                tracing::debug!("Peer connection state: {}", state);
                state_tx.send_replace(state);
                if let Some(handler) = handler.lock().as_ref() {
                    handler(state);
                }
                Box::pin(async {})
            }));
    }

    fn encoder_config(&self) -> OpusConfig {
        OpusConfig {
            bitrate: self.config.bitrate,
            fec: self.config.fec,
            ..OpusConfig::music(self.sample_rate)
        }
    }
}

#[async_trait]
impl PeerTransport for WebRtcTransport {
    async fn add_track(&self, source: Arc<dyn FrameSource>) -> Result<(), TransportError> {
        let encoder = OpusEncoder::new(self.encoder_config())?;

        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: OPUS_CLOCK_RATE,
                channels: 2,
                ..Default::default()
            },
            "audio".to_owned(),
            "roomcast".to_owned(),
        ));

        let sender = self
            .pc
            .add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| TransportError::Track(e.to_string()))?;

        // Interceptors only run while someone reads RTCP
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; RTCP_BUFFER];
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    read = sender.read(&mut buf) => if read.is_err() { break },
                }
            }
        });

        tokio::spawn(pump_media(
            source,
            track,
            encoder,
            self.state_tx.subscribe(),
            self.cancel.clone(),
        ));
        Ok(())
    }

    async fn apply_offer(&self, sdp: &str) -> Result<(), TransportError> {
        let offer = RTCSessionDescription::offer(sdp.to_string())
            .map_err(|e| TransportError::InvalidDescription(e.to_string()))?;
        self.pc
            .set_remote_description(offer)
            .await
            .map_err(|e| TransportError::InvalidDescription(e.to_string()))
    }

    async fn create_answer(&self) -> Result<String, TransportError> {
        let answer = self.pc.create_answer(None).await.map_err(connection_error)?;
        Ok(answer.sdp)
    }

    async fn set_local_answer(&self, sdp: &str) -> Result<(), TransportError> {
        let answer = RTCSessionDescription::answer(sdp.to_string())
            .map_err(|e| TransportError::InvalidDescription(e.to_string()))?;

        // Must be taken before the local description starts gathering
        let promise = self.pc.gathering_complete_promise().await;
        *self.gathering.lock().await = Some(promise);

        self.pc
            .set_local_description(answer)
            .await
            .map_err(|e| TransportError::InvalidDescription(e.to_string()))
    }

    async fn gathering_complete(&self) {
        let promise = self.gathering.lock().await.take();
        if let Some(mut promise) = promise {
            let _ = promise.recv().await;
        }
    }

    async fn local_description(&self) -> Option<String> {
        self.pc.local_description().await.map(|desc| desc.sdp)
    }

    fn on_state_change(&self, handler: StateHandler) {
        *self.handler.lock() = Some(handler);
    }

    fn connection_state(&self) -> TransportState {
        map_connection_state(self.pc.connection_state())
    }

    fn ice_state(&self) -> IceState {
        map_ice_state(self.pc.ice_connection_state())
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.cancel.cancel();
        self.pc.close().await.map_err(connection_error)
    }
}

/// Wait for the connection, then pull, encode and write frames until the
/// connection ends
async fn pump_media(
    source: Arc<dyn FrameSource>,
    track: Arc<TrackLocalStaticSample>,
    mut encoder: OpusEncoder,
    mut state: watch::Receiver<TransportState>,
    cancel: CancellationToken,
) {
    let connected = tokio::select! {
        _ = cancel.cancelled() => return,
        connected = state.wait_for(|s| *s == TransportState::Connected || s.is_terminal()) => {
            connected.map(|s| *s == TransportState::Connected).unwrap_or(false)
        }
    };
    if !connected {
        return;
    }
    tracing::debug!("Media pull loop started");

    loop {
        if state.borrow().is_terminal() {
            break;
        }

        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = source.next_frame() => frame,
        };

        let packet = match encoder.encode(&frame.to_samples()) {
            Ok(packet) => packet,
            Err(e) => {
                tracing::warn!("Dropping frame: {}", e);
                continue;
            }
        };

        let sample = Sample {
            data: packet,
            duration: frame.duration(),
            ..Default::default()
        };
        if let Err(e) = track.write_sample(&sample).await {
            tracing::debug!("{}", TransportError::Write(e.to_string()));
        }
    }

    let stats = encoder.stats();
    tracing::debug!(
        frames = stats.frames_encoded,
        bytes = stats.bytes_produced,
        "Media pull loop finished"
    );
}

fn connection_error(e: webrtc::Error) -> TransportError {
    TransportError::Connection(e.to_string())
}

fn map_connection_state(state: RTCPeerConnectionState) -> TransportState {
    match state {
        RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => TransportState::New,
        RTCPeerConnectionState::Connecting => TransportState::Connecting,
        RTCPeerConnectionState::Connected => TransportState::Connected,
        RTCPeerConnectionState::Disconnected => TransportState::Disconnected,
        RTCPeerConnectionState::Failed => TransportState::Failed,
        RTCPeerConnectionState::Closed => TransportState::Closed,
    }
}

fn map_ice_state(state: RTCIceConnectionState) -> IceState {
    match state {
        RTCIceConnectionState::Unspecified | RTCIceConnectionState::New => IceState::New,
        RTCIceConnectionState::Checking => IceState::Checking,
        RTCIceConnectionState::Connected => IceState::Connected,
        RTCIceConnectionState::Completed => IceState::Completed,
        RTCIceConnectionState::Disconnected => IceState::Disconnected,
        RTCIceConnectionState::Failed => IceState::Failed,
        RTCIceConnectionState::Closed => IceState::Closed,
    }
}
