//! End-to-end relay scenarios with a scripted transport and shell
//! subprocesses standing in for snapclient

use async_trait::async_trait;
use parking_lot::Mutex;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};

use roomcast_relay::{
    audio::{frame_bytes, PcmFrame},
    config::RelayConfig,
    error::{NegotiationError, PumpError, RelayError, TransportError},
    pump::{ProcessLauncher, PumpCommand},
    relay::{Relay, SessionObserver, SessionOptions},
    rtc::{FrameSource, IceState, PeerTransport, StateHandler, TransportFactory, TransportState},
    Error,
};

/// One 48kHz frame every 20ms, forever
const AUDIO_SCRIPT: &str = "while true; do head -c 3840 /dev/zero; sleep 0.02; done";

struct ShellLauncher {
    launches: AtomicUsize,
    commands: Mutex<Vec<PumpCommand>>,
}

impl ShellLauncher {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            launches: AtomicUsize::new(0),
            commands: Mutex::new(Vec::new()),
        })
    }

    fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }
}

impl ProcessLauncher for ShellLauncher {
    fn launch(&self, command: &PumpCommand) -> Result<Child, PumpError> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        self.commands.lock().push(command.clone());
        Command::new("sh")
            .arg("-c")
            .arg(AUDIO_SCRIPT)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| PumpError::SpawnFailed {
                program: "sh".into(),
                source,
            })
    }
}

struct FakeTransport {
    source: Mutex<Option<Arc<dyn FrameSource>>>,
    handler: Mutex<Option<StateHandler>>,
    state: Mutex<TransportState>,
    closed: AtomicBool,
}

impl FakeTransport {
    fn new() -> Self {
        Self {
            source: Mutex::new(None),
            handler: Mutex::new(None),
            state: Mutex::new(TransportState::New),
            closed: AtomicBool::new(false),
        }
    }

    fn fire(&self, state: TransportState) {
        *self.state.lock() = state;
        if let Some(handler) = self.handler.lock().as_ref() {
            handler(state);
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PeerTransport for FakeTransport {
    async fn add_track(&self, source: Arc<dyn FrameSource>) -> Result<(), TransportError> {
        *self.source.lock() = Some(source);
        Ok(())
    }

    async fn apply_offer(&self, sdp: &str) -> Result<(), TransportError> {
        if sdp.starts_with("v=0") {
            Ok(())
        } else {
            Err(TransportError::InvalidDescription("not an SDP offer".into()))
        }
    }

    async fn create_answer(&self) -> Result<String, TransportError> {
        Ok("v=0\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\na=rtpmap:111 opus/48000/2\r\n".into())
    }

    async fn set_local_answer(&self, _sdp: &str) -> Result<(), TransportError> {
        Ok(())
    }

    async fn gathering_complete(&self) {}

    async fn local_description(&self) -> Option<String> {
        None
    }

    fn on_state_change(&self, handler: StateHandler) {
        *self.handler.lock() = Some(handler);
    }

    fn connection_state(&self) -> TransportState {
        *self.state.lock()
    }

    fn ice_state(&self) -> IceState {
        IceState::New
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
struct FakeFactory {
    created: Mutex<Vec<Arc<FakeTransport>>>,
}

impl FakeFactory {
    fn transport(&self, index: usize) -> Arc<FakeTransport> {
        self.created.lock()[index].clone()
    }
}

#[async_trait]
impl TransportFactory for FakeFactory {
    async fn create(&self, _sample_rate: u32) -> Result<Arc<dyn PeerTransport>, TransportError> {
        let transport = Arc::new(FakeTransport::new());
        self.created.lock().push(transport.clone());
        Ok(transport)
    }
}

#[derive(Default)]
struct RecordingObserver {
    closed: Mutex<Vec<String>>,
}

#[async_trait]
impl SessionObserver for RecordingObserver {
    async fn session_closed(&self, node_id: &str) {
        self.closed.lock().push(node_id.to_string());
    }
}

struct Harness {
    relay: Arc<Relay>,
    factory: Arc<FakeFactory>,
    launcher: Arc<ShellLauncher>,
    observer: Arc<RecordingObserver>,
}

fn harness() -> Harness {
    let mut config = RelayConfig::default();
    config.pump.restart_delay_ms = 50;
    config.pump.stop_timeout_ms = 1000;
    config.relay.channel_idle_timeout_secs = 1.0;
    config.relay.ice_gather_timeout_ms = 100;

    let factory = Arc::new(FakeFactory::default());
    let launcher = ShellLauncher::new();
    let observer = Arc::new(RecordingObserver::default());
    let relay = Relay::builder(config, factory.clone())
        .launcher(launcher.clone())
        .observer(observer.clone())
        .build();

    Harness {
        relay: Arc::new(relay),
        factory,
        launcher,
        observer,
    }
}

const OFFER: &str = "v=0\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\n";

async fn pull(relay: &Relay, node_id: &str) -> PcmFrame {
    let session = relay.session(node_id).expect("session exists");
    tokio::time::timeout(Duration::from_secs(5), session.track().next_frame())
        .await
        .expect("frame in time")
}

async fn wait_for(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

fn listeners(relay: &Relay, channel_id: &str) -> Option<usize> {
    relay.channel_listener_counts().get(channel_id).copied()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_sessions_share_one_pump() {
    let h = harness();

    let tasks: Vec<_> = (0..8)
        .map(|i| {
            let relay = h.relay.clone();
            tokio::spawn(async move {
                relay
                    .create_session(&format!("node-{}", i), Some("ch1"), Some("radio:ch.1"), SessionOptions::default())
                    .await
            })
        })
        .collect();
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    for i in 0..8 {
        let frame = pull(&h.relay, &format!("node-{}", i)).await;
        assert_eq!(frame.data.len(), frame_bytes(48000));
    }
    assert_eq!(h.launcher.launches(), 1);
    assert_eq!(listeners(&h.relay, "ch1"), Some(8));
    assert_eq!(h.relay.diagnostics().session_count(), 8);

    h.relay.shutdown().await;
}

#[tokio::test]
async fn last_listener_leaving_stops_channel_after_grace() {
    let h = harness();
    h.relay
        .create_session("node-a", Some("ch1"), Some("radio:ch.1"), SessionOptions::default())
        .await
        .unwrap();
    pull(&h.relay, "node-a").await;
    assert_eq!(listeners(&h.relay, "ch1"), Some(1));

    h.relay.drop_session("node-a").await;
    assert_eq!(listeners(&h.relay, "ch1"), Some(0));
    assert!(h.relay.diagnostics().channels["ch1"].teardown_pending);
    assert_eq!(*h.observer.closed.lock(), vec!["node-a".to_string()]);

    wait_for(|| listeners(&h.relay, "ch1").is_none()).await;
    assert_eq!(h.launcher.launches(), 1);
}

#[tokio::test]
async fn quick_reconnect_reuses_running_pump() {
    let h = harness();
    h.relay
        .create_session("node-a", Some("ch1"), Some("radio:ch.1"), SessionOptions::default())
        .await
        .unwrap();
    pull(&h.relay, "node-a").await;
    h.relay.drop_session("node-a").await;

    tokio::time::sleep(Duration::from_millis(300)).await;
    h.relay
        .create_session("node-b", Some("ch1"), None, SessionOptions::default())
        .await
        .unwrap();
    pull(&h.relay, "node-b").await;

    // Well past the grace period of the first release
    tokio::time::sleep(Duration::from_millis(1200)).await;
    assert_eq!(listeners(&h.relay, "ch1"), Some(1));
    assert_eq!(h.launcher.launches(), 1);
    assert_eq!(h.relay.diagnostics().channels["ch1"].pump.spawns, 1);

    h.relay.shutdown().await;
}

#[tokio::test]
async fn replaced_session_keeps_channel_until_it_connects() {
    let h = harness();
    h.relay
        .create_session("node-a", Some("ch1"), Some("radio:ch.1"), SessionOptions::default())
        .await
        .unwrap();
    pull(&h.relay, "node-a").await;

    // Page reload: the old track lets go, the new one has not pulled yet
    h.relay
        .create_session("node-a", Some("ch1"), None, SessionOptions::default())
        .await
        .unwrap();
    assert_eq!(listeners(&h.relay, "ch1"), Some(0));

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(listeners(&h.relay, "ch1"), Some(0));

    let session = h.relay.session("node-a").unwrap();
    let frame = pull(&h.relay, "node-a").await;
    assert_eq!(frame.data.len(), frame_bytes(48000));
    assert_eq!(listeners(&h.relay, "ch1"), Some(1));
    assert_eq!(session.track().stats().silence_frames, 0);
    assert_eq!(h.launcher.launches(), 1);

    // Once the session goes away the normal grace period applies
    h.relay.drop_session("node-a").await;
    wait_for(|| listeners(&h.relay, "ch1").is_none()).await;

    h.relay.shutdown().await;
}

#[tokio::test]
async fn listener_counts_match_live_subscriptions() {
    let h = harness();
    for i in 0..4 {
        h.relay
            .create_session(&format!("node-{}", i), Some("ch1"), Some("radio:ch.1"), SessionOptions::default())
            .await
            .unwrap();
        pull(&h.relay, &format!("node-{}", i)).await;
    }

    let assert_counts = |ch1: usize, ch2: Option<usize>| {
        let diagnostics = h.relay.diagnostics();
        assert_eq!(listeners(&h.relay, "ch1"), Some(ch1));
        assert_eq!(diagnostics.channels["ch1"].broadcaster.subscribers, ch1);
        assert_eq!(listeners(&h.relay, "ch2"), ch2);
        if let Some(ch2) = ch2 {
            assert_eq!(diagnostics.channels["ch2"].broadcaster.subscribers, ch2);
        }
    };
    assert_counts(4, None);

    h.relay
        .update_session_channel("node-1", Some("ch2"), Some("spotify:ch.2"))
        .await
        .unwrap();
    pull(&h.relay, "node-1").await;
    assert_counts(3, Some(1));

    h.relay.drop_session("node-2").await;
    assert_counts(2, Some(1));

    h.relay.update_session_channel("node-3", None, None).await.unwrap();
    assert_counts(1, Some(1));

    h.relay.update_session_channel("node-1", Some("ch1"), None).await.unwrap();
    pull(&h.relay, "node-1").await;
    assert_counts(2, Some(0));

    h.relay.drop_session("node-0").await;
    h.relay.drop_session("node-0").await;
    assert_counts(1, Some(0));

    h.relay.shutdown().await;
}

#[tokio::test]
async fn failed_negotiation_removes_session_but_keeps_source() {
    let h = harness();
    h.relay
        .create_session("node-a", Some("ch1"), Some("radio:ch.1"), SessionOptions::default())
        .await
        .unwrap();

    let err = h.relay.negotiate("node-a", "garbage").await.unwrap_err();
    assert!(matches!(err, Error::Negotiation(NegotiationError::ApplyOffer(_))));
    assert!(h.relay.session("node-a").is_none());
    assert!(h.factory.transport(0).is_closed());
    assert_eq!(listeners(&h.relay, "ch1"), Some(0));
    assert!(h.observer.closed.lock().is_empty());

    h.relay.shutdown().await;
}

#[tokio::test]
async fn negotiation_returns_patched_answer() {
    let h = harness();
    h.relay
        .create_session("node-a", Some("ch1"), Some("radio:ch.1"), SessionOptions::default())
        .await
        .unwrap();

    let answer = h.relay.negotiate("node-a", OFFER).await.unwrap();
    assert!(answer.contains("a=fmtp:111 stereo=1;sprop-stereo=1;maxaveragebitrate=256000"));
    assert!(answer.ends_with("\r\n"));

    h.relay.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn unassigned_session_hears_silence() {
    let h = harness();
    h.relay
        .create_session("node-a", None, None, SessionOptions::default())
        .await
        .unwrap();

    let frame = pull(&h.relay, "node-a").await;
    assert!(frame.data.iter().all(|&b| b == 0));
    assert_eq!(h.launcher.launches(), 0);
    assert_eq!(h.relay.diagnostics().unassigned_sessions.len(), 1);
}

#[tokio::test]
async fn terminal_state_closes_session() {
    let h = harness();
    h.relay
        .create_session("node-a", Some("ch1"), Some("radio:ch.1"), SessionOptions::default())
        .await
        .unwrap();

    h.factory.transport(0).fire(TransportState::Disconnected);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(h.relay.session("node-a").is_some());

    h.factory.transport(0).fire(TransportState::Failed);
    wait_for(|| h.relay.session("node-a").is_none()).await;
    wait_for(|| h.observer.closed.lock().len() == 1).await;
    assert!(h.factory.transport(0).is_closed());

    h.relay.shutdown().await;
}

#[tokio::test]
async fn stale_session_cannot_close_its_replacement() {
    let h = harness();
    h.relay
        .create_session("node-a", Some("ch1"), Some("radio:ch.1"), SessionOptions::default())
        .await
        .unwrap();
    let first = h.relay.session("node-a").unwrap().id();
    h.relay
        .create_session("node-a", Some("ch1"), None, SessionOptions::default())
        .await
        .unwrap();
    assert!(h.factory.transport(0).is_closed());

    h.factory.transport(0).fire(TransportState::Closed);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let current = h.relay.session("node-a").expect("replacement survives");
    assert_ne!(current.id(), first);
    assert!(h.observer.closed.lock().is_empty());

    h.relay.shutdown().await;
}

#[tokio::test]
async fn channel_switch_moves_listener_and_keeps_timeline() {
    let h = harness();
    h.relay
        .create_session("node-a", Some("ch1"), Some("radio:ch.1"), SessionOptions::default())
        .await
        .unwrap();
    let first = pull(&h.relay, "node-a").await;

    h.relay
        .update_session_channel("node-a", Some("ch2"), Some("spotify:ch.2"))
        .await
        .unwrap();
    let second = pull(&h.relay, "node-a").await;

    assert_eq!(second.pts, first.pts + first.samples() as u64);
    assert_eq!(listeners(&h.relay, "ch1"), Some(0));
    assert_eq!(listeners(&h.relay, "ch2"), Some(1));
    assert_eq!(h.launcher.launches(), 2);

    let args = h.launcher.commands.lock()[1].args();
    assert!(args.contains(&"48000:16:2".to_string()));
    assert!(args.contains(&"roomcast-webrtc-ch2".to_string()));

    h.relay.shutdown().await;
}

#[tokio::test]
async fn listener_controls_require_a_session() {
    let h = harness();
    assert!(matches!(
        h.relay.set_pan("nobody", 0.5),
        Err(RelayError::SessionNotFound(_))
    ));

    h.relay
        .create_session("node-a", None, None, SessionOptions::default())
        .await
        .unwrap();
    h.relay.set_pan("node-a", 0.5).unwrap();
    h.relay.set_stereo_mode("node-a", "LEFT".parse().unwrap()).unwrap();

    let track = h.relay.session("node-a").unwrap().track().stats();
    assert_eq!(track.pan, 0.5);
    assert_eq!(track.stereo_mode.as_str(), "left");
}

#[tokio::test]
async fn shutdown_closes_everything() {
    let h = harness();
    h.relay
        .create_session("node-a", Some("ch1"), Some("radio:ch.1"), SessionOptions::default())
        .await
        .unwrap();
    pull(&h.relay, "node-a").await;

    h.relay.shutdown().await;
    h.relay.shutdown().await;

    assert!(h.relay.session("node-a").is_none());
    assert!(h.relay.channel_listener_counts().is_empty());
    assert!(h.factory.transport(0).is_closed());
    assert!(h.observer.closed.lock().is_empty());

    let err = h
        .relay
        .create_session("node-b", Some("ch1"), None, SessionOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Relay(RelayError::ShuttingDown)));
}
