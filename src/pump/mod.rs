//! Subprocess PCM pump
//!
//! A [`SourcePump`] keeps one PCM-producing subprocess alive for a
//! channel, cuts its stdout into 20ms frames and publishes them to the
//! channel's [`Broadcaster`]. The subprocess is restarted whenever it
//! exits until [`SourcePump::stop`] is called.
//!
//! ```text
//!  Stopped ──start()──▶ Starting ──first frame──▶ Streaming
//!     ▲                    ▲                          │
//!     │                    └──── exit / read error ───┘
//!     └──────────────── stop() ───────────────────────
//! ```

pub mod assign;
pub mod command;

pub use assign::{AssignmentState, AssignmentStatus, StreamAssigner};
pub use command::{ProcessLauncher, PumpCommand, SnapclientLauncher};

use bytes::BytesMut;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::process::ExitStatus;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStderr};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::audio::frame::frame_bytes;
use crate::audio::Broadcaster;
use crate::config::{AssignmentConfig, PumpConfig};
use crate::error::PumpError;

/// Size of a single stdout read
const READ_CHUNK: usize = 4096;

/// Pump lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PumpState {
    Stopped,
    Starting,
    Streaming,
}

/// How a single subprocess run ended
enum RunEnd {
    Stopped,
    Restart,
    Exited,
}

/// State shared between the pump handle and its supervisor task
struct PumpShared {
    config: PumpConfig,
    assignment_policy: AssignmentConfig,
    sample_rate: u32,
    client_id: String,
    stream_id: RwLock<String>,
    broadcaster: Arc<Broadcaster>,
    launcher: Arc<dyn ProcessLauncher>,
    assigner: Option<Arc<dyn StreamAssigner>>,

    state: Mutex<PumpState>,
    /// Bumped by `update_stream`; the running subprocess compares it to
    /// the value it was spawned with
    generation: AtomicU64,
    restart: Notify,
    assignment: Arc<Mutex<AssignmentState>>,
    assign_task: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,

    spawns: AtomicU64,
    restarts: AtomicU64,
    chunks: AtomicU64,
    bytes: AtomicU64,
    pid: Mutex<Option<u32>>,
    started_at: Mutex<Option<Instant>>,
    last_chunk_at: Mutex<Option<DateTime<Utc>>>,
    last_exit: Mutex<Option<String>>,
}

/// Supervised PCM subprocess feeding one broadcaster
pub struct SourcePump {
    shared: Arc<PumpShared>,
    cancel: Mutex<CancellationToken>,
    supervisor: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl SourcePump {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: PumpConfig,
        assignment_policy: AssignmentConfig,
        sample_rate: u32,
        client_id: impl Into<String>,
        stream_id: impl Into<String>,
        broadcaster: Arc<Broadcaster>,
        launcher: Arc<dyn ProcessLauncher>,
        assigner: Option<Arc<dyn StreamAssigner>>,
    ) -> Self {
        let shared = PumpShared {
            config,
            assignment_policy,
            sample_rate: crate::audio::frame::clamp_sample_rate(sample_rate),
            client_id: client_id.into(),
            stream_id: RwLock::new(stream_id.into()),
            broadcaster,
            launcher,
            assigner,
            state: Mutex::new(PumpState::Stopped),
            generation: AtomicU64::new(0),
            restart: Notify::new(),
            assignment: Arc::new(Mutex::new(AssignmentState::default())),
            assign_task: Mutex::new(None),
            spawns: AtomicU64::new(0),
            restarts: AtomicU64::new(0),
            chunks: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
            pid: Mutex::new(None),
            started_at: Mutex::new(None),
            last_chunk_at: Mutex::new(None),
            last_exit: Mutex::new(None),
        };
        Self {
            shared: Arc::new(shared),
            cancel: Mutex::new(CancellationToken::new()),
            supervisor: tokio::sync::Mutex::new(None),
        }
    }

    /// Start the supervisor task. Does nothing if it is already running.
    pub async fn start(&self) {
        let mut supervisor = self.supervisor.lock().await;
        if supervisor.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }

        let cancel = CancellationToken::new();
        *self.cancel.lock() = cancel.clone();
        *self.shared.state.lock() = PumpState::Starting;
        *self.shared.started_at.lock() = Some(Instant::now());

        let shared = self.shared.clone();
        *supervisor = Some(tokio::spawn(supervise(shared, cancel)));
        tracing::info!(client_id = %self.shared.client_id, "Source pump started");
    }

    /// Stop the subprocess and wait for the supervisor to exit.
    ///
    /// Safe to call repeatedly, and on a pump that never started.
    pub async fn stop(&self) {
        self.cancel.lock().cancel();
        self.shared.cancel_assignment();

        let handle = self.supervisor.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::error!(client_id = %self.shared.client_id, "Pump supervisor panicked: {}", e);
            }
            tracing::info!(client_id = %self.shared.client_id, "Source pump stopped");
        }
        *self.shared.state.lock() = PumpState::Stopped;
        *self.shared.pid.lock() = None;
    }

    /// Point the pump at a different upstream stream.
    ///
    /// Reassigns the client and restarts the subprocess, since producers
    /// may only read their target at startup. An unchanged or empty id is
    /// recorded without restarting.
    pub fn update_stream(&self, stream_id: &str) {
        {
            let mut current = self.shared.stream_id.write();
            if stream_id.is_empty() || *current == stream_id {
                *current = stream_id.to_string();
                return;
            }
            *current = stream_id.to_string();
        }

        tracing::info!(
            client_id = %self.shared.client_id,
            stream = %stream_id,
            "Stream changed, restarting subprocess"
        );
        if !self.is_running() {
            return;
        }
        // The respawned subprocess schedules its own assignment
        self.shared.generation.fetch_add(1, Ordering::SeqCst);
        self.shared.restart.notify_waiters();
    }

    pub fn is_running(&self) -> bool {
        *self.shared.state.lock() != PumpState::Stopped
    }

    pub fn state(&self) -> PumpState {
        *self.shared.state.lock()
    }

    pub fn client_id(&self) -> &str {
        &self.shared.client_id
    }

    pub fn stream_id(&self) -> String {
        self.shared.stream_id.read().clone()
    }

    pub fn broadcaster(&self) -> &Arc<Broadcaster> {
        &self.shared.broadcaster
    }

    /// Snapshot of the pump counters
    pub fn diagnostics(&self) -> PumpStats {
        let shared = &self.shared;
        let bytes = shared.bytes.load(Ordering::Relaxed);
        let started_at = *shared.started_at.lock();
        let uptime_secs = match started_at {
            Some(t) if self.is_running() => t.elapsed().as_secs_f64(),
            _ => 0.0,
        };

        PumpStats {
            state: self.state(),
            client_id: shared.client_id.clone(),
            stream_id: self.stream_id(),
            sample_rate: shared.sample_rate,
            pid: *shared.pid.lock(),
            spawns: shared.spawns.load(Ordering::Relaxed),
            restarts: shared.restarts.load(Ordering::Relaxed),
            total_chunks: shared.chunks.load(Ordering::Relaxed),
            total_bytes: bytes,
            last_chunk_at: *shared.last_chunk_at.lock(),
            uptime_secs,
            average_kbps: if uptime_secs > 0.0 {
                bytes as f64 * 8.0 / 1000.0 / uptime_secs
            } else {
                0.0
            },
            last_exit: shared.last_exit.lock().clone(),
            assignment: shared.assignment.lock().clone(),
        }
    }
}

impl Drop for SourcePump {
    fn drop(&mut self) {
        self.cancel.get_mut().cancel();
        self.shared.cancel_assignment();
    }
}

impl PumpShared {
    fn command(&self) -> PumpCommand {
        PumpCommand {
            program: self.config.program.clone(),
            host: self.config.host.clone(),
            port: self.config.port,
            sample_rate: self.sample_rate,
            latency_ms: self.config.latency_ms,
            client_id: self.client_id.clone(),
            stream_id: self.stream_id.read().clone(),
        }
    }

    /// (Re)start the assignment retry loop for the current stream id
    fn schedule_assignment(&self, pump_cancel: &CancellationToken) {
        let Some(assigner) = self.assigner.clone() else {
            return;
        };
        let stream_id = self.stream_id.read().clone();
        if self.client_id.is_empty() || stream_id.is_empty() {
            return;
        }

        let cancel = pump_cancel.child_token();
        let task = tokio::spawn(assign::run_assignment(
            assigner,
            self.client_id.clone(),
            stream_id,
            self.assignment_policy.clone(),
            cancel.clone(),
            self.assignment.clone(),
        ));
        if let Some((previous, _)) = self.assign_task.lock().replace((cancel, task)) {
            previous.cancel();
        }
    }

    fn cancel_assignment(&self) {
        if let Some((cancel, _)) = self.assign_task.lock().take() {
            cancel.cancel();
        }
    }

    fn publish(&self, chunk: bytes::Bytes) {
        self.chunks.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(chunk.len() as u64, Ordering::Relaxed);
        *self.last_chunk_at.lock() = Some(Utc::now());
        self.broadcaster.publish(chunk);
    }

    /// Run one subprocess until it exits, a restart is requested, or the
    /// pump is stopped
    async fn run_once(&self, cancel: &CancellationToken) -> RunEnd {
        let generation = self.generation.load(Ordering::SeqCst);
        let command = self.command();
        tracing::info!(client_id = %self.client_id, "Starting PCM subprocess: {}", command.display());

        let mut child = match self.launcher.launch(&command) {
            Ok(child) => child,
            Err(e) => {
                tracing::warn!(client_id = %self.client_id, "{}", e);
                *self.last_exit.lock() = Some(e.to_string());
                return RunEnd::Exited;
            }
        };
        self.spawns.fetch_add(1, Ordering::Relaxed);
        *self.pid.lock() = child.id();

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(log_stderr(stderr, self.config.program.clone(), self.client_id.clone()));
        }
        self.schedule_assignment(cancel);

        let end = match child.stdout.take() {
            Some(mut stdout) => {
                let frame_len = frame_bytes(self.sample_rate);
                let mut buffer = BytesMut::with_capacity(frame_len * 2);
                let mut read_buf = vec![0u8; READ_CHUNK];
                let mut got_audio = false;

                loop {
                    let restart = self.restart.notified();
                    tokio::pin!(restart);
                    if self.generation.load(Ordering::SeqCst) != generation {
                        break RunEnd::Restart;
                    }

                    let read = tokio::select! {
                        _ = cancel.cancelled() => break RunEnd::Stopped,
                        _ = &mut restart => break RunEnd::Restart,
                        read = stdout.read(&mut read_buf) => read,
                    };

                    match read {
                        Ok(0) => break RunEnd::Exited,
                        Ok(n) => {
                            buffer.extend_from_slice(&read_buf[..n]);
                            while buffer.len() >= frame_len {
                                let chunk = buffer.split_to(frame_len).freeze();
                                self.publish(chunk);
                                if !got_audio {
                                    got_audio = true;
                                    *self.state.lock() = PumpState::Streaming;
                                    tracing::info!(client_id = %self.client_id, "First PCM chunk published");
                                }
                            }
                        }
                        Err(e) => {
                            tracing::warn!(
                                client_id = %self.client_id,
                                "{}",
                                PumpError::ReadFailed(e)
                            );
                            break RunEnd::Exited;
                        }
                    }
                }
            }
            None => {
                tracing::warn!(client_id = %self.client_id, "{}", PumpError::MissingStdout);
                RunEnd::Exited
            }
        };

        let status = self.terminate(&mut child).await;
        *self.pid.lock() = None;
        let exit = match status {
            Some(status) => status.to_string(),
            None => "unknown".to_string(),
        };
        if matches!(end, RunEnd::Exited) {
            tracing::warn!(client_id = %self.client_id, "PCM subprocess exited ({})", exit);
        }
        *self.last_exit.lock() = Some(exit);
        end
    }

    /// SIGTERM, then kill after the configured grace period
    async fn terminate(&self, child: &mut Child) -> Option<ExitStatus> {
        if let Ok(Some(status)) = child.try_wait() {
            return Some(status);
        }

        request_terminate(child);
        match tokio::time::timeout(self.config.stop_timeout(), child.wait()).await {
            Ok(Ok(status)) => Some(status),
            Ok(Err(e)) => {
                tracing::warn!(client_id = %self.client_id, "Failed to reap subprocess: {}", e);
                None
            }
            Err(_) => {
                tracing::warn!(
                    client_id = %self.client_id,
                    "Subprocess ignored SIGTERM for {:?}, killing",
                    self.config.stop_timeout()
                );
                let _ = child.start_kill();
                child.wait().await.ok()
            }
        }
    }
}

/// Supervisor loop: respawn the subprocess until cancelled
async fn supervise(shared: Arc<PumpShared>, cancel: CancellationToken) {
    while !cancel.is_cancelled() {
        *shared.state.lock() = PumpState::Starting;
        let generation = shared.generation.load(Ordering::SeqCst);
        let end = shared.run_once(&cancel).await;
        if cancel.is_cancelled() {
            break;
        }
        shared.restarts.fetch_add(1, Ordering::Relaxed);

        // A requested restart respawns at once so the new stream takes effect,
        // also when it arrives during the delay after a crash
        if matches!(end, RunEnd::Exited) {
            let restart = shared.restart.notified();
            tokio::pin!(restart);
            if shared.generation.load(Ordering::SeqCst) == generation {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = &mut restart => {}
                    _ = tokio::time::sleep(shared.config.restart_delay()) => {}
                }
            }
        }
    }
    *shared.state.lock() = PumpState::Stopped;
}

#[cfg(unix)]
fn request_terminate(child: &mut Child) {
    if let Some(pid) = child.id() {
        // SAFETY: pid belongs to a child we have not reaped yet
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
    }
}

#[cfg(not(unix))]
fn request_terminate(child: &mut Child) {
    let _ = child.start_kill();
}

async fn log_stderr(stderr: ChildStderr, program: String, client_id: String) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim();
        if !line.is_empty() {
            tracing::warn!(client_id = %client_id, "{}: {}", program, line);
        }
    }
}

/// Pump statistics
#[derive(Debug, Clone, Serialize)]
pub struct PumpStats {
    pub state: PumpState,
    pub client_id: String,
    pub stream_id: String,
    pub sample_rate: u32,
    pub pid: Option<u32>,
    pub spawns: u64,
    pub restarts: u64,
    pub total_chunks: u64,
    pub total_bytes: u64,
    pub last_chunk_at: Option<DateTime<Utc>>,
    pub uptime_secs: f64,
    pub average_kbps: f64,
    pub last_exit: Option<String>,
    pub assignment: AssignmentState,
}
