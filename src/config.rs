//! Relay configuration
//!
//! Every section has a `Default` so a partial TOML file is enough:
//!
//! ```toml
//! [pump]
//! host = "10.0.0.5"
//!
//! [relay]
//! sample_rate = 44100
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::constants::{
    DEFAULT_BITRATE, DEFAULT_CLIENT_PREFIX, DEFAULT_IDLE_TIMEOUT_SECS, DEFAULT_QUEUE_CAPACITY,
    DEFAULT_SAMPLE_RATE, DEFAULT_STUN_SERVER,
};
use crate::error::{Error, Result};

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub pump: PumpConfig,
    pub relay: RelaySettings,
    pub assignment: AssignmentConfig,
    pub webrtc: WebRtcConfig,
}

/// PCM subprocess settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PumpConfig {
    /// Executable producing raw PCM on stdout
    pub program: String,
    /// Mixing server host
    pub host: String,
    /// Mixing server stream port
    pub port: u16,
    /// Target latency handed to the subprocess
    pub latency_ms: u32,
    /// Pause between a subprocess exit and the next spawn
    pub restart_delay_ms: u64,
    /// Grace period between SIGTERM and kill
    pub stop_timeout_ms: u64,
}

impl Default for PumpConfig {
    fn default() -> Self {
        Self {
            program: "snapclient".to_string(),
            host: "127.0.0.1".to_string(),
            port: 1704,
            latency_ms: 150,
            restart_delay_ms: 2000,
            stop_timeout_ms: 5000,
        }
    }
}

impl PumpConfig {
    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

/// Relay orchestration settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelaySettings {
    pub sample_rate: u32,
    /// Prefix for per-channel subprocess client ids
    pub client_prefix: String,
    /// How long an unlistened channel keeps its pump alive
    pub channel_idle_timeout_secs: f64,
    pub ice_gather_timeout_ms: u64,
    /// Per-subscriber queue depth in frames
    pub queue_capacity: usize,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            client_prefix: DEFAULT_CLIENT_PREFIX.to_string(),
            channel_idle_timeout_secs: DEFAULT_IDLE_TIMEOUT_SECS,
            ice_gather_timeout_ms: 5000,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

impl RelaySettings {
    /// Sample rate clamped into the supported range
    pub fn sample_rate(&self) -> u32 {
        crate::audio::frame::clamp_sample_rate(self.sample_rate)
    }

    /// Idle timeout, never shorter than one second
    pub fn channel_idle_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.channel_idle_timeout_secs.max(1.0))
    }

    pub fn ice_gather_timeout(&self) -> Duration {
        Duration::from_millis(self.ice_gather_timeout_ms)
    }
}

/// Retry policy for the stream-assignment callback
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AssignmentConfig {
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_factor: f64,
    /// Give up after this long; the pump keeps running regardless
    pub deadline_ms: u64,
}

impl Default for AssignmentConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: 500,
            max_backoff_ms: 5000,
            backoff_factor: 1.5,
            deadline_ms: 15_000,
        }
    }
}

impl AssignmentConfig {
    /// Delay to wait after a failed attempt that waited `current`
    pub fn next_backoff(&self, current: Duration) -> Duration {
        let next = current.mul_f64(self.backoff_factor);
        next.min(Duration::from_millis(self.max_backoff_ms))
    }

    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn deadline(&self) -> Duration {
        Duration::from_millis(self.deadline_ms)
    }
}

/// WebRTC transport settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebRtcConfig {
    pub ice_servers: Vec<String>,
    /// Opus target bitrate in bits per second
    pub bitrate: u32,
    /// In-band forward error correction
    pub fec: bool,
}

impl Default for WebRtcConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![DEFAULT_STUN_SERVER.to_string()],
            bitrate: DEFAULT_BITRATE,
            fec: true,
        }
    }
}

impl RelayConfig {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let config: RelayConfig = toml::from_str(&text)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from the per-user config file, or defaults if there is none
    pub fn load_or_default() -> Result<Self> {
        match Self::default_path() {
            Some(path) if path.exists() => {
                tracing::info!("Loading config from {}", path.display());
                Self::load(path)
            }
            _ => Ok(Self::default()),
        }
    }

    /// `<config dir>/roomcast/relay.toml`
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", "roomcast")
            .map(|dirs| dirs.config_dir().join("relay.toml"))
    }

    pub fn validate(&self) -> Result<()> {
        if self.pump.port == 0 {
            return Err(Error::Config("pump.port must be non-zero".into()));
        }
        if self.pump.program.trim().is_empty() {
            return Err(Error::Config("pump.program must not be empty".into()));
        }
        if self.relay.queue_capacity == 0 {
            return Err(Error::Config("relay.queue_capacity must be at least 1".into()));
        }
        if self.assignment.backoff_factor <= 0.0 {
            return Err(Error::Config("assignment.backoff_factor must be positive".into()));
        }
        Ok(())
    }
}
