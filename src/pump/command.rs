//! PCM subprocess command line and the launcher seam

use std::process::Stdio;
use tokio::process::{Child, Command};

use crate::constants::SAMPLE_BITS;
use crate::error::PumpError;

/// Everything needed to start one PCM-producing subprocess
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PumpCommand {
    pub program: String,
    pub host: String,
    pub port: u16,
    pub sample_rate: u32,
    pub latency_ms: u32,
    pub client_id: String,
    pub stream_id: String,
}

impl PumpCommand {
    /// Arguments for a snapclient running in pipe mode
    pub fn args(&self) -> Vec<String> {
        let mut args = vec![
            "-h".to_string(),
            self.host.clone(),
            "-p".to_string(),
            self.port.to_string(),
            "--player".to_string(),
            "file:filename=stdout".to_string(),
            "--sampleformat".to_string(),
            format!(
                "{}:{}:{}",
                self.sample_rate,
                SAMPLE_BITS,
                channel_arg(&self.stream_id)
            ),
            "--latency".to_string(),
            self.latency_ms.to_string(),
            "--logsink".to_string(),
            "stderr".to_string(),
            "--logfilter".to_string(),
            "*:warn".to_string(),
        ];
        if !self.client_id.is_empty() {
            args.push("--hostID".to_string());
            args.push(self.client_id.clone());
        }
        args
    }

    /// Shell-style rendering for logs
    pub fn display(&self) -> String {
        std::iter::once(self.program.clone())
            .chain(self.args())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Channel selector for `--sampleformat`.
///
/// Stream ids shaped like `name:x.y.N` pin output channel `N`;
/// anything else takes all channels.
fn channel_arg(stream_id: &str) -> String {
    if let Some((_, info)) = stream_id.split_once(':') {
        if let Some(hint) = info.rsplit('.').next() {
            if !hint.is_empty() && hint.chars().all(|c| c.is_ascii_digit()) {
                return hint.to_string();
            }
        }
    }
    "*".to_string()
}

/// Starts PCM subprocesses for a pump.
///
/// The returned child must have piped stdout; stderr is logged if piped.
pub trait ProcessLauncher: Send + Sync {
    fn launch(&self, command: &PumpCommand) -> Result<Child, PumpError>;
}

/// Launches `command.program` with snapclient arguments
#[derive(Debug, Default, Clone, Copy)]
pub struct SnapclientLauncher;

impl ProcessLauncher for SnapclientLauncher {
    fn launch(&self, command: &PumpCommand) -> Result<Child, PumpError> {
        Command::new(&command.program)
            .args(command.args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| PumpError::SpawnFailed {
                program: command.program.clone(),
                source,
            })
    }
}
