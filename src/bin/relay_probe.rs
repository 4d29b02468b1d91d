//! Relay Probe
//!
//! Runs a relay for a single listener: reads an SDP offer from stdin,
//! prints the answer and keeps streaming until Ctrl-C.
//!
//! Usage: roomcast-relay-probe [--config PATH] <node-id> <channel-id> <stream-id>

use anyhow::{bail, Context, Result};
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use roomcast_relay::{
    config::RelayConfig,
    relay::{Relay, SessionOptions},
    rtc::webrtc::WebRtcTransportFactory,
};

const DIAGNOSTICS_INTERVAL: Duration = Duration::from_secs(5);

struct Args {
    config: Option<PathBuf>,
    node_id: String,
    channel_id: String,
    stream_id: String,
}

fn parse_args() -> Result<Args> {
    let mut config = None;
    let mut positional = Vec::new();
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" | "-c" => {
                config = Some(PathBuf::from(args.next().context("--config needs a path")?));
            }
            _ => positional.push(arg),
        }
    }

    let [node_id, channel_id, stream_id]: [String; 3] = match positional.try_into() {
        Ok(values) => values,
        Err(_) => bail!("usage: roomcast-relay-probe [--config PATH] <node-id> <channel-id> <stream-id>"),
    };
    Ok(Args {
        config,
        node_id,
        channel_id,
        stream_id,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = parse_args()?;
    let config = match &args.config {
        Some(path) => RelayConfig::load(path)?,
        None => RelayConfig::load_or_default()?,
    };
    config.validate()?;

    tracing::info!("Starting relay probe");
    tracing::info!(
        "Mixer at {}:{}, {}Hz",
        config.pump.host,
        config.pump.port,
        config.relay.sample_rate()
    );

    let factory = Arc::new(WebRtcTransportFactory::new(config.webrtc.clone()));
    let relay = Relay::new(config, factory);

    tracing::info!("Reading SDP offer from stdin");
    let offer = tokio::task::spawn_blocking(|| {
        let mut offer = String::new();
        std::io::stdin().read_to_string(&mut offer).map(|_| offer)
    })
    .await??;

    relay
        .create_session(
            &args.node_id,
            Some(&args.channel_id),
            Some(&args.stream_id),
            SessionOptions::default(),
        )
        .await?;
    let answer = relay.negotiate(&args.node_id, &offer).await?;
    println!("{}", answer);

    let mut interval = tokio::time::interval(DIAGNOSTICS_INTERVAL);
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = interval.tick() => {
                match serde_json::to_string(&relay.diagnostics()) {
                    Ok(json) => tracing::info!("Diagnostics: {}", json),
                    Err(e) => tracing::warn!("Failed to serialize diagnostics: {}", e),
                }
                if relay.session(&args.node_id).is_none() {
                    tracing::info!("Session ended");
                    break;
                }
            }
        }
    }

    tracing::info!("Shutting down...");
    relay.shutdown().await;
    Ok(())
}
