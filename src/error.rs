//! Error types for the relay core

use thiserror::Error;

/// Main error type for the relay
#[derive(Error, Debug)]
pub enum Error {
    #[error("Pump error: {0}")]
    Pump(#[from] PumpError),

    #[error("Negotiation error: {0}")]
    Negotiation(#[from] NegotiationError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Relay error: {0}")]
    Relay(#[from] RelayError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Source pump errors
///
/// None of these reach a session caller; the pump logs them and restarts.
#[derive(Error, Debug)]
pub enum PumpError {
    #[error("Failed to spawn {program}: {source}")]
    SpawnFailed {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Subprocess has no stdout pipe")]
    MissingStdout,

    #[error("Read failed: {0}")]
    ReadFailed(std::io::Error),

    #[error("Stream assignment failed: {0}")]
    AssignmentFailed(String),
}

/// Signaling negotiation errors, tagged with the stage that failed
#[derive(Error, Debug)]
pub enum NegotiationError {
    #[error("Failed to apply offer: {0}")]
    ApplyOffer(#[source] TransportError),

    #[error("Failed to create answer: {0}")]
    CreateAnswer(#[source] TransportError),

    #[error("Failed to commit local description: {0}")]
    CommitAnswer(#[source] TransportError),

    #[error("Failed to set up transport: {0}")]
    Transport(#[source] TransportError),

    #[error("Session is closed")]
    SessionClosed,
}

/// Errors reported by a real-time transport implementation
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Invalid session description: {0}")]
    InvalidDescription(String),

    #[error("Peer connection failed: {0}")]
    Connection(String),

    #[error("Track registration failed: {0}")]
    Track(String),

    #[error("Media write failed: {0}")]
    Write(String),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
}

/// Relay orchestration errors
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Channel not initialized: {0}")]
    ChannelNotInitialized(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Relay is shutting down")]
    ShuttingDown,
}

/// Codec errors
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Encoder initialization failed: {0}")]
    EncoderInit(String),

    #[error("Encoding failed: {0}")]
    EncodingFailed(String),

    #[error("Invalid frame size: {0}")]
    InvalidFrameSize(usize),
}

/// Result type alias for the relay
pub type Result<T> = std::result::Result<T, Error>;
