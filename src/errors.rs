use thiserror::Error;

use crate::call::CallState;

#[derive(Debug, Error)]
pub enum HfpError {
    // ── Config ────────────────────────────────────────────────────────────────
    #[error("Config file not found at {path}.\nRun `hfp-bridge config init` to create one.")]
    ConfigNotFound { path: String },

    #[error("Failed to read config file: {0}")]
    ConfigRead(#[source] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    #[error("Failed to write config file: {0}")]
    ConfigWrite(#[from] toml::ser::Error),

    // ── Preconditions ─────────────────────────────────────────────────────────
    #[error("Phone must be connected ({0})")]
    NotConnected(String),

    #[error("No phone address known")]
    NoDevice,

    #[error("Invalid Bluetooth address '{0}'")]
    InvalidAddress(String),

    #[error("Invalid phone number '{0}'")]
    InvalidPhoneNumber(String),

    #[error("{op}: not allowed while call is {state}")]
    InvalidState { op: &'static str, state: CallState },

    #[error("No control channel is open")]
    NoControlChannel,

    // ── Transport / protocol ──────────────────────────────────────────────────
    #[error("Transport error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Service level connection failed: {0}")]
    Slc(#[from] SlcError),

    #[error("Phone rejected call: {0}")]
    DialRejected(String),

    // ── Audio ─────────────────────────────────────────────────────────────────
    #[error("Audio error: {0}")]
    Audio(#[from] AudioError),
}

/// A failed step of the AT handshake.
#[derive(Debug, Error)]
pub enum SlcError {
    #[error("{command}: {source}")]
    Transport {
        command: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("{command}: unexpected response {response:?}")]
    Rejected {
        command: &'static str,
        response: String,
    },
}

#[derive(Debug, Error)]
pub enum AudioError {
    #[error("SCO socket error: {0}")]
    Socket(#[source] std::io::Error),

    #[error("SCO link busy, retry failed: {0}")]
    LinkBusy(#[source] std::io::Error),

    #[error("{what} could not be opened: {reason}")]
    StreamOpen { what: &'static str, reason: String },

    #[error("{what} I/O error: {reason}")]
    StreamIo { what: &'static str, reason: String },
}

#[derive(Debug, Error)]
pub enum AecError {
    #[error("echo canceller expects {expected}-sample frames, got {got}")]
    FrameSize { expected: usize, got: usize },

    #[error("echo canceller init failed: {0}")]
    Init(String),
}
