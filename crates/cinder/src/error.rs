//! Error types for the briefing pipeline.

use std::time::Duration;

use thiserror::Error;

use crate::canon::ProtocolError;

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// Network-level failures of a stream transport.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TransportError {
    /// Could not reach the endpoint.
    #[error("failed to connect to {url}: {message}")]
    Connect { url: String, message: String },

    /// The endpoint answered with a non-success status.
    #[error("stream endpoint returned status {status}")]
    Status { status: u16 },

    /// The response body broke off mid-stream.
    #[error("failed reading stream body: {0}")]
    BodyRead(String),

    /// WebSocket protocol or I/O failure.
    #[error("websocket error: {0}")]
    Socket(String),

    /// No message (not even a heartbeat) within the keepalive window.
    #[error("no message from server for {0:?}")]
    HeartbeatTimeout(Duration),

    /// The push socket kept closing uncleanly.
    #[error("gave up reconnecting after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },

    /// Session creation failed.
    #[error("session bootstrap failed: {0}")]
    Bootstrap(String),

    /// Configured endpoint is not a usable URL.
    #[error("invalid endpoint url: {0}")]
    InvalidUrl(String),
}

impl TransportError {
    /// Whether a fresh attempt could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Connect { .. }
            | Self::BodyRead(_)
            | Self::Socket(_)
            | Self::HeartbeatTimeout(_) => true,
            Self::Status { status } => matches!(*status, 408 | 429) || *status >= 500,
            Self::ReconnectExhausted { .. } | Self::Bootstrap(_) | Self::InvalidUrl(_) => false,
        }
    }

    pub(crate) fn from_reqwest(url: &str, err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            return Self::Status {
                status: status.as_u16(),
            };
        }
        if err.is_connect() || err.is_timeout() || err.is_request() {
            return Self::Connect {
                url: url.to_string(),
                message: err.to_string(),
            };
        }
        Self::BodyRead(err.to_string())
    }
}

/// What ultimately ended a turn unsuccessfully.
#[derive(Debug, Clone, PartialEq)]
pub enum FailureCause {
    Transport(TransportError),
    Protocol(ProtocolError),
}

/// The single terminal failure surfaced to the session client's caller once the
/// retry budget is spent (or immediately, for non-retryable causes).
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{message}")]
pub struct SessionFailure {
    /// Human-readable, safe to show to an operator.
    pub message: String,
    pub cause: FailureCause,
    /// Number of transport opens made for the turn.
    pub attempts: u32,
}

impl SessionFailure {
    pub fn new(cause: FailureCause, attempts: u32) -> Self {
        let message = match &cause {
            FailureCause::Protocol(err) => err.user_message().to_string(),
            FailureCause::Transport(err) => transport_user_message(err).to_string(),
        };
        Self {
            message,
            cause,
            attempts,
        }
    }
}

fn transport_user_message(err: &TransportError) -> &'static str {
    match err {
        TransportError::Connect { .. } | TransportError::ReconnectExhausted { .. } => {
            "Could not reach the analysis service. Check the connection and try again."
        }
        TransportError::Status { status } if *status == 401 || *status == 403 => {
            "The analysis service refused the request."
        }
        TransportError::Status { .. } => "The analysis service returned an error.",
        TransportError::BodyRead(_)
        | TransportError::Socket(_)
        | TransportError::HeartbeatTimeout(_) => {
            "Lost the connection to the analysis service."
        }
        TransportError::Bootstrap(_) => "Could not start a briefing session.",
        TransportError::InvalidUrl(_) => "The analysis service address is misconfigured.",
    }
}

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unable to determine configuration directory")]
    NoConfigDir,

    #[error("failed to expand path {path}: {message}")]
    Expand { path: String, message: String },

    #[error(transparent)]
    Load(#[from] config::ConfigError),

    #[error("failed to serialize default config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
