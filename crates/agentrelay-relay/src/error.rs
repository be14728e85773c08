//! Upstream failure taxonomy.

use thiserror::Error;

/// Why one attempt against the gateway ended without a terminal signal.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UpstreamFailure {
    /// The TCP/TLS connection could not be established.
    #[error("gateway connection failed: {0}")]
    Connect(String),

    /// No response (or no further bytes) within the read timeout.
    #[error("gateway timed out: {0}")]
    Timeout(String),

    /// The connection broke after a successful status line.
    #[error("connection dropped mid-stream: {0}")]
    MidStreamDrop(String),

    /// Non-2xx status before any body bytes were read.
    #[error("gateway returned {status}: {body}")]
    ServerError { status: u16, body: String },
}

impl UpstreamFailure {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Connect(_) | Self::Timeout(_) | Self::MidStreamDrop(_) => true,
            Self::ServerError { status, .. } => is_transient_status(*status),
        }
    }

    /// Short label used in progress notes.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connect(_) => "ConnectError",
            Self::Timeout(_) => "ReadTimeout",
            Self::MidStreamDrop(_) => "RemoteProtocolError",
            Self::ServerError { .. } => "ServerError",
        }
    }
}

/// Statuses that indicate the gateway is restarting or overloaded.
pub fn is_transient_status(status: u16) -> bool {
    status >= 500 || status == 408 || status == 429
}
