//! Error types for peer-pilot

use thiserror::Error;

/// Result type alias for peer-pilot operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the codecs, the peer transport and the signaling service.
#[derive(Debug, Error)]
pub enum Error {
    /// A tagged value carried a type tag this build does not know
    #[error("Unknown data type tag: {0}")]
    UnknownDataType(u8),

    /// Envelope, chunk or socket frame shorter than its header claims
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    /// Chunk size leaves no room for payload after the header
    #[error("Invalid chunk size {0}: must exceed the chunk header")]
    InvalidChunkSize(usize),

    /// Transport send failed or the sub-channel closed mid-send
    #[error("Network error: {0}")]
    Network(String),

    /// No sub-channel was open when a send was scheduled
    #[error("No data channel available")]
    NoChannelAvailable,

    /// Invoke target is not in the connected state
    #[error("Target client {0} is offline")]
    TargetOffline(String),

    /// A client id is already registered in the room under another secret
    #[error("Authentication mismatched for client {0}")]
    AuthenticationMismatch(String),

    /// A signaling join was missing one of its identity arguments
    #[error("Missing argument: {0}")]
    MissingArgument(&'static str),

    /// No response arrived within a correlation window
    #[error("Timed out after {0}ms")]
    Timeout(u64),

    /// Well-formed but unexpected traffic
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// JSON encoding or decoding failed
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// WebSocket failure on the signaling socket
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Peer connection library failure
    #[error("RTC error: {0}")]
    Rtc(#[from] str0m::RtcError),

    /// HTTP failure on the fallback polling transport
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl Error {
    /// Create a network error
    pub fn network<T: Into<String>>(msg: T) -> Self {
        Error::Network(msg.into())
    }

    /// Create a malformed frame error
    pub fn malformed<T: Into<String>>(msg: T) -> Self {
        Error::MalformedFrame(msg.into())
    }

    /// Create a protocol error
    pub fn protocol<T: Into<String>>(msg: T) -> Self {
        Error::Protocol(msg.into())
    }

    /// Whether the error only means the other side went away
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            Error::Network(_) | Error::NoChannelAvailable | Error::TargetOffline(_)
        )
    }
}
