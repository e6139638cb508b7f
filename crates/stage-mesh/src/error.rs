//! Error types for stage mesh coordination

use serde::{Deserialize, Serialize};

/// Result type alias using the stage mesh Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while coordinating a stage
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid configuration parameter
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Relay transport failure (subscribe or publish could not reach the relay)
    #[error("Signaling transport error: {0}")]
    TransportError(String),

    /// Signaling protocol error (malformed or unroutable message)
    #[error("Signaling error: {0}")]
    SignalingError(String),

    /// SDP negotiation error
    #[error("SDP negotiation error: {0}")]
    SdpError(String),

    /// ICE candidate error
    #[error("ICE candidate error: {0}")]
    IceCandidateError(String),

    /// Peer connection could not be established or was lost
    #[error("Connectivity error: {0}")]
    ConnectivityError(String),

    /// Operation timeout
    #[error("Operation timeout: {0}")]
    OperationTimeout(String),

    /// Circuit is open and the call was rejected without running
    #[error("Circuit open: {0}")]
    CircuitOpen(String),

    /// Peer not found
    #[error("Peer not found: {0}")]
    PeerNotFound(String),

    /// Media track error
    #[error("Media track error: {0}")]
    MediaTrackError(String),

    /// Session lifecycle error (join twice, act while not joined)
    #[error("Session error: {0}")]
    SessionError(String),

    /// WebSocket error
    #[error("WebSocket error: {0}")]
    WebSocketError(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// WebRTC library error
    #[error("WebRTC error: {0}")]
    WebRtcError(String),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Any other error
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Coarse error category surfaced to the UI layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Relay unreachable or dropped
    Transport,
    /// Offer/answer/candidate exchange failed
    Negotiation,
    /// Peer connection failed or was lost
    Connectivity,
    /// Protected call exceeded its deadline
    Timeout,
    /// Rejected configuration
    Configuration,
    /// Local media capture or track handling
    Media,
    /// Anything else
    Internal,
}

/// Severity attached to errors surfaced in `StageState`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Error,
    /// Session or peer is gone and will not be retried
    Fatal,
}

impl Error {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::TransportError(_)
                | Error::ConnectivityError(_)
                | Error::OperationTimeout(_)
                | Error::CircuitOpen(_)
                | Error::WebSocketError(_)
                | Error::IoError(_)
        )
    }

    /// Check if this error is a peer-related error
    pub fn is_peer_error(&self) -> bool {
        matches!(
            self,
            Error::PeerNotFound(_)
                | Error::ConnectivityError(_)
                | Error::IceCandidateError(_)
                | Error::SdpError(_)
        )
    }

    /// Map the error onto its UI-facing category
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::TransportError(_) | Error::WebSocketError(_) | Error::IoError(_) => {
                ErrorKind::Transport
            }
            Error::SignalingError(_)
            | Error::SdpError(_)
            | Error::IceCandidateError(_)
            | Error::SerializationError(_) => ErrorKind::Negotiation,
            Error::ConnectivityError(_) | Error::PeerNotFound(_) | Error::WebRtcError(_) => {
                ErrorKind::Connectivity
            }
            Error::OperationTimeout(_) | Error::CircuitOpen(_) => ErrorKind::Timeout,
            Error::InvalidConfig(_) => ErrorKind::Configuration,
            Error::MediaTrackError(_) => ErrorKind::Media,
            Error::SessionError(_) | Error::Other(_) => ErrorKind::Internal,
        }
    }

    /// Default severity when the error is surfaced without further context
    pub fn severity(&self) -> Severity {
        match self.kind() {
            ErrorKind::Negotiation | ErrorKind::Timeout => Severity::Warning,
            ErrorKind::Configuration => Severity::Fatal,
            _ => Severity::Error,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::SerializationError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::InvalidConfig("test".to_string());
        assert_eq!(err.to_string(), "Invalid configuration: test");

        let err = Error::CircuitOpen("signaling".to_string());
        assert_eq!(err.to_string(), "Circuit open: signaling");
    }

    #[test]
    fn test_error_is_retryable() {
        assert!(Error::TransportError("test".to_string()).is_retryable());
        assert!(Error::OperationTimeout("test".to_string()).is_retryable());
        assert!(Error::CircuitOpen("test".to_string()).is_retryable());
        assert!(!Error::InvalidConfig("test".to_string()).is_retryable());
        assert!(!Error::SdpError("test".to_string()).is_retryable());
    }

    #[test]
    fn test_error_is_peer_error() {
        assert!(Error::PeerNotFound("test".to_string()).is_peer_error());
        assert!(Error::SdpError("test".to_string()).is_peer_error());
        assert!(!Error::InvalidConfig("test".to_string()).is_peer_error());
    }

    #[test]
    fn test_error_kind_and_severity() {
        let err = Error::TransportError("relay down".to_string());
        assert_eq!(err.kind(), ErrorKind::Transport);
        assert_eq!(err.severity(), Severity::Error);

        let err = Error::OperationTimeout("offer:bob".to_string());
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert_eq!(err.severity(), Severity::Warning);

        assert_eq!(
            Error::InvalidConfig("x".to_string()).severity(),
            Severity::Fatal
        );
    }

    #[test]
    fn test_serde_error_conversion() {
        let parse: std::result::Result<serde_json::Value, _> = serde_json::from_str("{not json");
        let err = Error::from(parse.unwrap_err());
        assert!(matches!(err, Error::SerializationError(_)));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err = Error::from(io_err);
        assert!(matches!(err, Error::IoError(_)));
        assert_eq!(err.kind(), ErrorKind::Transport);
    }
}
