//! Error types for discovery, negotiation and the session protocols

use bytes::Bytes;

/// Result type alias using the crate [`Error`]
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while finding, negotiating with or talking to a node
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Directory or signaling service answered with a non-success status
    #[error("Directory unavailable: {0}")]
    DirectoryUnavailable(String),

    /// The node's signaling slot refused our answer
    #[error("Answer rejected: {0}")]
    AnswerRejected(String),

    /// A local candidate could not be submitted
    #[error("Candidate rejected: {0}")]
    CandidateRejected(String),

    /// Unexpected payload on the control channel
    #[error("Protocol violation: unexpected message {}", describe_raw(.raw))]
    ProtocolViolation {
        /// The offending payload, kept for diagnostics
        raw: Bytes,
    },

    /// Status or chat frame received while a ready sentinel was expected
    #[error("{0}")]
    RemoteStatus(String),

    /// The directory returned zero offers
    #[error("No nodes currently available. Try again later.")]
    NoNodesAvailable,

    /// The overall launch timer fired
    #[error("Timed out waiting for a node")]
    Timeout,

    /// Another attempt won the race
    #[error("Superseded by a concurrent session")]
    ConcurrentSessionSuperseded,

    /// JSON-RPC error object returned by the remote peer
    #[error("RPC error {code}: {message}")]
    Rpc {
        /// JSON-RPC error code
        code: i64,
        /// Human-readable message
        message: String,
        /// Optional extra data
        data: Option<serde_json::Value>,
    },

    /// The data channel or peer connection went away
    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    /// Transport negotiation did not produce a channel
    #[error("Negotiation failed: {0}")]
    NegotiationFailed(String),

    /// The attempt was stopped locally with the given stop code
    #[error("Stopped with code {0}")]
    Stopped(i32),

    /// Storage resource does not exist yet
    #[error("Not found: {0}")]
    NotFound(String),

    /// Node offer could not be decoded
    #[error("Invalid offer: {0}")]
    InvalidOffer(String),

    /// Invalid configuration parameter
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// WebRTC library error
    #[error("WebRTC error: {0}")]
    WebRtc(#[from] webrtc::Error),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn describe_raw(raw: &Bytes) -> String {
    match std::str::from_utf8(raw) {
        Ok(text) => format!("{text:?}"),
        Err(_) => format!("0x{}", hex::encode(raw)),
    }
}

impl Error {
    /// Check if this error ends a launch with a message rather than a failure
    pub fn is_user_facing(&self) -> bool {
        matches!(self, Error::NoNodesAvailable | Error::Timeout)
    }

    /// Check if this error only means another attempt won
    pub fn is_superseded(&self) -> bool {
        matches!(self, Error::ConcurrentSessionSuperseded)
    }

    /// Build a protocol violation from a raw frame
    pub fn unexpected(raw: impl Into<Bytes>) -> Self {
        Error::ProtocolViolation { raw: raw.into() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::DirectoryUnavailable("HTTP 503".to_string());
        assert_eq!(err.to_string(), "Directory unavailable: HTTP 503");
        assert_eq!(
            Error::NoNodesAvailable.to_string(),
            "No nodes currently available. Try again later."
        );
    }

    #[test]
    fn test_protocol_violation_shows_payload() {
        let text = Error::unexpected(Bytes::from_static(b"hello"));
        assert_eq!(text.to_string(), "Protocol violation: unexpected message \"hello\"");

        let binary = Error::unexpected(Bytes::from_static(&[0xff, 0x00]));
        assert_eq!(binary.to_string(), "Protocol violation: unexpected message 0xff00");
    }

    #[test]
    fn test_superseded_is_not_user_facing() {
        assert!(Error::ConcurrentSessionSuperseded.is_superseded());
        assert!(!Error::ConcurrentSessionSuperseded.is_user_facing());
        assert!(!Error::DirectoryUnavailable("HTTP 503".into()).is_user_facing());
        assert!(Error::Timeout.is_user_facing());
        assert!(Error::NoNodesAvailable.is_user_facing());
    }
}
