use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;

/// Progress of one node's handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Idle,
    AnswerSubmitted,
    CandidatesExchanging,
    /// A data channel opened
    Connected,
    Failed,
}

impl NegotiationState {
    pub fn is_terminal(self) -> bool {
        matches!(self, NegotiationState::Connected | NegotiationState::Failed)
    }
}

/// Health of an established link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl LinkState {
    /// `Failed` and `Closed` never recover
    pub fn is_terminal(self) -> bool {
        matches!(self, LinkState::Failed | LinkState::Closed)
    }

    /// States that end a conduit or a pending negotiation
    pub fn is_down(self) -> bool {
        matches!(
            self,
            LinkState::Disconnected | LinkState::Failed | LinkState::Closed
        )
    }
}

impl From<RTCPeerConnectionState> for LinkState {
    fn from(state: RTCPeerConnectionState) -> Self {
        match state {
            RTCPeerConnectionState::Connected => LinkState::Connected,
            RTCPeerConnectionState::Disconnected => LinkState::Disconnected,
            RTCPeerConnectionState::Failed => LinkState::Failed,
            RTCPeerConnectionState::Closed => LinkState::Closed,
            _ => LinkState::Connecting,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_state_mapping() {
        assert_eq!(
            LinkState::from(RTCPeerConnectionState::Connected),
            LinkState::Connected
        );
        assert_eq!(
            LinkState::from(RTCPeerConnectionState::New),
            LinkState::Connecting
        );
        assert!(LinkState::from(RTCPeerConnectionState::Disconnected).is_down());
        assert!(!LinkState::Disconnected.is_terminal());
        assert!(LinkState::Closed.is_terminal());
    }

    #[test]
    fn test_negotiation_terminal_states() {
        assert!(NegotiationState::Connected.is_terminal());
        assert!(NegotiationState::Failed.is_terminal());
        assert!(!NegotiationState::CandidatesExchanging.is_terminal());
    }
}
