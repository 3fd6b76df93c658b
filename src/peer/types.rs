use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

/// A node willing to host a session, as listed by the directory
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct NodeOffer {
    pub session_id: String,
    /// JSON text `{"Offer": "<JSON session description>"}`
    pub peer_connection_offer: String,
}

#[derive(Deserialize)]
struct OfferEnvelope {
    #[serde(rename = "Offer")]
    offer: String,
}

impl NodeOffer {
    pub fn new(session_id: impl Into<String>, peer_connection_offer: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            peer_connection_offer: peer_connection_offer.into(),
        }
    }

    /// Wrap a bare session description the way nodes publish it
    pub fn from_description(
        session_id: impl Into<String>,
        description: &RTCSessionDescription,
    ) -> Result<Self> {
        let inner = serde_json::to_string(description)?;
        let envelope = serde_json::json!({ "Offer": inner });
        Ok(Self::new(session_id, envelope.to_string()))
    }

    /// Decode the node's session description
    pub fn parse_description(&self) -> Result<RTCSessionDescription> {
        let envelope: OfferEnvelope = serde_json::from_str(&self.peer_connection_offer)
            .map_err(|e| Error::InvalidOffer(format!("{}: {e}", self.session_id)))?;
        serde_json::from_str(&envelope.offer)
            .map_err(|e| Error::InvalidOffer(format!("{}: {e}", self.session_id)))
    }
}

/// ICE candidate in the browser JSON shape exchanged through signaling
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct IceCandidate {
    #[serde(default)]
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    #[serde(
        rename = "usernameFragment",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    /// The marker sent once local gathering is complete
    pub fn end_of_candidates() -> Self {
        Self::default()
    }

    pub fn is_end_marker(&self) -> bool {
        self.candidate.is_empty()
    }

    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

impl From<RTCIceCandidateInit> for IceCandidate {
    fn from(init: RTCIceCandidateInit) -> Self {
        Self {
            candidate: init.candidate,
            sdp_mid: init.sdp_mid,
            sdp_mline_index: init.sdp_mline_index,
            username_fragment: init.username_fragment,
        }
    }
}

impl From<IceCandidate> for RTCIceCandidateInit {
    fn from(c: IceCandidate) -> Self {
        RTCIceCandidateInit {
            candidate: c.candidate,
            sdp_mid: c.sdp_mid,
            sdp_mline_index: c.sdp_mline_index,
            username_fragment: c.username_fragment,
        }
    }
}

/// ICE server configuration
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ServerConfig {
    pub id: String,
    pub r#type: String, // 'stun' or 'turn'
    pub url: String,
    pub username: Option<String>,
    pub credential: Option<String>,
}
