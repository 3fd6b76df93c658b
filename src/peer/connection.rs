use crate::error::Result;
use crate::logger::{dump_candidate, dump_selected_pair};
use crate::peer::data_channel::{attach_dc, DataChannel};
use crate::peer::link::LinkCloser;
use crate::peer::state::LinkState;
use crate::peer::types::{IceCandidate, ServerConfig};
use crate::stop::StopSignal;
use crate::utils::add_ice_url_scheme;
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;
use webrtc::{
    api::APIBuilder,
    data_channel::RTCDataChannel,
    ice_transport::ice_server::RTCIceServer,
    peer_connection::{
        configuration::RTCConfiguration, peer_connection_state::RTCPeerConnectionState,
        RTCPeerConnection,
    },
};

/// A fresh answering peer and the event queues wired to it
pub struct PeerParts {
    pub pc: Arc<RTCPeerConnection>,
    /// Local candidates in gather order, closed by the end marker
    pub local_candidates: mpsc::UnboundedReceiver<IceCandidate>,
    pub state: watch::Receiver<LinkState>,
    /// Remote-created data channels, sent once open
    pub channels: mpsc::UnboundedReceiver<DataChannel>,
}

/// Create the answering side of a connection
pub async fn new_peer(ice: &[ServerConfig], session_id: &str) -> Result<PeerParts> {
    let api = APIBuilder::new().build();
    let pc = Arc::new(api.new_peer_connection(rtc_config(ice)).await?);

    let (cand_tx, cand_rx) = mpsc::unbounded_channel();
    let sid = session_id.to_string();
    pc.on_ice_candidate(Box::new(move |cand: Option<RTCIceCandidate>| {
        match cand {
            Some(c) => {
                dump_candidate(&sid, "LOCAL", &c);
                match c.to_json() {
                    Ok(init) => {
                        let _ = cand_tx.send(IceCandidate::from(init));
                    }
                    Err(e) => warn!(session_id = %sid, "Unserializable local candidate: {}", e),
                }
            }
            None => {
                // cand == None means gathering is complete
                debug!(session_id = %sid, "ICE candidate gathering completed");
                let _ = cand_tx.send(IceCandidate::end_of_candidates());
            }
        }
        Box::pin(async {})
    }));

    let sid = session_id.to_string();
    pc.on_ice_gathering_state_change(Box::new(move |state| {
        debug!(session_id = %sid, "ICE gathering state changed to: {:?}", state);
        Box::pin(async {})
    }));

    let (state_tx, state_rx) = watch::channel(LinkState::Connecting);
    let pc_stats = Arc::downgrade(&pc);
    let sid = session_id.to_string();
    pc.on_peer_connection_state_change(Box::new(move |st: RTCPeerConnectionState| {
        info!(session_id = %sid, "Peer connection state changed to: {:?}", st);
        state_tx.send_replace(LinkState::from(st));

        let moment = match st {
            RTCPeerConnectionState::Connected => Some("CONNECTED"),
            RTCPeerConnectionState::Disconnected | RTCPeerConnectionState::Failed => {
                Some("BEFORE-FAIL")
            }
            _ => None,
        };
        if let (Some(moment), Some(pc)) = (moment, pc_stats.upgrade()) {
            let sid = sid.clone();
            tokio::spawn(async move {
                dump_selected_pair(&pc, &sid, moment).await;
            });
        }
        Box::pin(async {})
    }));

    let (dc_tx, dc_rx) = mpsc::unbounded_channel();
    pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
        let channel = attach_dc(&dc);
        let slot = Mutex::new(Some(channel));
        let dc_tx = dc_tx.clone();
        let label = dc.label().to_string();
        dc.on_open(Box::new(move || {
            debug!(label = %label, "Data channel open");
            if let Some(channel) = slot.lock().ok().and_then(|mut s| s.take()) {
                let _ = dc_tx.send(channel);
            }
            Box::pin(async {})
        }));
        Box::pin(async {})
    }));

    Ok(PeerParts {
        pc,
        local_candidates: cand_rx,
        state: state_rx,
        channels: dc_rx,
    })
}

/// Build the peer connection configuration
fn rtc_config(servers: &[ServerConfig]) -> RTCConfiguration {
    let ice_servers = if servers.is_empty() {
        vec![RTCIceServer {
            urls: vec![
                "stun:stun.l.google.com:19302".into(),
                "stun:stun1.l.google.com:19302".into(),
            ],
            ..Default::default()
        }]
    } else {
        get_user_ice_servers(servers)
    };

    RTCConfiguration {
        ice_servers,
        ice_candidate_pool_size: 10,
        bundle_policy: RTCBundlePolicy::MaxBundle,
        rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
        ..Default::default()
    }
}

/// Map configured servers to webrtc ICE servers
pub fn get_user_ice_servers(servers: &[ServerConfig]) -> Vec<RTCIceServer> {
    servers
        .iter()
        .map(|config| RTCIceServer {
            urls: vec![add_ice_url_scheme(config)],
            username: config.username.clone().unwrap_or_default(),
            credential: config.credential.clone().unwrap_or_default(),
        })
        .collect()
}

/// Closes the peer connection and stops the tasks feeding it
pub struct PcCloser {
    pc: Arc<RTCPeerConnection>,
    tasks: StopSignal,
    session_id: String,
}

impl PcCloser {
    pub fn new(pc: Arc<RTCPeerConnection>, tasks: StopSignal, session_id: &str) -> Self {
        Self {
            pc,
            tasks,
            session_id: session_id.to_string(),
        }
    }
}

#[async_trait]
impl LinkCloser for PcCloser {
    async fn close(&self) {
        self.tasks.stop(0);
        if let Err(e) = self.pc.close().await {
            warn!(session_id = %self.session_id, "Closing peer connection failed: {}", e);
        }
    }
}
