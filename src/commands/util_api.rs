use crate::error::Result;
use crate::peer::types::ServerConfig;
use crate::utils::add_ice_url_scheme;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;

const CHECK_TIMEOUT: Duration = Duration::from_secs(10);

/// Candidate type a working server of this kind yields
fn expected_candidate(server_type: &str) -> &'static str {
    if server_type == "turn" {
        "typ relay"
    } else {
        "typ srflx"
    }
}

/// Gather candidates through `config` alone and report whether it answered
pub async fn check_ice_server_availability(config: &ServerConfig) -> Result<bool> {
    let url = add_ice_url_scheme(config);
    debug!("Checking ICE server '{}' -> '{}'", config.url, url);

    let rtc_config = RTCConfiguration {
        ice_servers: vec![RTCIceServer {
            urls: vec![url],
            username: config.username.clone().unwrap_or_default(),
            credential: config.credential.clone().unwrap_or_default(),
        }],
        ..Default::default()
    };
    let api = APIBuilder::new().build();
    let pc = api.new_peer_connection(rtc_config).await?;

    let (tx, mut rx) = mpsc::unbounded_channel::<Option<String>>();
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let text = candidate
            .and_then(|c| c.to_json().ok())
            .map(|init| init.candidate);
        let _ = tx.send(text);
        Box::pin(async {})
    }));

    // A data channel plus a local offer starts gathering.
    pc.create_data_channel("probe", None).await?;
    let offer = pc.create_offer(None).await?;
    pc.set_local_description(offer).await?;

    let wanted = expected_candidate(&config.r#type);
    let found = tokio::time::timeout(CHECK_TIMEOUT, async {
        while let Some(candidate) = rx.recv().await {
            match candidate {
                Some(text) if text.contains(wanted) => return true,
                Some(text) => debug!("Candidate type mismatch: {}", text),
                // Gathering complete
                None => return false,
            }
        }
        false
    })
    .await
    .unwrap_or_else(|_| {
        warn!("Timeout waiting for a {} candidate from {}", wanted, config.url);
        false
    });

    pc.close().await?;
    info!("ICE server {} available: {}", config.id, found);
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expected_candidate_type() {
        assert_eq!(expected_candidate("turn"), "typ relay");
        assert_eq!(expected_candidate("stun"), "typ srflx");
    }
}
