use crate::peer::types::IceCandidate;
use crate::signaling::{is_end_of_candidates, SignalTransport};
use crate::stop::StopSignal;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::RTCPeerConnection;

/// Counts of gathered candidates by type
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CandidateSummary {
    pub host: usize,
    pub srflx: usize,
    pub relay: usize,
}

/// Apply one remote candidate. Returns `true` for the end-of-candidates marker.
pub async fn add_ice_candidate(pc: &RTCPeerConnection, session_id: &str, raw: &str) -> bool {
    if is_end_of_candidates(raw) {
        info!(session_id, "Remote end of candidates");
        return true;
    }
    let candidate: IceCandidate = match serde_json::from_str(raw) {
        Ok(c) => c,
        Err(e) => {
            warn!(session_id, "Ignoring malformed remote candidate {:?}: {}", raw, e);
            return false;
        }
    };
    debug!(session_id, "add_ice_candidate: {}", candidate.candidate);
    if let Err(e) = pc.add_ice_candidate(RTCIceCandidateInit::from(candidate)).await {
        warn!(session_id, "Failed to add ICE candidate: {}", e);
    }
    false
}

/// Submit local candidates one at a time, in gather order
///
/// Submission failures are logged and skipped. Ends after the end marker, when
/// the queue closes or when `stop` fires.
pub async fn forward_local_candidates(
    signal: Arc<dyn SignalTransport>,
    mut local: mpsc::UnboundedReceiver<IceCandidate>,
    stop: StopSignal,
) -> Vec<IceCandidate> {
    let mut sent = Vec::new();
    loop {
        let candidate = tokio::select! {
            c = local.recv() => c,
            _ = stop.stopped() => None,
        };
        let Some(candidate) = candidate else {
            break;
        };

        let raw = match candidate.to_json_string() {
            Ok(raw) => raw,
            Err(e) => {
                warn!(session_id = signal.session_id(), "Skipping candidate: {}", e);
                continue;
            }
        };
        if let Err(e) = signal.send_candidate(&raw).await {
            warn!(session_id = signal.session_id(), "Candidate not delivered: {}", e);
        }

        if candidate.is_end_marker() {
            analyze_candidates(signal.session_id(), &sent);
            break;
        }
        sent.push(candidate);
    }
    sent
}

pub fn analyze_candidates(session_id: &str, candidates: &[IceCandidate]) -> CandidateSummary {
    let mut summary = CandidateSummary::default();

    for candidate in candidates {
        if candidate.candidate.contains("typ host") {
            summary.host += 1;
        } else if candidate.candidate.contains("typ srflx") {
            summary.srflx += 1;
        } else if candidate.candidate.contains("typ relay") {
            summary.relay += 1;
        }
    }

    info!(
        session_id,
        "Candidate analysis: {} host, {} srflx, {} relay",
        summary.host,
        summary.srflx,
        summary.relay
    );

    if summary.relay == 0 {
        debug!(session_id, "No TURN relay candidates found; connection through NAT may fail");
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Error, Result};
    use async_trait::async_trait;
    use std::sync::Mutex;

    fn cand(text: &str) -> IceCandidate {
        IceCandidate {
            candidate: text.to_string(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }

    #[derive(Default)]
    struct RecordingSignal {
        sent: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl SignalTransport for RecordingSignal {
        fn session_id(&self) -> &str {
            "rec"
        }

        async fn submit_answer(&self, _answer: &str) -> Result<()> {
            Ok(())
        }

        async fn send_candidate(&self, candidate: &str) -> Result<()> {
            let mut sent = self.sent.lock().unwrap();
            sent.push(candidate.to_string());
            if sent.len() == 2 {
                return Err(Error::CandidateRejected("HTTP 500".into()));
            }
            Ok(())
        }

        async fn fetch_candidates(
            &self,
            _sink: mpsc::UnboundedSender<String>,
            _stop: &StopSignal,
        ) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_analyze_candidates() {
        let summary = analyze_candidates(
            "s",
            &[
                cand("candidate:1 1 udp 1 10.0.0.1 9 typ host"),
                cand("candidate:2 1 udp 1 1.2.3.4 9 typ srflx raddr 0.0.0.0 rport 0"),
                cand("candidate:3 1 udp 1 5.6.7.8 9 typ relay raddr 0.0.0.0 rport 0"),
                cand("candidate:4 1 udp 1 10.0.0.2 9 typ host"),
            ],
        );
        assert_eq!(
            summary,
            CandidateSummary {
                host: 2,
                srflx: 1,
                relay: 1
            }
        );
    }

    #[tokio::test]
    async fn test_every_end_marker_form_ends_remote_candidates() {
        let pc = webrtc::api::APIBuilder::new()
            .build()
            .new_peer_connection(Default::default())
            .await
            .unwrap();
        for raw in [
            "null",
            "{}",
            "{\"candidate\":null}",
            "{\"candidate\":\"\"}",
            "{\"candidate\":\"\",\"sdpMid\":\"0\"}",
        ] {
            assert!(add_ice_candidate(&pc, "s", raw).await, "{raw}");
        }
        assert!(!add_ice_candidate(&pc, "s", "not json").await);
        assert!(
            !add_ice_candidate(
                &pc,
                "s",
                "{\"candidate\":\"candidate:1 1 udp 1 10.0.0.1 9 typ host\",\"sdpMid\":\"0\"}"
            )
            .await
        );
        pc.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_forwarding_keeps_order_and_tolerates_failures() {
        let signal = Arc::new(RecordingSignal::default());
        let (tx, rx) = mpsc::unbounded_channel();
        for i in 0..3 {
            tx.send(cand(&format!("candidate:{i} 1 udp 1 10.0.0.1 9 typ host")))
                .unwrap();
        }
        tx.send(IceCandidate::end_of_candidates()).unwrap();
        tx.send(cand("after the end")).unwrap();

        let forwarded =
            forward_local_candidates(signal.clone(), rx, StopSignal::new()).await;
        assert_eq!(forwarded.len(), 3);

        let sent = signal.sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 4);
        for (i, raw) in sent.iter().take(3).enumerate() {
            assert!(raw.contains(&format!("candidate:{i} ")));
        }
        assert_eq!(sent[3], "{\"candidate\":\"\"}");
    }
}
