//! Answer-side negotiation with one node

use crate::error::{Error, Result};
use crate::peer::connection::{new_peer, PcCloser, PeerParts};
use crate::peer::data_channel::DataChannel;
use crate::peer::ice::{add_ice_candidate, forward_local_candidates};
use crate::peer::link::{Connector, LinkCloser, PeerLink};
use crate::peer::state::NegotiationState;
use crate::peer::types::{NodeOffer, ServerConfig};
use crate::signaling::{SignalFactory, SignalTransport};
use crate::stop::StopSignal;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{error, info, warn};
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

/// Production [`Connector`] over webrtc-rs
pub struct WebRtcConnector {
    signals: Arc<dyn SignalFactory>,
    ice: Vec<ServerConfig>,
    end_of_candidates_grace: Duration,
}

impl WebRtcConnector {
    pub fn new(
        signals: Arc<dyn SignalFactory>,
        ice: Vec<ServerConfig>,
        end_of_candidates_grace: Duration,
    ) -> Self {
        Self {
            signals,
            ice,
            end_of_candidates_grace,
        }
    }
}

#[async_trait]
impl Connector for WebRtcConnector {
    async fn connect(&self, offer: &NodeOffer, stop: &StopSignal) -> Result<PeerLink> {
        let signal = self.signals.create(&offer.session_id);
        let negotiator = Negotiator::new(signal, self.end_of_candidates_grace);
        negotiator.negotiate(offer, &self.ice, stop).await
    }
}

/// Drives one negotiation through [`NegotiationState`]
pub struct Negotiator {
    signal: Arc<dyn SignalTransport>,
    grace: Duration,
    state: watch::Sender<NegotiationState>,
}

impl Negotiator {
    pub fn new(signal: Arc<dyn SignalTransport>, grace: Duration) -> Self {
        let (state, _) = watch::channel(NegotiationState::Idle);
        Self {
            signal,
            grace,
            state,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<NegotiationState> {
        self.state.subscribe()
    }

    fn enter(&self, next: NegotiationState) {
        info!(session_id = self.signal.session_id(), "Negotiation {:?}", next);
        self.state.send_replace(next);
    }

    /// Answer `offer` and trickle candidates until a data channel opens
    pub async fn negotiate(
        &self,
        offer: &NodeOffer,
        ice: &[ServerConfig],
        stop: &StopSignal,
    ) -> Result<PeerLink> {
        let session_id = offer.session_id.clone();
        let description = offer.parse_description()?;
        let mut parts = new_peer(ice, &session_id).await?;
        // Background work stops with the attempt or when the link is closed.
        let tasks = stop.child();
        let closer = PcCloser::new(Arc::clone(&parts.pc), tasks.clone(), &session_id);

        let outcome = tokio::select! {
            outcome = self.exchange(&mut parts, description, &tasks) => outcome,
            code = tasks.stopped() => Err(Error::Stopped(code)),
        };
        match outcome {
            Ok(first) => {
                self.enter(NegotiationState::Connected);
                Ok(PeerLink::new(
                    session_id,
                    Some(first),
                    parts.channels,
                    parts.state,
                    Arc::new(closer),
                ))
            }
            Err(e) => {
                self.enter(NegotiationState::Failed);
                error!(session_id = %session_id, "Negotiation failed: {}", e);
                closer.close().await;
                Err(e)
            }
        }
    }

    async fn exchange(
        &self,
        parts: &mut PeerParts,
        description: RTCSessionDescription,
        tasks: &StopSignal,
    ) -> Result<DataChannel> {
        let pc = Arc::clone(&parts.pc);
        pc.set_remote_description(description).await?;
        let answer = pc.create_answer(None).await?;
        pc.set_local_description(answer.clone()).await?;
        let local = pc.local_description().await.unwrap_or(answer);

        let answer_json = serde_json::to_string(&local)?;
        self.signal.submit_answer(&answer_json).await?;
        self.enter(NegotiationState::AnswerSubmitted);

        // Local candidates queued since set_local_description go out after the answer.
        let (_, placeholder) = mpsc::unbounded_channel();
        let local_rx = std::mem::replace(&mut parts.local_candidates, placeholder);
        tokio::spawn(forward_local_candidates(
            Arc::clone(&self.signal),
            local_rx,
            tasks.clone(),
        ));

        let end_rx = spawn_remote_candidates(Arc::clone(&self.signal), pc, tasks.clone());
        self.enter(NegotiationState::CandidatesExchanging);

        self.await_channel(parts, end_rx).await
    }

    async fn await_channel(
        &self,
        parts: &mut PeerParts,
        mut end_rx: oneshot::Receiver<()>,
    ) -> Result<DataChannel> {
        let mut state = parts.state.clone();
        let mut end_seen = false;
        let grace = tokio::time::sleep(Duration::MAX);
        tokio::pin!(grace);

        loop {
            tokio::select! {
                channel = parts.channels.recv() => {
                    return channel.ok_or_else(|| {
                        Error::NegotiationFailed("peer connection dropped".to_string())
                    });
                }
                changed = state.changed() => {
                    let current = *state.borrow_and_update();
                    if changed.is_err() || current.is_down() {
                        return Err(Error::NegotiationFailed(format!("peer {:?}", current)));
                    }
                }
                received = &mut end_rx, if !end_seen => {
                    end_seen = true;
                    if received.is_ok() {
                        grace
                            .as_mut()
                            .reset(tokio::time::Instant::now() + self.grace);
                    }
                }
                _ = &mut grace => {
                    return Err(Error::NegotiationFailed(
                        "no channel opened after the last remote candidate".to_string(),
                    ));
                }
            }
        }
    }
}

/// Feed remote candidates into `pc`. The returned receiver fires on the end marker.
fn spawn_remote_candidates(
    signal: Arc<dyn SignalTransport>,
    pc: Arc<RTCPeerConnection>,
    tasks: StopSignal,
) -> oneshot::Receiver<()> {
    let (end_tx, end_rx) = oneshot::channel();
    let (sink, mut remote) = mpsc::unbounded_channel::<String>();

    let fetch_signal = Arc::clone(&signal);
    let fetch_stop = tasks.clone();
    tokio::spawn(async move {
        if let Err(e) = fetch_signal.fetch_candidates(sink, &fetch_stop).await {
            warn!(
                session_id = fetch_signal.session_id(),
                "Candidate polling ended: {}", e
            );
        }
    });

    tokio::spawn(async move {
        let mut end_tx = Some(end_tx);
        while let Some(raw) = remote.recv().await {
            if tasks.is_stopped() {
                break;
            }
            if add_ice_candidate(&pc, signal.session_id(), &raw).await {
                if let Some(tx) = end_tx.take() {
                    let _ = tx.send(());
                }
            }
        }
    });

    end_rx
}
