//! In-memory nodes for driving the arbitrator without a network

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use peerlaunch_lib::directory::{Directory, NodeQuery};
use peerlaunch_lib::peer::{Connector, DataChannel, LinkCloser, LinkState, NodeOffer, PeerLink};
use peerlaunch_lib::session::{LAUNCH_PREFIX, SENTINEL};
use peerlaunch_lib::{Error, Result, StopSignal};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};

/// How a simulated node behaves
#[derive(Clone, Debug)]
pub struct NodeScript {
    /// `None` never finishes negotiating
    pub connect_after: Option<Duration>,
    /// Fail negotiation with this message instead of connecting
    pub fail: Option<String>,
    /// Probe frames to echo (warmup + samples)
    pub probe_frames: usize,
    /// Delay before the second sentinel
    pub ready_after: Duration,
    /// How long the live session runs before it ends
    pub hold: Duration,
    /// Exit code reported at the end of the session
    pub exit_code: i32,
    /// End the session by dropping the link instead of sending an exit frame
    pub disconnect: bool,
    /// Side channels opened right after connecting
    pub extra_channels: Vec<&'static str>,
}

impl NodeScript {
    pub fn ready(connect_after: Duration, ready_after: Duration) -> Self {
        Self {
            connect_after: Some(connect_after),
            fail: None,
            probe_frames: 3,
            ready_after,
            hold: Duration::from_millis(50),
            exit_code: 0,
            disconnect: false,
            extra_channels: Vec::new(),
        }
    }

    pub fn hang() -> Self {
        Self {
            connect_after: None,
            ..Self::ready(Duration::ZERO, Duration::ZERO)
        }
    }

    pub fn failing(after: Duration, message: &str) -> Self {
        Self {
            fail: Some(message.to_string()),
            ..Self::ready(after, Duration::ZERO)
        }
    }

    pub fn exit_with(mut self, code: i32) -> Self {
        self.exit_code = code;
        self
    }
}

/// What the simulated nodes observed
#[derive(Default, Debug)]
pub struct Observations {
    pub connects: Vec<String>,
    /// `(session, stop code at close)` per closed attempt
    pub closed: Vec<(String, Option<i32>)>,
    /// Sessions that received a launch frame
    pub launched: Vec<String>,
    /// Sessions that saw a launch frame before their second sentinel
    pub early_launch: Vec<String>,
    /// Side channels handed to services
    pub served: Vec<String>,
}

pub type Record = Arc<Mutex<Observations>>;

pub struct SimConnector {
    scripts: HashMap<String, NodeScript>,
    pub record: Record,
}

impl SimConnector {
    pub fn new(scripts: Vec<(&str, NodeScript)>) -> Self {
        Self {
            scripts: scripts
                .into_iter()
                .map(|(sid, script)| (sid.to_string(), script))
                .collect(),
            record: Record::default(),
        }
    }

    pub fn offers(&self) -> Vec<NodeOffer> {
        let mut ids: Vec<_> = self.scripts.keys().cloned().collect();
        ids.sort();
        ids.into_iter()
            .map(|sid| NodeOffer::new(sid, "{\"Offer\":\"{}\"}"))
            .collect()
    }
}

struct SimCloser {
    session_id: String,
    stop: StopSignal,
    state: Arc<watch::Sender<LinkState>>,
    record: Record,
}

#[async_trait]
impl LinkCloser for SimCloser {
    async fn close(&self) {
        self.state.send_replace(LinkState::Closed);
        self.record
            .lock()
            .unwrap()
            .closed
            .push((self.session_id.clone(), self.stop.code()));
    }
}

#[async_trait]
impl Connector for SimConnector {
    async fn connect(&self, offer: &NodeOffer, stop: &StopSignal) -> Result<PeerLink> {
        let sid = offer.session_id.clone();
        self.record.lock().unwrap().connects.push(sid.clone());
        let script = self
            .scripts
            .get(&sid)
            .cloned()
            .ok_or_else(|| Error::InvalidOffer(sid.clone()))?;

        let Some(delay) = script.connect_after else {
            let code = stop.stopped().await;
            self.record.lock().unwrap().closed.push((sid, Some(code)));
            return Err(Error::Stopped(code));
        };
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            code = stop.stopped() => {
                self.record.lock().unwrap().closed.push((sid, Some(code)));
                return Err(Error::Stopped(code));
            }
        }
        if let Some(message) = script.fail {
            return Err(Error::NegotiationFailed(message));
        }

        let (control, remote) = DataChannel::pair("control");
        let (state_tx, state_rx) = watch::channel(LinkState::Connected);
        let state_tx = Arc::new(state_tx);
        let (extra_tx, extra_rx) = mpsc::unbounded_channel();
        let mut extra_remotes = Vec::new();
        for label in &script.extra_channels {
            let (ours, theirs) = DataChannel::pair(label);
            let _ = extra_tx.send(ours);
            extra_remotes.push(theirs);
        }

        tokio::spawn(run_node(
            sid.clone(),
            script,
            remote,
            extra_remotes,
            Arc::clone(&state_tx),
            Arc::clone(&self.record),
        ));

        let closer = SimCloser {
            session_id: sid.clone(),
            stop: stop.clone(),
            state: state_tx,
            record: Arc::clone(&self.record),
        };
        Ok(PeerLink::new(
            sid,
            Some(control),
            extra_rx,
            state_rx,
            Arc::new(closer),
        ))
    }
}

fn is_launch(frame: &Bytes) -> bool {
    frame.first() == Some(&LAUNCH_PREFIX)
}

async fn run_node(
    sid: String,
    script: NodeScript,
    mut channel: DataChannel,
    _extra: Vec<DataChannel>,
    state: Arc<watch::Sender<LinkState>>,
    record: Record,
) {
    let sentinel = || Bytes::from_static(&[SENTINEL]);
    if channel.send(sentinel()).await.is_err() {
        return;
    }
    for _ in 0..script.probe_frames {
        let Some(frame) = channel.recv().await else {
            return;
        };
        if is_launch(&frame) {
            record.lock().unwrap().early_launch.push(sid.clone());
            return;
        }
        if channel.send(frame).await.is_err() {
            return;
        }
    }

    tokio::time::sleep(script.ready_after).await;
    if channel.send(sentinel()).await.is_err() {
        return;
    }

    let Some(frame) = channel.recv().await else {
        return;
    };
    if !is_launch(&frame) {
        return;
    }
    record.lock().unwrap().launched.push(sid.clone());
    if channel.send(sentinel()).await.is_err() {
        return;
    }

    channel
        .send_text(r#"{"type":"status","str":"running"}"#)
        .await
        .ok();
    tokio::time::sleep(script.hold).await;
    if script.disconnect {
        state.send_replace(LinkState::Disconnected);
        // Keep the channel open so only the stall timer can end the session.
        while channel.recv().await.is_some() {}
        return;
    }
    let exit = format!(r#"{{"type":"exit","code":{}}}"#, script.exit_code);
    channel.send_text(exit).await.ok();
}

/// Directory returning a fixed listing
pub struct StaticDirectory {
    pub offers: Vec<NodeOffer>,
    pub queries: Mutex<Vec<NodeQuery>>,
}

impl StaticDirectory {
    pub fn new(offers: Vec<NodeOffer>) -> Self {
        Self {
            offers,
            queries: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl Directory for StaticDirectory {
    async fn list_nodes(&self, query: &NodeQuery, _stop: &StopSignal) -> Result<Vec<NodeOffer>> {
        self.queries.lock().unwrap().push(query.clone());
        Ok(self.offers.clone())
    }
}
