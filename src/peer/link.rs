use crate::error::Result;
use crate::peer::data_channel::DataChannel;
use crate::peer::state::LinkState;
use crate::peer::types::NodeOffer;
use crate::stop::StopSignal;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

/// Establishes a link to one node
#[async_trait]
pub trait Connector: Send + Sync {
    /// Negotiate with the node behind `offer`. Resolves once a data channel is open.
    async fn connect(&self, offer: &NodeOffer, stop: &StopSignal) -> Result<PeerLink>;
}

/// Tears down whatever carries a link
#[async_trait]
pub trait LinkCloser: Send + Sync {
    async fn close(&self);
}

/// An established link: opened channels plus connection health
pub struct PeerLink {
    channels: ChannelStream,
    handle: LinkHandle,
}

impl PeerLink {
    pub fn new(
        session_id: impl Into<String>,
        first: Option<DataChannel>,
        channels: mpsc::UnboundedReceiver<DataChannel>,
        state: watch::Receiver<LinkState>,
        closer: Arc<dyn LinkCloser>,
    ) -> Self {
        Self {
            channels: ChannelStream {
                ready: first,
                rx: channels,
            },
            handle: LinkHandle {
                session_id: session_id.into(),
                state,
                closer,
            },
        }
    }

    pub fn session_id(&self) -> &str {
        &self.handle.session_id
    }

    pub async fn next_channel(&mut self) -> Option<DataChannel> {
        self.channels.next().await
    }

    pub fn handle(&self) -> LinkHandle {
        self.handle.clone()
    }

    pub async fn close(&self) {
        self.handle.close().await
    }

    pub fn split(self) -> (ChannelStream, LinkHandle) {
        (self.channels, self.handle)
    }
}

/// Data channels in the order they opened
pub struct ChannelStream {
    ready: Option<DataChannel>,
    rx: mpsc::UnboundedReceiver<DataChannel>,
}

impl ChannelStream {
    pub async fn next(&mut self) -> Option<DataChannel> {
        match self.ready.take() {
            Some(channel) => Some(channel),
            None => self.rx.recv().await,
        }
    }
}

/// Clonable view of a link's state plus the means to close it
#[derive(Clone)]
pub struct LinkHandle {
    session_id: String,
    state: watch::Receiver<LinkState>,
    closer: Arc<dyn LinkCloser>,
}

impl LinkHandle {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn state(&self) -> LinkState {
        *self.state.borrow()
    }

    pub fn watch(&self) -> watch::Receiver<LinkState> {
        self.state.clone()
    }

    /// Resolves once the link reaches `Failed` or `Closed`
    pub async fn terminated(&self) -> LinkState {
        let mut rx = self.state.clone();
        let state = match rx.wait_for(|s| s.is_terminal()).await {
            Ok(state) => *state,
            Err(_) => LinkState::Closed,
        };
        state
    }

    pub async fn close(&self) {
        self.closer.close().await
    }
}
