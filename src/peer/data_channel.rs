use crate::error::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;

/// What a channel is used for, decided once from its label when it opens
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelRole {
    Control,
    Persistence,
    Auth,
    Other(String),
}

impl ChannelRole {
    pub fn from_label(label: &str) -> Self {
        match label {
            "control" => ChannelRole::Control,
            "persistence" => ChannelRole::Persistence,
            "auth" => ChannelRole::Auth,
            other => ChannelRole::Other(other.to_string()),
        }
    }
}

/// Outbound half of a message channel
#[async_trait]
pub trait FrameSink: Send + Sync {
    async fn send(&self, data: Bytes) -> Result<()>;
    async fn send_text(&self, text: String) -> Result<()>;
    async fn close(&self) -> Result<()>;
}

/// An open, message-oriented channel to the remote peer
pub struct DataChannel {
    label: String,
    role: ChannelRole,
    sink: Arc<dyn FrameSink>,
    inbound: mpsc::UnboundedReceiver<Bytes>,
}

impl DataChannel {
    pub fn new(
        label: impl Into<String>,
        sink: Arc<dyn FrameSink>,
        inbound: mpsc::UnboundedReceiver<Bytes>,
    ) -> Self {
        let label = label.into();
        Self {
            role: ChannelRole::from_label(&label),
            label,
            sink,
            inbound,
        }
    }

    /// Two connected in-memory ends with the same label
    pub fn pair(label: &str) -> (DataChannel, DataChannel) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        let a = DataChannel::new(label, Arc::new(MemorySink::new(b_tx)), a_rx);
        let b = DataChannel::new(label, Arc::new(MemorySink::new(a_tx)), b_rx);
        (a, b)
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn role(&self) -> &ChannelRole {
        &self.role
    }

    /// Send a binary message
    pub async fn send(&self, data: impl Into<Bytes>) -> Result<()> {
        self.sink.send(data.into()).await
    }

    /// Send a text message
    pub async fn send_text(&self, text: impl Into<String>) -> Result<()> {
        self.sink.send_text(text.into()).await
    }

    /// Next inbound message, `None` once the channel closed
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.inbound.recv().await
    }

    /// Clonable outbound handle
    pub fn sender(&self) -> Arc<dyn FrameSink> {
        Arc::clone(&self.sink)
    }

    pub async fn close(&self) -> Result<()> {
        self.sink.close().await
    }

    /// Split into the outbound handle and the inbound queue
    pub fn into_parts(self) -> (Arc<dyn FrameSink>, mpsc::UnboundedReceiver<Bytes>) {
        (self.sink, self.inbound)
    }
}

impl fmt::Debug for DataChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataChannel")
            .field("label", &self.label)
            .field("role", &self.role)
            .finish()
    }
}

/// In-memory sink feeding the other end's inbound queue
pub struct MemorySink {
    peer: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
}

impl MemorySink {
    pub fn new(peer: mpsc::UnboundedSender<Bytes>) -> Self {
        Self {
            peer: Mutex::new(Some(peer)),
        }
    }

    fn push(&self, data: Bytes) -> Result<()> {
        let guard = self
            .peer
            .lock()
            .map_err(|_| Error::ChannelClosed("sink poisoned".to_string()))?;
        match guard.as_ref() {
            Some(tx) => tx
                .send(data)
                .map_err(|_| Error::ChannelClosed("peer dropped".to_string())),
            None => Err(Error::ChannelClosed("closed locally".to_string())),
        }
    }
}

#[async_trait]
impl FrameSink for MemorySink {
    async fn send(&self, data: Bytes) -> Result<()> {
        self.push(data)
    }

    async fn send_text(&self, text: String) -> Result<()> {
        self.push(Bytes::from(text))
    }

    async fn close(&self) -> Result<()> {
        if let Ok(mut guard) = self.peer.lock() {
            guard.take();
        }
        Ok(())
    }
}

/// Sink over a webrtc-rs data channel
pub struct RtcSink {
    dc: Arc<RTCDataChannel>,
}

#[async_trait]
impl FrameSink for RtcSink {
    async fn send(&self, data: Bytes) -> Result<()> {
        self.dc.send(&data).await?;
        Ok(())
    }

    async fn send_text(&self, text: String) -> Result<()> {
        self.dc.send_text(text).await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.dc.close().await?;
        Ok(())
    }
}

/// Common data-channel wiring: route messages into a queue and end it on close
pub fn attach_dc(dc: &Arc<RTCDataChannel>) -> DataChannel {
    let label = dc.label().to_string();
    debug!(label = %label, id = dc.id(), "attach_dc called");

    let (tx, rx) = mpsc::unbounded_channel::<Bytes>();
    // Dropping the sender on close ends the receiver.
    let inbound = Arc::new(Mutex::new(Some(tx)));

    let on_message_inbound = Arc::clone(&inbound);
    let message_label = label.clone();
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        debug!(label = %message_label, len = msg.data.len(), "Received message");
        if let Ok(guard) = on_message_inbound.lock() {
            if let Some(tx) = guard.as_ref() {
                let _ = tx.send(msg.data);
            }
        }
        Box::pin(async {})
    }));

    let close_label = label.clone();
    dc.on_close(Box::new(move || {
        debug!(label = %close_label, "Data channel closed");
        if let Ok(mut guard) = inbound.lock() {
            guard.take();
        }
        Box::pin(async {})
    }));

    dc.on_error(Box::new(move |err| {
        warn!("Data channel error: {}", err);
        Box::pin(async {})
    }));

    DataChannel::new(label, Arc::new(RtcSink { dc: Arc::clone(dc) }), rx)
}
