use crate::conduit::codec::{encode, FrameDecoder, Request};
use crate::config::ConduitConfig;
use crate::directory::{Directory, NodeQuery};
use crate::error::{Error, Result};
use crate::peer::data_channel::{DataChannel, FrameSink};
use crate::peer::link::{Connector, LinkHandle};
use crate::peer::state::LinkState;
use crate::peer::types::NodeOffer;
use crate::signaling::pause;
use crate::stop::StopSignal;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

type Pending = oneshot::Sender<Result<Value>>;

/// Where conduits find and reach their nodes
#[derive(Clone)]
pub struct ConduitContext {
    pub directory: Arc<dyn Directory>,
    pub connector: Arc<dyn Connector>,
    pub config: ConduitConfig,
}

#[derive(Default)]
struct CallTable {
    calls: HashMap<u64, Pending>,
    closed: Option<String>,
}

struct Shared {
    table: Mutex<CallTable>,
    events: broadcast::Sender<String>,
    link: LinkHandle,
}

impl Shared {
    fn table(&self) -> MutexGuard<'_, CallTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn resolve(&self, id: u64, result: Result<Value>) {
        let pending = self.table().calls.remove(&id);
        match pending {
            Some(tx) => {
                let _ = tx.send(result);
            }
            None => debug!("Response for unknown call {}", id),
        }
    }

    /// Reject every pending call and notify subscribers. Only the first close counts.
    async fn close(&self, reason: String) {
        let drained = {
            let mut table = self.table();
            if table.closed.is_some() {
                return;
            }
            table.closed = Some(reason.clone());
            std::mem::take(&mut table.calls)
        };
        info!("Conduit closed: {} ({} pending call(s) rejected)", reason, drained.len());
        for (_, tx) in drained {
            let _ = tx.send(Err(Error::ChannelClosed(reason.clone())));
        }
        let _ = self.events.send(reason);
        self.link.close().await;
    }
}

/// JSON-RPC calls multiplexed over one data channel
pub struct ConduitService {
    shared: Arc<Shared>,
    sink: Arc<dyn FrameSink>,
    next_id: AtomicU64,
    reader: JoinHandle<()>,
}

impl ConduitService {
    pub fn new(channel: DataChannel, link: LinkHandle) -> Self {
        let (events, _) = broadcast::channel(4);
        let shared = Arc::new(Shared {
            table: Mutex::new(CallTable::default()),
            events,
            link,
        });
        let (sink, inbound) = channel.into_parts();
        let reader = tokio::spawn(read_responses(Arc::clone(&shared), inbound));
        Self {
            shared,
            sink,
            next_id: AtomicU64::new(0),
            reader,
        }
    }

    /// Call `method` and wait for its result
    pub async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: impl Serialize,
    ) -> Result<T> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let frame = encode(&Request::new(id, method, serde_json::to_value(params)?))?;

        let (tx, rx) = oneshot::channel();
        {
            let mut table = self.shared.table();
            if let Some(reason) = &table.closed {
                return Err(Error::ChannelClosed(reason.clone()));
            }
            table.calls.insert(id, tx);
        }

        debug!("RPC call {} {}", id, method);
        if let Err(e) = self.sink.send_text(frame).await {
            self.shared.table().calls.remove(&id);
            return Err(e);
        }

        let value = rx
            .await
            .map_err(|_| Error::ChannelClosed("call abandoned".to_string()))??;
        Ok(serde_json::from_value(value)?)
    }

    /// Receive the close reason when the conduit goes down
    pub fn subscribe_close(&self) -> broadcast::Receiver<String> {
        self.shared.events.subscribe()
    }

    pub fn closed_reason(&self) -> Option<String> {
        self.shared.table().closed.clone()
    }

    pub fn pending_calls(&self) -> usize {
        self.shared.table().calls.len()
    }

    pub async fn close(&self) {
        self.shared.close("closed locally".to_string()).await;
        self.reader.abort();
    }

    /// Find a node offering `service` and open a conduit to it.
    ///
    /// Retries until a connection succeeds or `stop` fires (`Ok(None)`).
    pub async fn connect(
        ctx: &ConduitContext,
        service: &str,
        ver_min: Option<String>,
        ver_max: Option<String>,
        stop: &StopSignal,
    ) -> Result<Option<ConduitService>> {
        let query = NodeQuery::capability(service).versions(ver_min, ver_max);

        while !stop.is_stopped() {
            let nodes = match ctx.directory.list_nodes(&query, stop).await {
                Ok(nodes) => nodes,
                Err(Error::Stopped(_)) => break,
                Err(e) => {
                    warn!("Directory query for {} failed: {}", service, e);
                    Vec::new()
                }
            };

            for offer in &nodes {
                match Self::connect_one(ctx.connector.as_ref(), offer, stop).await {
                    Ok(conduit) => {
                        info!(session_id = %offer.session_id, "Conduit to {} established", service);
                        return Ok(Some(conduit));
                    }
                    Err(e) => error!(session_id = %offer.session_id, "Conduit attempt failed: {}", e),
                }
                if stop.is_stopped() {
                    return Ok(None);
                }
            }

            let delay = if nodes.is_empty() {
                ctx.config.empty_retry_delay
            } else {
                ctx.config.pass_retry_delay
            };
            if !pause(delay, stop).await {
                break;
            }
        }
        Ok(None)
    }

    async fn connect_one(
        connector: &dyn Connector,
        offer: &NodeOffer,
        stop: &StopSignal,
    ) -> Result<ConduitService> {
        let link = connector.connect(offer, &stop.child()).await?;
        let (mut channels, handle) = link.split();
        match channels.next().await {
            Some(channel) => Ok(ConduitService::new(channel, handle)),
            None => {
                handle.close().await;
                Err(Error::ChannelClosed("no channel opened".to_string()))
            }
        }
    }
}

impl Drop for ConduitService {
    fn drop(&mut self) {
        self.reader.abort();
        if self.shared.table().closed.is_some() {
            return;
        }
        // Dropping an open conduit still rejects its callers and releases the link.
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let shared = Arc::clone(&self.shared);
                runtime.spawn(async move { shared.close("conduit dropped".to_string()).await });
            }
            Err(_) => warn!("Conduit dropped outside a runtime, link left open"),
        }
    }
}

async fn read_responses(
    shared: Arc<Shared>,
    mut inbound: mpsc::UnboundedReceiver<Bytes>,
) {
    let mut decoder = FrameDecoder::new();
    let mut state = shared.link.watch();

    let reason = loop {
        tokio::select! {
            data = inbound.recv() => {
                let Some(data) = data else {
                    break "channel closed".to_string();
                };
                let Some(response) = decoder.push(&data) else {
                    continue;
                };
                match response.id() {
                    Some(id) => shared.resolve(id, response.into_result()),
                    None => debug!("Ignoring response without id"),
                }
            }
            changed = state.changed() => {
                let current = match changed {
                    Ok(()) => *state.borrow_and_update(),
                    Err(_) => LinkState::Closed,
                };
                if current.is_down() {
                    break format!("link {:?}", current);
                }
            }
        }
    };
    shared.close(reason).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::link::{LinkCloser, PeerLink};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::sync::watch;

    #[derive(Default)]
    struct CountingCloser(AtomicUsize);

    #[async_trait]
    impl LinkCloser for CountingCloser {
        async fn close(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Harness {
        conduit: ConduitService,
        remote: DataChannel,
        state: watch::Sender<LinkState>,
        closer: Arc<CountingCloser>,
    }

    fn harness() -> Harness {
        let (ours, remote) = DataChannel::pair("conduit");
        let (state, state_rx) = watch::channel(LinkState::Connected);
        let closer = Arc::new(CountingCloser::default());
        let (_tx, rx) = mpsc::unbounded_channel();
        let link = PeerLink::new("c", None, rx, state_rx, closer.clone());
        Harness {
            conduit: ConduitService::new(ours, link.handle()),
            remote,
            state,
            closer,
        }
    }

    fn request_id(frame: &[u8]) -> u64 {
        let text = std::str::from_utf8(frame).unwrap();
        let body = text.split("\r\n\r\n").nth(1).unwrap();
        let value: Value = serde_json::from_str(body).unwrap();
        value["id"].as_u64().unwrap()
    }

    #[tokio::test]
    async fn test_call_resolves_by_id() {
        let Harness {
            conduit,
            mut remote,
            state: _state,
            ..
        } = harness();
        let node = tokio::spawn(async move {
            let frame = remote.recv().await.unwrap();
            let id = request_id(&frame);
            assert_eq!(id, 0);
            // Unknown id first: must be ignored
            remote
                .send_text(json!({"jsonrpc":"2.0","id":99,"result":"stray"}).to_string())
                .await
                .unwrap();
            remote
                .send_text(json!({"jsonrpc":"2.0","id":id,"result":{"sum":3}}).to_string())
                .await
                .unwrap();
            remote
        });

        let result: Value = conduit.call("add", json!([1, 2])).await.unwrap();
        assert_eq!(result, json!({"sum": 3}));
        assert_eq!(conduit.pending_calls(), 0);
        let _remote = node.await.unwrap();
    }

    #[tokio::test]
    async fn test_rpc_error_rejects_that_call() {
        let Harness {
            conduit,
            mut remote,
            state: _state,
            ..
        } = harness();
        tokio::spawn(async move {
            while let Some(frame) = remote.recv().await {
                let id = request_id(&frame);
                let reply = if id == 0 {
                    json!({"id": id, "error": {"code": -32000, "message": "boom"}})
                } else {
                    json!({"id": id, "result": "fine"})
                };
                let _ = remote.send_text(reply.to_string()).await;
            }
        });

        let failed = conduit.call::<Value>("first", ()).await;
        assert!(matches!(failed, Err(Error::Rpc { code: -32000, .. })));
        let ok: String = conduit.call("second", ()).await.unwrap();
        assert_eq!(ok, "fine");
    }

    #[tokio::test]
    async fn test_link_failure_rejects_pending_and_notifies() {
        let Harness {
            conduit,
            remote,
            state,
            closer,
        } = harness();
        let mut closed = conduit.subscribe_close();
        let conduit = Arc::new(conduit);
        let pending = {
            let conduit = Arc::clone(&conduit);
            tokio::spawn(async move { conduit.call::<Value>("slow", ()).await })
        };
        while conduit.pending_calls() == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        state.send(LinkState::Failed).unwrap();
        assert!(matches!(
            pending.await.unwrap(),
            Err(Error::ChannelClosed(_))
        ));
        assert_eq!(closed.recv().await.unwrap(), "link Failed");
        assert_eq!(closer.0.load(Ordering::SeqCst), 1);

        // Calls after close fail fast
        assert!(matches!(
            conduit.call::<Value>("late", ()).await,
            Err(Error::ChannelClosed(_))
        ));
        drop(remote);
    }

    #[tokio::test]
    async fn test_drop_closes_link_once() {
        let Harness {
            conduit,
            remote,
            state: _state,
            closer,
        } = harness();
        let mut closed = conduit.subscribe_close();
        drop(conduit);
        assert_eq!(closed.recv().await.unwrap(), "conduit dropped");
        while closer.0.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        drop(remote);

        let h = harness();
        h.conduit.close().await;
        drop(h.conduit);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(h.closer.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_remote_channel_close_closes_conduit() {
        let h = harness();
        let mut closed = h.conduit.subscribe_close();
        drop(h.remote);
        assert_eq!(closed.recv().await.unwrap(), "channel closed");
        assert_eq!(h.conduit.closed_reason().as_deref(), Some("channel closed"));
    }
}
