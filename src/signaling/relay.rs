//! Signaling through a shared cloud-storage folder
//!
//! Every message is a small file under `PCs/{pc}/connections/`. The node
//! publishes its offer as `{sid}.sdp` and its candidates as `{sid}/ice/*.ice`;
//! we answer with `{sid}.sdp.client` and `{sid}/ice/{n}.ice.client`. Inbound
//! files are discovered through the storage delta feed.

use super::{is_end_of_candidates, pause, BackoffPolicy, CandidateSet, SignalFactory, SignalTransport};
use crate::error::{Error, Result};
use crate::peer::types::NodeOffer;
use crate::stop::StopSignal;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info};

/// One entry of a delta page
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeltaItem {
    pub name: String,
    pub is_file: bool,
    /// Folder path the item lives in, when the backend reports it
    pub parent: Option<String>,
    /// File contents, when the backend delivers them inline
    pub content: Option<String>,
}

impl DeltaItem {
    pub fn file(name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            is_file: true,
            parent: None,
            content: Some(content.into()),
        }
    }
}

/// Where to continue the delta feed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeltaCursor {
    /// More items are ready; follow at once
    More(String),
    /// Caught up; poll this cursor again later
    Resume(String),
    /// The feed ended
    End,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeltaPage {
    pub items: Vec<DeltaItem>,
    pub cursor: DeltaCursor,
}

/// What the relay needs from a storage provider
#[async_trait]
pub trait StorageBackend: Send + Sync {
    async fn write(&self, path: &str, bytes: Bytes) -> Result<()>;

    /// Items changed under `path` since `cursor` (`None` = from the start).
    /// A folder that does not exist yet is [`Error::NotFound`].
    async fn delta_poll(&self, path: &str, cursor: Option<&str>) -> Result<DeltaPage>;
}

fn connections_root(pc: &str) -> String {
    format!("PCs/{pc}/connections")
}

/// Follow the delta feed of `path`, handing each page's items to `on_items`.
///
/// `on_items` returns `true` to finish the watch.
async fn watch_folder<F>(
    storage: &dyn StorageBackend,
    path: &str,
    backoff: &dyn BackoffPolicy,
    stop: &StopSignal,
    mut on_items: F,
) -> Result<bool>
where
    F: FnMut(Vec<DeltaItem>) -> (bool, usize),
{
    let started = Instant::now();
    let mut cursor: Option<String> = None;
    let mut seen = 0;

    while !stop.is_stopped() {
        let page = tokio::select! {
            page = storage.delta_poll(path, cursor.as_deref()) => page,
            _ = stop.stopped() => return Ok(false),
        };
        let page = match page {
            Ok(page) => page,
            Err(Error::NotFound(_)) => {
                debug!(path, "Folder not created yet");
                if !pause(backoff.next_delay(started.elapsed(), seen), stop).await {
                    return Ok(false);
                }
                continue;
            }
            Err(e) => return Err(e),
        };

        let (done, total) = on_items(page.items);
        seen = total;
        if done {
            return Ok(true);
        }

        match page.cursor {
            DeltaCursor::More(next) => cursor = Some(next),
            DeltaCursor::Resume(next) => {
                cursor = Some(next);
                if !pause(backoff.next_delay(started.elapsed(), seen), stop).await {
                    return Ok(false);
                }
            }
            DeltaCursor::End => return Ok(false),
        }
    }
    Ok(false)
}

/// One signal session relayed through storage
pub struct StorageRelaySignal {
    storage: Arc<dyn StorageBackend>,
    pc: String,
    session_id: String,
    next_candidate: AtomicU64,
    backoff: Arc<dyn BackoffPolicy>,
}

impl StorageRelaySignal {
    pub fn new(
        storage: Arc<dyn StorageBackend>,
        pc: impl Into<String>,
        session_id: impl Into<String>,
        backoff: Arc<dyn BackoffPolicy>,
    ) -> Self {
        Self {
            storage,
            pc: pc.into(),
            session_id: session_id.into(),
            next_candidate: AtomicU64::new(0),
            backoff,
        }
    }

    fn session_path(&self) -> String {
        format!("{}/{}", connections_root(&self.pc), self.session_id)
    }

    /// Wait for the first offer a node publishes for `pc`
    pub async fn discover_offer(
        storage: &dyn StorageBackend,
        pc: &str,
        backoff: &dyn BackoffPolicy,
        stop: &StopSignal,
    ) -> Result<Option<NodeOffer>> {
        let root = connections_root(pc);
        let mut found = None;
        watch_folder(storage, &root, backoff, stop, |items| {
            for item in items {
                if !item.is_file || !item.name.ends_with(".sdp") {
                    continue;
                }
                if item.parent.as_deref().is_some_and(|parent| parent != root) {
                    continue;
                }
                let Some(content) = item.content else {
                    continue;
                };
                let session_id = item.name.trim_end_matches(".sdp").to_string();
                let envelope = serde_json::json!({ "Offer": content });
                found = Some(NodeOffer::new(session_id, envelope.to_string()));
                return (true, 1);
            }
            (false, 0)
        })
        .await?;
        if let Some(offer) = &found {
            info!(pc, session_id = %offer.session_id, "Discovered offer");
        }
        Ok(found)
    }
}

#[async_trait]
impl SignalTransport for StorageRelaySignal {
    fn session_id(&self) -> &str {
        &self.session_id
    }

    async fn submit_answer(&self, answer: &str) -> Result<()> {
        let path = format!("{}.sdp.client", self.session_path());
        self.storage
            .write(&path, Bytes::from(answer.to_string()))
            .await
            .map_err(|e| Error::AnswerRejected(e.to_string()))?;
        info!(session_id = %self.session_id, "Answer written to {}", path);
        Ok(())
    }

    async fn send_candidate(&self, candidate: &str) -> Result<()> {
        let index = self.next_candidate.fetch_add(1, Ordering::SeqCst);
        let path = format!("{}/ice/{}.ice.client", self.session_path(), index);
        self.storage
            .write(&path, Bytes::from(candidate.to_string()))
            .await
            .map_err(|e| Error::CandidateRejected(e.to_string()))
    }

    async fn fetch_candidates(
        &self,
        sink: mpsc::UnboundedSender<String>,
        stop: &StopSignal,
    ) -> Result<()> {
        let folder = format!("{}/ice", self.session_path());
        let mut seen = CandidateSet::new();
        let session_id = self.session_id.clone();

        watch_folder(
            self.storage.as_ref(),
            &folder,
            self.backoff.as_ref(),
            stop,
            |items| {
                let mut done = false;
                for item in items {
                    if !item.is_file || !item.name.ends_with(".ice") {
                        continue;
                    }
                    let Some(content) = item.content else {
                        continue;
                    };
                    if !seen.insert(&item.name) {
                        continue;
                    }
                    debug!(session_id = %session_id, "Remote candidate {}: {}", item.name, content);
                    done |= is_end_of_candidates(&content);
                    if sink.send(content).is_err() {
                        return (true, seen.len());
                    }
                }
                (done, seen.len())
            },
        )
        .await?;
        Ok(())
    }
}

/// Builds [`StorageRelaySignal`]s for one PC folder
pub struct RelaySignalFactory {
    storage: Arc<dyn StorageBackend>,
    pc: String,
    backoff: Arc<dyn BackoffPolicy>,
}

impl RelaySignalFactory {
    pub fn new(
        storage: Arc<dyn StorageBackend>,
        pc: impl Into<String>,
        backoff: Arc<dyn BackoffPolicy>,
    ) -> Self {
        Self {
            storage,
            pc: pc.into(),
            backoff,
        }
    }
}

impl SignalFactory for RelaySignalFactory {
    fn create(&self, session_id: &str) -> Arc<dyn SignalTransport> {
        Arc::new(StorageRelaySignal::new(
            Arc::clone(&self.storage),
            self.pc.clone(),
            session_id,
            Arc::clone(&self.backoff),
        ))
    }
}
