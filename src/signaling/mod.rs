//! Signal transports: how answers and candidates reach a node and back

pub mod backoff;
pub mod direct;
pub mod relay;

pub use backoff::{AdaptiveBackoff, BackoffPolicy, FixedBackoff};
pub use direct::{DirectSignal, DirectSignalFactory};
pub use relay::{
    DeltaCursor, DeltaItem, DeltaPage, RelaySignalFactory, StorageBackend, StorageRelaySignal,
};

use crate::error::Result;
use crate::stop::StopSignal;
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// One signal session with one node
#[async_trait]
pub trait SignalTransport: Send + Sync {
    fn session_id(&self) -> &str;

    /// Publish the local description (JSON text). Failure ends the attempt.
    async fn submit_answer(&self, answer: &str) -> Result<()>;

    /// Publish one local candidate (JSON text)
    async fn send_candidate(&self, candidate: &str) -> Result<()>;

    /// Poll for remote candidates, pushing each new one into `sink` once.
    ///
    /// Returns when `stop` fires, the end-of-candidates marker was delivered
    /// or the sink was dropped.
    async fn fetch_candidates(
        &self,
        sink: mpsc::UnboundedSender<String>,
        stop: &StopSignal,
    ) -> Result<()>;
}

/// Creates a transport per signal session
pub trait SignalFactory: Send + Sync {
    fn create(&self, session_id: &str) -> Arc<dyn SignalTransport>;
}

/// Distinct items seen by one polling loop
#[derive(Debug, Default)]
pub struct CandidateSet {
    seen: HashSet<String>,
}

impl CandidateSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// `true` the first time `key` is inserted
    pub fn insert(&mut self, key: &str) -> bool {
        if self.seen.contains(key) {
            return false;
        }
        self.seen.insert(key.to_string())
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

/// A candidate without a non-empty `candidate` field closes the remote trickle
pub fn is_end_of_candidates(raw: &str) -> bool {
    match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(value) => value
            .get("candidate")
            .and_then(|c| c.as_str())
            .map_or(true, str::is_empty),
        Err(_) => false,
    }
}

/// Sleep for `delay` unless stopped first. Returns `false` when stopped.
pub(crate) async fn pause(delay: Duration, stop: &StopSignal) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => !stop.is_stopped(),
        _ = stop.stopped() => false,
    }
}
