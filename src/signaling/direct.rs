//! Direct-polling signaling over the hosted HTTP service

use super::{is_end_of_candidates, pause, BackoffPolicy, CandidateSet, SignalFactory, SignalTransport};
use crate::error::{Error, Result};
use crate::stop::StopSignal;
use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, RequestBuilder};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info};

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct SessionCandidates {
    #[serde(default)]
    offer_ice: Vec<Value>,
}

/// One signal session against `{endpoint}{session_id}`
pub struct DirectSignal {
    client: Client,
    endpoint: String,
    secret: Option<String>,
    session_id: String,
    backoff: Arc<dyn BackoffPolicy>,
}

impl DirectSignal {
    pub fn new(
        client: Client,
        endpoint: impl Into<String>,
        secret: Option<String>,
        session_id: impl Into<String>,
        backoff: Arc<dyn BackoffPolicy>,
    ) -> Self {
        let mut endpoint = endpoint.into();
        if !endpoint.ends_with('/') {
            endpoint.push('/');
        }
        Self {
            client,
            endpoint,
            secret,
            session_id: session_id.into(),
            backoff,
        }
    }

    fn url(&self, suffix: &str) -> String {
        format!("{}{}{}", self.endpoint, self.session_id, suffix)
    }

    fn with_secret(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.secret {
            Some(secret) => request.header("Secret", secret),
            None => request,
        }
    }

    async fn poll_once(&self) -> Result<Vec<String>> {
        let response = self.with_secret(self.client.get(self.url(""))).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::DirectoryUnavailable(format!(
                "candidate poll for {} returned HTTP {}",
                self.session_id, status
            )));
        }
        let session: SessionCandidates = response.json().await?;
        Ok(session
            .offer_ice
            .into_iter()
            .map(|value| match value {
                Value::String(raw) => raw,
                other => other.to_string(),
            })
            .collect())
    }
}

#[async_trait]
impl SignalTransport for DirectSignal {
    fn session_id(&self) -> &str {
        &self.session_id
    }

    async fn submit_answer(&self, answer: &str) -> Result<()> {
        let request = self
            .client
            .put(self.url("/answer"))
            .header(CONTENT_TYPE, "text/plain")
            .body(answer.to_string());
        let response = self
            .with_secret(request)
            .send()
            .await
            .map_err(|e| Error::AnswerRejected(e.to_string()))?;
        if !response.status().is_success() {
            return Err(Error::AnswerRejected(format!("HTTP {}", response.status())));
        }
        info!(session_id = %self.session_id, "Answer submitted");
        Ok(())
    }

    async fn send_candidate(&self, candidate: &str) -> Result<()> {
        let request = self
            .client
            .put(self.url("/answerIce"))
            .header(CONTENT_TYPE, "text/plain")
            .body(candidate.to_string());
        let response = self
            .with_secret(request)
            .send()
            .await
            .map_err(|e| Error::CandidateRejected(e.to_string()))?;
        if !response.status().is_success() {
            return Err(Error::CandidateRejected(format!(
                "HTTP {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn fetch_candidates(
        &self,
        sink: mpsc::UnboundedSender<String>,
        stop: &StopSignal,
    ) -> Result<()> {
        let started = Instant::now();
        let mut seen = CandidateSet::new();

        while !stop.is_stopped() {
            let candidates = tokio::select! {
                result = self.poll_once() => result?,
                _ = stop.stopped() => return Ok(()),
            };

            // A page is delivered whole, even past an end marker.
            let mut done = false;
            for raw in candidates {
                if !seen.insert(&raw) {
                    continue;
                }
                debug!(session_id = %self.session_id, "Remote candidate: {}", raw);
                done |= is_end_of_candidates(&raw);
                if sink.send(raw).is_err() {
                    return Ok(());
                }
            }
            if done {
                return Ok(());
            }

            let delay = self.backoff.next_delay(started.elapsed(), seen.len());
            if !pause(delay, stop).await {
                break;
            }
        }
        Ok(())
    }
}

/// Builds [`DirectSignal`]s sharing one HTTP client
pub struct DirectSignalFactory {
    client: Client,
    endpoint: String,
    secret: Option<String>,
    backoff: Arc<dyn BackoffPolicy>,
}

impl DirectSignalFactory {
    pub fn new(
        client: Client,
        endpoint: impl Into<String>,
        secret: Option<String>,
        backoff: Arc<dyn BackoffPolicy>,
    ) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
            secret,
            backoff,
        }
    }
}

impl SignalFactory for DirectSignalFactory {
    fn create(&self, session_id: &str) -> Arc<dyn SignalTransport> {
        Arc::new(DirectSignal::new(
            self.client.clone(),
            self.endpoint.clone(),
            self.secret.clone(),
            session_id,
            Arc::clone(&self.backoff),
        ))
    }
}
