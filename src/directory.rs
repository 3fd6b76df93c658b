//! Node directory: who is currently offering sessions

use crate::error::{Error, Result};
use crate::peer::types::NodeOffer;
use crate::stop::StopSignal;
use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, info};

/// Filter for a directory listing
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeQuery {
    /// Capability name, sent as the `Secret` header
    pub capability: Option<String>,
    /// Inclusive lower version bound
    pub ver_min: Option<String>,
    /// Inclusive upper version bound
    pub ver_max: Option<String>,
}

impl NodeQuery {
    pub fn capability(name: impl Into<String>) -> Self {
        Self {
            capability: Some(name.into()),
            ..Default::default()
        }
    }

    pub fn versions(mut self, ver_min: Option<String>, ver_max: Option<String>) -> Self {
        self.ver_min = ver_min;
        self.ver_max = ver_max;
        self
    }
}

#[async_trait]
pub trait Directory: Send + Sync {
    /// List current offers. Order carries no meaning.
    async fn list_nodes(&self, query: &NodeQuery, stop: &StopSignal) -> Result<Vec<NodeOffer>>;
}

/// Directory served over HTTP at `{endpoint}offers`
pub struct HttpDirectory {
    client: Client,
    endpoint: String,
    secret: Option<String>,
}

impl HttpDirectory {
    pub fn new(client: Client, endpoint: impl Into<String>, secret: Option<String>) -> Self {
        let mut endpoint = endpoint.into();
        if !endpoint.ends_with('/') {
            endpoint.push('/');
        }
        Self {
            client,
            endpoint,
            secret,
        }
    }

    async fn fetch(&self, query: &NodeQuery) -> Result<Vec<NodeOffer>> {
        let mut params = Vec::new();
        if let Some(v) = &query.ver_min {
            params.push(("verMin", v.as_str()));
        }
        if let Some(v) = &query.ver_max {
            params.push(("verMax", v.as_str()));
        }

        let mut request = self.client.get(format!("{}offers", self.endpoint));
        if !params.is_empty() {
            request = request.query(&params);
        }
        if let Some(secret) = query.capability.as_ref().or(self.secret.as_ref()) {
            request = request.header("Secret", secret);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::DirectoryUnavailable(format!("HTTP {status}")));
        }
        let offers: Vec<NodeOffer> = response.json().await?;
        Ok(offers)
    }
}

#[async_trait]
impl Directory for HttpDirectory {
    async fn list_nodes(&self, query: &NodeQuery, stop: &StopSignal) -> Result<Vec<NodeOffer>> {
        debug!(?query, "Listing nodes");
        let offers = tokio::select! {
            biased;
            code = stop.stopped() => return Err(Error::Stopped(code)),
            offers = self.fetch(query) => offers?,
        };
        info!("Directory listed {} offer(s)", offers.len());
        Ok(offers)
    }
}
