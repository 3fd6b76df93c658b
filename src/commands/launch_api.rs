use crate::arbitrator::{Arbitrator, ChannelServices, LaunchContext};
use crate::config::Config;
use crate::directory::{Directory, HttpDirectory, NodeQuery};
use crate::error::Result;
use crate::peer::negotiator::WebRtcConnector;
use crate::peer::types::NodeOffer;
use crate::session::launch::{Anonymous, LaunchConfig};
use crate::signaling::{AdaptiveBackoff, DirectSignalFactory};
use crate::stop::StopSignal;
use reqwest::Client;
use std::sync::Arc;
use tracing::info;

fn http_client() -> Result<Client> {
    Ok(Client::builder().build()?)
}

/// Wire the production collaborators from `config`
pub fn launch_context(config: &Config) -> Result<LaunchContext> {
    let client = http_client()?;
    let directory = HttpDirectory::new(
        client.clone(),
        config.directory.endpoint.clone(),
        config.directory.secret.clone(),
    );
    let signals = DirectSignalFactory::new(
        client,
        config.signaling.endpoint.clone(),
        config.signaling.secret.clone(),
        Arc::new(AdaptiveBackoff::new(config.signaling.backoff.clone())),
    );
    let connector = WebRtcConnector::new(
        Arc::new(signals),
        config.ice.clone(),
        config.race.end_of_candidates_grace,
    );

    Ok(LaunchContext {
        config: config.clone(),
        directory: Arc::new(directory),
        connector: Arc::new(connector),
        credentials: Arc::new(Anonymous),
        services: ChannelServices::default(),
    })
}

/// Launch `request` on the first node to answer; returns its exit code
pub async fn launch(config: &Config, request: LaunchConfig, stop: StopSignal) -> Result<i32> {
    let ctx = Arc::new(launch_context(config)?);
    let code = Arbitrator::with_stop(ctx, stop).launch(request).await?;
    info!("Session ended with code {}", code);
    Ok(code)
}

/// Current directory listing
pub async fn list_nodes(
    config: &Config,
    capability: Option<String>,
    stop: &StopSignal,
) -> Result<Vec<NodeOffer>> {
    let directory = HttpDirectory::new(
        http_client()?,
        config.directory.endpoint.clone(),
        config.directory.secret.clone(),
    );
    let query = NodeQuery {
        capability,
        ..Default::default()
    };
    directory.list_nodes(&query, stop).await
}
