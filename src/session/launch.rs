use crate::error::Result;
use crate::session::frames::LAUNCH_PREFIX;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tracing::warn;

/// What the operator asked to launch
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LaunchConfig {
    pub game: String,
    pub node_min: Option<String>,
    pub node_max: Option<String>,
    /// Generated when absent
    pub session_id: Option<String>,
}

impl LaunchConfig {
    pub fn new(game: impl Into<String>) -> Self {
        Self {
            game: game.into(),
            ..Default::default()
        }
    }

    pub fn launch_uri(&self) -> String {
        format!("borg:games/{}", self.game)
    }
}

/// Body of the 0x15 launch frame
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct LaunchPayload {
    pub launch: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub persistence_root: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub steam_licenses: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gog_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cml: Option<Value>,
}

impl LaunchPayload {
    /// `0x15` followed by the JSON body
    pub fn encode(&self) -> Result<String> {
        let mut frame = String::from(char::from(LAUNCH_PREFIX));
        frame.push_str(&serde_json::to_string(self)?);
        Ok(frame)
    }
}

/// Account-backed extras for the launch payload
#[async_trait]
pub trait CredentialSource: Send + Sync {
    /// Whether a storage account is signed in
    fn is_logged_in(&self) -> bool;

    /// Prepare the persistence folders for `launch_uri` and return their id
    async fn persistence_root(&self, launch_uri: &str) -> Result<Option<String>>;

    async fn steam_licenses(&self) -> Result<Option<Value>>;

    async fn gog_token(&self) -> Result<Option<String>>;

    async fn minecraft_credentials(&self) -> Result<Option<Value>>;
}

/// No account: launches carry no credentials
#[derive(Debug, Default, Clone, Copy)]
pub struct Anonymous;

#[async_trait]
impl CredentialSource for Anonymous {
    fn is_logged_in(&self) -> bool {
        false
    }

    async fn persistence_root(&self, _launch_uri: &str) -> Result<Option<String>> {
        Ok(None)
    }

    async fn steam_licenses(&self) -> Result<Option<Value>> {
        Ok(None)
    }

    async fn gog_token(&self) -> Result<Option<String>> {
        Ok(None)
    }

    async fn minecraft_credentials(&self) -> Result<Option<Value>> {
        Ok(None)
    }
}

/// Everything needed to build the launch frame once an attempt wins
#[derive(Clone)]
pub struct LaunchPlan {
    pub config: LaunchConfig,
    pub persistence_root: Option<String>,
    pub credentials: Arc<dyn CredentialSource>,
}

fn tolerate<T>(what: &str, result: Result<Option<T>>) -> Option<T> {
    result.unwrap_or_else(|e| {
        warn!("{} unavailable: {}", what, e);
        None
    })
}

impl LaunchPlan {
    pub fn new(config: LaunchConfig, credentials: Arc<dyn CredentialSource>) -> Self {
        Self {
            config,
            persistence_root: None,
            credentials,
        }
    }

    pub fn with_persistence_root(mut self, root: Option<String>) -> Self {
        self.persistence_root = root;
        self
    }

    /// Credential lookups that fail are left out of the payload
    pub async fn payload(&self) -> LaunchPayload {
        let mut payload = LaunchPayload {
            launch: self.config.launch_uri(),
            ..Default::default()
        };
        if !self.credentials.is_logged_in() {
            return payload;
        }

        payload.persistence_root = self.persistence_root.clone();
        payload.steam_licenses = tolerate("Steam licenses", self.credentials.steam_licenses().await);
        payload.gog_token = tolerate("GOG token", self.credentials.gog_token().await);
        payload.cml = tolerate(
            "Minecraft credentials",
            self.credentials.minecraft_credentials().await,
        );
        payload
    }
}
