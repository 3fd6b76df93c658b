// Application configuration
// Logging defaults stay on in debug builds and quiet in release builds.

use crate::error::{Error, Result};
use crate::peer::types::ServerConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[cfg(debug_assertions)]
pub const DEFAULT_LOG_FILTER: &str = "peerlaunch=debug,info";

#[cfg(not(debug_assertions))]
pub const DEFAULT_LOG_FILTER: &str = "warn";

pub const DEFAULT_DIRECTORY: &str = "https://borg-ephemeral.azurewebsites.net/ephemeral/";

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub directory: DirectoryConfig,
    pub signaling: SignalingConfig,
    /// ICE servers; the public STUN pair is used when empty
    pub ice: Vec<ServerConfig>,
    pub race: RaceConfig,
    pub conduit: ConduitConfig,
    pub logging: LoggingConfig,
}

/// Where node offers are listed
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectoryConfig {
    pub endpoint: String,
    pub secret: Option<String>,
}

/// Direct-polling signaling service
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalingConfig {
    pub endpoint: String,
    pub secret: Option<String>,
    pub backoff: BackoffConfig,
}

/// Adaptive candidate polling thresholds
///
/// The defaults were tuned by hand against the hosted signaling service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    #[serde(with = "duration_ms")]
    pub fast_interval: Duration,
    #[serde(with = "duration_ms")]
    pub fast_window: Duration,
    #[serde(with = "duration_ms")]
    pub slow_interval: Duration,
    #[serde(with = "duration_ms")]
    pub slow_window: Duration,
    #[serde(with = "duration_ms")]
    pub idle_interval: Duration,
    /// Candidates seen after which the remote trickle is assumed finished
    pub settled_after: usize,
}

/// Launch race settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RaceConfig {
    #[serde(with = "duration_ms")]
    pub overall_timeout: Duration,
    /// How long a disconnected live session may stay down
    #[serde(with = "duration_ms")]
    pub stall_timeout: Duration,
    /// How long to wait for a channel after the remote's last candidate
    #[serde(with = "duration_ms")]
    pub end_of_candidates_grace: Duration,
    pub probe_warmup: usize,
    pub probe_samples: usize,
}

/// Conduit reconnection delays
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConduitConfig {
    #[serde(with = "duration_ms")]
    pub empty_retry_delay: Duration,
    #[serde(with = "duration_ms")]
    pub pass_retry_delay: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub enabled: bool,
    /// `EnvFilter` directives, `RUST_LOG` takes precedence
    pub filter: String,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_DIRECTORY.to_string(),
            secret: None,
        }
    }
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_DIRECTORY.to_string(),
            secret: None,
            backoff: BackoffConfig::default(),
        }
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            fast_interval: Duration::from_secs(1),
            fast_window: Duration::from_secs(5),
            slow_interval: Duration::from_secs(5),
            slow_window: Duration::from_secs(60),
            idle_interval: Duration::from_secs(3 * 60),
            settled_after: 2,
        }
    }
}

impl Default for RaceConfig {
    fn default() -> Self {
        Self {
            overall_timeout: Duration::from_secs(5 * 60),
            stall_timeout: Duration::from_secs(30),
            end_of_candidates_grace: Duration::from_secs(10),
            probe_warmup: 4,
            probe_samples: 10,
        }
    }
}

impl Default for ConduitConfig {
    fn default() -> Self {
        Self {
            empty_retry_delay: Duration::from_millis(1000),
            pass_retry_delay: Duration::from_millis(30),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            filter: DEFAULT_LOG_FILTER.to_string(),
        }
    }
}

impl Config {
    /// Load a JSON config file; missing keys keep their defaults
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let mut config: Config = serde_json::from_str(&text)?;
        config.normalize();
        config.validate()?;
        Ok(config)
    }

    /// Ensure endpoints end with `/` so paths can be appended
    pub fn normalize(&mut self) {
        for endpoint in [&mut self.directory.endpoint, &mut self.signaling.endpoint] {
            if !endpoint.ends_with('/') {
                endpoint.push('/');
            }
        }
    }

    /// Validate configuration parameters
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - an endpoint is not an http(s) URL
    /// - an ICE server has an empty URL, or a TURN server lacks credentials
    /// - the backoff windows are out of order or an interval is zero
    /// - the probe has no samples or the overall timeout is zero
    pub fn validate(&self) -> Result<()> {
        for (name, endpoint) in [
            ("directory", &self.directory.endpoint),
            ("signaling", &self.signaling.endpoint),
        ] {
            if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
                return Err(Error::InvalidConfig(format!(
                    "{name} endpoint must be an http(s) URL: {endpoint}"
                )));
            }
        }

        for server in &self.ice {
            if server.url.is_empty() {
                return Err(Error::InvalidConfig(format!(
                    "ICE server {} has an empty URL",
                    server.id
                )));
            }
            if server.r#type == "turn" && (server.username.is_none() || server.credential.is_none())
            {
                return Err(Error::InvalidConfig(format!(
                    "TURN server {} requires username and credential",
                    server.id
                )));
            }
        }

        let backoff = &self.signaling.backoff;
        if backoff.fast_interval.is_zero()
            || backoff.slow_interval.is_zero()
            || backoff.idle_interval.is_zero()
        {
            return Err(Error::InvalidConfig(
                "backoff intervals must be positive".to_string(),
            ));
        }
        if backoff.fast_window > backoff.slow_window {
            return Err(Error::InvalidConfig(
                "backoff fast_window must not exceed slow_window".to_string(),
            ));
        }
        if backoff.fast_interval > backoff.slow_interval
            || backoff.slow_interval > backoff.idle_interval
        {
            return Err(Error::InvalidConfig(
                "backoff intervals must not decrease".to_string(),
            ));
        }

        if self.race.overall_timeout.is_zero() {
            return Err(Error::InvalidConfig(
                "overall_timeout must be positive".to_string(),
            ));
        }
        if self.race.probe_samples == 0 {
            return Err(Error::InvalidConfig(
                "probe_samples must be at least 1".to_string(),
            ));
        }

        Ok(())
    }
}

/// Durations as integer milliseconds
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
