//! Edge configuration – reads/writes a TOML file with `EDGEBUS_*` overrides.

use std::fs;
use std::path::Path;
use std::time::Duration;

use edgebus_middleware::EdgeSettings;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config at {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("failed to write config at {path}: {source}")]
    Write {
        path: String,
        source: std::io::Error,
    },
}

/// Settings for one edge: which topic and subscription it binds, and how it
/// receives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeConfig {
    /// Topic that `send` publishes to.
    pub topic: String,

    /// Subscription that `receive_on` consumes.
    pub subscription: String,

    /// Floor for ack-deadline extensions, in seconds.
    #[serde(default = "default_min_extension_secs")]
    pub min_extension_secs: u64,

    /// Capacity of the delivery channel built by [`EdgeConfig::delivery_channel`].
    #[serde(default = "default_delivery_buffer")]
    pub delivery_buffer: usize,

    /// Concurrent receive workers.
    #[serde(default = "default_num_workers")]
    pub num_workers: usize,
}

fn default_min_extension_secs() -> u64 {
    20
}
fn default_delivery_buffer() -> usize {
    64
}
fn default_num_workers() -> usize {
    edgebus_middleware::client::DEFAULT_NUM_WORKERS
}

impl EdgeConfig {
    pub fn new(topic: impl Into<String>, subscription: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            subscription: subscription.into(),
            min_extension_secs: default_min_extension_secs(),
            delivery_buffer: default_delivery_buffer(),
            num_workers: default_num_workers(),
        }
    }

    pub fn edge_settings(&self) -> EdgeSettings {
        EdgeSettings {
            min_extension_period: Duration::from_secs(self.min_extension_secs),
        }
    }

    /// Bounded delivery channel sized by `delivery_buffer` (at least 1).
    pub fn delivery_channel<T>(&self) -> (mpsc::Sender<T>, mpsc::Receiver<T>) {
        mpsc::channel(self.delivery_buffer.max(1))
    }
}

/// Load the config from `path` and apply environment overrides.
/// Returns `None` if the file does not exist.
pub fn load_from(path: &Path) -> Result<Option<EdgeConfig>, ConfigError> {
    let Some(mut cfg) = read_from(path)? else {
        return Ok(None);
    };
    apply_env_overrides(&mut cfg);
    Ok(Some(cfg))
}

/// Parse the file at `path` as-is, without environment overrides.
pub(crate) fn read_from(path: &Path) -> Result<Option<EdgeConfig>, ConfigError> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;
    Ok(Some(toml::from_str(&raw)?))
}

/// Save the config to `path`, creating parent directories if necessary.
pub fn save_to(cfg: &EdgeConfig, path: &Path) -> Result<(), ConfigError> {
    let write_err = |source: std::io::Error| ConfigError::Write {
        path: path.display().to_string(),
        source,
    };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(write_err)?;
    }
    let raw = toml::to_string_pretty(cfg)?;
    fs::write(path, raw).map_err(write_err)
}

/// Apply `EDGEBUS_*` environment variable overrides to `cfg`.
///
/// | Variable | Config field |
/// |---|---|
/// | `EDGEBUS_TOPIC` | `topic` |
/// | `EDGEBUS_SUBSCRIPTION` | `subscription` |
/// | `EDGEBUS_MIN_EXTENSION_SECS` | `min_extension_secs` |
/// | `EDGEBUS_DELIVERY_BUFFER` | `delivery_buffer` |
/// | `EDGEBUS_NUM_WORKERS` | `num_workers` |
///
/// Values that fail to parse are ignored.
pub fn apply_env_overrides(cfg: &mut EdgeConfig) {
    if let Ok(v) = std::env::var("EDGEBUS_TOPIC") {
        cfg.topic = v;
    }
    if let Ok(v) = std::env::var("EDGEBUS_SUBSCRIPTION") {
        cfg.subscription = v;
    }
    if let Ok(v) = std::env::var("EDGEBUS_MIN_EXTENSION_SECS")
        && let Ok(secs) = v.parse::<u64>()
    {
        cfg.min_extension_secs = secs;
    }
    if let Ok(v) = std::env::var("EDGEBUS_DELIVERY_BUFFER")
        && let Ok(n) = v.parse::<usize>()
    {
        cfg.delivery_buffer = n;
    }
    if let Ok(v) = std::env::var("EDGEBUS_NUM_WORKERS")
        && let Ok(n) = v.parse::<usize>()
    {
        cfg.num_workers = n;
    }
}
