//! Engine configuration, read from the environment.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use cubeflow_channels::{MAX_BATCH_SIZE, RedrivePolicy, StreamConfig};
use cubeflow_core::TileId;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}")]
    Invalid { key: &'static str, value: String },
    #[error("{key} out of range: {reason}")]
    OutOfRange { key: &'static str, reason: String },
}

/// Which channel the submitter emits to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    #[default]
    Queue,
    Stream,
}

impl FromStr for ChannelKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "queue" => Ok(Self::Queue),
            "stream" => Ok(Self::Stream),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub channel: ChannelKind,
    pub visibility_timeout: Duration,
    pub max_receive_count: u32,
    pub fanout_partitions: u32,
    pub fanout_batch_size: usize,
    pub poll_interval: Duration,
    pub dead_letter_batch: usize,
    pub auto_redrive_limit: u32,
    pub use_persistent_stores: bool,
    pub database_url: Option<String>,
    pub redis_url: String,
    pub bind_addr: String,
    /// Tiles the bundled static compute rejects. Lets a dev deployment
    /// exercise the failure and dead-letter paths.
    pub failing_tiles: Vec<TileId>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            channel: ChannelKind::Queue,
            visibility_timeout: Duration::from_secs(900),
            max_receive_count: 1,
            fanout_partitions: 4,
            fanout_batch_size: 10,
            poll_interval: Duration::from_millis(100),
            dead_letter_batch: 10,
            auto_redrive_limit: 0,
            use_persistent_stores: false,
            database_url: None,
            redis_url: "redis://localhost:6379".to_string(),
            bind_addr: "0.0.0.0:8080".to_string(),
            failing_tiles: Vec::new(),
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Missing keys keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(v) = lookup("CUBEFLOW_CHANNEL") {
            config.channel = v.parse().map_err(|_| invalid("CUBEFLOW_CHANNEL", &v))?;
        }
        if let Some(secs) = parse::<u64>(&lookup, "CUBEFLOW_VISIBILITY_TIMEOUT_SECS")? {
            config.visibility_timeout = Duration::from_secs(secs);
        }
        if let Some(n) = parse(&lookup, "CUBEFLOW_MAX_RECEIVE_COUNT")? {
            config.max_receive_count = n;
        }
        if let Some(n) = parse(&lookup, "CUBEFLOW_FANOUT_PARTITIONS")? {
            config.fanout_partitions = n;
        }
        if let Some(n) = parse(&lookup, "CUBEFLOW_FANOUT_BATCH_SIZE")? {
            config.fanout_batch_size = n;
        }
        if let Some(ms) = parse::<u64>(&lookup, "CUBEFLOW_POLL_INTERVAL_MS")? {
            config.poll_interval = Duration::from_millis(ms);
        }
        if let Some(n) = parse(&lookup, "CUBEFLOW_DEAD_LETTER_BATCH")? {
            config.dead_letter_batch = n;
        }
        if let Some(n) = parse(&lookup, "CUBEFLOW_AUTO_REDRIVE_LIMIT")? {
            config.auto_redrive_limit = n;
        }
        if let Some(flag) = parse(&lookup, "USE_PERSISTENT_STORES")? {
            config.use_persistent_stores = flag;
        }
        if let Some(url) = lookup("DATABASE_URL") {
            config.database_url = Some(url);
        }
        if let Some(url) = lookup("REDIS_URL") {
            config.redis_url = url;
        }
        if let Some(addr) = lookup("CUBEFLOW_BIND_ADDR") {
            config.bind_addr = addr;
        }
        if let Some(raw) = lookup("CUBEFLOW_FAILING_TILES") {
            config.failing_tiles = raw
                .split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(|t| t.parse().map_err(|_| invalid("CUBEFLOW_FAILING_TILES", &raw)))
                .collect::<Result<_, _>>()?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_receive_count == 0 {
            return Err(out_of_range("CUBEFLOW_MAX_RECEIVE_COUNT", "must be at least 1"));
        }
        if self.visibility_timeout.is_zero() {
            return Err(out_of_range("CUBEFLOW_VISIBILITY_TIMEOUT_SECS", "must be positive"));
        }
        if self.fanout_partitions == 0 {
            return Err(out_of_range("CUBEFLOW_FANOUT_PARTITIONS", "must be at least 1"));
        }
        if self.fanout_batch_size == 0 || self.fanout_batch_size > MAX_BATCH_SIZE {
            return Err(out_of_range(
                "CUBEFLOW_FANOUT_BATCH_SIZE",
                &format!("must be within 1..={MAX_BATCH_SIZE}"),
            ));
        }
        if self.dead_letter_batch == 0 {
            return Err(out_of_range("CUBEFLOW_DEAD_LETTER_BATCH", "must be at least 1"));
        }
        Ok(())
    }

    pub fn redrive_policy(&self) -> RedrivePolicy {
        RedrivePolicy::default()
            .with_max_receive_count(self.max_receive_count)
            .with_visibility_timeout(self.visibility_timeout)
    }

    pub fn stream_config(&self) -> StreamConfig {
        StreamConfig::default()
            .with_partitions(self.fanout_partitions)
            .with_max_batch_size(self.fanout_batch_size)
    }
}

fn parse<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &'static str) -> Result<Option<T>, ConfigError> {
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw.trim().parse().map(Some).map_err(|_| invalid(key, &raw)),
    }
}

fn invalid(key: &'static str, value: &str) -> ConfigError {
    ConfigError::Invalid {
        key,
        value: value.to_string(),
    }
}

fn out_of_range(key: &'static str, reason: &str) -> ConfigError {
    ConfigError::OutOfRange {
        key,
        reason: reason.to_string(),
    }
}
