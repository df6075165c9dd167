use std::{env, path::PathBuf, str::FromStr, time::Duration};

use async_trait::async_trait;
use bridge_protocol::chunk::DEFAULT_CHUNK_THRESHOLD;
use dashmap::DashMap;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

pub const BACKEND_URL: &str = "PIPELINE_BACKEND_URL";
pub const POLL_INTERVAL_MS: &str = "PIPELINE_POLL_INTERVAL_MS";
pub const CONNECT_BACKOFF_MS: &str = "PIPELINE_CONNECT_BACKOFF_MS";
pub const CHUNK_THRESHOLD: &str = "PIPELINE_CHUNK_THRESHOLD";
pub const NOTIFY_ON_CHANGE: &str = "PIPELINE_NOTIFY_ON_CHANGE";
pub const API_SPECIFICATION: &str = "PIPELINE_API_SPECIFICATION";
pub const LOG_LEVEL: &str = "PIPELINE_LOG_LEVEL";
pub const LOG_DIR: &str = "PIPELINE_LOG_DIR";

const KEY_PREFIX: &str = "PIPELINE_";
const KNOWN_KEYS: [&str; 8] = [
    BACKEND_URL,
    POLL_INTERVAL_MS,
    CONNECT_BACKOFF_MS,
    CHUNK_THRESHOLD,
    NOTIFY_ON_CHANGE,
    API_SPECIFICATION,
    LOG_LEVEL,
    LOG_DIR,
];

/// Source of raw configuration values.
#[async_trait]
#[typetag::serde]
pub trait ConfigManagerType: Send + Sync {
    async fn keys(&self) -> Vec<String>;
    async fn get(&self, key: &str) -> Option<String>;
    fn clone_box(&self) -> Box<dyn ConfigManagerType>;
    fn debug_box(&self) -> String;
}

#[derive(Serialize, Deserialize)]
pub struct ConfigManager(pub Box<dyn ConfigManagerType>);

impl ConfigManager {
    pub async fn get(&self, key: &str) -> Option<String> {
        self.0.get(key).await
    }

    /// `PIPELINE_*` keys that no setting reads, most likely misspelt.
    pub async fn unknown_keys(&self) -> Vec<String> {
        let mut unknown: Vec<String> = self
            .0
            .keys()
            .await
            .into_iter()
            .filter(|k| k.starts_with(KEY_PREFIX) && !KNOWN_KEYS.contains(&k.as_str()))
            .collect();
        unknown.sort();
        unknown
    }
}

impl Clone for ConfigManager {
    fn clone(&self) -> Self {
        ConfigManager(self.0.clone_box())
    }
}

impl std::fmt::Debug for ConfigManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0.debug_box())
    }
}

/// Process environment, optionally seeded from a `.env` file.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EnvConfigManager {
    env_file: Option<PathBuf>,
}

impl EnvConfigManager {
    pub fn new(env_file: Option<PathBuf>) -> Box<Self> {
        match &env_file {
            Some(path) => match dotenvy::from_path(path) {
                Ok(()) => info!("loaded {}", path.display()),
                Err(e) => debug!("no env file at {}: {e}", path.display()),
            },
            None => {
                dotenvy::dotenv().ok();
            }
        }
        Box::new(Self { env_file })
    }
}

#[typetag::serde]
#[async_trait]
impl ConfigManagerType for EnvConfigManager {
    async fn keys(&self) -> Vec<String> {
        env::vars().map(|(k, _)| k).collect()
    }

    async fn get(&self, key: &str) -> Option<String> {
        env::var(key).ok()
    }

    fn clone_box(&self) -> Box<dyn ConfigManagerType> {
        Box::new(self.clone())
    }

    fn debug_box(&self) -> String {
        match &self.env_file {
            Some(p) => format!("EnvConfigManager({})", p.display()),
            None => "EnvConfigManager".to_string(),
        }
    }
}

/// In-memory values, for tests and embedding.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct MapConfigManager {
    #[schemars(with = "std::collections::HashMap<String, String>")]
    map: DashMap<String, String>,
}

impl MapConfigManager {
    pub fn new() -> Box<Self> {
        Box::default()
    }

    pub fn with<I, K, V>(pairs: I) -> Box<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let map = pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect();
        Box::new(Self { map })
    }
}

#[typetag::serde]
#[async_trait]
impl ConfigManagerType for MapConfigManager {
    async fn keys(&self) -> Vec<String> {
        self.map.iter().map(|entry| entry.key().clone()).collect()
    }

    async fn get(&self, key: &str) -> Option<String> {
        self.map.get(key).map(|v| v.clone())
    }

    fn clone_box(&self) -> Box<dyn ConfigManagerType> {
        Box::new(self.clone())
    }

    fn debug_box(&self) -> String {
        format!("MapConfigManager({} entries)", self.map.len())
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("{key} has an invalid value `{value}`: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Settings of one bridge instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct BridgeConfig {
    #[schemars(with = "Option<String>")]
    pub backend_url: Option<Url>,
    pub poll_interval_ms: u64,
    pub connect_backoff_ms: u64,
    pub chunk_threshold: usize,
    pub notify_on_change: bool,
    pub api_specification: Option<PathBuf>,
    pub log_level: String,
    pub log_dir: Option<PathBuf>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            backend_url: None,
            poll_interval_ms: 1500,
            connect_backoff_ms: 3000,
            chunk_threshold: DEFAULT_CHUNK_THRESHOLD,
            notify_on_change: true,
            api_specification: None,
            log_level: "info".to_string(),
            log_dir: None,
        }
    }
}

impl BridgeConfig {
    pub async fn load(config: &ConfigManager) -> Result<Self, ConfigError> {
        for key in config.unknown_keys().await {
            warn!(%key, "ignoring unknown setting");
        }
        let defaults = Self::default();
        let backend_url = match config.get(BACKEND_URL).await {
            Some(raw) if !raw.trim().is_empty() => Some(parse(BACKEND_URL, &raw)?),
            _ => None,
        };
        Ok(Self {
            backend_url,
            poll_interval_ms: parse_or(config, POLL_INTERVAL_MS, defaults.poll_interval_ms).await?,
            connect_backoff_ms: parse_or(config, CONNECT_BACKOFF_MS, defaults.connect_backoff_ms)
                .await?,
            chunk_threshold: parse_or(config, CHUNK_THRESHOLD, defaults.chunk_threshold).await?,
            notify_on_change: parse_or(config, NOTIFY_ON_CHANGE, defaults.notify_on_change).await?,
            api_specification: config.get(API_SPECIFICATION).await.map(PathBuf::from),
            log_level: config.get(LOG_LEVEL).await.unwrap_or(defaults.log_level),
            log_dir: config.get(LOG_DIR).await.map(PathBuf::from),
        })
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn connect_backoff(&self) -> Duration {
        Duration::from_millis(self.connect_backoff_ms)
    }
}

fn parse<T>(key: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
        key,
        value: raw.to_string(),
        reason: e.to_string(),
    })
}

async fn parse_or<T>(config: &ConfigManager, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match config.get(key).await {
        Some(raw) => parse(key, &raw),
        None => Ok(default),
    }
}
