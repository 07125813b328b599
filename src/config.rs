//! Startup configuration.
//!
//! Values come from a TOML file merged with `EVENTWIRE_`-prefixed environment
//! variables (`__` separates nested keys, e.g. `EVENTWIRE_JPA__COMMAND__URL`).
//! Everything is read once and handed to the wiring by value.

use crate::error::ConfigError;
use figment::{
    Figment,
    providers::{Env, Format, Toml},
};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

pub const ENV_PREFIX: &str = "EVENTWIRE_";
pub const DEFAULT_CONFIG_FILE: &str = "config.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub loglevel: String,
    /// Prefix applied to every component name (`cs` => `cs-ds`, `cs-tx`, ...).
    pub qualifier: Option<String>,
    pub jpa: JpaConfig,
    #[serde(alias = "tokenStore")]
    pub token_store: TokenStoreConfig,
    pub snapshotter: SnapshotterConfig,
}

impl Config {
    pub fn figment(path: impl AsRef<Path>) -> Figment {
        Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let mut cfg: Config = Self::figment(path)
            .extract()
            .map_err(|e| ConfigError::Figment(Box::new(e)))?;
        if cfg.loglevel.trim().is_empty() {
            cfg.loglevel = "info".to_string();
        }
        Ok(cfg)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct JpaConfig {
    #[serde(alias = "driverClassName")]
    pub driver_class_name: String,
    pub dialect: String,
    /// Required; startup fails when unset.
    #[serde(alias = "nonContextualCreation", deserialize_with = "optional_bool_like")]
    pub non_contextual_creation: Option<bool>,
    #[serde(alias = "showSql", deserialize_with = "bool_like")]
    pub show_sql: bool,
    pub command: CommandConfig,
    pub pool: PoolConfig,
}

#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandConfig {
    pub url: String,
    pub username: String,
    pub password: String,
    /// Required; startup fails when unset.
    #[serde(alias = "ddlAuto")]
    pub ddl_auto: Option<DdlAuto>,
}

impl fmt::Debug for CommandConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandConfig")
            .field("url", &self.url)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("ddl_auto", &self.ddl_auto)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    #[serde(alias = "maxConnections")]
    pub max_connections: u32,
    #[serde(alias = "acquireTimeoutSecs")]
    pub acquire_timeout_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            acquire_timeout_secs: 30,
        }
    }
}

impl PoolConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenStoreConfig {
    #[serde(alias = "nodeId")]
    pub node_id: Option<String>,
    #[serde(alias = "claimTimeoutSecs")]
    pub claim_timeout_secs: u64,
}

impl Default for TokenStoreConfig {
    fn default() -> Self {
        Self {
            node_id: None,
            claim_timeout_secs: 10,
        }
    }
}

impl TokenStoreConfig {
    pub fn claim_timeout(&self) -> Duration {
        Duration::from_secs(self.claim_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotterConfig {
    #[serde(alias = "threadName")]
    pub thread_name: String,
    #[serde(alias = "queueCapacity")]
    pub queue_capacity: usize,
    #[serde(alias = "eventCountThreshold")]
    pub event_count_threshold: u32,
}

impl Default for SnapshotterConfig {
    fn default() -> Self {
        Self {
            thread_name: "snapshotter".to_string(),
            queue_capacity: 1024,
            event_count_threshold: 50,
        }
    }
}

/// Schema generation mode applied when the persistence unit is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DdlAuto {
    Validate,
    Update,
    Create,
    CreateDrop,
    None,
}

impl DdlAuto {
    pub fn as_str(self) -> &'static str {
        match self {
            DdlAuto::Validate => "validate",
            DdlAuto::Update => "update",
            DdlAuto::Create => "create",
            DdlAuto::CreateDrop => "create-drop",
            DdlAuto::None => "none",
        }
    }
}

impl fmt::Display for DdlAuto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DdlAuto {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "validate" => Ok(DdlAuto::Validate),
            "update" => Ok(DdlAuto::Update),
            "create" => Ok(DdlAuto::Create),
            "create-drop" => Ok(DdlAuto::CreateDrop),
            "none" => Ok(DdlAuto::None),
            _ => Err(ConfigError::InvalidDdlAuto(s.to_string())),
        }
    }
}

impl<'de> Deserialize<'de> for DdlAuto {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        value.parse().map_err(D::Error::custom)
    }
}

/// Parses `true/false`, `yes/no`, `on/off` and `1/0`, case-insensitively.
pub fn parse_bool_like(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Some(true),
        "false" | "no" | "off" | "0" => Some(false),
        _ => None,
    }
}

fn bool_like<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum BoolLike {
        Bool(bool),
        Int(i64),
        Text(String),
    }

    match BoolLike::deserialize(deserializer)? {
        BoolLike::Bool(b) => Ok(b),
        BoolLike::Int(i) => Ok(i != 0),
        BoolLike::Text(s) => parse_bool_like(&s)
            .ok_or_else(|| D::Error::custom(format!("invalid boolean-like value `{s}`"))),
    }
}

fn optional_bool_like<'de, D>(deserializer: D) -> Result<Option<bool>, D::Error>
where
    D: Deserializer<'de>,
{
    bool_like(deserializer).map(Some)
}
