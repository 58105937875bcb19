//! Server configuration: TOML file plus environment overrides.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::dispatcher::DispatcherConfig;
use crate::logging::LogFormat;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading config: {0}")]
    Io(#[from] std::io::Error),

    #[error("parsing config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Where subscriptions are persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum StoreConfig {
    Memory,
    Sqlite { path: String },
    Postgres { url: String, table: String },
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig::Sqlite { path: "subscriptions.db".to_string() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: String,
    /// VAPID application server key handed to browsers, base64url.
    pub vapid_public_key: String,
    /// Upper bound for the `ttl` of a broadcast request, in seconds.
    pub max_ttl_secs: u64,
    pub log_format: LogFormat,
    pub store: StoreConfig,
    pub dispatcher: DispatcherConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8080".to_string(),
            vapid_public_key: String::new(),
            max_ttl_secs: 28 * 24 * 3600,
            log_format: LogFormat::default(),
            store: StoreConfig::default(),
            dispatcher: DispatcherConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Apply `PUSH_LISTEN`, `VAPID_PUBLIC_KEY`, `DATABASE_URL` and
    /// `SUBSCRIPTIONS_TABLE` from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_vars(|key| std::env::var(key).ok());
    }

    fn apply_vars(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(listen) = var("PUSH_LISTEN") {
            self.listen = listen;
        }
        if let Some(key) = var("VAPID_PUBLIC_KEY") {
            self.vapid_public_key = key;
        }
        if let Some(url) = var("DATABASE_URL") {
            let table = match &self.store {
                StoreConfig::Postgres { table, .. } => table.clone(),
                _ => "subscriptions".to_string(),
            };
            self.store = StoreConfig::Postgres { url, table };
        }
        if let Some(name) = var("SUBSCRIPTIONS_TABLE") {
            if let StoreConfig::Postgres { table, .. } = &mut self.store {
                *table = name;
            }
        }
    }
}
