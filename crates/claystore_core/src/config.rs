//! Adapter configuration.
//!
//! # Responsibility
//! - Describe where the adapter connects and how tables are created.
//! - Validate options once, at configuration time.
//!
//! # Invariants
//! - `database` and any table name override are valid identifiers.
//! - Options are owned per adapter; nothing is shared between instances.

use crate::db::{is_valid_identifier, ConnectOptions};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::time::Duration;

pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_PORT: u16 = 28015;

#[derive(Debug)]
pub enum ConfigError {
    MissingDatabase,
    InvalidIdentifier { field: &'static str, value: String },
    EmptyKeyField,
    InvalidIndex(String),
    InvalidRetryPolicy(String),
    Parse(serde_json::Error),
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingDatabase => write!(f, "you must pass a database name in `database`"),
            Self::InvalidIdentifier { field, value } => {
                write!(f, "`{field}` must match [A-Za-z0-9_]+, got `{value}`")
            }
            Self::EmptyKeyField => write!(f, "model key field cannot be empty"),
            Self::InvalidIndex(name) => write!(f, "invalid index field `{name}`"),
            Self::InvalidRetryPolicy(message) => write!(f, "invalid retry policy: {message}"),
            Self::Parse(err) => write!(f, "cannot parse adapter options: {err}"),
        }
    }
}

impl Error for ConfigError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Parse(err) => Some(err),
            _ => None,
        }
    }
}

/// Connect retry behavior. `max_attempts = 1` means a single attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            base_delay_ms: 100,
            max_delay_ms: 5_000,
        }
    }
}

impl RetryPolicy {
    pub fn no_retry() -> Self {
        Self::default()
    }

    pub fn exponential(max_attempts: u32, base_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            max_attempts,
            base_delay_ms,
            max_delay_ms,
        }
    }

    /// Delay to wait after failed attempt number `attempt` (1-based):
    /// `min(max_delay, base_delay * 2^(attempt - 1))`.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let millis = self
            .base_delay_ms
            .saturating_mul(1_u64 << exponent)
            .min(self.max_delay_ms);
        Duration::from_millis(millis)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::InvalidRetryPolicy(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        if self.base_delay_ms > self.max_delay_ms {
            return Err(ConfigError::InvalidRetryPolicy(format!(
                "base_delay_ms {} exceeds max_delay_ms {}",
                self.base_delay_ms, self.max_delay_ms
            )));
        }
        Ok(())
    }
}

fn default_host() -> String {
    DEFAULT_HOST.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

/// Options consumed by `ModelAdapter::configure`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdapterOptions {
    pub database: String,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default, alias = "authKey")]
    pub auth_key: Option<String>,
    /// Pass-through table creation hints.
    #[serde(default)]
    pub dbopts: Map<String, Value>,
    #[serde(default, alias = "dbname")]
    pub tablename: Option<String>,
    #[serde(default)]
    pub retry: RetryPolicy,
}

impl AdapterOptions {
    pub fn new(database: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            host: default_host(),
            port: default_port(),
            auth_key: None,
            dbopts: Map::new(),
            tablename: None,
            retry: RetryPolicy::default(),
        }
    }

    /// Parses options from a JSON object.
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(text).map_err(ConfigError::Parse)
    }

    pub fn with_endpoint(mut self, host: impl Into<String>, port: u16) -> Self {
        self.host = host.into();
        self.port = port;
        self
    }

    pub fn with_auth_key(mut self, auth_key: impl Into<String>) -> Self {
        self.auth_key = Some(auth_key.into());
        self
    }

    pub fn with_tablename(mut self, tablename: impl Into<String>) -> Self {
        self.tablename = Some(tablename.into());
        self
    }

    pub fn with_dbopt(mut self, name: impl Into<String>, value: Value) -> Self {
        self.dbopts.insert(name.into(), value);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database.trim().is_empty() {
            return Err(ConfigError::MissingDatabase);
        }
        if !is_valid_identifier(&self.database) {
            return Err(ConfigError::InvalidIdentifier {
                field: "database",
                value: self.database.clone(),
            });
        }
        if let Some(tablename) = &self.tablename {
            if !is_valid_identifier(tablename) {
                return Err(ConfigError::InvalidIdentifier {
                    field: "tablename",
                    value: tablename.clone(),
                });
            }
        }
        self.retry.validate()
    }

    /// Table name: explicit override, else the model's plural.
    pub fn resolve_tablename<'a>(&'a self, plural: &'a str) -> &'a str {
        self.tablename.as_deref().unwrap_or(plural)
    }

    pub fn connect_options(&self) -> ConnectOptions {
        ConnectOptions {
            host: self.host.clone(),
            port: self.port,
            auth_key: self.auth_key.clone(),
            database: self.database.clone(),
        }
    }
}
