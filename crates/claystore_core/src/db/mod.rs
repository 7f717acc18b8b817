//! Document database driver boundary and the embedded SQLite engine.
//!
//! # Responsibility
//! - Define the async execution service the adapter talks to: databases,
//!   tables, secondary indexes and JSON documents addressed by primary key.
//! - Provide an embedded implementation backed by SQLite.
//!
//! # Invariants
//! - Database, table and index names match `[A-Za-z0-9_]+`.
//! - A closed connection rejects every operation with `DriverError::Closed`.

use crate::model::Document;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::Arc;

pub mod migrations;
mod open;
pub mod sqlite;

pub use open::{open_store, open_store_in_memory};
pub use sqlite::{SqliteConnection, SqliteDriver, StoreLocation};

pub type DriverResult<T> = Result<T, DriverError>;

static IDENTIFIER_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_]+$").expect("identifier pattern is valid"));

/// Returns whether `name` may be used as a database, table or index name.
pub fn is_valid_identifier(name: &str) -> bool {
    IDENTIFIER_PATTERN.is_match(name)
}

#[derive(Debug)]
pub enum DriverError {
    Sqlite(rusqlite::Error),
    Serialization(serde_json::Error),
    UnsupportedCatalogVersion {
        store_version: u32,
        latest_supported: u32,
    },
    AuthenticationFailed,
    Closed,
    InvalidIdentifier(String),
    DatabaseNotFound(String),
    TableNotFound {
        database: String,
        table: String,
    },
    IndexNotFound {
        table: String,
        index: String,
    },
    AlreadyExists(String),
    InvalidDocument(String),
    Task(String),
}

impl Display for DriverError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sqlite(err) => write!(f, "{err}"),
            Self::Serialization(err) => write!(f, "invalid stored document: {err}"),
            Self::UnsupportedCatalogVersion {
                store_version,
                latest_supported,
            } => write!(
                f,
                "store catalog version {store_version} is newer than supported {latest_supported}"
            ),
            Self::AuthenticationFailed => write!(f, "authentication failed: wrong auth key"),
            Self::Closed => write!(f, "connection is closed"),
            Self::InvalidIdentifier(name) => write!(
                f,
                "invalid name `{name}`; only alphanumeric characters and underscores are allowed"
            ),
            Self::DatabaseNotFound(name) => write!(f, "database `{name}` does not exist"),
            Self::TableNotFound { database, table } => {
                write!(f, "table `{database}.{table}` does not exist")
            }
            Self::IndexNotFound { table, index } => {
                write!(f, "index `{index}` was not found on table `{table}`")
            }
            Self::AlreadyExists(what) => write!(f, "{what} already exists"),
            Self::InvalidDocument(message) => write!(f, "invalid document: {message}"),
            Self::Task(message) => write!(f, "storage task failed: {message}"),
        }
    }
}

impl Error for DriverError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Sqlite(err) => Some(err),
            Self::Serialization(err) => Some(err),
            _ => None,
        }
    }
}

impl From<rusqlite::Error> for DriverError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Sqlite(value)
    }
}

impl From<serde_json::Error> for DriverError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization(value)
    }
}

/// Endpoint and credentials handed to `Driver::connect`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectOptions {
    pub host: String,
    pub port: u16,
    pub auth_key: Option<String>,
    pub database: String,
}

/// Table creation options. `extra` carries caller pass-through hints such
/// as shard or replica counts; engines ignore what they do not understand.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TableOptions {
    pub primary_key: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Write summary returned by every mutating call.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WriteResult {
    pub inserted: u64,
    pub replaced: u64,
    pub unchanged: u64,
    pub skipped: u64,
    pub deleted: u64,
    pub errors: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_error: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub generated_keys: Vec<String>,
}

impl WriteResult {
    pub fn has_errors(&self) -> bool {
        self.errors > 0
    }

    pub(crate) fn error(message: impl Into<String>) -> Self {
        Self {
            errors: 1,
            first_error: Some(message.into()),
            ..Self::default()
        }
    }
}

/// Opens connections to a document database.
#[async_trait]
pub trait Driver: Send + Sync {
    async fn connect(&self, options: &ConnectOptions) -> DriverResult<Arc<dyn Connection>>;
}

/// One open connection. Every call is a suspension point; implementations
/// must be safe to share across concurrently running operations.
#[async_trait]
pub trait Connection: Send + Sync {
    async fn db_list(&self) -> DriverResult<Vec<String>>;
    async fn db_create(&self, database: &str) -> DriverResult<()>;

    async fn table_list(&self, database: &str) -> DriverResult<Vec<String>>;
    async fn table_create(
        &self,
        database: &str,
        table: &str,
        options: &TableOptions,
    ) -> DriverResult<()>;

    async fn index_list(&self, database: &str, table: &str) -> DriverResult<Vec<String>>;
    async fn index_create(&self, database: &str, table: &str, index: &str) -> DriverResult<()>;

    async fn get(&self, database: &str, table: &str, key: &str) -> DriverResult<Option<Document>>;
    /// Fetches the documents for the keys that exist. Order is unspecified.
    async fn get_all(
        &self,
        database: &str,
        table: &str,
        keys: &[String],
    ) -> DriverResult<Vec<Document>>;
    async fn get_all_by_index(
        &self,
        database: &str,
        table: &str,
        index: &str,
        value: &Value,
    ) -> DriverResult<Vec<Document>>;
    /// Every document of the table, ascending by `field`.
    async fn order_by(&self, database: &str, table: &str, field: &str)
        -> DriverResult<Vec<Document>>;

    async fn insert(
        &self,
        database: &str,
        table: &str,
        document: Document,
    ) -> DriverResult<WriteResult>;
    /// Shallow-merges `patch` into the document stored under `key`.
    async fn update(
        &self,
        database: &str,
        table: &str,
        key: &str,
        patch: Document,
    ) -> DriverResult<WriteResult>;
    async fn delete(&self, database: &str, table: &str, key: &str) -> DriverResult<WriteResult>;
    async fn delete_all(
        &self,
        database: &str,
        table: &str,
        keys: &[String],
    ) -> DriverResult<WriteResult>;

    async fn close(&self) -> DriverResult<()>;
}
