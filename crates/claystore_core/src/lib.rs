//! Document database persistence adapter for model classes.
//!
//! A `ModelAdapter<M>` stores instances of one model in a primary table and
//! their named attachments in a `<table>_attachments` side table, talking to
//! storage through the async `db::Driver`/`db::Connection` boundary.

pub mod adapter;
pub mod codec;
pub mod config;
pub mod db;
pub mod logging;
pub mod model;
pub mod repo;

pub use adapter::connection::ConnectionStatus;
pub use adapter::finders::{Finder, FinderRegistry};
pub use adapter::provision::ProvisionReport;
pub use adapter::{AdapterError, AdapterResult, Fetched, Listing, ModelAdapter, WriteAck};
pub use codec::document::{flatten, inflate, Payload};
pub use config::{AdapterOptions, ConfigError, RetryPolicy};
pub use db::{
    Connection, ConnectOptions, Driver, DriverError, DriverResult, SqliteDriver, TableOptions,
    WriteResult,
};
pub use logging::{default_log_level, init_logging, logging_status, LoggingError};
pub use model::attachment::{attachment_key, AttachmentBody, AttachmentPayload};
pub use model::{Document, InflateError, KeyOrObject, KeySelector, Model};

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
