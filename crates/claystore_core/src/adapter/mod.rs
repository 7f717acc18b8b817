//! Model adapter: the storage backend one model class talks to.
//!
//! # Responsibility
//! - Translate model-level CRUD calls into table operations.
//! - Run the two-phase write: primary body first, then attachments.
//! - Own the connection lifecycle and schema provisioning.
//!
//! # Invariants
//! - Every operation reports exactly one outcome.
//! - Writes without a key fail before any I/O.
//! - Body and attachment writes are not atomic together: a failed
//!   attachment save leaves the body and earlier attachments in place.

use crate::codec::document::{flatten, inflate, inflate_all};
use crate::config::{AdapterOptions, ConfigError};
use crate::db::{Connection, Driver, DriverError, WriteResult};
use crate::model::attachment::{is_valid_attachment_name, AttachmentBody, AttachmentPayload};
use crate::model::{required_key, Document, InflateError, KeyOrObject, KeySelector, Model};
use crate::repo::attachment_repo::AttachmentTable;
use crate::repo::attachment_table_name;
use crate::repo::document_repo::DocumentTable;
use futures::future::try_join_all;
use log::{debug, error};
use serde_json::Value;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;

pub mod connection;
pub mod finders;
pub mod provision;

use connection::{ConnectionManager, ConnectionStatus};
use finders::FinderRegistry;
use provision::{ProvisionReport, SchemaPlan};

pub type AdapterResult<T> = Result<T, AdapterError>;

#[derive(Debug)]
pub enum AdapterError {
    Config(ConfigError),
    NotConnected,
    ConnectionClosed,
    Connection(DriverError),
    Storage(DriverError),
    MissingKey,
    InvalidAttachmentName(String),
    InvalidAttachmentBody(String),
    KeyMismatch { object: String, document: String },
    NotFound(String),
    WriteRejected(String),
    UnknownFinder(String),
    Inflate(InflateError),
}

impl AdapterError {
    /// Stable code used in log lines.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Config(_) => "config_invalid",
            Self::NotConnected => "not_connected",
            Self::ConnectionClosed => "connection_closed",
            Self::Connection(_) => "connect_failed",
            Self::Storage(_) => "storage_failed",
            Self::MissingKey => "missing_key",
            Self::InvalidAttachmentName(_) => "invalid_attachment_name",
            Self::InvalidAttachmentBody(_) => "invalid_attachment_body",
            Self::KeyMismatch { .. } => "key_mismatch",
            Self::NotFound(_) => "not_found",
            Self::WriteRejected(_) => "write_rejected",
            Self::UnknownFinder(_) => "unknown_finder",
            Self::Inflate(_) => "inflate_failed",
        }
    }
}

impl Display for AdapterError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(err) => write!(f, "{err}"),
            Self::NotConnected => write!(f, "adapter is not connected; await connect() first"),
            Self::ConnectionClosed => write!(f, "adapter connection has been shut down"),
            Self::Connection(err) => write!(f, "cannot connect: {err}"),
            Self::Storage(err) => write!(f, "{err}"),
            Self::MissingKey => write!(f, "cannot persist a document without a key"),
            Self::InvalidAttachmentName(name) => {
                write!(f, "invalid attachment name `{name}`; names cannot be empty or contain `:`")
            }
            Self::InvalidAttachmentBody(name) => write!(
                f,
                "attachment `{name}` body must be a string or binary value"
            ),
            Self::KeyMismatch { object, document } => write!(
                f,
                "document key `{document}` does not match object key `{object}`"
            ),
            Self::NotFound(key) => write!(f, "record not found: {key}"),
            Self::WriteRejected(message) => write!(f, "write rejected: {message}"),
            Self::UnknownFinder(name) => write!(f, "no finder named `{name}`"),
            Self::Inflate(err) => write!(f, "{err}"),
        }
    }
}

impl Error for AdapterError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Config(err) => Some(err),
            Self::Connection(err) | Self::Storage(err) => Some(err),
            Self::Inflate(err) => Some(err),
            _ => None,
        }
    }
}

impl From<ConfigError> for AdapterError {
    fn from(value: ConfigError) -> Self {
        Self::Config(value)
    }
}

impl From<DriverError> for AdapterError {
    fn from(value: DriverError) -> Self {
        Self::Storage(value)
    }
}

impl From<InflateError> for AdapterError {
    fn from(value: InflateError) -> Self {
        Self::Inflate(value)
    }
}

/// Acknowledgement of a save or update; displays as `OK`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteAck {
    /// Attachments written after the body.
    pub attachments: usize,
}

impl Display for WriteAck {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "OK")
    }
}

/// Result of `all`. There is no pagination, so `complete` is always true.
#[derive(Debug, Clone, PartialEq)]
pub struct Listing<M> {
    pub items: Vec<M>,
    pub complete: bool,
}

/// Result of `get_any`.
#[derive(Debug, Clone, PartialEq)]
pub enum Fetched<M> {
    One(Option<M>),
    Many(Vec<M>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteMode {
    Insert,
    Update,
}

impl WriteMode {
    fn event(self) -> &'static str {
        match self {
            Self::Insert => "doc_save",
            Self::Update => "doc_update",
        }
    }
}

/// Storage adapter for model `M`.
pub struct ModelAdapter<M: Model> {
    options: AdapterOptions,
    table: String,
    attachment_table: String,
    indexes: Vec<String>,
    finders: FinderRegistry,
    connection: ConnectionManager,
    _model: PhantomData<fn() -> M>,
}

impl<M: Model> ModelAdapter<M> {
    /// Validates `options` and builds the adapter. Does not connect.
    pub fn configure(options: AdapterOptions, driver: Arc<dyn Driver>) -> Result<Self, ConfigError> {
        options.validate()?;
        if M::KEY_FIELD.is_empty() {
            return Err(ConfigError::EmptyKeyField);
        }

        let table = options.resolve_tablename(M::PLURAL).to_string();
        if !crate::db::is_valid_identifier(&table) {
            return Err(ConfigError::InvalidIdentifier {
                field: "tablename",
                value: table,
            });
        }

        let finders = FinderRegistry::from_indexes(M::INDEXES)?;
        let connection =
            ConnectionManager::new(driver, options.connect_options(), options.retry);
        Ok(Self {
            attachment_table: attachment_table_name(&table),
            indexes: finders.fields(),
            table,
            finders,
            connection,
            options,
            _model: PhantomData,
        })
    }

    pub fn options(&self) -> &AdapterOptions {
        &self.options
    }

    pub fn database(&self) -> &str {
        &self.options.database
    }

    pub fn tablename(&self) -> &str {
        &self.table
    }

    pub fn attachment_tablename(&self) -> &str {
        &self.attachment_table
    }

    pub fn finders(&self) -> &FinderRegistry {
        &self.finders
    }

    pub async fn connect(&self) -> AdapterResult<()> {
        self.connection.connect().await
    }

    pub async fn shutdown(&self) -> AdapterResult<()> {
        self.connection.shutdown().await
    }

    pub fn status(&self) -> ConnectionStatus {
        self.connection.status()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionStatus> {
        self.connection.subscribe()
    }

    /// Ensures database, tables and indexes exist. Safe to repeat.
    pub async fn provision(&self) -> AdapterResult<ProvisionReport> {
        let started_at = Instant::now();
        let result = self.provision_inner().await;
        self.log_outcome("provision", None, started_at, &result);
        let report = result?;
        debug!(
            "event=provision module=adapter status=report database_created={} tables_created={} indexes_created={}",
            report.database_created,
            report.tables_created.len(),
            report.indexes_created.len()
        );
        Ok(report)
    }

    async fn provision_inner(&self) -> AdapterResult<ProvisionReport> {
        let conn = self.connection.handle().await?;
        let plan = SchemaPlan {
            database: &self.options.database,
            table: &self.table,
            attachment_table: &self.attachment_table,
            key_field: M::KEY_FIELD,
            dbopts: &self.options.dbopts,
            indexes: &self.indexes,
        };
        Ok(provision::provision(&*conn, &plan).await?)
    }

    /// Fetches one record; `None` when it does not exist.
    pub async fn get(&self, key: &str) -> AdapterResult<Option<M>> {
        let started_at = Instant::now();
        let result = async {
            let conn = self.connection.handle().await?;
            let record = self.documents(&*conn).get(key).await?;
            Ok::<_, AdapterError>(record.map(inflate::<M>).transpose()?)
        }
        .await;
        self.log_outcome("doc_get", Some(key), started_at, &result);
        result
    }

    /// Fetches the subset of `keys` that exist, in storage order.
    pub async fn get_batch<K: AsRef<str>>(&self, keys: &[K]) -> AdapterResult<Vec<M>> {
        let started_at = Instant::now();
        let keys: Vec<String> = keys.iter().map(|key| key.as_ref().to_string()).collect();
        let result = async {
            let conn = self.connection.handle().await?;
            let records = self.documents(&*conn).get_batch(&keys).await?;
            Ok::<_, AdapterError>(inflate_all::<M>(records)?)
        }
        .await;
        self.log_outcome("doc_get_batch", None, started_at, &result);
        result
    }

    /// Single key or key list, dispatching to `get` or `get_batch`.
    pub async fn get_any(&self, selector: impl Into<KeySelector>) -> AdapterResult<Fetched<M>> {
        match selector.into() {
            KeySelector::One(key) => self.get(&key).await.map(Fetched::One),
            KeySelector::Many(keys) => self.get_batch(&keys).await.map(Fetched::Many),
        }
    }

    /// Equality lookup through a secondary index.
    pub async fn get_all_by(&self, index: &str, value: impl Into<Value>) -> AdapterResult<Vec<M>> {
        let started_at = Instant::now();
        let value = value.into();
        let result = async {
            let conn = self.connection.handle().await?;
            let records = self.documents(&*conn).get_all_by(index, &value).await?;
            Ok::<_, AdapterError>(inflate_all::<M>(records)?)
        }
        .await;
        self.log_outcome("doc_get_all_by", None, started_at, &result);
        result
    }

    /// Runs a registered finder such as `byName` or `findByName`.
    pub async fn find_by(&self, finder: &str, value: impl Into<Value>) -> AdapterResult<Vec<M>> {
        let field = self
            .finders
            .resolve(finder)
            .ok_or_else(|| AdapterError::UnknownFinder(finder.to_string()))?
            .field()
            .to_string();
        self.get_all_by(&field, value).await
    }

    /// Every record, ascending by primary key.
    pub async fn all(&self) -> AdapterResult<Listing<M>> {
        let started_at = Instant::now();
        let result = async {
            let conn = self.connection.handle().await?;
            let records = self.documents(&*conn).all().await?;
            Ok::<_, AdapterError>(Listing {
                items: inflate_all::<M>(records)?,
                complete: true,
            })
        }
        .await;
        self.log_outcome("doc_all", None, started_at, &result);
        result
    }

    /// Inserts a new record, then writes its attachments concurrently.
    pub async fn save(&self, object: &M, document: Document) -> AdapterResult<WriteAck> {
        self.write(WriteMode::Insert, object, document).await
    }

    /// Merges into the existing record, then writes its attachments.
    pub async fn update(&self, object: &M, document: Document) -> AdapterResult<WriteAck> {
        self.write(WriteMode::Update, object, document).await
    }

    async fn write(&self, mode: WriteMode, object: &M, document: Document) -> AdapterResult<WriteAck> {
        let started_at = Instant::now();
        let key = required_key(object);
        let result = match key {
            Some(key) => self.write_inner(mode, key, document).await,
            None => Err(AdapterError::MissingKey),
        };
        self.log_outcome(mode.event(), key, started_at, &result);
        result
    }

    async fn write_inner(&self, mode: WriteMode, key: &str, document: Document) -> AdapterResult<WriteAck> {
        let mut payload = flatten(document);
        check_attachments(&payload.attachments)?;
        check_document_key::<M>(key, &payload.body)?;

        let conn = self.connection.handle().await?;
        let documents = self.documents(&*conn);
        match mode {
            WriteMode::Insert => {
                payload
                    .body
                    .entry(M::KEY_FIELD)
                    .or_insert_with(|| Value::String(key.to_string()));
                accepted(documents.insert(payload.body).await?)?;
            }
            WriteMode::Update => {
                let result = accepted(documents.update(key, payload.body).await?)?;
                if result.skipped > 0 {
                    return Err(AdapterError::NotFound(key.to_string()));
                }
            }
        }

        let attachments = self.attachments(&*conn);
        try_join_all(payload.attachments.iter().map(|attachment| {
            let attachments = &attachments;
            async move { accepted(attachments.save(key, attachment).await?) }
        }))
        .await?;

        Ok(WriteAck {
            attachments: payload.attachments.len(),
        })
    }

    /// Shallow-merges `attributes` into the stored record. Attachments are
    /// untouched; the write summary is returned as reported.
    pub async fn merge(&self, key: &str, attributes: Document) -> AdapterResult<WriteResult> {
        let started_at = Instant::now();
        let result = async {
            let conn = self.connection.handle().await?;
            Ok::<_, AdapterError>(self.documents(&*conn).update(key, attributes).await?)
        }
        .await;
        self.log_outcome("doc_merge", Some(key), started_at, &result);
        result
    }

    /// Deletes the record. Its attachments are left for the caller to
    /// remove.
    pub async fn remove(&self, object: &M) -> AdapterResult<WriteResult> {
        let started_at = Instant::now();
        let key = required_key(object);
        let result = match key {
            Some(key) => async {
                let conn = self.connection.handle().await?;
                Ok::<_, AdapterError>(self.documents(&*conn).remove(key).await?)
            }
            .await,
            None => Err(AdapterError::MissingKey),
        };
        self.log_outcome("doc_remove", key, started_at, &result);
        result
    }

    /// Deletes a mixed list of keys and objects in one batch. An empty list
    /// is a successful no-op.
    pub async fn destroy_many(&self, targets: &[KeyOrObject<'_, M>]) -> AdapterResult<WriteResult> {
        let started_at = Instant::now();
        let result = async {
            let keys = targets
                .iter()
                .map(|target| target.key().map(str::to_string).ok_or(AdapterError::MissingKey))
                .collect::<AdapterResult<Vec<_>>>()?;
            if keys.is_empty() {
                return Ok(WriteResult::default());
            }
            let conn = self.connection.handle().await?;
            Ok::<_, AdapterError>(self.documents(&*conn).remove_many(&keys).await?)
        }
        .await;
        self.log_outcome("doc_destroy_many", None, started_at, &result);
        result
    }

    /// Fetches one attachment body; `None` when it does not exist.
    pub async fn attachment(&self, key: &str, name: &str) -> AdapterResult<Option<AttachmentBody>> {
        let started_at = Instant::now();
        let result = async {
            let conn = self.connection.handle().await?;
            Ok::<_, AdapterError>(self.attachments(&*conn).get(key, name).await?)
        }
        .await;
        self.log_outcome("attachment_get", Some(key), started_at, &result);
        result
    }

    /// Inserts or overwrites one attachment of `object`.
    pub async fn save_attachment(&self, object: &M, attachment: &AttachmentPayload) -> AdapterResult<()> {
        let started_at = Instant::now();
        let key = required_key(object);
        let result = async {
            let key = key.ok_or(AdapterError::MissingKey)?;
            check_attachments(std::slice::from_ref(attachment))?;
            let conn = self.connection.handle().await?;
            accepted(self.attachments(&*conn).save(key, attachment).await?)?;
            Ok::<_, AdapterError>(())
        }
        .await;
        self.log_outcome("attachment_save", key, started_at, &result);
        result
    }

    /// Deletes one attachment of `object` from the attachment table.
    pub async fn remove_attachment(&self, object: &M, name: &str) -> AdapterResult<WriteResult> {
        let started_at = Instant::now();
        let key = required_key(object);
        let result = async {
            let key = key.ok_or(AdapterError::MissingKey)?;
            let conn = self.connection.handle().await?;
            Ok::<_, AdapterError>(self.attachments(&*conn).remove(key, name).await?)
        }
        .await;
        self.log_outcome("attachment_remove", key, started_at, &result);
        result
    }

    fn documents<'c>(&'c self, conn: &'c dyn Connection) -> DocumentTable<'c> {
        DocumentTable::new(conn, &self.options.database, &self.table, M::KEY_FIELD)
    }

    fn attachments<'c>(&'c self, conn: &'c dyn Connection) -> AttachmentTable<'c> {
        AttachmentTable::new(conn, &self.options.database, &self.attachment_table, M::KEY_FIELD)
    }

    fn log_outcome<T>(
        &self,
        event: &str,
        key: Option<&str>,
        started_at: Instant,
        result: &AdapterResult<T>,
    ) {
        let key = key.unwrap_or("-");
        match result {
            Ok(_) => debug!(
                "event={event} module=adapter status=ok table={} key={key} duration_ms={}",
                self.table,
                started_at.elapsed().as_millis()
            ),
            Err(err) => error!(
                "event={event} module=adapter status=error table={} key={key} duration_ms={} error_code={} error={}",
                self.table,
                started_at.elapsed().as_millis(),
                err.code(),
                err
            ),
        }
    }
}

/// Rejects attachments that could not be read back once stored.
fn check_attachments(attachments: &[AttachmentPayload]) -> AdapterResult<()> {
    for attachment in attachments {
        if !is_valid_attachment_name(&attachment.name) {
            return Err(AdapterError::InvalidAttachmentName(attachment.name.clone()));
        }
        if AttachmentBody::from_value(&attachment.body).is_none() {
            return Err(AdapterError::InvalidAttachmentBody(attachment.name.clone()));
        }
    }
    Ok(())
}

/// The body may omit the key field, but must not name another record.
fn check_document_key<M: Model>(key: &str, body: &Document) -> AdapterResult<()> {
    match body.get(M::KEY_FIELD) {
        None | Some(Value::Null) => Ok(()),
        Some(Value::String(document)) if document == key => Ok(()),
        Some(other) => Err(AdapterError::KeyMismatch {
            object: key.to_string(),
            document: other.as_str().map_or_else(|| other.to_string(), str::to_string),
        }),
    }
}

/// Turns a write summary carrying errors into `WriteRejected`.
fn accepted(result: WriteResult) -> AdapterResult<WriteResult> {
    if result.has_errors() {
        let message = result
            .first_error
            .unwrap_or_else(|| "unknown write error".to_string());
        return Err(AdapterError::WriteRejected(message));
    }
    Ok(result)
}
