#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use claystore_core::db::{
    ConnectOptions, Connection, Driver, DriverError, DriverResult, SqliteDriver, TableOptions,
    WriteResult,
};
use claystore_core::model::attachment::attachment_entry;
use claystore_core::{AdapterOptions, AttachmentBody, Document, InflateError, Model, ModelAdapter};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Widget {
    pub key: String,
    pub name: String,
    pub created: DateTime<Utc>,
    pub foozles: Vec<String>,
    pub snozzers: BTreeMap<String, Value>,
    pub is_valid: bool,
    pub count: i64,
    pub required_prop: String,
    #[serde(default)]
    pub ttl: Option<f64>,
}

impl Model for Widget {
    const PLURAL: &'static str = "models";
    const KEY_FIELD: &'static str = "key";
    const INDEXES: &'static [&'static str] = &["name"];

    fn key(&self) -> Option<&str> {
        Some(self.key.as_str())
    }

    fn init_from_storage(&mut self, record: Document) -> Result<(), InflateError> {
        *self = serde_json::from_value(Value::Object(record))?;
        Ok(())
    }
}

impl Widget {
    pub fn sample(key: &str, name: &str) -> Self {
        let mut snozzers = BTreeMap::new();
        snozzers.insert("frobnitz".to_string(), json!({"depth": 3, "tags": ["a", "b"]}));
        snozzers.insert("ratio".to_string(), json!(0.25));
        Self {
            key: key.to_string(),
            name: name.to_string(),
            created: Utc.with_ymd_and_hms(2024, 2, 29, 13, 45, 7).unwrap()
                + chrono::Duration::milliseconds(123),
            foozles: vec!["three".to_string(), "two".to_string(), "one".to_string()],
            snozzers,
            is_valid: true,
            count: 42,
            required_prop: "requirement met".to_string(),
            ttl: Some(3600.5),
        }
    }

    pub fn document(&self) -> Document {
        serde_json::to_value(self)
            .unwrap()
            .as_object()
            .cloned()
            .unwrap()
    }

    pub fn document_with(&self, attachments: &[(&str, AttachmentBody)]) -> Document {
        let mut document = self.document();
        let mut entries = Map::new();
        for (name, body) in attachments {
            entries.insert((*name).to_string(), attachment_entry(body));
        }
        document.insert("_attachments".to_string(), Value::Object(entries));
        document
    }
}

/// Bytes shaped like the start of a PNG, including NUL and high bytes.
pub fn png_bytes() -> Vec<u8> {
    let mut bytes = vec![0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a];
    bytes.extend((0..=255u8).rev());
    bytes.extend_from_slice(b"IEND");
    bytes
}

pub fn test_options() -> AdapterOptions {
    AdapterOptions::new("test")
}

pub fn connect_options() -> ConnectOptions {
    test_options().connect_options()
}

pub async fn connected_adapter() -> ModelAdapter<Widget> {
    let adapter =
        ModelAdapter::<Widget>::configure(test_options(), Arc::new(SqliteDriver::in_memory()))
            .unwrap();
    adapter.connect().await.unwrap();
    adapter
}

pub async fn provisioned_adapter() -> ModelAdapter<Widget> {
    let adapter = connected_adapter().await;
    adapter.provision().await.unwrap();
    adapter
}

pub async fn provisioned_file_adapter(path: &Path) -> ModelAdapter<Widget> {
    let adapter =
        ModelAdapter::<Widget>::configure(test_options(), Arc::new(SqliteDriver::open(path)))
            .unwrap();
    adapter.connect().await.unwrap();
    adapter.provision().await.unwrap();
    adapter
}

/// Opens an independent connection to a store file for inspection.
pub async fn inspect(path: &Path) -> Arc<dyn Connection> {
    SqliteDriver::open(path)
        .connect(&connect_options())
        .await
        .unwrap()
}

/// Wraps another driver and counts connects and issued queries.
pub struct RecordingDriver {
    inner: Arc<dyn Driver>,
    connects: AtomicUsize,
    queries: Arc<AtomicUsize>,
    failing_key: Option<String>,
}

impl RecordingDriver {
    pub fn new(inner: impl Driver + 'static) -> Arc<Self> {
        Arc::new(Self {
            inner: Arc::new(inner),
            connects: AtomicUsize::new(0),
            queries: Arc::new(AtomicUsize::new(0)),
            failing_key: None,
        })
    }

    /// Like `new`, but inserts and updates of the record keyed `key` fail.
    /// The failure is held back until another attachment write succeeds, so
    /// a sibling attachment always lands first.
    pub fn failing_writes(inner: impl Driver + 'static, key: &str) -> Arc<Self> {
        Arc::new(Self {
            inner: Arc::new(inner),
            connects: AtomicUsize::new(0),
            queries: Arc::new(AtomicUsize::new(0)),
            failing_key: Some(key.to_string()),
        })
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn queries(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Driver for RecordingDriver {
    async fn connect(&self, options: &ConnectOptions) -> DriverResult<Arc<dyn Connection>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let inner = self.inner.connect(options).await?;
        Ok(Arc::new(RecordingConnection {
            inner,
            queries: Arc::clone(&self.queries),
            failing_key: self.failing_key.clone(),
            attachment_written: Notify::new(),
        }))
    }
}

struct RecordingConnection {
    inner: Arc<dyn Connection>,
    queries: Arc<AtomicUsize>,
    failing_key: Option<String>,
    attachment_written: Notify,
}

impl RecordingConnection {
    fn bump(&self) {
        self.queries.fetch_add(1, Ordering::SeqCst);
    }

    fn fails(&self, key: Option<&str>) -> bool {
        key.is_some() && self.failing_key.as_deref() == key
    }

    async fn write_failure(&self, key: &str) -> DriverResult<WriteResult> {
        self.attachment_written.notified().await;
        Err(DriverError::Task(format!("write to `{key}` refused")))
    }

    fn written(&self, table: &str, result: &DriverResult<WriteResult>) {
        if table.ends_with("_attachments") && result.is_ok() {
            self.attachment_written.notify_one();
        }
    }
}

#[async_trait]
impl Connection for RecordingConnection {
    async fn db_list(&self) -> DriverResult<Vec<String>> {
        self.bump();
        self.inner.db_list().await
    }

    async fn db_create(&self, database: &str) -> DriverResult<()> {
        self.bump();
        self.inner.db_create(database).await
    }

    async fn table_list(&self, database: &str) -> DriverResult<Vec<String>> {
        self.bump();
        self.inner.table_list(database).await
    }

    async fn table_create(
        &self,
        database: &str,
        table: &str,
        options: &TableOptions,
    ) -> DriverResult<()> {
        self.bump();
        self.inner.table_create(database, table, options).await
    }

    async fn index_list(&self, database: &str, table: &str) -> DriverResult<Vec<String>> {
        self.bump();
        self.inner.index_list(database, table).await
    }

    async fn index_create(&self, database: &str, table: &str, index: &str) -> DriverResult<()> {
        self.bump();
        self.inner.index_create(database, table, index).await
    }

    async fn get(&self, database: &str, table: &str, key: &str) -> DriverResult<Option<Document>> {
        self.bump();
        self.inner.get(database, table, key).await
    }

    async fn get_all(
        &self,
        database: &str,
        table: &str,
        keys: &[String],
    ) -> DriverResult<Vec<Document>> {
        self.bump();
        self.inner.get_all(database, table, keys).await
    }

    async fn get_all_by_index(
        &self,
        database: &str,
        table: &str,
        index: &str,
        value: &Value,
    ) -> DriverResult<Vec<Document>> {
        self.bump();
        self.inner
            .get_all_by_index(database, table, index, value)
            .await
    }

    async fn order_by(
        &self,
        database: &str,
        table: &str,
        field: &str,
    ) -> DriverResult<Vec<Document>> {
        self.bump();
        self.inner.order_by(database, table, field).await
    }

    async fn insert(
        &self,
        database: &str,
        table: &str,
        document: Document,
    ) -> DriverResult<WriteResult> {
        self.bump();
        let key = document.get("key").and_then(Value::as_str).map(str::to_string);
        if let Some(key) = key.as_deref().filter(|key| self.fails(Some(key))) {
            return self.write_failure(key).await;
        }
        let result = self.inner.insert(database, table, document).await;
        self.written(table, &result);
        result
    }

    async fn update(
        &self,
        database: &str,
        table: &str,
        key: &str,
        patch: Document,
    ) -> DriverResult<WriteResult> {
        self.bump();
        if self.fails(Some(key)) {
            return self.write_failure(key).await;
        }
        let result = self.inner.update(database, table, key, patch).await;
        self.written(table, &result);
        result
    }

    async fn delete(&self, database: &str, table: &str, key: &str) -> DriverResult<WriteResult> {
        self.bump();
        self.inner.delete(database, table, key).await
    }

    async fn delete_all(
        &self,
        database: &str,
        table: &str,
        keys: &[String],
    ) -> DriverResult<WriteResult> {
        self.bump();
        self.inner.delete_all(database, table, keys).await
    }

    async fn close(&self) -> DriverResult<()> {
        self.inner.close().await
    }
}

/// Refuses the first `failures` connects, then delegates.
pub struct FlakyDriver {
    inner: SqliteDriver,
    failures: usize,
    attempts: AtomicUsize,
}

impl FlakyDriver {
    pub fn new(failures: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: SqliteDriver::in_memory(),
            failures,
            attempts: AtomicUsize::new(0),
        })
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Driver for FlakyDriver {
    async fn connect(&self, options: &ConnectOptions) -> DriverResult<Arc<dyn Connection>> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        if attempt < self.failures {
            return Err(DriverError::Task("connection refused".to_string()));
        }
        self.inner.connect(options).await
    }
}
