//! Primary table access.
//!
//! # Invariants
//! - Batch calls with no keys return without touching the connection.
//! - Results come back as stored; callers decide how to inflate them.

use crate::db::{Connection, DriverResult, WriteResult};
use crate::model::Document;
use serde_json::Value;

/// Primary table of one model, bound to a borrowed connection.
pub struct DocumentTable<'conn> {
    conn: &'conn dyn Connection,
    database: &'conn str,
    table: &'conn str,
    key_field: &'conn str,
}

impl<'conn> DocumentTable<'conn> {
    pub fn new(
        conn: &'conn dyn Connection,
        database: &'conn str,
        table: &'conn str,
        key_field: &'conn str,
    ) -> Self {
        Self {
            conn,
            database,
            table,
            key_field,
        }
    }

    pub async fn get(&self, key: &str) -> DriverResult<Option<Document>> {
        self.conn.get(self.database, self.table, key).await
    }

    pub async fn get_batch(&self, keys: &[String]) -> DriverResult<Vec<Document>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        self.conn.get_all(self.database, self.table, keys).await
    }

    pub async fn get_all_by(&self, index: &str, value: &Value) -> DriverResult<Vec<Document>> {
        self.conn
            .get_all_by_index(self.database, self.table, index, value)
            .await
    }

    /// Every record, ascending by primary key.
    pub async fn all(&self) -> DriverResult<Vec<Document>> {
        self.conn
            .order_by(self.database, self.table, self.key_field)
            .await
    }

    pub async fn insert(&self, body: Document) -> DriverResult<WriteResult> {
        self.conn.insert(self.database, self.table, body).await
    }

    pub async fn update(&self, key: &str, body: Document) -> DriverResult<WriteResult> {
        self.conn.update(self.database, self.table, key, body).await
    }

    pub async fn remove(&self, key: &str) -> DriverResult<WriteResult> {
        self.conn.delete(self.database, self.table, key).await
    }

    pub async fn remove_many(&self, keys: &[String]) -> DriverResult<WriteResult> {
        if keys.is_empty() {
            return Ok(WriteResult::default());
        }
        self.conn.delete_all(self.database, self.table, keys).await
    }
}
