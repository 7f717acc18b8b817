//! Attachment side table access.
//!
//! # Invariants
//! - Records are keyed by `<owner-key>:<name>` under the model key field.
//! - Saves check for an existing record first and update it in place, so
//!   repeated saves never collide on the primary key.

use crate::db::{Connection, DriverError, DriverResult, WriteResult};
use crate::model::attachment::{attachment_key, AttachmentBody, AttachmentPayload};
use crate::model::Document;
use serde_json::Value;

pub struct AttachmentTable<'conn> {
    conn: &'conn dyn Connection,
    database: &'conn str,
    table: &'conn str,
    key_field: &'conn str,
}

impl<'conn> AttachmentTable<'conn> {
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

    /// Fetches an attachment body, `None` when no such attachment exists.
    pub async fn get(&self, owner_key: &str, name: &str) -> DriverResult<Option<AttachmentBody>> {
        let composite = attachment_key(owner_key, name);
        let Some(record) = self.conn.get(self.database, self.table, &composite).await? else {
            return Ok(None);
        };

        let body = record.get("body").unwrap_or(&Value::Null);
        AttachmentBody::from_value(body).map(Some).ok_or_else(|| {
            DriverError::InvalidDocument(format!(
                "attachment `{composite}` has an unreadable body"
            ))
        })
    }

    /// Inserts the attachment, or overwrites the existing record in place.
    pub async fn save(
        &self,
        owner_key: &str,
        attachment: &AttachmentPayload,
    ) -> DriverResult<WriteResult> {
        let composite = attachment_key(owner_key, &attachment.name);
        let existing = self.conn.get(self.database, self.table, &composite).await?;

        let mut record = Document::new();
        record.insert("name".to_string(), Value::String(attachment.name.clone()));
        record.insert("body".to_string(), attachment.body.clone());

        if existing.is_some() {
            self.conn
                .update(self.database, self.table, &composite, record)
                .await
        } else {
            record.insert(self.key_field.to_string(), Value::String(composite));
            self.conn.insert(self.database, self.table, record).await
        }
    }

    pub async fn remove(&self, owner_key: &str, name: &str) -> DriverResult<WriteResult> {
        let composite = attachment_key(owner_key, name);
        self.conn.delete(self.database, self.table, &composite).await
    }
}
