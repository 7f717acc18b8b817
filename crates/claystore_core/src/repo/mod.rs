//! Table-level data access over a borrowed connection.
//!
//! # Responsibility
//! - Address the primary table and its `_attachments` side table.
//! - Keep driver call shapes out of model-level orchestration.
//!
//! # Invariants
//! - Repositories borrow a connection for one operation and never keep it.
//! - Attachment records are read, written and deleted only in the
//!   attachment table.

pub mod attachment_repo;
pub mod document_repo;

/// Suffix appended to the primary table name for attachment storage.
pub const ATTACHMENT_TABLE_SUFFIX: &str = "_attachments";

pub fn attachment_table_name(table: &str) -> String {
    format!("{table}{ATTACHMENT_TABLE_SUFFIX}")
}
