//! Attachment payloads and composite attachment keys.
//!
//! # Invariants
//! - Attachment records live in `<table>_attachments`, keyed by
//!   `<owner-key>:<name>`.
//! - Names never contain `:`, so the composite key splits unambiguously at
//!   its last colon even when the owner key contains colons.
//! - Binary bodies travel as the `BINARY` pseudo-type inside JSON.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde_json::{json, Map, Value};

pub const ATTACHMENT_KEY_SEPARATOR: char = ':';
pub const PSEUDO_TYPE_FIELD: &str = "$reql_type$";
pub const BINARY_PSEUDO_TYPE: &str = "BINARY";

/// Raw content of one attachment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttachmentBody {
    Binary(Vec<u8>),
    Text(String),
}

impl AttachmentBody {
    /// Encodes the body for storage inside a JSON document.
    pub fn to_value(&self) -> Value {
        match self {
            Self::Binary(bytes) => {
                let mut map = Map::new();
                map.insert(
                    PSEUDO_TYPE_FIELD.to_string(),
                    Value::String(BINARY_PSEUDO_TYPE.to_string()),
                );
                map.insert("data".to_string(), Value::String(STANDARD.encode(bytes)));
                Value::Object(map)
            }
            Self::Text(text) => Value::String(text.clone()),
        }
    }

    /// Decodes a stored body. Returns `None` for shapes that are neither a
    /// string nor a well-formed binary pseudo-type.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(text) => Some(Self::Text(text.clone())),
            Value::Object(map) => {
                if map.get(PSEUDO_TYPE_FIELD)?.as_str()? != BINARY_PSEUDO_TYPE {
                    return None;
                }
                let data = map.get("data")?.as_str()?;
                STANDARD.decode(data).ok().map(Self::Binary)
            }
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Binary(bytes) => bytes,
            Self::Text(text) => text.as_bytes(),
        }
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.as_bytes().is_empty()
    }
}

impl From<Vec<u8>> for AttachmentBody {
    fn from(value: Vec<u8>) -> Self {
        Self::Binary(value)
    }
}

impl From<&[u8]> for AttachmentBody {
    fn from(value: &[u8]) -> Self {
        Self::Binary(value.to_vec())
    }
}

impl From<String> for AttachmentBody {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<&str> for AttachmentBody {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

/// One named attachment split out of a document by `flatten`.
///
/// `body` is kept as the JSON value found in the document so that flatten
/// stays a pure field shuffle.
#[derive(Debug, Clone, PartialEq)]
pub struct AttachmentPayload {
    pub name: String,
    pub body: Value,
}

impl AttachmentPayload {
    pub fn new(name: impl Into<String>, body: &AttachmentBody) -> Self {
        Self {
            name: name.into(),
            body: body.to_value(),
        }
    }
}

/// Builds the `_attachments` entry for one attachment inside an exported
/// document: `{ "body": <encoded body> }`.
pub fn attachment_entry(body: &AttachmentBody) -> Value {
    json!({ "body": body.to_value() })
}

pub fn is_valid_attachment_name(name: &str) -> bool {
    !name.is_empty() && !name.contains(ATTACHMENT_KEY_SEPARATOR)
}

/// Composite key of an attachment record.
pub fn attachment_key(owner_key: &str, name: &str) -> String {
    format!("{owner_key}{ATTACHMENT_KEY_SEPARATOR}{name}")
}

/// Splits a composite key back into `(owner_key, name)`.
pub fn split_attachment_key(composite: &str) -> Option<(&str, &str)> {
    composite
        .rsplit_once(ATTACHMENT_KEY_SEPARATOR)
        .filter(|(_, name)| !name.is_empty())
}
