//! Model collaborator contract.
//!
//! # Responsibility
//! - Describe what the adapter needs from a model type: plural table name,
//!   key field, declared indexes, key access and inflation from storage.
//! - Define the JSON document shape exchanged with storage.
//!
//! # Invariants
//! - Every persisted record carries a non-empty value under `KEY_FIELD`.
//! - The adapter never interprets record fields beyond the key field.

use serde_json::{Map, Value};
use std::error::Error;
use std::fmt::{Display, Formatter};

pub mod attachment;

/// JSON object as stored in (and read back from) a table.
pub type Document = Map<String, Value>;

/// Field holding the inline attachment mapping of an exported document.
pub const ATTACHMENTS_FIELD: &str = "_attachments";

/// Error reported by a model while initializing from a stored record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InflateError {
    message: String,
}

impl InflateError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl Display for InflateError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "cannot initialize model from storage: {}", self.message)
    }
}

impl Error for InflateError {}

impl From<serde_json::Error> for InflateError {
    fn from(value: serde_json::Error) -> Self {
        Self::new(value.to_string())
    }
}

/// A model class persisted through the adapter.
///
/// `Default` plays the role of the bare constructor: the adapter builds a
/// fresh instance and then hands it the stored record.
pub trait Model: Default + Send + Sync + 'static {
    /// Plural name, used as the primary table name unless overridden.
    const PLURAL: &'static str;
    /// Name of the primary key field inside stored records.
    const KEY_FIELD: &'static str = "key";
    /// Fields that get a secondary index and a pair of finders.
    const INDEXES: &'static [&'static str] = &[];

    /// Current key, `None` (or empty) when the instance was never keyed.
    fn key(&self) -> Option<&str>;

    /// Mutates a freshly constructed instance from a stored record.
    fn init_from_storage(&mut self, record: Document) -> Result<(), InflateError>;
}

/// Returns the key of `object` when it is present and non-empty.
pub fn required_key<M: Model>(object: &M) -> Option<&str> {
    object.key().filter(|key| !key.is_empty())
}

/// Either a bare key or a model instance, for batch deletes.
#[derive(Debug, Clone, Copy)]
pub enum KeyOrObject<'a, M> {
    Key(&'a str),
    Object(&'a M),
}

impl<'a, M: Model> KeyOrObject<'a, M> {
    /// Resolves to a non-empty key, if one is available.
    pub fn key(&self) -> Option<&'a str> {
        match self {
            Self::Key(key) => Some(*key).filter(|key| !key.is_empty()),
            Self::Object(object) => required_key(*object),
        }
    }
}

impl<'a, M> From<&'a str> for KeyOrObject<'a, M> {
    fn from(value: &'a str) -> Self {
        Self::Key(value)
    }
}

impl<'a, M> From<&'a String> for KeyOrObject<'a, M> {
    fn from(value: &'a String) -> Self {
        Self::Key(value.as_str())
    }
}

/// Selects one record or a batch, mirroring the polymorphic `get`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeySelector {
    One(String),
    Many(Vec<String>),
}

impl From<&str> for KeySelector {
    fn from(value: &str) -> Self {
        Self::One(value.to_string())
    }
}

impl From<String> for KeySelector {
    fn from(value: String) -> Self {
        Self::One(value)
    }
}

impl From<Vec<String>> for KeySelector {
    fn from(value: Vec<String>) -> Self {
        Self::Many(value)
    }
}

impl From<&[&str]> for KeySelector {
    fn from(value: &[&str]) -> Self {
        Self::Many(value.iter().map(|key| (*key).to_string()).collect())
    }
}
