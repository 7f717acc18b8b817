//! Flatten and inflate.
//!
//! # Invariants
//! - `flatten` is pure: no I/O, no shared state.
//! - Attachment order follows the insertion order of `_attachments`.
//! - Inflation never interprets record fields; the model does.

use crate::model::attachment::AttachmentPayload;
use crate::model::{Document, InflateError, Model, ATTACHMENTS_FIELD};
use serde_json::Value;

/// A document split into its stored body and its attachments.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Payload {
    pub body: Document,
    pub attachments: Vec<AttachmentPayload>,
}

/// Removes the `_attachments` mapping from `document` and returns it as
/// `{name, body}` pairs next to the remaining fields.
///
/// Entries whose value is an object carrying `body` contribute that body;
/// any other entry value is taken as the body itself. A non-object
/// `_attachments` field yields no attachments.
pub fn flatten(mut document: Document) -> Payload {
    let attachments = match document.remove(ATTACHMENTS_FIELD) {
        Some(Value::Object(entries)) => entries
            .into_iter()
            .map(|(name, entry)| AttachmentPayload {
                name,
                body: match entry {
                    Value::Object(mut fields) if fields.contains_key("body") => {
                        fields.remove("body").unwrap_or(Value::Null)
                    }
                    other => other,
                },
            })
            .collect(),
        _ => Vec::new(),
    };

    Payload {
        body: document,
        attachments,
    }
}

/// Builds a fresh model instance and initializes it from `record`.
pub fn inflate<M: Model>(record: Document) -> Result<M, InflateError> {
    let mut object = M::default();
    object.init_from_storage(record)?;
    Ok(object)
}

pub fn inflate_all<M: Model>(records: Vec<Document>) -> Result<Vec<M>, InflateError> {
    records.into_iter().map(inflate).collect()
}

#[cfg(test)]
mod tests {
    use super::{flatten, inflate, inflate_all};
    use crate::model::attachment::{attachment_entry, AttachmentBody};
    use crate::model::{Document, InflateError, Model};
    use serde_json::{json, Value};

    fn doc(value: Value) -> Document {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn flatten_separates_attachments_in_insertion_order() {
        let mut document = doc(json!({"key": "1", "name": "one"}));
        let mut attachments = serde_json::Map::new();
        attachments.insert(
            "zeta".to_string(),
            attachment_entry(&AttachmentBody::from("z")),
        );
        attachments.insert(
            "alpha".to_string(),
            attachment_entry(&AttachmentBody::Binary(vec![1, 2])),
        );
        document.insert("_attachments".to_string(), Value::Object(attachments));

        let payload = flatten(document);
        assert_eq!(payload.body, doc(json!({"key": "1", "name": "one"})));
        let names: Vec<_> = payload.attachments.iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, vec!["zeta", "alpha"]);
        assert_eq!(payload.attachments[0].body, json!("z"));
        assert_eq!(
            AttachmentBody::from_value(&payload.attachments[1].body),
            Some(AttachmentBody::Binary(vec![1, 2]))
        );
    }

    #[test]
    fn flatten_without_attachments_keeps_body() {
        let payload = flatten(doc(json!({"key": "1", "count": 3})));
        assert!(payload.attachments.is_empty());
        assert_eq!(payload.body, doc(json!({"key": "1", "count": 3})));
    }

    #[test]
    fn flatten_drops_non_object_attachment_field() {
        let payload = flatten(doc(json!({"key": "1", "_attachments": null})));
        assert!(payload.attachments.is_empty());
        assert!(!payload.body.contains_key("_attachments"));
    }

    #[derive(Default, Debug)]
    struct Echo {
        key: Option<String>,
        fields: usize,
    }

    impl Model for Echo {
        const PLURAL: &'static str = "echoes";

        fn key(&self) -> Option<&str> {
            self.key.as_deref()
        }

        fn init_from_storage(&mut self, record: Document) -> Result<(), InflateError> {
            self.key = record
                .get("key")
                .and_then(Value::as_str)
                .map(str::to_string);
            if self.key.is_none() {
                return Err(InflateError::new("record has no key"));
            }
            self.fields = record.len();
            Ok(())
        }
    }

    #[test]
    fn inflate_builds_instances_through_the_model() {
        let echo: Echo = inflate(doc(json!({"key": "a", "x": 1}))).unwrap();
        assert_eq!(echo.key.as_deref(), Some("a"));
        assert_eq!(echo.fields, 2);

        let err = inflate_all::<Echo>(vec![doc(json!({"key": "a"})), doc(json!({"x": 1}))])
            .unwrap_err();
        assert_eq!(err.message(), "record has no key");
    }
}
