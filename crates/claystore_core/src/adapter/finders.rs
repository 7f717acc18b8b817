//! Index finder registry.
//!
//! Every declared index field `f` gets a getter `by<F>` and an alias
//! `findBy<F>`, both resolving to the same finder. The registry is built
//! once at configuration time and never changes afterwards.

use crate::config::ConfigError;
use crate::db::is_valid_identifier;
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finder {
    field: String,
    getter: String,
    alias: String,
}

impl Finder {
    fn new(field: &str) -> Self {
        let getter = format!("by{}", capitalize(field));
        let alias = format!("find{}", capitalize(&getter));
        Self {
            field: field.to_string(),
            getter,
            alias,
        }
    }

    /// Indexed field, which is also the index name.
    pub fn field(&self) -> &str {
        &self.field
    }

    pub fn getter(&self) -> &str {
        &self.getter
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }
}

#[derive(Debug, Clone, Default)]
pub struct FinderRegistry {
    finders: Vec<Finder>,
    by_name: HashMap<String, usize>,
}

impl FinderRegistry {
    /// Registers one finder per distinct index field, in declaration order.
    pub fn from_indexes(indexes: &[&str]) -> Result<Self, ConfigError> {
        let mut registry = Self::default();
        for field in indexes {
            if !is_valid_identifier(field) {
                return Err(ConfigError::InvalidIndex((*field).to_string()));
            }
            if registry.finders.iter().any(|finder| finder.field == *field) {
                continue;
            }

            let finder = Finder::new(field);
            let slot = registry.finders.len();
            registry.by_name.insert(finder.getter.clone(), slot);
            registry.by_name.insert(finder.alias.clone(), slot);
            registry.finders.push(finder);
        }
        Ok(registry)
    }

    /// Looks a finder up by getter or alias name.
    pub fn resolve(&self, name: &str) -> Option<&Finder> {
        self.by_name.get(name).map(|slot| &self.finders[*slot])
    }

    pub fn fields(&self) -> Vec<String> {
        self.finders.iter().map(|finder| finder.field.clone()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Finder> {
        self.finders.iter()
    }

    pub fn len(&self) -> usize {
        self.finders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.finders.is_empty()
    }
}

fn capitalize(value: &str) -> String {
    let mut chars = value.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
