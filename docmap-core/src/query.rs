//! Query descriptions understood by adapters.
//!
//! There is no general query planner. A native store answers a [`MatchSpec`], an
//! exact-match of field values; a view store answers a [`ViewQuery`], a named
//! precomputed index filtered by key. Adapters reject the form they cannot serve.
//!
//! ```ignore
//! use docmap_core::query::{MatchSpec, Query, ViewQuery};
//!
//! let by_name: Query = MatchSpec::new().field("name", "Alice").into();
//! let by_key: Query = ViewQuery::new("getByStrField").keys(["foo", "bar"]).into();
//! ```

use serde_json::{Map as JsonMap, Value as JsonValue};
use std::collections::BTreeMap;

use crate::{error::DocumentResult, value::Value};

/// Field values a stored document must equal, all at once.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MatchSpec {
    pairs: BTreeMap<String, Value>,
}

impl MatchSpec {
    /// An empty spec, matching every document of the type.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.pairs.insert(name.into(), value.into());
        self
    }

    pub fn pairs(&self) -> &BTreeMap<String, Value> {
        &self.pairs
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// The match pairs in transport form, comparable with serialized documents.
    pub fn to_json(&self) -> DocumentResult<JsonMap<String, JsonValue>> {
        self.pairs
            .iter()
            .map(|(name, value)| Ok((name.clone(), value.to_json()?)))
            .collect()
    }

    /// Whether a serialized document satisfies every match pair.
    pub fn matches(&self, document: &JsonMap<String, JsonValue>) -> DocumentResult<bool> {
        Ok(self
            .to_json()?
            .iter()
            .all(|(name, expected)| document.get(name).unwrap_or(&JsonValue::Null) == expected))
    }
}

/// The key filter applied to a view.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum ViewKeys {
    /// Scan the whole view.
    #[default]
    All,
    /// Rows whose key equals any of these.
    Keys(Vec<JsonValue>),
}

impl ViewKeys {
    pub fn is_keyed(&self) -> bool {
        matches!(self, ViewKeys::Keys(_))
    }
}

/// A named view of a document type, optionally filtered by key.
#[derive(Debug, Clone, PartialEq)]
pub struct ViewQuery {
    pub view: String,
    pub keys: ViewKeys,
}

impl ViewQuery {
    pub fn new(view: impl Into<String>) -> Self {
        Self { view: view.into(), keys: ViewKeys::All }
    }

    /// Filters on a single key.
    pub fn key(self, key: impl Into<JsonValue>) -> Self {
        self.keys([key])
    }

    /// Filters on any of several keys.
    pub fn keys<K: Into<JsonValue>>(mut self, keys: impl IntoIterator<Item = K>) -> Self {
        self.keys = ViewKeys::Keys(keys.into_iter().map(Into::into).collect());
        self
    }
}

/// A query handed to [`Adapter::find`](crate::backend::Adapter::find).
#[derive(Debug, Clone, PartialEq)]
pub enum Query {
    Match(MatchSpec),
    View(ViewQuery),
}

impl Query {
    /// Every document of the type.
    pub fn all() -> Self {
        Query::Match(MatchSpec::new())
    }

    pub fn view(view: impl Into<String>) -> Self {
        Query::View(ViewQuery::new(view))
    }
}

impl From<MatchSpec> for Query {
    fn from(spec: MatchSpec) -> Self {
        Query::Match(spec)
    }
}

impl From<ViewQuery> for Query {
    fn from(view: ViewQuery) -> Self {
        Query::View(view)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_match_spec_matches_serialized_documents() {
        let spec = MatchSpec::new().field("strField", "foo").field("intField", 3);
        let hit = json!({"strField": "foo", "intField": 3, "other": true});
        let miss = json!({"strField": "foo", "intField": 4});

        assert!(spec.matches(hit.as_object().unwrap()).unwrap());
        assert!(!spec.matches(miss.as_object().unwrap()).unwrap());
        assert!(MatchSpec::new().matches(miss.as_object().unwrap()).unwrap());
    }

    #[test]
    fn test_missing_field_matches_null() {
        let spec = MatchSpec::new().field("linkField", Value::Null);
        assert!(spec.matches(json!({}).as_object().unwrap()).unwrap());
    }

    #[test]
    fn test_view_keys() {
        assert_eq!(ViewQuery::new("v").keys, ViewKeys::All);
        assert_eq!(ViewQuery::new("v").key("foo").keys, ViewKeys::Keys(vec![json!("foo")]));
        assert!(ViewQuery::new("v").keys(["a", "b"]).keys.is_keyed());
    }
}
