//! The dynamic value model shared by fields, instances and adapters.
//!
//! A [`Value`] is both the raw input handed to a field for validation and the
//! validated value stored on an instance. After validation a value conforms to its
//! field's declared kind; before validation it may be anything.

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use serde_json::{Map as JsonMap, Number, Value as JsonValue};
use std::collections::BTreeMap;

use crate::{
    document::ModelInstance,
    error::{DocumentError, DocumentResult},
};

/// A dynamically typed field value.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    /// Timestamps are always held in UTC.
    DateTime(DateTime<Utc>),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
    /// A live nested document, embedded or referenced.
    Document(Box<ModelInstance>),
    /// The bare identity of a referenced document that has not been fetched.
    Ref(String),
}

impl Value {
    /// A short name for the variant, used in validation messages.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Text(_) => "text",
            Value::DateTime(_) => "datetime",
            Value::List(_) => "list",
            Value::Map(_) => "map",
            Value::Document(_) => "document",
            Value::Ref(_) => "reference",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_datetime(&self) -> Option<&DateTime<Utc>> {
        match self {
            Value::DateTime(dt) => Some(dt),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Map(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_document(&self) -> Option<&ModelInstance> {
        match self {
            Value::Document(doc) => Some(doc),
            _ => None,
        }
    }

    pub fn as_document_mut(&mut self) -> Option<&mut ModelInstance> {
        match self {
            Value::Document(doc) => Some(doc),
            _ => None,
        }
    }

    /// The identity this value points at: the id of a bare reference, or of a live
    /// document that has been saved.
    pub fn reference_id(&self) -> Option<&str> {
        match self {
            Value::Ref(id) => Some(id),
            Value::Document(doc) => doc.id(),
            _ => None,
        }
    }

    /// Renders the value as text when it is a scalar, for use as a map key.
    pub(crate) fn scalar_text(&self) -> Option<String> {
        match self {
            Value::Bool(b) => Some(b.to_string()),
            Value::Int(i) => Some(i.to_string()),
            Value::Float(f) => Some(f.to_string()),
            Value::Text(s) => Some(s.clone()),
            Value::DateTime(dt) => Some(format_datetime(dt)),
            Value::Ref(id) => Some(id.clone()),
            _ => None,
        }
    }

    /// Converts the value to its JSON transport form without a field descriptor.
    ///
    /// Nested documents serialize in full when their schema is embedded and as their
    /// identity otherwise.
    pub fn to_json(&self) -> DocumentResult<JsonValue> {
        Ok(match self {
            Value::Null => JsonValue::Null,
            Value::Bool(b) => JsonValue::Bool(*b),
            Value::Int(i) => JsonValue::Number((*i).into()),
            Value::Float(f) => Number::from_f64(*f)
                .map(JsonValue::Number)
                .unwrap_or(JsonValue::Null),
            Value::Text(s) => JsonValue::String(s.clone()),
            Value::DateTime(dt) => JsonValue::String(format_datetime(dt)),
            Value::List(items) => JsonValue::Array(
                items
                    .iter()
                    .map(Value::to_json)
                    .collect::<DocumentResult<Vec<_>>>()?,
            ),
            Value::Map(map) => JsonValue::Object(
                map.iter()
                    .map(|(k, v)| Ok((k.clone(), v.to_json()?)))
                    .collect::<DocumentResult<JsonMap<_, _>>>()?,
            ),
            Value::Document(doc) => {
                if doc.schema().embedded() {
                    JsonValue::Object(doc.to_transport(&[], JsonMap::new())?)
                } else {
                    JsonValue::String(
                        doc.id()
                            .ok_or_else(|| {
                                DocumentError::model(format!(
                                    "referenced {} has not been saved",
                                    doc.schema().name()
                                ))
                            })?
                            .to_string(),
                    )
                }
            }
            Value::Ref(id) => JsonValue::String(id.clone()),
        })
    }
}

/// Formats a timestamp as ISO-8601 with an explicit offset.
pub fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::AutoSi, false)
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Int(value.into())
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<u32> for Value {
    fn from(value: u32) -> Self {
        Value::Int(value.into())
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(value: DateTime<Utc>) -> Self {
        Value::DateTime(value)
    }
}

/// Naive timestamps are taken to be UTC.
impl From<NaiveDateTime> for Value {
    fn from(value: NaiveDateTime) -> Self {
        Value::DateTime(value.and_utc())
    }
}

impl From<ModelInstance> for Value {
    fn from(value: ModelInstance) -> Self {
        Value::Document(Box::new(value))
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(value: Vec<T>) -> Self {
        Value::List(value.into_iter().map(Into::into).collect())
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(value: BTreeMap<String, Value>) -> Self {
        Value::Map(value)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Value::Null)
    }
}

impl From<JsonValue> for Value {
    fn from(value: JsonValue) -> Self {
        match value {
            JsonValue::Null => Value::Null,
            JsonValue::Bool(b) => Value::Bool(b),
            JsonValue::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            JsonValue::String(s) => Value::Text(s),
            JsonValue::Array(items) => Value::List(items.into_iter().map(Value::from).collect()),
            JsonValue::Object(map) => {
                Value::Map(map.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
            }
        }
    }
}
