//! Typed, self-validating field descriptors.
//!
//! A [`FieldSpec`] describes one attribute of a document: its [`FieldKind`], whether
//! mismatched values may be coerced, an optional extra validator and a default. Kinds
//! form a closed enumeration, so validation and serialization are a single `match`
//! that recurses through lists, maps and nested specs.
//!
//! # Example
//!
//! ```ignore
//! use docmap_core::field::FieldSpec;
//!
//! let score = FieldSpec::int()
//!     .with_default(0)
//!     .with_validator(|value| match value.as_i64() {
//!         Some(n) if !(0..=10).contains(&n) => Err(ValidationError::new("out of range")),
//!         _ => Ok(()),
//!     });
//! assert_eq!(score.validate("7".into(), &catalog)?, Value::Int(7));
//! ```

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde_json::{Map as JsonMap, Value as JsonValue};
use std::{collections::BTreeMap, fmt, sync::Arc};

use crate::{
    document::ModelInstance,
    error::{DocumentError, DocumentResult, ValidationError},
    schema::Catalog,
    value::Value,
};

/// The scalar types a field can declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalarType {
    /// Accepts any value unchanged.
    Any,
    Bool,
    Int,
    Float,
    Text,
    /// A timestamp. Text without an explicit offset is taken to be UTC.
    DateTime,
}

impl ScalarType {
    fn matches(&self, value: &Value) -> bool {
        matches!(
            (self, value),
            (ScalarType::Any, _)
                | (ScalarType::Bool, Value::Bool(_))
                | (ScalarType::Int, Value::Int(_))
                | (ScalarType::Float, Value::Float(_))
                | (ScalarType::Text, Value::Text(_))
                | (ScalarType::DateTime, Value::DateTime(_))
        )
    }

    fn cast(&self, value: &Value) -> Option<Value> {
        match (self, value) {
            (ScalarType::Int, Value::Bool(b)) => Some(Value::Int(i64::from(*b))),
            (ScalarType::Int, Value::Float(f)) => {
                let whole = f.trunc();
                // The upper bound is exclusive: i64::MAX rounds up to 2^63 as f64.
                (whole >= i64::MIN as f64 && whole < i64::MAX as f64).then(|| Value::Int(whole as i64))
            }
            (ScalarType::Int, Value::Text(s)) => s.trim().parse().ok().map(Value::Int),
            (ScalarType::Float, Value::Int(i)) => Some(Value::Float(*i as f64)),
            (ScalarType::Float, Value::Bool(b)) => Some(Value::Float(if *b { 1.0 } else { 0.0 })),
            (ScalarType::Float, Value::Text(s)) => s.trim().parse().ok().map(Value::Float),
            (ScalarType::Text, other) => other.scalar_text().map(Value::Text),
            (ScalarType::Bool, Value::Int(i)) => Some(Value::Bool(*i != 0)),
            (ScalarType::Bool, Value::Float(f)) => Some(Value::Bool(*f != 0.0)),
            (ScalarType::Bool, Value::Text(s)) => parse_bool(s).map(Value::Bool),
            (ScalarType::DateTime, Value::Text(s)) => parse_datetime(s).map(Value::DateTime),
            (ScalarType::DateTime, Value::Int(secs)) => {
                DateTime::from_timestamp(*secs, 0).map(Value::DateTime)
            }
            _ => None,
        }
    }
}

impl fmt::Display for ScalarType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ScalarType::Any => "any",
            ScalarType::Bool => "bool",
            ScalarType::Int => "int",
            ScalarType::Float => "float",
            ScalarType::Text => "text",
            ScalarType::DateTime => "datetime",
        })
    }
}

fn parse_bool(input: &str) -> Option<bool> {
    match input.trim().to_ascii_lowercase().as_str() {
        "true" | "1" => Some(true),
        "false" | "0" => Some(false),
        _ => None,
    }
}

/// Parses an ISO-8601 timestamp, attaching UTC when the text carries no offset.
pub fn parse_datetime(input: &str) -> Option<DateTime<Utc>> {
    let input = input.trim();

    if let Ok(dt) = DateTime::parse_from_rfc3339(input) {
        return Some(dt.with_timezone(&Utc));
    }

    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(input, format).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(input, "%Y-%m-%d")
                .ok()
                .and_then(|date| date.and_hms_opt(0, 0, 0))
        })
        .map(|naive| naive.and_utc())
}

/// An extra check run after type validation. It may only reject, never transform.
pub type Validator = Arc<dyn Fn(&Value) -> Result<(), ValidationError> + Send + Sync>;

/// The default applied when an instance is constructed without a value for a field.
#[derive(Clone, Default)]
pub enum FieldDefault {
    #[default]
    Null,
    /// A fixed value, cloned into every new instance.
    Value(Value),
    /// Invoked once per new instance.
    Factory(Arc<dyn Fn() -> Value + Send + Sync>),
    /// A fresh instance of the field's document type, built from that type's own defaults.
    NewDocument,
}

impl fmt::Debug for FieldDefault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldDefault::Null => f.write_str("Null"),
            FieldDefault::Value(value) => f.debug_tuple("Value").field(value).finish(),
            FieldDefault::Factory(_) => f.write_str("Factory(..)"),
            FieldDefault::NewDocument => f.write_str("NewDocument"),
        }
    }
}

/// The structural shape of a field.
#[derive(Debug, Clone)]
pub enum FieldKind {
    Scalar(ScalarType),
    /// A nested document of the named type. Embedded types are stored inline, other
    /// types are stored as a reference to the target's identity.
    Document(String),
    /// A sequence whose elements are validated by the element spec.
    List(Box<FieldSpec>),
    /// A string-keyed mapping whose values are validated by the element spec.
    Map(Box<FieldSpec>),
    /// Delegates validation to another spec, then applies this spec's validator.
    Nested(Box<FieldSpec>),
}

/// Descriptor for a single document attribute.
#[derive(Clone)]
pub struct FieldSpec {
    kind: FieldKind,
    validator: Option<Validator>,
    default: FieldDefault,
    cast: bool,
    doc: Option<String>,
}

impl fmt::Debug for FieldSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldSpec")
            .field("kind", &self.kind)
            .field("validator", &self.validator.as_ref().map(|_| ".."))
            .field("default", &self.default)
            .field("cast", &self.cast)
            .field("doc", &self.doc)
            .finish()
    }
}

impl FieldSpec {
    pub fn new(kind: FieldKind) -> Self {
        Self {
            kind,
            validator: None,
            default: FieldDefault::Null,
            cast: true,
            doc: None,
        }
    }

    pub fn scalar(ty: ScalarType) -> Self {
        Self::new(FieldKind::Scalar(ty))
    }

    pub fn any() -> Self {
        Self::scalar(ScalarType::Any)
    }

    pub fn bool() -> Self {
        Self::scalar(ScalarType::Bool)
    }

    pub fn int() -> Self {
        Self::scalar(ScalarType::Int)
    }

    pub fn float() -> Self {
        Self::scalar(ScalarType::Float)
    }

    pub fn text() -> Self {
        Self::scalar(ScalarType::Text)
    }

    pub fn datetime() -> Self {
        Self::scalar(ScalarType::DateTime)
    }

    pub fn document(type_name: impl Into<String>) -> Self {
        Self::new(FieldKind::Document(type_name.into()))
    }

    pub fn list(element: FieldSpec) -> Self {
        Self::new(FieldKind::List(Box::new(element)))
    }

    pub fn map(element: FieldSpec) -> Self {
        Self::new(FieldKind::Map(Box::new(element)))
    }

    pub fn nested(inner: FieldSpec) -> Self {
        Self::new(FieldKind::Nested(Box::new(inner)))
    }

    pub fn with_default(mut self, value: impl Into<Value>) -> Self {
        self.default = FieldDefault::Value(value.into());
        self
    }

    pub fn with_default_fn(mut self, factory: impl Fn() -> Value + Send + Sync + 'static) -> Self {
        self.default = FieldDefault::Factory(Arc::new(factory));
        self
    }

    /// Defaults a document field to a fresh instance of its type.
    pub fn with_default_document(mut self) -> Self {
        self.default = FieldDefault::NewDocument;
        self
    }

    pub fn with_validator(
        mut self,
        validator: impl Fn(&Value) -> Result<(), ValidationError> + Send + Sync + 'static,
    ) -> Self {
        self.validator = Some(Arc::new(validator));
        self
    }

    /// Enables or disables coercion of mismatched values. Enabled by default.
    pub fn with_cast(mut self, cast: bool) -> Self {
        self.cast = cast;
        self
    }

    pub fn with_doc(mut self, doc: impl Into<String>) -> Self {
        self.doc = Some(doc.into());
        self
    }

    pub fn kind(&self) -> &FieldKind {
        &self.kind
    }

    pub fn default_value(&self) -> &FieldDefault {
        &self.default
    }

    pub fn cast_enabled(&self) -> bool {
        self.cast
    }

    pub fn doc(&self) -> Option<&str> {
        self.doc.as_deref()
    }

    /// The document type this field refers to, looking through nested specs.
    pub fn document_type(&self) -> Option<&str> {
        match &self.kind {
            FieldKind::Document(name) => Some(name),
            FieldKind::Nested(inner) => inner.document_type(),
            _ => None,
        }
    }

    /// Every document type named anywhere in this spec.
    pub(crate) fn document_targets(&self) -> Vec<&str> {
        match &self.kind {
            FieldKind::Scalar(_) => vec![],
            FieldKind::Document(name) => vec![name.as_str()],
            FieldKind::List(inner) | FieldKind::Map(inner) | FieldKind::Nested(inner) => {
                inner.document_targets()
            }
        }
    }

    /// Validates `value` against this spec, coercing it where casting allows.
    ///
    /// Null always passes and skips the extra validator.
    pub fn validate(&self, value: Value, catalog: &Arc<Catalog>) -> Result<Value, ValidationError> {
        let value = match &self.kind {
            FieldKind::Scalar(ty) => self.validate_scalar(*ty, value)?,
            FieldKind::Document(target) => self.validate_document(target, value, catalog)?,
            FieldKind::List(element) => match self.coerce_list(value)? {
                Value::List(items) => Value::List(
                    items
                        .into_iter()
                        .map(|item| element.validate(item, catalog))
                        .collect::<Result<Vec<_>, _>>()?,
                ),
                other => other,
            },
            FieldKind::Map(element) => match self.coerce_map(value)? {
                Value::Map(map) => Value::Map(
                    map.into_iter()
                        .map(|(k, v)| Ok((k, element.validate(v, catalog)?)))
                        .collect::<Result<BTreeMap<_, _>, ValidationError>>()?,
                ),
                other => other,
            },
            FieldKind::Nested(inner) => inner.validate(value, catalog)?,
        };

        if let Some(validator) = &self.validator {
            match (&self.kind, &value) {
                (_, Value::Null) => {}
                (FieldKind::List(_), Value::List(items)) => {
                    for item in items {
                        validator(item)?;
                    }
                }
                _ => validator(&value)?,
            }
        }

        Ok(value)
    }

    fn validate_scalar(&self, ty: ScalarType, value: Value) -> Result<Value, ValidationError> {
        if value.is_null() || ty.matches(&value) {
            return Ok(value);
        }
        // Stored timestamps are ISO text, so they parse whether or not casting is on.
        if let (ScalarType::DateTime, Value::Text(text)) = (ty, &value) {
            return parse_datetime(text)
                .map(Value::DateTime)
                .ok_or_else(|| ValidationError::cast(ty, &value));
        }
        if !self.cast {
            return Err(ValidationError::mismatch(ty, value.kind_name()));
        }

        ty.cast(&value)
            .ok_or_else(|| ValidationError::cast(ty, &value))
    }

    fn validate_document(
        &self,
        target: &str,
        value: Value,
        catalog: &Arc<Catalog>,
    ) -> Result<Value, ValidationError> {
        let model = catalog
            .model(target)
            .map_err(|_| ValidationError::new(format!("unknown document type {target}")))?;

        match value {
            Value::Null => Ok(Value::Null),
            Value::Document(doc) if doc.schema().name() == target => Ok(Value::Document(doc)),
            Value::Ref(id) | Value::Text(id) if !model.schema().embedded() => Ok(Value::Ref(id)),
            Value::Map(map) => ModelInstance::from_map(&model, map)
                .map(Value::from)
                .map_err(|err| match err {
                    DocumentError::Validation(inner) => inner,
                    other => ValidationError::new(other.to_string()),
                }),
            other if self.cast => Err(ValidationError::cast(target, &other)),
            other => Err(ValidationError::mismatch(target, match &other {
                Value::Document(doc) => doc.schema().name().to_string(),
                _ => other.kind_name().to_string(),
            })),
        }
    }

    fn coerce_list(&self, value: Value) -> Result<Value, ValidationError> {
        match value {
            Value::Null | Value::List(_) => Ok(value),
            other if self.cast => Ok(Value::List(vec![other])),
            other => Err(ValidationError::mismatch("list", other.kind_name())),
        }
    }

    fn coerce_map(&self, value: Value) -> Result<Value, ValidationError> {
        match value {
            Value::Null | Value::Map(_) => Ok(value),
            other if !self.cast => Err(ValidationError::mismatch("map", other.kind_name())),
            other => match other.scalar_text() {
                Some(key) => Ok(Value::Map(BTreeMap::from([(key, other)]))),
                None => Err(ValidationError::cast("map", &other)),
            },
        }
    }

    /// Converts a validated value to its transport form, mirroring [`validate`](Self::validate).
    pub fn serialize(&self, value: &Value) -> DocumentResult<JsonValue> {
        match (&self.kind, value) {
            (_, Value::Null) => Ok(JsonValue::Null),
            (FieldKind::List(element), Value::List(items)) => Ok(JsonValue::Array(
                items
                    .iter()
                    .map(|item| element.serialize(item))
                    .collect::<DocumentResult<Vec<_>>>()?,
            )),
            (FieldKind::Map(element), Value::Map(map)) => Ok(JsonValue::Object(
                map.iter()
                    .map(|(k, v)| Ok((k.clone(), element.serialize(v)?)))
                    .collect::<DocumentResult<JsonMap<_, _>>>()?,
            )),
            (FieldKind::Nested(inner), _) => inner.serialize(value),
            _ => value.to_json(),
        }
    }

    /// Produces the value a new instance receives when none was supplied.
    pub(crate) fn make_default(&self, catalog: &Arc<Catalog>) -> DocumentResult<Value> {
        Ok(match &self.default {
            FieldDefault::Null => Value::Null,
            FieldDefault::Value(value) => value.clone(),
            FieldDefault::Factory(factory) => factory(),
            FieldDefault::NewDocument => {
                let target = self.document_type().ok_or_else(|| {
                    DocumentError::model("a document default requires a document field")
                })?;
                Value::from(ModelInstance::new(&catalog.model(target)?)?)
            }
        })
    }
}
