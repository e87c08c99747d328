//! Error types and result types for document mapping and persistence operations.
//!
//! Errors fall into four kinds that callers can branch on:
//!
//! - [`ValidationError`] - a value failed a field's type, shape or range check
//! - [`DocumentError::Model`] - the schema contract was misused (saving an embedded type,
//!   a `touch` veto, an unknown attribute on a strict schema)
//! - [`DatabaseError`] - any transport or protocol failure reported by a store
//! - [`DocumentError::NotFound`] - a lookup by identity found nothing
//!
//! Use [`DocumentResult<T>`] as the return type for fallible operations.

use serde_json::{Error as SerdeJsonError, Value as JsonValue};
use std::fmt;
use thiserror::Error;

/// A value did not satisfy a field's declared type, shape or validator.
///
/// Raised synchronously at the point of assignment. The message is prefixed with
/// `Type.field` once the error leaves a [`ModelInstance`](crate::document::ModelInstance).
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{message}")]
pub struct ValidationError {
    message: String,
}

impl ValidationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }

    /// A coercion to `target` failed for `value`.
    pub fn cast(target: impl fmt::Display, value: impl fmt::Debug) -> Self {
        Self::new(format!("cannot cast {value:?} to {target}"))
    }

    /// A value of the wrong type was supplied to a field with casting disabled.
    pub fn mismatch(expected: impl fmt::Display, got: impl fmt::Display) -> Self {
        Self::new(format!("expected {expected}, got {got}"))
    }

    /// Returns a copy of this error scoped to `owner.field`.
    pub fn within(&self, owner: &str, field: &str) -> Self {
        Self::new(format!("{owner}.{field}: {}", self.message))
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// A transport or protocol failure reported by a store.
///
/// HTTP stores fill in the response status, reason phrase and parsed body. Native
/// stores usually only carry a reason.
#[derive(Error, Debug, Clone, PartialEq)]
pub struct DatabaseError {
    pub status: Option<u16>,
    pub reason: String,
    pub body: Option<JsonValue>,
}

impl DatabaseError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self { status: None, reason: reason.into(), body: None }
    }

    pub fn with_status(status: u16, reason: impl Into<String>, body: Option<JsonValue>) -> Self {
        Self { status: Some(status), reason: reason.into(), body }
    }

    /// The capability is not offered by this adapter.
    pub fn unsupported(capability: &str) -> Self {
        Self::new(format!("{capability} is not supported by this adapter"))
    }
}

impl fmt::Display for DatabaseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(status) => write!(f, "{status} {}", self.reason),
            None => f.write_str(&self.reason),
        }
    }
}

/// Represents all possible errors surfaced by the document mapping layer.
#[derive(Error, Debug)]
pub enum DocumentError {
    /// A field value failed validation.
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
    /// The schema contract was misused.
    #[error("Model error: {0}")]
    Model(String),
    /// The store reported a transport or protocol failure.
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
    /// No document exists for the requested identity.
    #[error("Not found: {0}")]
    NotFound(String),
    /// Converting between the transport form and a store's native form failed.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl DocumentError {
    pub fn model(message: impl Into<String>) -> Self {
        DocumentError::Model(message.into())
    }

    pub fn database(reason: impl Into<String>) -> Self {
        DocumentError::Database(DatabaseError::new(reason))
    }

    pub fn is_validation_error(&self) -> bool {
        matches!(self, DocumentError::Validation(_))
    }

    /// Validation errors are a refinement of model errors.
    pub fn is_model_error(&self) -> bool {
        matches!(self, DocumentError::Model(_) | DocumentError::Validation(_))
    }

    /// Not-found errors are a refinement of database errors.
    pub fn is_database_error(&self) -> bool {
        matches!(self, DocumentError::Database(_) | DocumentError::NotFound(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, DocumentError::NotFound(_))
    }

    /// The HTTP status carried by a database error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            DocumentError::Database(err) => err.status,
            _ => None,
        }
    }
}

/// A specialized `Result` type for document operations.
pub type DocumentResult<T> = Result<T, DocumentError>;

impl From<SerdeJsonError> for DocumentError {
    fn from(err: SerdeJsonError) -> Self {
        DocumentError::Serialization(err.to_string())
    }
}
