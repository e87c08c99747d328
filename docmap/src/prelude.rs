//! Convenient re-exports of commonly used types from docmap.
//!
//! ```ignore
//! use docmap::prelude::*;
//! ```
//!
//! This provides access to schemas and fields, live instances and attachments, the
//! adapter traits and registry, queries, and the error types.

pub use std::sync::Arc;

pub use docmap_core::{
    attachment::{Attachment, AttachmentState},
    backend::{Adapter, AdapterBuilder, ResultSet},
    document::{Identity, LoadStatus, ModelInstance},
    error::{DatabaseError, DocumentError, DocumentResult, ValidationError},
    field::{FieldKind, FieldSpec, ScalarType},
    page::PaginationParams,
    query::{MatchSpec, Query, ViewKeys, ViewQuery},
    registry::{AdapterRegistry, DEFAULT_INSTANCE},
    schema::{Catalog, Model, Schema},
    value::Value,
};
