//! A typed document-mapping layer over heterogeneous document stores.
//!
//! This crate is the core of the docmap project and provides:
//!
//! - **Values** ([`value`]) - The dynamic value model shared by fields, instances and adapters
//! - **Field descriptors** ([`field`]) - Typed, self-validating field specs with coercion rules
//! - **Schemas** ([`schema`]) - Document type declaration, registration and flag resolution
//! - **Documents** ([`document`]) - Live instances that enforce their schema on every assignment
//! - **Attachments** ([`attachment`]) - Binary blobs with a new/stub/deleted lifecycle
//! - **Adapter abstraction** ([`backend`]) - The capability set every store adapter implements
//! - **Adapter registry** ([`registry`]) - Named adapter instances resolved from schema backend names
//! - **Queries** ([`query`]) - Exact-match specs and view queries
//! - **Pagination** ([`page`]) - Zero-based page window arithmetic
//! - **Error handling** ([`error`]) - The validation / model / database / not-found taxonomy
//!
//! # Example
//!
//! ```ignore
//! use docmap_core::{field::FieldSpec, schema::{Catalog, Schema}};
//!
//! let catalog = Catalog::builder()
//!     .register(
//!         Schema::builder("User")
//!             .backend("MongoDB")
//!             .field("name", FieldSpec::text())
//!             .field("age", FieldSpec::int().with_default(0)),
//!     )
//!     .build()?;
//!
//! let mut user = catalog.model("User")?.instance()?;
//! user.set("age", "42")?;
//! ```

#[allow(unused_extern_crates)]
extern crate self as docmap_core;

pub mod attachment;
pub mod backend;
pub mod document;
pub mod error;
pub mod field;
pub mod page;
pub mod query;
pub mod registry;
pub mod schema;
pub mod value;
