//! MongoDB adapter for docmap.
//!
//! This crate implements the native-protocol [`Adapter`](docmap_core::backend::Adapter)
//! on top of the async MongoDB driver. It supports exact-match queries only, has no
//! attachment support, and keeps no revisions.
//!
//! To use this adapter through the facade, enable the `mongodb` feature:
//!
//! ```toml
//! [dependencies]
//! docmap = { version = "x.y.z", features = ["mongodb"] }
//! ```
//!
//! # Storage layout
//!
//! - One collection per document type, named after the schema's collection name
//! - Object identities are exposed as their hex string; other `_id` values verbatim
//! - Map keys containing `.`, `$` or NUL are escaped on write and restored on read
//!
//! # Example
//!
//! ```ignore
//! use docmap_core::{backend::{Adapter, AdapterBuilder}, query::MatchSpec};
//! use docmap_mongodb::MongoDbStore;
//!
//! let store = MongoDbStore::builder("mongodb://localhost:27017", "my_database")
//!     .build()
//!     .await?;
//!
//! let mut admins = store.find(&users, MatchSpec::new().field("role", "admin").into()).await?;
//! while let Some(user) = admins.try_next().await? {
//!     println!("{:?}", user.id());
//! }
//! ```

#[allow(unused_extern_crates)]
extern crate self as docmap_mongodb;

pub mod query;
pub mod sanitizer;
pub mod store;

pub use store::{MongoDbStore, MongoDbStoreBuilder, MongoResults};
