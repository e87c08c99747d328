//! In-memory adapter for docmap.
//!
//! This crate provides a thread-safe, in-memory implementation of the `Adapter` trait.
//! It uses async-aware read-write locks for concurrent access and is ideal for development,
//! testing, and small-scale deployments.
//!
//! # Features
//!
//! - **Thread-safe access** - Concurrent reads and writes using async-aware RwLock
//! - **Native-store semantics** - Exact-match queries, no views, no attachments
//! - **Revision checks** - Stale revisions are rejected with a 409 database error
//!
//! # Quick Start
//!
//! ```ignore
//! use docmap_core::{backend::{Adapter, AdapterBuilder}, field::FieldSpec, schema::{Catalog, Schema}};
//! use docmap_memory::MemoryStore;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let catalog = Catalog::builder()
//!         .register(Schema::builder("User").field("name", FieldSpec::text()))
//!         .build()?;
//!     let users = catalog.model("User")?;
//!
//!     let store = MemoryStore::builder().build().await?;
//!     let mut alice = users.instance()?;
//!     alice.set("name", "Alice")?;
//!     store.save(&mut alice).await?;
//!
//!     Ok(())
//! }
//! ```

#[allow(unused_extern_crates)]
extern crate self as docmap_memory;

pub mod store;

pub use store::{MemoryStore, MemoryStoreBuilder};
