//! Persistence adapter abstraction.
//!
//! This module defines the capability set every store adapter implements, the lazy
//! [`ResultSet`] returned by queries, and the shared steps of the save, delete and
//! load paths so that every adapter enforces the same schema contract.
//!
//! # Traits
//!
//! - [`Adapter`]: The capability set {save, get, find, delete, attach, read-attachment,
//!   delete-attachment} plus the load-time preprocess hook
//! - [`ResultSet`]: A lazily fetched, possibly windowed, sequence of loaded instances
//! - [`AdapterBuilder`]: Factory trait for creating adapter instances
//!
//! # Examples
//!
//! ```ignore
//! use docmap_core::{backend::Adapter, query::MatchSpec};
//!
//! let mut user = users.instance()?;
//! user.set("name", "Alice")?;
//! let id = adapter.save(&mut user).await?;
//!
//! let loaded = adapter.get(&users, &id).await?;
//! let mut found = adapter.find(&users, MatchSpec::new().field("name", "Alice").into()).await?;
//! assert_eq!(found.len().await?, 1);
//! ```

use async_trait::async_trait;
use serde_json::{Map as JsonMap, Value as JsonValue};
use std::{any::Any, fmt::Debug, sync::Arc};
use tracing::warn;

use crate::{
    attachment::{Attachment, AttachmentState},
    document::{LoadStatus, ModelInstance},
    error::{DatabaseError, DocumentError, DocumentResult},
    query::Query,
    schema::Model,
};

/// The outcome of an adapter's preprocess hook: the document to validate and any
/// adapter-private metadata split off from it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Preprocessed {
    pub document: JsonMap<String, JsonValue>,
    pub attachments: Vec<Attachment>,
}

impl Preprocessed {
    pub fn new(document: JsonMap<String, JsonValue>) -> Self {
        Self { document, attachments: Vec::new() }
    }
}

/// Abstract interface for document store adapters.
///
/// Implementations must be thread-safe. Each operation issues its requests in order
/// and completes before returning; no background work is spawned.
///
/// # Error Handling
///
/// Saving or deleting an embedded type is always a model error. Transport and protocol
/// failures surface as [`DatabaseError`]; a missing identity on `get` surfaces as
/// [`DocumentError::NotFound`].
#[async_trait]
pub trait Adapter: Send + Sync + Debug {
    /// The backend kind this adapter registers under, such as `"CouchDB"`.
    fn kind(&self) -> &'static str;

    /// Persists an instance, creating it when it has no identity yet.
    ///
    /// Runs the instance's `touch` hook first. The identity assigned by the store is
    /// written back onto the instance.
    ///
    /// # Returns
    ///
    /// The identity of the stored document.
    async fn save(&self, instance: &mut ModelInstance) -> DocumentResult<String>;

    /// Fetches a document by identity.
    ///
    /// # Errors
    ///
    /// Returns [`DocumentError::NotFound`] if no such document exists.
    async fn get(&self, model: &Model, id: &str) -> DocumentResult<ModelInstance>;

    /// Runs a query against the documents of one type.
    ///
    /// Results are fetched lazily; a query the store rejects may only fail on first
    /// access.
    async fn find(&self, model: &Model, query: Query) -> DocumentResult<Box<dyn ResultSet>>;

    /// Removes the stored counterpart of an instance.
    async fn delete(&self, instance: &mut ModelInstance) -> DocumentResult<()>;

    /// Adds an attachment to be written on the next save.
    fn attach(&self, _instance: &mut ModelInstance, _attachment: Attachment) -> DocumentResult<()> {
        Err(DatabaseError::unsupported("attach").into())
    }

    /// Fetches the stored bytes of an attachment.
    async fn read_attachment(&self, _instance: &ModelInstance, _name: &str) -> DocumentResult<Vec<u8>> {
        Err(DatabaseError::unsupported("read_attachment").into())
    }

    /// Marks an attachment for removal on the next save.
    fn delete_attachment(&self, _instance: &mut ModelInstance, _name: &str) -> DocumentResult<()> {
        Err(DatabaseError::unsupported("delete_attachment").into())
    }

    /// Strips adapter-private metadata from a stored document before validation.
    fn preprocess(&self, _model: &Model, document: JsonMap<String, JsonValue>) -> DocumentResult<Preprocessed> {
        Ok(Preprocessed::new(document))
    }

    fn as_any(&self) -> &dyn Any;
}

#[async_trait]
impl<A> Adapter for Arc<A>
where
    A: Adapter + ?Sized,
{
    fn kind(&self) -> &'static str {
        (**self).kind()
    }

    async fn save(&self, instance: &mut ModelInstance) -> DocumentResult<String> {
        (**self).save(instance).await
    }

    async fn get(&self, model: &Model, id: &str) -> DocumentResult<ModelInstance> {
        (**self).get(model, id).await
    }

    async fn find(&self, model: &Model, query: Query) -> DocumentResult<Box<dyn ResultSet>> {
        (**self).find(model, query).await
    }

    async fn delete(&self, instance: &mut ModelInstance) -> DocumentResult<()> {
        (**self).delete(instance).await
    }

    fn attach(&self, instance: &mut ModelInstance, attachment: Attachment) -> DocumentResult<()> {
        (**self).attach(instance, attachment)
    }

    async fn read_attachment(&self, instance: &ModelInstance, name: &str) -> DocumentResult<Vec<u8>> {
        (**self).read_attachment(instance, name).await
    }

    fn delete_attachment(&self, instance: &mut ModelInstance, name: &str) -> DocumentResult<()> {
        (**self).delete_attachment(instance, name)
    }

    fn preprocess(&self, model: &Model, document: JsonMap<String, JsonValue>) -> DocumentResult<Preprocessed> {
        (**self).preprocess(model, document)
    }

    fn as_any(&self) -> &dyn Any {
        (**self).as_any()
    }
}

/// A lazily fetched sequence of loaded instances.
///
/// Length, indexing and iteration all refer to the current window of the result; for
/// unpaged results that is the whole result.
#[async_trait]
pub trait ResultSet: Send + Debug {
    async fn len(&mut self) -> DocumentResult<usize>;

    async fn is_empty(&mut self) -> DocumentResult<bool> {
        Ok(self.len().await? == 0)
    }

    /// The instance at `index` within the current window.
    async fn get(&mut self, index: usize) -> DocumentResult<Option<ModelInstance>>;

    /// Advances the iteration cursor.
    async fn try_next(&mut self) -> DocumentResult<Option<ModelInstance>>;

    /// Every instance in the current window.
    async fn all(&mut self) -> DocumentResult<Vec<ModelInstance>>;

    /// Whether a document with this identity is in the current window.
    async fn contains(&mut self, id: &str) -> DocumentResult<bool>;
}

/// A result set that is already fully materialized.
#[derive(Debug, Clone, Default)]
pub struct LoadedResults {
    items: Vec<ModelInstance>,
    cursor: usize,
}

impl LoadedResults {
    pub fn new(items: Vec<ModelInstance>) -> Self {
        Self { items, cursor: 0 }
    }
}

#[async_trait]
impl ResultSet for LoadedResults {
    async fn len(&mut self) -> DocumentResult<usize> {
        Ok(self.items.len())
    }

    async fn get(&mut self, index: usize) -> DocumentResult<Option<ModelInstance>> {
        Ok(self.items.get(index).cloned())
    }

    async fn try_next(&mut self) -> DocumentResult<Option<ModelInstance>> {
        let next = self.items.get(self.cursor).cloned();
        if next.is_some() {
            self.cursor += 1;
        }

        Ok(next)
    }

    async fn all(&mut self) -> DocumentResult<Vec<ModelInstance>> {
        Ok(self.items.clone())
    }

    async fn contains(&mut self, id: &str) -> DocumentResult<bool> {
        Ok(self.items.iter().any(|item| item.id() == Some(id)))
    }
}

#[async_trait]
pub trait AdapterBuilder {
    type Adapter: Adapter;

    async fn build(self) -> DocumentResult<Self::Adapter>;
}

/// Checks the schema contract and runs the `touch` hook before a save.
///
/// # Errors
///
/// Returns a model error for embedded types and when `touch` vetoes the save.
pub fn prepare_save(instance: &mut ModelInstance) -> DocumentResult<()> {
    if instance.schema().embedded() {
        return Err(DocumentError::model(format!(
            "cannot save {}: embedded documents are stored inside their parent",
            instance.schema().name()
        )));
    }
    if !instance.touch() {
        return Err(DocumentError::model(format!("{}: touch failed", instance.schema().name())));
    }

    Ok(())
}

/// Checks that an instance can be deleted and returns its identity.
pub fn prepare_delete(instance: &ModelInstance) -> DocumentResult<String> {
    if instance.schema().embedded() {
        return Err(DocumentError::model(format!(
            "cannot delete {}: embedded documents are stored inside their parent",
            instance.schema().name()
        )));
    }

    instance
        .id()
        .map(str::to_string)
        .ok_or_else(|| DocumentError::model(format!("cannot delete {}: it was never saved", instance.schema().name())))
}

/// Rejects saves that carry pending attachments on adapters without attachment support.
pub fn reject_pending_attachments(instance: &ModelInstance) -> DocumentResult<()> {
    if instance.attachments().any(|attachment| attachment.state() == AttachmentState::New) {
        return Err(DatabaseError::unsupported("attach").into());
    }

    Ok(())
}

/// Rebuilds an instance from a stored document.
///
/// The adapter's preprocess hook runs first. A failing hook does not fail the load:
/// the raw document is validated instead and the instance is marked
/// [`LoadStatus::Degraded`].
pub fn load_instance<A>(adapter: &A, model: &Model, document: JsonMap<String, JsonValue>) -> DocumentResult<ModelInstance>
where
    A: Adapter + ?Sized,
{
    let (preprocessed, status) = match adapter.preprocess(model, document.clone()) {
        Ok(preprocessed) => (preprocessed, LoadStatus::Clean),
        Err(err) => {
            warn!(
                adapter = adapter.kind(),
                model = model.name(),
                error = %err,
                "preprocess failed, loading the raw document"
            );
            (Preprocessed::new(document), LoadStatus::Degraded(err.to_string()))
        }
    };

    let mut instance = ModelInstance::from_stored(model, preprocessed.document)?;
    for attachment in preprocessed.attachments {
        instance
            .attachments_mut()
            .insert(attachment.name().to_string(), attachment);
    }
    instance.set_load_status(status);

    Ok(instance)
}

/// Returns the bytes of an attachment, fetching and caching them on first read.
///
/// # Errors
///
/// Returns [`DocumentError::NotFound`] for unknown or deleted attachments.
pub async fn read_attachment<A>(adapter: &A, instance: &mut ModelInstance, name: &str) -> DocumentResult<Vec<u8>>
where
    A: Adapter + ?Sized,
{
    let attachment = instance
        .attachment(name)
        .ok_or_else(|| DocumentError::NotFound(format!("attachment {name}")))?;
    if let Some(data) = attachment.data() {
        return Ok(data.to_vec());
    }

    let data = adapter.read_attachment(instance, name).await?;
    if let Some(attachment) = instance.attachments_mut().get_mut(name) {
        attachment.set_data(data.clone());
    }

    Ok(data)
}
