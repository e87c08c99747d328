//! Named adapter instances.
//!
//! Schemas name their backend as `"kind"` or `"kind/instance"` instead of holding a
//! live adapter. An [`AdapterRegistry`] maps those names to adapters and offers the
//! persistence operations in two forms: type-level operations take a [`Model`],
//! instance-level operations take a [`ModelInstance`]. Both resolve the adapter from
//! the schema and share the adapter's implementation.
//!
//! The registry is an explicit value. Build it during startup and share it, usually
//! behind an `Arc`.
//!
//! # Example
//!
//! ```ignore
//! let mut registry = AdapterRegistry::new();
//! registry.register("CouchDB", DEFAULT_INSTANCE, Arc::new(couch))?;
//!
//! let mut user = users.instance()?;
//! registry.save(&mut user).await?;
//! let again = registry.get(&users, user.id().unwrap_or_default()).await?;
//! ```

use std::{collections::HashMap, sync::Arc};
use tracing::debug;

use crate::{
    attachment::Attachment,
    backend::{self, Adapter, ResultSet},
    document::ModelInstance,
    error::{DocumentError, DocumentResult},
    query::Query,
    schema::Model,
    value::Value,
};

/// The instance name used when a backend name carries none.
pub const DEFAULT_INSTANCE: &str = "default";

/// Splits a backend name into its kind and optional instance name.
pub fn parse_backend_name(name: &str) -> (&str, Option<&str>) {
    match name.split_once('/') {
        Some((kind, instance)) if !instance.is_empty() => (kind, Some(instance)),
        Some((kind, _)) => (kind, None),
        None => (name, None),
    }
}

#[derive(Debug, Default, Clone)]
pub struct AdapterRegistry {
    adapters: HashMap<(String, String), Arc<dyn Adapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an adapter under a kind and instance name.
    ///
    /// # Errors
    ///
    /// Returns a database error if the pair is already registered.
    pub fn register(
        &mut self,
        kind: impl Into<String>,
        instance: impl Into<String>,
        adapter: Arc<dyn Adapter>,
    ) -> DocumentResult<()> {
        let key = (kind.into(), instance.into());
        if self.adapters.contains_key(&key) {
            return Err(DocumentError::database(format!(
                "a {} instance named {} is already registered",
                key.0, key.1
            )));
        }

        debug!(kind = %key.0, instance = %key.1, "registered adapter");
        self.adapters.insert(key, adapter);

        Ok(())
    }

    /// Looks up an adapter. A missing instance name means [`DEFAULT_INSTANCE`].
    pub fn resolve(&self, kind: &str, instance: Option<&str>) -> DocumentResult<Arc<dyn Adapter>> {
        let instance = instance.unwrap_or(DEFAULT_INSTANCE);

        self.adapters
            .get(&(kind.to_string(), instance.to_string()))
            .cloned()
            .ok_or_else(|| DocumentError::database(format!("no {kind} instance named {instance} is registered")))
    }

    /// The adapter a document type persists through.
    pub fn adapter_for(&self, model: &Model) -> DocumentResult<Arc<dyn Adapter>> {
        let backend = model
            .schema()
            .backend()
            .ok_or_else(|| DocumentError::model(format!("{} declares no backend", model.name())))?;
        let (kind, instance) = parse_backend_name(backend);

        self.resolve(kind, instance)
    }

    pub async fn get(&self, model: &Model, id: &str) -> DocumentResult<ModelInstance> {
        self.adapter_for(model)?.get(model, id).await
    }

    pub async fn find(&self, model: &Model, query: impl Into<Query>) -> DocumentResult<Box<dyn ResultSet>> {
        self.adapter_for(model)?.find(model, query.into()).await
    }

    pub async fn save(&self, instance: &mut ModelInstance) -> DocumentResult<String> {
        let adapter = self.adapter_for(instance.model())?;
        adapter.save(instance).await
    }

    pub async fn delete(&self, instance: &mut ModelInstance) -> DocumentResult<()> {
        let adapter = self.adapter_for(instance.model())?;
        adapter.delete(instance).await
    }

    pub fn attach(&self, instance: &mut ModelInstance, attachment: Attachment) -> DocumentResult<()> {
        let adapter = self.adapter_for(instance.model())?;
        adapter.attach(instance, attachment)
    }

    /// Reads an attachment, fetching its bytes from the store when only a stub is held.
    pub async fn read_attachment(&self, instance: &mut ModelInstance, name: &str) -> DocumentResult<Vec<u8>> {
        let adapter = self.adapter_for(instance.model())?;
        backend::read_attachment(&*adapter, instance, name).await
    }

    pub fn delete_attachment(&self, instance: &mut ModelInstance, name: &str) -> DocumentResult<()> {
        let adapter = self.adapter_for(instance.model())?;
        adapter.delete_attachment(instance, name)
    }

    /// Replaces the bare identity held by a reference field with the live document.
    ///
    /// Fields that already hold a live document are returned as they are.
    ///
    /// # Errors
    ///
    /// Returns [`DocumentError::NotFound`] when the field is empty or the referenced
    /// document does not exist, and a model error for fields that are not references.
    pub async fn fetch_reference<'a>(&self, instance: &'a mut ModelInstance, field: &str) -> DocumentResult<&'a ModelInstance> {
        let target = instance
            .schema()
            .field(field)
            .and_then(|spec| spec.document_type())
            .ok_or_else(|| {
                DocumentError::model(format!("{}.{field} is not a document field", instance.schema().name()))
            })?
            .to_string();

        let id = match instance.get(field)? {
            Value::Document(_) => None,
            Value::Ref(id) => Some(id.clone()),
            _ => {
                return Err(DocumentError::NotFound(format!(
                    "{}.{field} holds no reference",
                    instance.schema().name()
                )));
            }
        };

        if let Some(id) = id {
            let model = instance.model().catalog().model(&target)?;
            let fetched = self.get(&model, &id).await?;
            instance.set(field, fetched)?;
        }

        instance
            .get(field)?
            .as_document()
            .ok_or_else(|| DocumentError::model(format!("{field} does not hold a document")))
    }
}
