//! In-memory adapter implementation.
//!
//! This module provides a simple adapter that keeps serialized documents in ordered
//! maps behind an async-safe read-write lock. It follows the native store's contract:
//! exact-match queries only and no attachment support.

use async_trait::async_trait;
use mea::rwlock::RwLock;
use serde_json::{Map as JsonMap, Value as JsonValue};
use std::{any::Any, collections::{BTreeMap, HashMap}, sync::Arc};
use tracing::debug;
use uuid::Uuid;

use docmap_core::{
    backend::{
        Adapter, AdapterBuilder, LoadedResults, ResultSet, load_instance, prepare_delete,
        prepare_save, reject_pending_attachments,
    },
    document::ModelInstance,
    error::{DatabaseError, DocumentError, DocumentResult},
    query::Query,
    schema::Model,
};

#[derive(Debug, Clone)]
struct StoredDocument {
    revision: String,
    body: JsonMap<String, JsonValue>,
}

type CollectionMap = BTreeMap<String, StoredDocument>;
type StoreMap = HashMap<String, CollectionMap>;

/// Builds the revision that follows `current`, as `"{generation}-{token}"`.
fn next_revision(current: Option<&str>) -> String {
    let generation = current
        .and_then(|revision| revision.split_once('-'))
        .and_then(|(generation, _)| generation.parse::<u64>().ok())
        .unwrap_or(0);

    format!("{}-{}", generation + 1, Uuid::new_v4().simple())
}

fn conflict(id: &str) -> DocumentError {
    DatabaseError::with_status(409, "Conflict", Some(serde_json::json!({"error": "conflict", "id": id}))).into()
}

/// Thread-safe in-memory adapter.
///
/// `MemoryStore` is cloneable and shares its state through an `Arc`, so every clone
/// sees the same documents. Identities are random UUIDs; revisions are checked on
/// update and delete whenever the instance carries one.
///
/// # Example
///
/// ```ignore
/// use docmap_memory::MemoryStore;
/// use docmap_core::backend::Adapter;
///
/// let store = MemoryStore::new();
/// let mut user = users.instance()?;
/// let id = store.save(&mut user).await?;
/// assert_eq!(store.get(&users, &id).await?.id(), Some(id.as_str()));
/// ```
#[derive(Default, Clone, Debug)]
pub struct MemoryStore {
    /// collection name -> (identity -> document)
    store: Arc<RwLock<StoreMap>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn builder() -> MemoryStoreBuilder {
        MemoryStoreBuilder
    }

    /// The number of documents stored for a type.
    pub async fn count(&self, model: &Model) -> usize {
        self.store
            .read()
            .await
            .get(model.schema().collection_name())
            .map(BTreeMap::len)
            .unwrap_or(0)
    }
}

#[async_trait]
impl Adapter for MemoryStore {
    fn kind(&self) -> &'static str {
        "Memory"
    }

    async fn save(&self, instance: &mut ModelInstance) -> DocumentResult<String> {
        prepare_save(instance)?;
        reject_pending_attachments(instance)?;

        let body = instance.to_transport(&[], JsonMap::new())?;
        let collection = instance.schema().collection_name().to_string();

        let mut store = self.store.write().await;
        let documents = store.entry(collection.clone()).or_default();

        let id = instance
            .id()
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().simple().to_string());
        let current = documents.get(&id).map(|stored| stored.revision.as_str());

        if let (Some(current), Some(expected)) = (current, instance.revision()) {
            if current != expected {
                return Err(conflict(&id));
            }
        }

        let revision = next_revision(current);
        documents.insert(id.clone(), StoredDocument { revision: revision.clone(), body });

        debug!(collection = %collection, id = %id, revision = %revision, "saved document");
        instance.set_identity(id.clone(), Some(revision));

        Ok(id)
    }

    async fn get(&self, model: &Model, id: &str) -> DocumentResult<ModelInstance> {
        let stored = self
            .store
            .read()
            .await
            .get(model.schema().collection_name())
            .and_then(|documents| documents.get(id))
            .cloned()
            .ok_or_else(|| DocumentError::NotFound(format!("{} {id}", model.name())))?;

        let mut document = stored.body;
        document.insert("_id".into(), id.into());
        document.insert("_rev".into(), stored.revision.into());

        load_instance(self, model, document)
    }

    async fn find(&self, model: &Model, query: Query) -> DocumentResult<Box<dyn ResultSet>> {
        let spec = match query {
            Query::Match(spec) => spec,
            Query::View(view) => {
                return Err(DatabaseError::unsupported(&format!("view query {}", view.view)).into());
            }
        };

        let matched = {
            let store = self.store.read().await;
            let Some(documents) = store.get(model.schema().collection_name()) else {
                return Ok(Box::new(LoadedResults::default()));
            };

            let mut matched = Vec::new();
            for (id, stored) in documents {
                if spec.matches(&stored.body)? {
                    matched.push((id.clone(), stored.clone()));
                }
            }
            matched
        };

        let instances = matched
            .into_iter()
            .map(|(id, stored)| {
                let mut document = stored.body;
                document.insert("_id".into(), id.into());
                document.insert("_rev".into(), stored.revision.into());
                load_instance(self, model, document)
            })
            .collect::<DocumentResult<Vec<_>>>()?;

        Ok(Box::new(LoadedResults::new(instances)))
    }

    async fn delete(&self, instance: &mut ModelInstance) -> DocumentResult<()> {
        let id = prepare_delete(instance)?;
        let mut store = self.store.write().await;
        let documents = store
            .get_mut(instance.schema().collection_name())
            .ok_or_else(|| DocumentError::NotFound(format!("{} {id}", instance.schema().name())))?;

        match (documents.get(&id), instance.revision()) {
            (None, _) => return Err(DocumentError::NotFound(format!("{} {id}", instance.schema().name()))),
            (Some(stored), Some(expected)) if stored.revision != expected => return Err(conflict(&id)),
            _ => {}
        }

        documents.remove(&id);
        debug!(collection = instance.schema().collection_name(), id = %id, "deleted document");

        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Builder for constructing [`MemoryStore`] instances.
#[derive(Default)]
pub struct MemoryStoreBuilder;

#[async_trait]
impl AdapterBuilder for MemoryStoreBuilder {
    type Adapter = MemoryStore;

    async fn build(self) -> DocumentResult<Self::Adapter> {
        Ok(MemoryStore::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docmap_core::{
        field::FieldSpec,
        query::{MatchSpec, ViewQuery},
        schema::{Catalog, Schema},
        value::Value,
    };

    fn catalog() -> Arc<Catalog> {
        Catalog::builder()
            .register(
                Schema::builder("SampleEmbeddedModel")
                    .embedded(true)
                    .field("strField", FieldSpec::text().with_default(""))
                    .field("intField", FieldSpec::int().with_default(0)),
            )
            .register(
                Schema::builder("SampleModel")
                    .backend("Memory")
                    .field("strField", FieldSpec::text().with_default(""))
                    .field("embedField", FieldSpec::document("SampleEmbeddedModel").with_default_document()),
            )
            .register(
                Schema::builder("TouchableModel")
                    .field("strField", FieldSpec::text().with_default(""))
                    .touch(|doc| doc.set("strField", "touched").is_ok()),
            )
            .build()
            .unwrap()
    }

    #[test]
    fn test_revision_generations() {
        assert!(next_revision(None).starts_with("1-"));
        assert!(next_revision(Some("7-abc")).starts_with("8-"));
        assert!(next_revision(Some("garbage")).starts_with("1-"));
    }

    #[tokio::test]
    async fn test_save_assigns_identity() {
        let store = MemoryStore::builder().build().await.unwrap();
        let catalog = catalog();
        let model = catalog.model("SampleModel").unwrap();
        let mut instance = ModelInstance::with_values(&model, [("strField", "foobar")]).unwrap();

        assert_eq!(instance.id(), None);
        let id = store.save(&mut instance).await.unwrap();

        assert_eq!(instance.id(), Some(id.as_str()));
        assert!(instance.revision().unwrap().starts_with("1-"));

        let loaded = store.get(&model, &id).await.unwrap();
        assert_eq!(loaded.get("strField").unwrap(), &Value::from("foobar"));
        assert_eq!(loaded, instance);
    }

    #[tokio::test]
    async fn test_stale_revision_conflicts() {
        let store = MemoryStore::new();
        let catalog = catalog();
        let model = catalog.model("SampleModel").unwrap();
        let mut first = model.instance().unwrap();
        let id = store.save(&mut first).await.unwrap();
        let mut second = store.get(&model, &id).await.unwrap();

        first.set("strField", "one").unwrap();
        store.save(&mut first).await.unwrap();

        second.set("strField", "two").unwrap();
        let err = store.save(&mut second).await.unwrap_err();
        assert_eq!(err.status(), Some(409));
        assert!(store.delete(&mut second).await.is_err());
    }

    #[tokio::test]
    async fn test_embedded_models_cannot_be_saved() {
        let store = MemoryStore::new();
        let catalog = catalog();
        let mut embedded = catalog.model("SampleEmbeddedModel").unwrap().instance().unwrap();

        assert!(store.save(&mut embedded).await.unwrap_err().is_model_error());
        assert!(store.delete(&mut embedded).await.unwrap_err().is_model_error());
    }

    #[tokio::test]
    async fn test_touch_runs_before_save() {
        let store = MemoryStore::new();
        let catalog = catalog();
        let model = catalog.model("TouchableModel").unwrap();
        let mut instance = model.instance().unwrap();

        assert_eq!(instance.get("strField").unwrap(), &Value::from(""));
        let id = store.save(&mut instance).await.unwrap();

        assert_eq!(instance.get("strField").unwrap(), &Value::from("touched"));
        assert_eq!(store.get(&model, &id).await.unwrap().get("strField").unwrap(), &Value::from("touched"));
    }

    #[tokio::test]
    async fn test_find_by_match_spec() {
        let store = MemoryStore::new();
        let catalog = catalog();
        let model = catalog.model("SampleModel").unwrap();

        for value in ["foo", "foo", "bar", "baz"] {
            let mut instance = ModelInstance::with_values(&model, [("strField", value)]).unwrap();
            store.save(&mut instance).await.unwrap();
        }

        let mut foos = store
            .find(&model, MatchSpec::new().field("strField", "foo").into())
            .await
            .unwrap();
        assert_eq!(foos.len().await.unwrap(), 2);
        for instance in foos.all().await.unwrap() {
            assert_eq!(instance.get("strField").unwrap(), &Value::from("foo"));
        }

        let mut everything = store.find(&model, Query::all()).await.unwrap();
        assert_eq!(everything.len().await.unwrap(), 4);

        let mut nested = store
            .find(&model, MatchSpec::new().field("embedField", serde_json::json!({"strField": "", "intField": 0})).into())
            .await
            .unwrap();
        assert_eq!(nested.len().await.unwrap(), 4);

        assert!(store.find(&model, ViewQuery::new("byStr").into()).await.unwrap_err().is_database_error());
    }

    #[tokio::test]
    async fn test_delete_then_get_is_not_found() {
        let store = MemoryStore::new();
        let catalog = catalog();
        let model = catalog.model("SampleModel").unwrap();
        let mut instance = model.instance().unwrap();
        let id = store.save(&mut instance).await.unwrap();

        store.delete(&mut instance).await.unwrap();

        assert!(store.get(&model, &id).await.unwrap_err().is_not_found());
        assert_eq!(store.count(&model).await, 0);
    }

    #[tokio::test]
    async fn test_attachments_are_unsupported() {
        let store = MemoryStore::new();
        let catalog = catalog();
        let mut instance = catalog.model("SampleModel").unwrap().instance().unwrap();

        assert!(store.attach(&mut instance, docmap_core::attachment::Attachment::new("a.txt", "x", None)).is_err());

        instance.attach("a.txt", "x", None);
        assert!(store.save(&mut instance).await.unwrap_err().is_database_error());
    }
}
