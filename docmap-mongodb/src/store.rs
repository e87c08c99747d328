use async_trait::async_trait;
use bson::{Bson, Document, de::deserialize_from_bson, doc, oid::ObjectId, ser::serialize_to_bson};
use futures::TryStreamExt;
use mongodb::{Client, Collection as MongoCollection, Cursor, options::ClientOptions};
use serde_json::{Map as JsonMap, Value as JsonValue};
use std::{any::Any, fmt};
use tracing::debug;

use docmap_core::{
    backend::{
        Adapter, AdapterBuilder, ResultSet, load_instance, prepare_delete, prepare_save,
        reject_pending_attachments,
    },
    document::ModelInstance,
    error::{DatabaseError, DocumentError, DocumentResult, ValidationError},
    query::{MatchSpec, Query},
    schema::Model,
};

use crate::{query::match_filter, sanitizer::KeySanitizer};

/// Parses an identity string: the hex form of an object id becomes an `ObjectId`,
/// anything else is used verbatim.
pub fn parse_identity(id: &str) -> Bson {
    ObjectId::parse_str(id)
        .map(Bson::ObjectId)
        .unwrap_or_else(|_| Bson::String(id.to_string()))
}

/// Renders a stored `_id` as an identity string.
pub fn format_identity(id: &Bson) -> String {
    match id {
        Bson::ObjectId(oid) => oid.to_hex(),
        Bson::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn backend_error(err: mongodb::error::Error) -> DocumentError {
    DocumentError::database(err.to_string())
}

fn serialization_error(err: bson::error::Error) -> DocumentError {
    DocumentError::Serialization(err.to_string())
}

/// Converts a serialized instance to a sanitized BSON document.
pub(crate) fn to_stored(document: JsonMap<String, JsonValue>) -> DocumentResult<Document> {
    match KeySanitizer::sanitize_value(serialize_to_bson(&JsonValue::Object(document)).map_err(serialization_error)?) {
        Bson::Document(document) => Ok(document),
        other => Err(DocumentError::Serialization(format!("expected a document, got {other}"))),
    }
}

/// Converts a stored BSON document back to transport form, with `_id` as a string.
pub(crate) fn from_stored(mut document: Document) -> DocumentResult<JsonMap<String, JsonValue>> {
    let id = document.remove("_id");
    let restored = KeySanitizer::restore_value(Bson::Document(document));

    let mut json = match deserialize_from_bson::<JsonValue>(restored).map_err(serialization_error)? {
        JsonValue::Object(map) => map,
        other => return Err(DocumentError::Serialization(format!("expected a document, got {other}"))),
    };
    if let Some(id) = id {
        json.insert("_id".into(), JsonValue::String(format_identity(&id)));
    }

    Ok(json)
}

/// Native-protocol adapter over the async MongoDB driver.
///
/// Each document type lives in its own collection, named after the schema's collection
/// name. MongoDB keeps no revisions, so instances saved here carry none.
#[derive(Debug, Clone)]
pub struct MongoDbStore {
    client: Client,
    database: String,
}

impl MongoDbStore {
    pub fn new(client: Client, database: String) -> Self {
        Self { client, database }
    }

    pub fn builder(dsn: &str, database: &str) -> MongoDbStoreBuilder {
        MongoDbStoreBuilder::new(dsn, database)
    }

    fn get_collection(&self, model: &Model) -> MongoCollection<Document> {
        self.client
            .database(&self.database)
            .collection(&KeySanitizer::sanitize_key(model.schema().collection_name()))
    }

    /// Runs an exact-match query and returns a lazy cursor over the matches.
    pub fn find_matching(&self, model: &Model, spec: &MatchSpec) -> DocumentResult<MongoResults> {
        Ok(MongoResults {
            store: self.clone(),
            model: model.clone(),
            collection: self.get_collection(model),
            filter: match_filter(spec)?,
            cursor: None,
        })
    }

    /// Finds the single document matching `spec`.
    ///
    /// # Errors
    ///
    /// Returns a validation error carrying the match count when it is not exactly one.
    pub async fn one(&self, model: &Model, spec: &MatchSpec) -> DocumentResult<ModelInstance> {
        let mut results = self.find_matching(model, spec)?;

        match results.len().await? {
            1 => results
                .try_next()
                .await?
                .ok_or_else(|| DocumentError::NotFound(model.name().to_string())),
            count => Err(ValidationError::new(format!(
                "expected exactly one {} to match, found {count}",
                model.name()
            ))
            .into()),
        }
    }

    pub async fn shutdown(self) -> DocumentResult<()> {
        self.client.shutdown().await;

        Ok(())
    }
}

#[async_trait]
impl Adapter for MongoDbStore {
    fn kind(&self) -> &'static str {
        "MongoDB"
    }

    async fn save(&self, instance: &mut ModelInstance) -> DocumentResult<String> {
        prepare_save(instance)?;
        reject_pending_attachments(instance)?;

        let collection = self.get_collection(instance.model());
        let document = to_stored(instance.to_transport(&[], JsonMap::new())?)?;

        let id = match instance.id() {
            Some(id) => {
                let id = id.to_string();
                collection
                    .replace_one(doc! { "_id": parse_identity(&id) }, document)
                    .upsert(true)
                    .await
                    .map_err(backend_error)?;
                id
            }
            None => format_identity(
                &collection
                    .insert_one(document)
                    .await
                    .map_err(backend_error)?
                    .inserted_id,
            ),
        };

        debug!(collection = collection.name(), id = %id, "saved document");
        instance.set_identity(id.clone(), None);

        Ok(id)
    }

    async fn get(&self, model: &Model, id: &str) -> DocumentResult<ModelInstance> {
        let document = self
            .get_collection(model)
            .find_one(doc! { "_id": parse_identity(id) })
            .await
            .map_err(backend_error)?
            .ok_or_else(|| DocumentError::NotFound(format!("{} {id}", model.name())))?;

        load_instance(self, model, from_stored(document)?)
    }

    async fn find(&self, model: &Model, query: Query) -> DocumentResult<Box<dyn ResultSet>> {
        match query {
            Query::Match(spec) => Ok(Box::new(self.find_matching(model, &spec)?)),
            Query::View(view) => Err(DatabaseError::unsupported(&format!("view query {}", view.view)).into()),
        }
    }

    async fn delete(&self, instance: &mut ModelInstance) -> DocumentResult<()> {
        let id = prepare_delete(instance)?;
        let result = self
            .get_collection(instance.model())
            .delete_one(doc! { "_id": parse_identity(&id) })
            .await
            .map_err(backend_error)?;

        if result.deleted_count == 0 {
            return Err(DocumentError::NotFound(format!("{} {id}", instance.schema().name())));
        }
        debug!(collection = instance.schema().collection_name(), id = %id, "deleted document");

        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// A lazy cursor over the documents matching a filter.
///
/// Nothing is fetched until the first access. Results are ordered by `_id`.
pub struct MongoResults {
    store: MongoDbStore,
    model: Model,
    collection: MongoCollection<Document>,
    filter: Document,
    cursor: Option<Cursor<Document>>,
}

impl fmt::Debug for MongoResults {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MongoResults")
            .field("model", &self.model)
            .field("collection", &self.collection.name())
            .field("filter", &self.filter)
            .field("open", &self.cursor.is_some())
            .finish()
    }
}

impl MongoResults {
    fn load(&self, document: Document) -> DocumentResult<ModelInstance> {
        load_instance(&self.store, &self.model, from_stored(document)?)
    }
}

#[async_trait]
impl ResultSet for MongoResults {
    async fn len(&mut self) -> DocumentResult<usize> {
        let count = self
            .collection
            .count_documents(self.filter.clone())
            .await
            .map_err(backend_error)?;

        Ok(count as usize)
    }

    async fn get(&mut self, index: usize) -> DocumentResult<Option<ModelInstance>> {
        self.collection
            .find_one(self.filter.clone())
            .sort(doc! { "_id": 1 })
            .skip(index as u64)
            .await
            .map_err(backend_error)?
            .map(|document| self.load(document))
            .transpose()
    }

    async fn try_next(&mut self) -> DocumentResult<Option<ModelInstance>> {
        if self.cursor.is_none() {
            debug!(collection = self.collection.name(), "opening cursor");
            self.cursor = Some(
                self.collection
                    .find(self.filter.clone())
                    .sort(doc! { "_id": 1 })
                    .await
                    .map_err(backend_error)?,
            );
        }

        let next = match self.cursor.as_mut() {
            Some(cursor) => cursor.try_next().await.map_err(backend_error)?,
            None => None,
        };

        next.map(|document| self.load(document)).transpose()
    }

    async fn all(&mut self) -> DocumentResult<Vec<ModelInstance>> {
        self.collection
            .find(self.filter.clone())
            .sort(doc! { "_id": 1 })
            .await
            .map_err(backend_error)?
            .try_collect::<Vec<Document>>()
            .await
            .map_err(backend_error)?
            .into_iter()
            .map(|document| self.load(document))
            .collect()
    }

    async fn contains(&mut self, id: &str) -> DocumentResult<bool> {
        let mut filter = self.filter.clone();
        filter.insert("_id", parse_identity(id));

        let count = self
            .collection
            .count_documents(filter)
            .await
            .map_err(backend_error)?;

        Ok(count > 0)
    }
}

pub struct MongoDbStoreBuilder {
    dsn: String,
    database: String,
}

impl MongoDbStoreBuilder {
    pub fn new(dsn: &str, database: &str) -> Self {
        Self {
            dsn: dsn.to_string(),
            database: database.to_string(),
        }
    }
}

#[async_trait]
impl AdapterBuilder for MongoDbStoreBuilder {
    type Adapter = MongoDbStore;

    async fn build(self) -> DocumentResult<Self::Adapter> {
        debug!(database = %self.database, "connecting to MongoDB");

        Ok(MongoDbStore::new(
            Client::with_options(
                ClientOptions::parse(&self.dsn)
                    .await
                    .map_err(backend_error)?,
            )
            .map_err(backend_error)?,
            self.database,
        ))
    }
}
