//! Schema declaration and registration.
//!
//! A [`Schema`] is the immutable definition of one document type: its ordered fields
//! plus storage policy flags. Schemas are declared with [`SchemaBuilder`] and registered
//! together into a [`Catalog`], which resolves every flag against [`SchemaDefaults`] and
//! checks every document reference exactly once. After registration nothing is
//! recomputed: field lookup is a direct map lookup.
//!
//! # Example
//!
//! ```ignore
//! use docmap_core::{field::FieldSpec, schema::{Catalog, Schema}};
//!
//! let catalog = Catalog::builder()
//!     .register(
//!         Schema::builder("Address")
//!             .embedded(true)
//!             .field("street", FieldSpec::text().with_default("")),
//!     )
//!     .register(
//!         Schema::builder("User")
//!             .backend("CouchDB")
//!             .field("name", FieldSpec::text())
//!             .field("address", FieldSpec::document("Address").with_default_document())
//!             .view("byName", "function(doc) { emit(doc.name, null); }"),
//!     )
//!     .build()?;
//!
//! let users = catalog.model("User")?;
//! ```

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    fmt,
    sync::Arc,
};

use crate::{
    document::ModelInstance,
    error::{DocumentError, DocumentResult},
    field::FieldSpec,
};

/// Keys the persistence layer writes into stored documents. No field may use them.
pub const RESERVED_KEYS: [&str; 4] = ["_id", "_rev", "_attachments", "type"];

/// Hook run immediately before every save. Returning `false` aborts the save.
pub type TouchHook = Arc<dyn Fn(&mut ModelInstance) -> bool + Send + Sync>;

/// A named, precomputed query index maintained by a view-capable store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewDefinition {
    /// The map function source. Opaque to this crate.
    pub map: String,
}

/// System-level fallbacks for schema flags a type does not set itself.
#[derive(Debug, Clone, Default)]
pub struct SchemaDefaults {
    pub strict: bool,
    pub embedded: bool,
    pub backend: Option<String>,
}

/// Declares a document type before registration.
pub struct SchemaBuilder {
    name: String,
    fields: Vec<(String, FieldSpec)>,
    strict: Option<bool>,
    embedded: Option<bool>,
    backend: Option<String>,
    collection: Option<String>,
    type_name: Option<String>,
    views: BTreeMap<String, ViewDefinition>,
    touch: Option<TouchHook>,
}

impl SchemaBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: Vec::new(),
            strict: None,
            embedded: None,
            backend: None,
            collection: None,
            type_name: None,
            views: BTreeMap::new(),
            touch: None,
        }
    }

    /// Adds a field. Declaration order is preserved.
    pub fn field(mut self, name: impl Into<String>, spec: FieldSpec) -> Self {
        self.fields.push((name.into(), spec));
        self
    }

    /// When strict, assigning an attribute that is not a declared field is an error.
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = Some(strict);
        self
    }

    /// Embedded types only exist inside other documents and can never be saved or deleted.
    pub fn embedded(mut self, embedded: bool) -> Self {
        self.embedded = Some(embedded);
        self
    }

    /// Names the adapter this type persists through, as `kind` or `kind/instance`.
    pub fn backend(mut self, backend: impl Into<String>) -> Self {
        self.backend = Some(backend.into());
        self
    }

    /// Overrides the native collection name.
    pub fn collection(mut self, collection: impl Into<String>) -> Self {
        self.collection = Some(collection.into());
        self
    }

    /// Overrides the type tag stamped on documents written to schema-less stores.
    pub fn type_name(mut self, type_name: impl Into<String>) -> Self {
        self.type_name = Some(type_name.into());
        self
    }

    pub fn view(mut self, name: impl Into<String>, map: impl Into<String>) -> Self {
        self.views.insert(name.into(), ViewDefinition { map: map.into() });
        self
    }

    pub fn touch(mut self, hook: impl Fn(&mut ModelInstance) -> bool + Send + Sync + 'static) -> Self {
        self.touch = Some(Arc::new(hook));
        self
    }

    fn resolve(self, defaults: &SchemaDefaults) -> DocumentResult<Schema> {
        let mut index = HashMap::with_capacity(self.fields.len());

        for (position, (field, _)) in self.fields.iter().enumerate() {
            if RESERVED_KEYS.contains(&field.as_str()) {
                return Err(DocumentError::model(format!(
                    "{}: field name {field} is reserved",
                    self.name
                )));
            }
            if index.insert(field.clone(), position).is_some() {
                return Err(DocumentError::model(format!(
                    "{}: field {field} is declared twice",
                    self.name
                )));
            }
        }

        let collection = self.collection.unwrap_or_else(|| self.name.clone());
        let type_tag = self.type_name.unwrap_or_else(|| collection.clone());

        Ok(Schema {
            strict: self.strict.unwrap_or(defaults.strict),
            embedded: self.embedded.unwrap_or(defaults.embedded),
            backend: self.backend.or_else(|| defaults.backend.clone()),
            name: self.name,
            fields: self.fields,
            index,
            collection,
            type_tag,
            views: self.views,
            touch: self.touch,
        })
    }
}

/// A registered document type with every flag resolved.
pub struct Schema {
    name: String,
    fields: Vec<(String, FieldSpec)>,
    index: HashMap<String, usize>,
    strict: bool,
    embedded: bool,
    backend: Option<String>,
    collection: String,
    type_tag: String,
    views: BTreeMap<String, ViewDefinition>,
    touch: Option<TouchHook>,
}

impl fmt::Debug for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Schema")
            .field("name", &self.name)
            .field("fields", &self.fields)
            .field("strict", &self.strict)
            .field("embedded", &self.embedded)
            .field("backend", &self.backend)
            .field("collection", &self.collection)
            .field("type_tag", &self.type_tag)
            .field("views", &self.views)
            .finish_non_exhaustive()
    }
}

impl Schema {
    pub fn builder(name: impl Into<String>) -> SchemaBuilder {
        SchemaBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn strict(&self) -> bool {
        self.strict
    }

    pub fn embedded(&self) -> bool {
        self.embedded
    }

    pub fn backend(&self) -> Option<&str> {
        self.backend.as_deref()
    }

    /// The native collection: the override, else the schema name.
    pub fn collection_name(&self) -> &str {
        &self.collection
    }

    /// The type tag: the type override, else the collection name.
    pub fn type_tag(&self) -> &str {
        &self.type_tag
    }

    pub fn views(&self) -> &BTreeMap<String, ViewDefinition> {
        &self.views
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &FieldSpec)> {
        self.fields.iter().map(|(name, spec)| (name.as_str(), spec))
    }

    pub fn field_count(&self) -> usize {
        self.fields.len()
    }

    /// The position of a field in declaration order.
    pub fn position(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.position(name).map(|position| &self.fields[position].1)
    }

    pub(crate) fn field_at(&self, position: usize) -> (&str, &FieldSpec) {
        let (name, spec) = &self.fields[position];
        (name, spec)
    }

    pub(crate) fn touch_hook(&self) -> Option<&TouchHook> {
        self.touch.as_ref()
    }
}

/// The set of registered schemas, shared by every instance and adapter.
#[derive(Debug, Default)]
pub struct Catalog {
    schemas: Vec<Schema>,
    by_name: HashMap<String, usize>,
}

impl Catalog {
    pub fn builder() -> CatalogBuilder {
        CatalogBuilder::default()
    }

    pub fn empty() -> Arc<Catalog> {
        Arc::new(Catalog::default())
    }

    /// Returns a handle to the named document type.
    pub fn model(self: &Arc<Self>, name: &str) -> DocumentResult<Model> {
        self.by_name
            .get(name)
            .map(|&index| Model { catalog: Arc::clone(self), index })
            .ok_or_else(|| DocumentError::model(format!("unknown document type {name}")))
    }

    pub fn models(self: &Arc<Self>) -> Vec<Model> {
        (0..self.schemas.len())
            .map(|index| Model { catalog: Arc::clone(self), index })
            .collect()
    }

    /// Returns the document type whose type tag is `tag`.
    pub fn model_for_tag(self: &Arc<Self>, tag: &str) -> Option<Model> {
        self.schemas
            .iter()
            .position(|schema| schema.type_tag() == tag)
            .map(|index| Model { catalog: Arc::clone(self), index })
    }

    pub fn schemas(&self) -> impl Iterator<Item = &Schema> {
        self.schemas.iter()
    }

    pub fn schema(&self, name: &str) -> Option<&Schema> {
        self.by_name.get(name).map(|&index| &self.schemas[index])
    }
}

/// Collects schema declarations and resolves them into a [`Catalog`].
#[derive(Default)]
pub struct CatalogBuilder {
    defaults: SchemaDefaults,
    pending: Vec<SchemaBuilder>,
}

impl CatalogBuilder {
    pub fn with_defaults(mut self, defaults: SchemaDefaults) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn register(mut self, schema: SchemaBuilder) -> Self {
        self.pending.push(schema);
        self
    }

    /// Resolves every schema and verifies names and document references.
    ///
    /// # Errors
    ///
    /// Returns a model error for duplicate type names, stored types sharing a type tag,
    /// duplicate or reserved field names, and document fields naming an unregistered
    /// type.
    pub fn build(self) -> DocumentResult<Arc<Catalog>> {
        let mut catalog = Catalog::default();

        for pending in self.pending {
            let schema = pending.resolve(&self.defaults)?;

            if catalog.by_name.contains_key(schema.name()) {
                return Err(DocumentError::model(format!(
                    "document type {} is registered twice",
                    schema.name()
                )));
            }

            catalog
                .by_name
                .insert(schema.name().to_string(), catalog.schemas.len());
            catalog.schemas.push(schema);
        }

        let mut tags = HashMap::new();
        for schema in catalog.schemas.iter().filter(|schema| !schema.embedded()) {
            if let Some(other) = tags.insert(schema.type_tag(), schema.name()) {
                return Err(DocumentError::model(format!(
                    "{other} and {} share the type tag {}",
                    schema.name(),
                    schema.type_tag()
                )));
            }
        }

        let known = catalog.by_name.keys().map(String::as_str).collect::<HashSet<_>>();
        for schema in &catalog.schemas {
            for (field, spec) in schema.fields() {
                if let Some(target) = spec
                    .document_targets()
                    .into_iter()
                    .find(|target| !known.contains(target))
                {
                    return Err(DocumentError::model(format!(
                        "{}.{field} refers to unknown document type {target}",
                        schema.name()
                    )));
                }
            }
        }

        Ok(Arc::new(catalog))
    }
}

/// A cheap, cloneable handle to one registered document type.
#[derive(Clone)]
pub struct Model {
    catalog: Arc<Catalog>,
    index: usize,
}

impl Model {
    pub fn schema(&self) -> &Schema {
        &self.catalog.schemas[self.index]
    }

    pub fn name(&self) -> &str {
        self.schema().name()
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    /// Builds a new instance with every field at its default.
    pub fn instance(&self) -> DocumentResult<ModelInstance> {
        ModelInstance::new(self)
    }
}

impl fmt::Debug for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Model").field(&self.name()).finish()
    }
}

impl PartialEq for Model {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index && Arc::ptr_eq(&self.catalog, &other.catalog)
    }
}
