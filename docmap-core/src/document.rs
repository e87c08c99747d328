//! Live documents.
//!
//! A [`ModelInstance`] holds validated field values for one document, enforces its
//! schema on every assignment, and carries the identity and attachments the
//! persistence layer needs. Field values are stored positionally, in the schema's
//! declaration order, so every access is a direct lookup.

use serde_json::{Map as JsonMap, Value as JsonValue};
use std::{collections::BTreeMap, fmt, io::Read};

use crate::{
    attachment::{Attachment, AttachmentState},
    error::{DocumentError, DocumentResult, ValidationError},
    schema::{Model, RESERVED_KEYS, Schema},
    value::Value,
};

/// The store-assigned identity of a document.
///
/// `id` stays `None` until the first successful save and is assigned by the adapter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Identity {
    pub id: Option<String>,
    pub revision: Option<String>,
}

/// How cleanly an instance was rebuilt from stored data.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum LoadStatus {
    /// Constructed directly, or loaded with every adapter hook succeeding.
    #[default]
    Clean,
    /// The adapter's preprocess hook failed and the raw stored data was used as-is.
    Degraded(String),
}

/// How attributes that are not declared fields are treated during construction.
#[derive(Clone, Copy, PartialEq)]
enum UnknownKeys {
    /// Route through [`ModelInstance::set`]: kept on loose schemas, rejected on strict ones.
    Assign,
    /// Kept on loose schemas, silently dropped on strict ones.
    Lenient,
}

/// A live document bound to its schema.
#[derive(Clone)]
pub struct ModelInstance {
    model: Model,
    values: Vec<Value>,
    extras: BTreeMap<String, Value>,
    identity: Identity,
    attachments: BTreeMap<String, Attachment>,
    status: LoadStatus,
}

impl ModelInstance {
    /// Creates an instance with every field at its default.
    ///
    /// Defaults run through validation like any assigned value. A document default
    /// produces a fresh nested instance per call, never a shared one.
    pub fn new(model: &Model) -> DocumentResult<Self> {
        Self::build(model, BTreeMap::new(), UnknownKeys::Assign)
    }

    /// Creates an instance from explicit values, defaulting the rest.
    ///
    /// Keys that are not fields follow assignment rules: kept as plain attributes on
    /// loose schemas, rejected on strict ones.
    pub fn with_values<K, V>(model: &Model, values: impl IntoIterator<Item = (K, V)>) -> DocumentResult<Self>
    where
        K: Into<String>,
        V: Into<Value>,
    {
        Self::build(
            model,
            values
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
            UnknownKeys::Assign,
        )
    }

    /// Creates an instance from a raw mapping, as found nested inside another document.
    ///
    /// `_id` and `_rev` become the identity; other reserved keys are dropped. Unknown
    /// keys are ignored on strict schemas.
    pub fn from_map(model: &Model, mut values: BTreeMap<String, Value>) -> DocumentResult<Self> {
        let identity = Identity {
            id: values.remove("_id").and_then(|v| v.scalar_text()),
            revision: values.remove("_rev").and_then(|v| v.scalar_text()),
        };
        values.retain(|key, _| !RESERVED_KEYS.contains(&key.as_str()));

        let mut instance = Self::build(model, values, UnknownKeys::Lenient)?;
        instance.identity = identity;

        Ok(instance)
    }

    /// Creates an instance from a stored JSON document.
    pub fn from_stored(model: &Model, document: JsonMap<String, JsonValue>) -> DocumentResult<Self> {
        Self::from_map(
            model,
            document
                .into_iter()
                .map(|(k, v)| (k, Value::from(v)))
                .collect(),
        )
    }

    fn build(model: &Model, mut supplied: BTreeMap<String, Value>, unknown: UnknownKeys) -> DocumentResult<Self> {
        let schema = model.schema();
        let mut instance = Self {
            model: model.clone(),
            values: vec![Value::Null; schema.field_count()],
            extras: BTreeMap::new(),
            identity: Identity::default(),
            attachments: BTreeMap::new(),
            status: LoadStatus::Clean,
        };

        for position in 0..schema.field_count() {
            let (name, spec) = schema.field_at(position);
            let value = match supplied.remove(name) {
                Some(value) => value,
                None => spec.make_default(model.catalog())?,
            };
            instance.set(name, value)?;
        }

        for (name, value) in supplied {
            match unknown {
                UnknownKeys::Assign => instance.set(&name, value)?,
                UnknownKeys::Lenient if !schema.strict() => {
                    instance.extras.insert(name, value);
                }
                UnknownKeys::Lenient => {}
            }
        }

        Ok(instance)
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    pub fn schema(&self) -> &Schema {
        self.model.schema()
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn id(&self) -> Option<&str> {
        self.identity.id.as_deref()
    }

    pub fn revision(&self) -> Option<&str> {
        self.identity.revision.as_deref()
    }

    /// Records the identity assigned by a store. Adapters call this after a write.
    pub fn set_identity(&mut self, id: impl Into<String>, revision: Option<String>) {
        self.identity = Identity { id: Some(id.into()), revision };
    }

    pub fn set_revision(&mut self, revision: Option<String>) {
        self.identity.revision = revision;
    }

    pub fn load_status(&self) -> &LoadStatus {
        &self.status
    }

    pub(crate) fn set_load_status(&mut self, status: LoadStatus) {
        self.status = status;
    }

    /// Returns the stored value of a field or plain attribute.
    pub fn get(&self, name: &str) -> DocumentResult<&Value> {
        match self.schema().position(name) {
            Some(position) => Ok(&self.values[position]),
            None => self.extras.get(name).ok_or_else(|| self.no_such_attribute(name)),
        }
    }

    /// Returns a mutable handle to a nested document held by a field.
    pub fn document_mut(&mut self, name: &str) -> DocumentResult<&mut ModelInstance> {
        let position = self
            .schema()
            .position(name)
            .ok_or_else(|| self.no_such_attribute(name))?;
        let owner = self.schema().name().to_string();

        self.values[position]
            .as_document_mut()
            .ok_or_else(|| DocumentError::model(format!("{owner}.{name} does not hold a loaded document")))
    }

    /// Assigns a field or plain attribute.
    ///
    /// Field values are validated; the error names the owning type and field.
    /// Attributes that are not fields are accepted on loose schemas, or when the
    /// attribute already exists.
    pub fn set(&mut self, name: &str, value: impl Into<Value>) -> Result<(), ValidationError> {
        let value = value.into();

        match self.schema().position(name) {
            Some(position) => {
                let (_, spec) = self.schema().field_at(position);
                let validated = spec
                    .validate(value, self.model.catalog())
                    .map_err(|err| err.within(self.schema().name(), name))?;
                self.values[position] = validated;
            }
            None if !self.schema().strict() || self.extras.contains_key(name) => {
                self.extras.insert(name.to_string(), value);
            }
            None => {
                return Err(ValidationError::new(format!(
                    "{}: no such attribute {name}",
                    self.schema().name()
                )));
            }
        }

        Ok(())
    }

    /// Iterates declared fields and their values in declaration order.
    pub fn values(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.schema()
            .fields()
            .map(|(name, _)| name)
            .zip(self.values.iter())
    }

    /// Plain attributes that are not declared fields. They are never persisted.
    pub fn extras(&self) -> &BTreeMap<String, Value> {
        &self.extras
    }

    /// Serializes declared fields to the transport form.
    ///
    /// Fields named in `skip` are left out; `extra` pairs are merged last, so they win
    /// over field values of the same name.
    pub fn to_transport(&self, skip: &[&str], extra: JsonMap<String, JsonValue>) -> DocumentResult<JsonMap<String, JsonValue>> {
        let mut out = JsonMap::new();

        for ((name, spec), value) in self.schema().fields().zip(self.values.iter()) {
            if skip.contains(&name) {
                continue;
            }
            out.insert(name.to_string(), spec.serialize(value)?);
        }
        out.extend(extra);

        Ok(out)
    }

    /// Runs the schema's touch hook. Types without a hook always succeed.
    pub fn touch(&mut self) -> bool {
        let hook = self.schema().touch_hook().cloned();
        match hook {
            Some(hook) => hook(self),
            None => true,
        }
    }

    /// Attaches in-memory bytes under `name`, replacing any attachment of that name.
    pub fn attach(&mut self, name: impl Into<String>, data: impl Into<Vec<u8>>, content_type: Option<&str>) {
        let attachment = Attachment::new(name, data, content_type);
        self.attachments.insert(attachment.name().to_string(), attachment);
    }

    /// Attaches the full contents of `reader` under `name`.
    pub fn attach_reader(&mut self, name: impl Into<String>, reader: impl Read, content_type: Option<&str>) -> DocumentResult<()> {
        let attachment = Attachment::from_reader(name, reader, content_type)?;
        self.attachments.insert(attachment.name().to_string(), attachment);

        Ok(())
    }

    /// Live attachments, excluding those marked for deletion.
    pub fn attachments(&self) -> impl Iterator<Item = &Attachment> {
        self.attachments
            .values()
            .filter(|attachment| attachment.state() != AttachmentState::Deleted)
    }

    pub fn attachment(&self, name: &str) -> Option<&Attachment> {
        self.attachments
            .get(name)
            .filter(|attachment| attachment.state() != AttachmentState::Deleted)
    }

    /// Marks an attachment for removal on the next save.
    ///
    /// Attachments that were never saved are dropped immediately.
    pub fn delete_attachment(&mut self, name: &str) -> DocumentResult<()> {
        let attachment = self
            .attachments
            .get_mut(name)
            .filter(|attachment| attachment.state() != AttachmentState::Deleted)
            .ok_or_else(|| DocumentError::model(format!("{}: no attachment named {name}", self.model.name())))?;

        if attachment.state() == AttachmentState::New {
            self.attachments.remove(name);
        } else {
            attachment.mark_deleted();
        }

        Ok(())
    }

    /// Every tracked attachment, including pending deletions.
    pub fn tracked_attachments(&self) -> impl Iterator<Item = &Attachment> {
        self.attachments.values()
    }

    /// Mutable access to the tracked attachments. Used by adapters.
    pub fn attachments_mut(&mut self) -> &mut BTreeMap<String, Attachment> {
        &mut self.attachments
    }

    fn no_such_attribute(&self, name: &str) -> DocumentError {
        DocumentError::model(format!("{}: no such attribute {name}", self.schema().name()))
    }
}

impl PartialEq for ModelInstance {
    fn eq(&self, other: &Self) -> bool {
        self.model == other.model
            && self.identity == other.identity
            && self.values == other.values
            && self.extras == other.extras
            && self.attachments == other.attachments
    }
}

impl fmt::Debug for ModelInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(self.schema().name())
            .field("identity", &self.identity)
            .field("values", &self.values().collect::<BTreeMap<_, _>>())
            .field("attachments", &self.attachments.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        field::FieldSpec,
        schema::{Catalog, Schema},
    };
    use chrono::{TimeZone, Utc};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::Arc;

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
                    .field("strField", FieldSpec::text().with_default(""))
                    .field(
                        "embedField",
                        FieldSpec::document("SampleEmbeddedModel").with_default_document(),
                    )
                    .field("linkField", FieldSpec::document("SampleModel")),
            )
            .register(
                Schema::builder("StrictModel")
                    .strict(true)
                    .field("name", FieldSpec::text()),
            )
            .register(
                Schema::builder("UncastModel")
                    .strict(true)
                    .field("at", FieldSpec::datetime().with_cast(false))
                    .field(
                        "embedField",
                        FieldSpec::document("SampleEmbeddedModel")
                            .with_cast(false)
                            .with_default_document(),
                    ),
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
    fn test_instantiation_empty() {
        let catalog = catalog();
        let instance = ModelInstance::new(&catalog.model("SampleModel").unwrap()).unwrap();

        assert_eq!(instance.get("strField").unwrap(), &Value::from(""));
        let embed = instance.get("embedField").unwrap().as_document().unwrap();
        assert_eq!(embed.get("strField").unwrap(), &Value::from(""));
        assert_eq!(embed.get("intField").unwrap(), &Value::Int(0));
        assert_eq!(instance.get("linkField").unwrap(), &Value::Null);
        assert_eq!(instance.id(), None);
    }

    #[test]
    fn test_instantiation_with_values() {
        let catalog = catalog();
        let instance =
            ModelInstance::with_values(&catalog.model("SampleModel").unwrap(), [("strField", "bar")]).unwrap();

        assert_eq!(instance.get("strField").unwrap(), &Value::from("bar"));
    }

    #[test]
    fn test_nested_assignment_is_validated() {
        let catalog = catalog();
        let mut instance = ModelInstance::new(&catalog.model("SampleModel").unwrap()).unwrap();

        instance.document_mut("embedField").unwrap().set("intField", "12").unwrap();
        let embed = instance.get("embedField").unwrap().as_document().unwrap();
        assert_eq!(embed.get("intField").unwrap(), &Value::Int(12));

        let err = instance
            .document_mut("embedField")
            .unwrap()
            .set("intField", "twelve")
            .unwrap_err();
        assert!(err.message().starts_with("SampleEmbeddedModel.intField: "));
    }

    #[test]
    fn test_default_documents_are_isolated() {
        let catalog = catalog();
        let model = catalog.model("SampleModel").unwrap();
        let mut first = ModelInstance::new(&model).unwrap();
        let second = ModelInstance::new(&model).unwrap();

        first.document_mut("embedField").unwrap().set("strField", "changed").unwrap();

        let untouched = second.get("embedField").unwrap().as_document().unwrap();
        assert_eq!(untouched.get("strField").unwrap(), &Value::from(""));
    }

    #[test]
    fn test_validation_error_names_owner() {
        let catalog = catalog();
        let mut instance = ModelInstance::new(&catalog.model("SampleModel").unwrap()).unwrap();

        let err = instance.set("embedField", 42).unwrap_err();
        assert!(err.message().starts_with("SampleModel.embedField: "));
    }

    #[test]
    fn test_strict_rejects_unknown_attribute() {
        let catalog = catalog();
        let mut strict = ModelInstance::new(&catalog.model("StrictModel").unwrap()).unwrap();
        let mut loose = ModelInstance::new(&catalog.model("SampleModel").unwrap()).unwrap();

        assert!(strict.set("other", 1).is_err());
        assert!(strict.get("other").unwrap_err().is_model_error());

        loose.set("scratch", 1).unwrap();
        assert_eq!(loose.get("scratch").unwrap(), &Value::Int(1));
        assert!(!loose.to_transport(&[], JsonMap::new()).unwrap().contains_key("scratch"));
    }

    #[test]
    fn test_strict_load_ignores_unknown_keys() {
        let catalog = catalog();
        let stored = json!({"_id": "abc", "_rev": "1-x", "type": "StrictModel", "name": "n", "junk": true});

        let instance = ModelInstance::from_stored(
            &catalog.model("StrictModel").unwrap(),
            stored.as_object().cloned().unwrap(),
        )
        .unwrap();

        assert_eq!(instance.id(), Some("abc"));
        assert_eq!(instance.revision(), Some("1-x"));
        assert_eq!(instance.get("name").unwrap(), &Value::from("n"));
        assert!(instance.extras().is_empty());
    }

    #[test]
    fn test_transport_form() {
        let catalog = catalog();
        let model = catalog.model("SampleModel").unwrap();
        let mut linked = ModelInstance::new(&model).unwrap();
        linked.set_identity("linked-id", None);

        let mut instance = ModelInstance::with_values(&model, [("strField", "foo")]).unwrap();
        instance.set("linkField", linked).unwrap();

        let mut extra = JsonMap::new();
        extra.insert("type".into(), json!("SampleModel"));

        assert_eq!(
            JsonValue::Object(instance.to_transport(&[], extra).unwrap()),
            json!({
                "strField": "foo",
                "embedField": {"strField": "", "intField": 0},
                "linkField": "linked-id",
                "type": "SampleModel",
            })
        );
        assert!(!instance.to_transport(&["strField"], JsonMap::new()).unwrap().contains_key("strField"));
    }

    #[test]
    fn test_uncast_fields_reload_from_transport_form() {
        let catalog = catalog();
        let model = catalog.model("UncastModel").unwrap();
        let at = Utc.with_ymd_and_hms(2026, 10, 16, 1, 36, 53).unwrap();

        let mut instance = ModelInstance::new(&model).unwrap();
        instance.set("at", at).unwrap();
        instance.document_mut("embedField").unwrap().set("intField", 9).unwrap();

        let stored = instance.to_transport(&[], JsonMap::new()).unwrap();
        let reloaded = ModelInstance::from_stored(&model, stored).unwrap();

        assert_eq!(reloaded.get("at").unwrap(), &Value::DateTime(at));
        assert_eq!(
            reloaded.get("embedField").unwrap().as_document().unwrap().get("intField").unwrap(),
            &Value::Int(9)
        );
        assert_eq!(reloaded, instance);
    }

    #[test]
    fn test_unsaved_reference_cannot_serialize() {
        let catalog = catalog();
        let model = catalog.model("SampleModel").unwrap();
        let mut instance = ModelInstance::new(&model).unwrap();
        instance.set("linkField", ModelInstance::new(&model).unwrap()).unwrap();

        assert!(instance.to_transport(&[], JsonMap::new()).unwrap_err().is_model_error());
    }

    #[test]
    fn test_touch_hook() {
        let catalog = catalog();
        let mut touchable = ModelInstance::new(&catalog.model("TouchableModel").unwrap()).unwrap();
        let mut plain = ModelInstance::new(&catalog.model("SampleModel").unwrap()).unwrap();

        assert!(touchable.touch());
        assert_eq!(touchable.get("strField").unwrap(), &Value::from("touched"));
        assert!(plain.touch());
    }

    #[test]
    fn test_attachment_bookkeeping() {
        let catalog = catalog();
        let mut instance = ModelInstance::new(&catalog.model("SampleModel").unwrap()).unwrap();

        instance.attach("a.txt", "hello", None);
        assert_eq!(instance.attachment("a.txt").unwrap().data(), Some(&b"hello"[..]));

        instance.delete_attachment("a.txt").unwrap();
        assert!(instance.attachment("a.txt").is_none());
        assert!(instance.attachments_mut().is_empty());
        assert!(instance.delete_attachment("a.txt").unwrap_err().is_model_error());

        instance
            .attachments_mut()
            .insert("b.txt".into(), Attachment::stub("b.txt", "text/plain", Some(5)));
        instance.delete_attachment("b.txt").unwrap();
        assert!(instance.attachment("b.txt").is_none());
        assert_eq!(instance.attachments_mut()["b.txt"].state(), AttachmentState::Deleted);
    }
}
