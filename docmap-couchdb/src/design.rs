//! Design document sync.
//!
//! Every document type that declares views gets one design document, `_design/{type}`,
//! holding all of its views. Syncing fetches the current design document, replaces
//! the declared views in it, and writes it back under its prior revision.

use reqwest::Method;
use serde_json::{Map as JsonMap, Value as JsonValue, json};
use std::collections::BTreeMap;
use tracing::info;

use docmap_core::{
    error::{DocumentError, DocumentResult},
    schema::Catalog,
};

use crate::store::CouchDbStore;

/// Collects the declared views of every stored type, keyed by type tag.
pub fn design_documents(catalog: &Catalog) -> BTreeMap<String, JsonMap<String, JsonValue>> {
    let mut designs: BTreeMap<String, JsonMap<String, JsonValue>> = BTreeMap::new();

    for schema in catalog.schemas().filter(|schema| !schema.embedded()) {
        if schema.views().is_empty() {
            continue;
        }
        let views = designs.entry(schema.type_tag().to_string()).or_default();
        for (name, definition) in schema.views() {
            views.insert(name.clone(), json!({ "map": definition.map }));
        }
    }

    designs
}

impl CouchDbStore {
    /// Pushes the catalog's views to the server.
    ///
    /// Existing design documents keep their revision and any views not declared in
    /// the catalog.
    ///
    /// # Returns
    ///
    /// The number of design documents written.
    pub async fn sync_views(&self, catalog: &Catalog) -> DocumentResult<usize> {
        let designs = design_documents(catalog);

        for (tag, views) in &designs {
            let mut design = match self.request_json(self.db_request(Method::GET, ["_design", tag.as_str()])).await {
                Ok(JsonValue::Object(existing)) => existing,
                Ok(other) => {
                    return Err(DocumentError::Serialization(format!("expected a design document, got {other}")));
                }
                Err(err) if err.status() == Some(404) => JsonMap::new(),
                Err(err) => return Err(err),
            };

            design.insert("language".into(), "javascript".into());
            match design.get_mut("views") {
                Some(JsonValue::Object(existing)) => existing.extend(views.clone()),
                _ => {
                    design.insert("views".into(), JsonValue::Object(views.clone()));
                }
            }

            self.request(
                self.db_request(Method::PUT, ["_design", tag.as_str()])
                    .json(&JsonValue::Object(design))?,
            )
            .await?;
            info!(database = self.database(), design = %tag, views = views.len(), "synced design document");
        }

        Ok(designs.len())
    }
}
