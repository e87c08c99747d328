//! Lazy, paginated view results.
//!
//! A [`ViewQueryResult`] fetches nothing until it is first read. It then caches the
//! current page and the view's total row count. Changing the page size or page number
//! drops the cached page only.
//!
//! # Example
//!
//! ```ignore
//! let mut results = store.view(&users, ViewQuery::new("byName"));
//! results.limit(19);
//!
//! for number in 0..results.pages().await? {
//!     results.page(number);
//!     for user in results.rows().await? {
//!         println!("{:?}", user.id());
//!     }
//! }
//! ```

use async_trait::async_trait;
use reqwest::Method;
use serde::Deserialize;
use serde_json::{Value as JsonValue, json};
use tracing::debug;

use docmap_core::{
    backend::{ResultSet, load_instance},
    document::ModelInstance,
    error::{DocumentError, DocumentResult},
    page::PaginationParams,
    query::{ViewKeys, ViewQuery},
    schema::Model,
};

use crate::{store::CouchDbStore, transport::HttpRequest};

#[derive(Debug, Deserialize)]
struct ViewResponse {
    total_rows: Option<usize>,
    #[serde(default)]
    rows: Vec<ViewRow>,
}

#[derive(Debug, Deserialize)]
struct ViewRow {
    #[serde(default)]
    doc: Option<JsonValue>,
}

/// The result of querying a named view.
///
/// Length, indexing, iteration and membership all refer to the current page. Each
/// row is loaded as the document type whose type tag it carries, falling back to the
/// queried type.
#[derive(Debug)]
pub struct ViewQueryResult {
    store: CouchDbStore,
    model: Model,
    query: ViewQuery,
    pagination: PaginationParams,
    total: Option<usize>,
    page: Option<Vec<ModelInstance>>,
    cursor: usize,
}

impl ViewQueryResult {
    pub fn new(store: CouchDbStore, model: Model, query: ViewQuery) -> Self {
        Self {
            store,
            model,
            query,
            pagination: PaginationParams::unpaged(),
            total: None,
            page: None,
            cursor: 0,
        }
    }

    pub fn query(&self) -> &ViewQuery {
        &self.query
    }

    pub fn pagination(&self) -> PaginationParams {
        self.pagination
    }

    /// Sets the rows per page. `None` or zero disables paging.
    pub fn set_page_size(&mut self, page_size: Option<usize>) -> &mut Self {
        self.pagination = PaginationParams::new(page_size, self.pagination.page_number);
        self.invalidate_page();
        self
    }

    pub fn limit(&mut self, page_size: usize) -> &mut Self {
        self.set_page_size(Some(page_size))
    }

    /// Selects the zero-based page to read.
    pub fn page(&mut self, page_number: usize) -> &mut Self {
        self.pagination.page_number = page_number;
        self.invalidate_page();
        self
    }

    /// Drops every cached value so that the next read goes back to the server.
    pub fn refresh(&mut self) -> &mut Self {
        self.total = None;
        self.invalidate_page();
        self
    }

    /// The number of rows in the whole view, or matching the keys.
    pub async fn total(&mut self) -> DocumentResult<usize> {
        if let Some(total) = self.total {
            return Ok(total);
        }

        let total = match self.query.keys {
            // Keyed responses report the size of the whole view, so count the matches.
            ViewKeys::Keys(_) => {
                let request = self.view_request(false, PaginationParams::unpaged())?;
                self.fetch(request).await?.rows.len()
            }
            ViewKeys::All => {
                let request = self.view_request(false, PaginationParams::unpaged())?.query("limit", 0);
                self.fetch(request).await?.total_rows.unwrap_or_default()
            }
        };
        self.total = Some(total);

        Ok(total)
    }

    /// The number of pages at the current page size.
    pub async fn pages(&mut self) -> DocumentResult<usize> {
        let total = self.total().await?;
        Ok(self.pagination.page_count(total))
    }

    /// The instances on the current page, fetched on first access.
    pub async fn rows(&mut self) -> DocumentResult<&[ModelInstance]> {
        if self.page.is_none() {
            self.fetch_page().await?;
        }

        Ok(self.page.as_deref().unwrap_or_default())
    }

    fn invalidate_page(&mut self) {
        self.page = None;
        self.cursor = 0;
    }

    fn view_request(&self, include_docs: bool, window: PaginationParams) -> DocumentResult<HttpRequest> {
        let path = [
            "_design",
            self.model.schema().type_tag(),
            "_view",
            self.query.view.as_str(),
        ];

        let request = match &self.query.keys {
            ViewKeys::All => self.store.db_request(Method::GET, path),
            ViewKeys::Keys(keys) => self
                .store
                .db_request(Method::POST, path)
                .json(&json!({ "keys": keys }))?,
        }
        .query("include_docs", include_docs);

        let request = match window.limit() {
            Some(limit) => request.query("limit", limit),
            None => request,
        };

        Ok(match window.offset() {
            0 => request,
            skip => request.query("skip", skip),
        })
    }

    async fn fetch(&self, request: HttpRequest) -> DocumentResult<ViewResponse> {
        Ok(serde_json::from_value(self.store.request_json(request).await?)?)
    }

    async fn fetch_page(&mut self) -> DocumentResult<()> {
        let response = self.fetch(self.view_request(true, self.pagination)?).await?;
        if let (None, ViewKeys::All) = (self.total, &self.query.keys) {
            self.total = response.total_rows;
        }

        let catalog = self.model.catalog();
        let mut page = Vec::with_capacity(response.rows.len());
        for row in response.rows {
            let document = match row.doc {
                Some(JsonValue::Object(document)) => document,
                Some(JsonValue::Null) | None => continue,
                Some(other) => return Err(DocumentError::Serialization(format!("expected a document, got {other}"))),
            };

            let model = document
                .get("type")
                .and_then(JsonValue::as_str)
                .and_then(|tag| catalog.model_for_tag(tag))
                .unwrap_or_else(|| self.model.clone());
            page.push(load_instance(&self.store, &model, document)?);
        }

        debug!(
            view = %self.query.view,
            page = self.pagination.page_number,
            rows = page.len(),
            "fetched view page"
        );
        self.page = Some(page);
        self.cursor = 0;

        Ok(())
    }
}

impl CouchDbStore {
    /// Queries a named view.
    ///
    /// Unlike [`find`](docmap_core::backend::Adapter::find), the concrete result keeps
    /// its paging controls.
    pub fn view(&self, model: &Model, query: ViewQuery) -> ViewQueryResult {
        ViewQueryResult::new(self.clone(), model.clone(), query)
    }
}

#[async_trait]
impl ResultSet for ViewQueryResult {
    async fn len(&mut self) -> DocumentResult<usize> {
        Ok(self.rows().await?.len())
    }

    async fn get(&mut self, index: usize) -> DocumentResult<Option<ModelInstance>> {
        Ok(self.rows().await?.get(index).cloned())
    }

    async fn try_next(&mut self) -> DocumentResult<Option<ModelInstance>> {
        let cursor = self.cursor;
        let next = self.rows().await?.get(cursor).cloned();
        if next.is_some() {
            self.cursor += 1;
        }

        Ok(next)
    }

    async fn all(&mut self) -> DocumentResult<Vec<ModelInstance>> {
        Ok(self.rows().await?.to_vec())
    }

    async fn contains(&mut self, id: &str) -> DocumentResult<bool> {
        Ok(self
            .rows()
            .await?
            .iter()
            .any(|instance| instance.id() == Some(id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{HttpResponse, HttpTransport, TransportError};
    use docmap_core::schema::{Catalog, Schema};
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    #[derive(Debug)]
    struct Unreachable;

    #[async_trait]
    impl HttpTransport for Unreachable {
        async fn send(&self, _request: HttpRequest) -> Result<HttpResponse, TransportError> {
            Err(TransportError::Other("unreachable".into()))
        }
    }

    fn result(query: ViewQuery) -> ViewQueryResult {
        let model = Catalog::builder()
            .register(Schema::builder("SampleModel").view("getByStrField", "function(doc) {}"))
            .build()
            .unwrap()
            .model("SampleModel")
            .unwrap();

        ViewQueryResult::new(CouchDbStore::new(Arc::new(Unreachable), "docs", None), model, query)
    }

    #[test]
    fn test_unkeyed_request_uses_query_parameters() {
        let mut result = result(ViewQuery::new("getByStrField"));
        result.limit(19).page(2);

        let request = result.view_request(true, result.pagination()).unwrap();
        assert_eq!(request.method, Method::GET);
        assert_eq!(request.path, ["docs", "_design", "SampleModel", "_view", "getByStrField"]);
        assert_eq!(request.query_value("include_docs"), Some("true"));
        assert_eq!(request.query_value("limit"), Some("19"));
        assert_eq!(request.query_value("skip"), Some("38"));
        assert_eq!(request.body, None);
    }

    #[test]
    fn test_keyed_request_sends_keys_in_body() {
        let result = result(ViewQuery::new("getByStrField").keys(["foo", "bar"]));

        let request = result.view_request(true, result.pagination()).unwrap();
        assert_eq!(request.method, Method::POST);
        assert_eq!(request.query_value("limit"), None);
        assert_eq!(request.query_value("skip"), None);
        assert_eq!(
            serde_json::from_slice::<JsonValue>(request.body.as_deref().unwrap()).unwrap(),
            json!({"keys": ["foo", "bar"]})
        );
    }

    #[test]
    fn test_paging_changes_drop_the_cached_page() {
        let mut result = result(ViewQuery::new("getByStrField"));
        result.total = Some(100);
        result.page = Some(Vec::new());
        result.cursor = 3;

        result.limit(19);
        assert_eq!(result.page, None);
        assert_eq!(result.cursor, 0);
        assert_eq!(result.total, Some(100));

        result.page = Some(Vec::new());
        result.page(5);
        assert_eq!(result.page, None);

        result.refresh();
        assert_eq!(result.total, None);
    }

    #[tokio::test]
    async fn test_transport_failures_surface_on_first_read() {
        let mut result = result(ViewQuery::new("getByStrField"));

        assert!(result.len().await.unwrap_err().is_database_error());
        assert!(result.pages().await.unwrap_err().is_database_error());
    }
}
