use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD};
use reqwest::{Method, Url};
use serde::Deserialize;
use serde_json::{Map as JsonMap, Value as JsonValue};
use std::{any::Any, fmt, sync::Arc};
use tracing::{debug, warn};

use docmap_core::{
    attachment::{Attachment, AttachmentState},
    backend::{Adapter, AdapterBuilder, Preprocessed, ResultSet, load_instance, prepare_delete, prepare_save},
    document::ModelInstance,
    error::{DatabaseError, DocumentError, DocumentResult},
    query::Query,
    schema::{Catalog, Model},
};

use crate::transport::{HttpRequest, HttpResponse, HttpTransport, ReqwestTransport, TransportError};

/// Total attempts for a request whose connection was lost.
pub const MAX_ATTEMPTS: usize = 3;

pub const DEFAULT_PORT: u16 = 5984;

/// Basic-auth credentials attached to every request.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self { username: username.into(), password: password.into() }
    }

    pub fn header_value(&self) -> String {
        format!("Basic {}", STANDARD.encode(format!("{}:{}", self.username, self.password)))
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// Parses a server URL into a bare base URL and any embedded credentials.
///
/// `couchdb://` is accepted as an alias of `http://` and the port defaults to 5984.
///
/// # Errors
///
/// Returns a model error for unsupported schemes and for URLs carrying a path, query
/// or fragment.
pub fn parse_server_url(url: &str) -> DocumentResult<(Url, Option<Credentials>)> {
    let normalized = match url.strip_prefix("couchdb://") {
        Some(rest) => format!("http://{rest}"),
        None => url.to_string(),
    };
    let mut parsed = Url::parse(&normalized).map_err(|e| DocumentError::model(format!("invalid server url {url}: {e}")))?;

    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(DocumentError::model(format!("unsupported scheme {}", parsed.scheme())));
    }
    if parsed.path() != "/" || parsed.query().is_some() || parsed.fragment().is_some() {
        return Err(DocumentError::model(format!(
            "server url {url} carries a path, query or fragment"
        )));
    }

    let credentials = match parsed.username() {
        "" => None,
        username => Some(Credentials::new(username, parsed.password().unwrap_or_default())),
    };
    // Neither call can fail on an http(s) url with a host.
    let _ = parsed.set_username("");
    let _ = parsed.set_password(None);
    if parsed.port().is_none() {
        let _ = parsed.set_port(Some(DEFAULT_PORT));
    }

    Ok((parsed, credentials))
}

#[derive(Debug, Deserialize)]
struct AttachmentInfo {
    content_type: String,
    length: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct WriteResponse {
    id: String,
    rev: String,
}

/// HTTP/view adapter for CouchDB.
///
/// Documents of every type share one database and carry a `type` tag. Queries go
/// through named views; see [`sync_views`](CouchDbStore::sync_views). Attachments are
/// supported.
///
/// Requests are retried on lost connections, up to [`MAX_ATTEMPTS`] in total. HTTP
/// error responses are never retried.
#[derive(Clone)]
pub struct CouchDbStore {
    transport: Arc<dyn HttpTransport>,
    database: String,
    credentials: Option<Credentials>,
}

impl fmt::Debug for CouchDbStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CouchDbStore")
            .field("transport", &self.transport)
            .field("database", &self.database)
            .field("credentials", &self.credentials)
            .finish()
    }
}

impl CouchDbStore {
    pub fn new(transport: Arc<dyn HttpTransport>, database: impl Into<String>, credentials: Option<Credentials>) -> Self {
        Self {
            transport,
            database: database.into(),
            credentials,
        }
    }

    pub fn builder(url: &str, database: &str) -> CouchDbStoreBuilder {
        CouchDbStoreBuilder::new(url, database)
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    /// A request against a path below this store's database.
    pub(crate) fn db_request<S: Into<String>>(&self, method: Method, path: impl IntoIterator<Item = S>) -> HttpRequest {
        HttpRequest::new(
            method,
            std::iter::once(self.database.clone()).chain(path.into_iter().map(Into::into)),
        )
    }

    /// Sends a request, retrying only on lost connections.
    ///
    /// # Errors
    ///
    /// Non-2xx responses become a [`DatabaseError`] carrying status, reason and body.
    pub(crate) async fn request(&self, request: HttpRequest) -> DocumentResult<HttpResponse> {
        let request = match &self.credentials {
            Some(credentials) => request.header("Authorization", credentials.header_value()),
            None => request,
        };

        let mut attempt = 1;
        loop {
            debug!(method = %request.method, path = ?request.path, attempt, "couchdb request");

            match self.transport.send(request.clone()).await {
                Ok(response) => {
                    debug!(status = response.status, "couchdb response");
                    if !response.is_success() {
                        return Err(response.into_error());
                    }
                    return Ok(response);
                }
                Err(TransportError::ConnectionLost(reason)) if attempt < MAX_ATTEMPTS => {
                    warn!(attempt, reason = %reason, "connection lost, retrying on a fresh connection");
                    self.transport.reset();
                    attempt += 1;
                }
                Err(err) => return Err(DocumentError::database(err.to_string())),
            }
        }
    }

    pub(crate) async fn request_json(&self, request: HttpRequest) -> DocumentResult<JsonValue> {
        self.request(request).await?.json()
    }

    /// Fetches a raw document, mapping 404 to not-found.
    pub(crate) async fn fetch_document(&self, id: &str) -> DocumentResult<JsonMap<String, JsonValue>> {
        match self.request_json(self.db_request(Method::GET, [id])).await {
            Ok(JsonValue::Object(document)) => Ok(document),
            Ok(other) => Err(DocumentError::Serialization(format!("expected a document, got {other}"))),
            Err(err) if err.status() == Some(404) => Err(DocumentError::NotFound(id.to_string())),
            Err(err) => Err(err),
        }
    }

    /// Checks that the server answers with the CouchDB welcome payload.
    pub async fn ping(&self) -> DocumentResult<()> {
        let info = self.request_json(HttpRequest::new::<String>(Method::GET, [])).await?;

        match info.get("couchdb").and_then(JsonValue::as_str) {
            Some("Welcome") => Ok(()),
            _ => Err(DatabaseError::new(format!("not a CouchDB server: {info}")).into()),
        }
    }

    fn stored_body(&self, instance: &ModelInstance) -> DocumentResult<JsonValue> {
        let mut extra = JsonMap::new();
        extra.insert("type".into(), instance.schema().type_tag().into());
        if let Some(revision) = instance.revision() {
            extra.insert("_rev".into(), revision.into());
        }

        let stubs = instance
            .tracked_attachments()
            .filter(|attachment| attachment.state() != AttachmentState::New)
            .map(|attachment| (attachment.name().to_string(), attachment.to_json(false)))
            .collect::<JsonMap<_, _>>();
        if !stubs.is_empty() {
            extra.insert("_attachments".into(), JsonValue::Object(stubs));
        }

        Ok(JsonValue::Object(instance.to_transport(&[], extra)?))
    }

    /// Uploads pending attachments and issues pending deletions, one revision at a time.
    ///
    /// The instance carries the latest revision after every request, so a failure part
    /// way through leaves it ready for the next save.
    async fn sync_attachments(&self, instance: &mut ModelInstance, id: &str, mut revision: String) -> DocumentResult<String> {
        let pending = instance
            .attachments_mut()
            .values()
            .filter(|attachment| attachment.state() != AttachmentState::Stub)
            .cloned()
            .collect::<Vec<_>>();

        for attachment in pending {
            let request = match attachment.state() {
                AttachmentState::New => self
                    .db_request(Method::PUT, [id, attachment.name()])
                    .bytes(attachment.data().unwrap_or_default().to_vec(), attachment.content_type()),
                _ => self.db_request(Method::DELETE, [id, attachment.name()]),
            }
            .query("rev", &revision);

            let written: WriteResponse = serde_json::from_value(self.request_json(request).await?)?;
            revision = written.rev;
            instance.set_revision(Some(revision.clone()));

            match attachment.state() {
                AttachmentState::New => {
                    if let Some(stored) = instance.attachments_mut().get_mut(attachment.name()) {
                        stored.mark_stored();
                    }
                }
                _ => {
                    instance.attachments_mut().remove(attachment.name());
                }
            }
            debug!(id = %id, attachment = attachment.name(), revision = %revision, "synced attachment");
        }

        Ok(revision)
    }
}

#[async_trait]
impl Adapter for CouchDbStore {
    fn kind(&self) -> &'static str {
        "CouchDB"
    }

    async fn save(&self, instance: &mut ModelInstance) -> DocumentResult<String> {
        prepare_save(instance)?;

        let body = self.stored_body(instance)?;
        let request = match instance.id() {
            Some(id) => self.db_request(Method::PUT, [id]),
            None => self.db_request::<String>(Method::POST, []),
        }
        .json(&body)?;

        let written: WriteResponse = serde_json::from_value(self.request_json(request).await?)?;
        instance.set_identity(written.id.clone(), Some(written.rev.clone()));

        let revision = self.sync_attachments(instance, &written.id, written.rev).await?;

        debug!(id = %written.id, revision = %revision, "saved document");

        Ok(written.id)
    }

    async fn get(&self, model: &Model, id: &str) -> DocumentResult<ModelInstance> {
        let document = self.fetch_document(id).await.map_err(|err| match err {
            DocumentError::NotFound(_) => DocumentError::NotFound(format!("{} {id}", model.name())),
            other => other,
        })?;

        load_instance(self, model, document)
    }

    async fn find(&self, model: &Model, query: Query) -> DocumentResult<Box<dyn ResultSet>> {
        match query {
            Query::View(view) => Ok(Box::new(self.view(model, view))),
            Query::Match(_) => Err(DatabaseError::unsupported("exact-match query").into()),
        }
    }

    async fn delete(&self, instance: &mut ModelInstance) -> DocumentResult<()> {
        let id = prepare_delete(instance)?;
        let revision = match instance.revision() {
            Some(revision) => revision.to_string(),
            None => self
                .fetch_document(&id)
                .await?
                .get("_rev")
                .and_then(JsonValue::as_str)
                .map(str::to_string)
                .ok_or_else(|| DocumentError::database(format!("document {id} carries no revision")))?,
        };

        self.request(self.db_request(Method::DELETE, [id.as_str()]).query("rev", &revision))
            .await?;
        debug!(id = %id, "deleted document");

        Ok(())
    }

    fn attach(&self, instance: &mut ModelInstance, attachment: Attachment) -> DocumentResult<()> {
        instance
            .attachments_mut()
            .insert(attachment.name().to_string(), attachment);

        Ok(())
    }

    async fn read_attachment(&self, instance: &ModelInstance, name: &str) -> DocumentResult<Vec<u8>> {
        let id = instance
            .id()
            .ok_or_else(|| DocumentError::model(format!("{}: attachments of unsaved documents have no stored body", instance.schema().name())))?;

        match self.request(self.db_request(Method::GET, [id, name])).await {
            Ok(response) => Ok(response.body),
            Err(err) if err.status() == Some(404) => Err(DocumentError::NotFound(format!("attachment {name}"))),
            Err(err) => Err(err),
        }
    }

    fn delete_attachment(&self, instance: &mut ModelInstance, name: &str) -> DocumentResult<()> {
        instance.delete_attachment(name)
    }

    /// Splits `_attachments` off the document into attachment stubs.
    fn preprocess(&self, _model: &Model, mut document: JsonMap<String, JsonValue>) -> DocumentResult<Preprocessed> {
        let attachments = match document.remove("_attachments") {
            Some(raw) => serde_json::from_value::<JsonMap<String, JsonValue>>(raw)?
                .into_iter()
                .map(|(name, info)| {
                    let info: AttachmentInfo = serde_json::from_value(info)?;
                    Ok(Attachment::stub(name, info.content_type, info.length))
                })
                .collect::<DocumentResult<Vec<_>>>()?,
            None => Vec::new(),
        };

        Ok(Preprocessed { document, attachments })
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub struct CouchDbStoreBuilder {
    url: String,
    database: String,
    sync_views: bool,
    credentials: Option<Credentials>,
    transport: Option<Arc<dyn HttpTransport>>,
    catalog: Option<Arc<Catalog>>,
}

impl CouchDbStoreBuilder {
    pub fn new(url: &str, database: &str) -> Self {
        Self {
            url: url.to_string(),
            database: database.to_string(),
            sync_views: true,
            credentials: None,
            transport: None,
            catalog: None,
        }
    }

    /// Whether to push the catalog's views to the server on build. On by default.
    ///
    /// Syncing needs a [`catalog`](Self::catalog); without one the build skips it
    /// and logs a warning.
    pub fn sync_views(mut self, sync_views: bool) -> Self {
        self.sync_views = sync_views;
        self
    }

    /// Credentials to use instead of any embedded in the url.
    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.credentials = Some(Credentials::new(username, password));
        self
    }

    pub fn transport(mut self, transport: Arc<dyn HttpTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// The catalog whose views are synced on build.
    pub fn catalog(mut self, catalog: Arc<Catalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }
}

#[async_trait]
impl AdapterBuilder for CouchDbStoreBuilder {
    type Adapter = CouchDbStore;

    async fn build(self) -> DocumentResult<Self::Adapter> {
        let (base_url, embedded) = parse_server_url(&self.url)?;
        let transport = self
            .transport
            .unwrap_or_else(|| Arc::new(ReqwestTransport::new(base_url.clone())));

        debug!(server = %base_url, database = %self.database, "connecting to CouchDB");
        let store = CouchDbStore::new(transport, self.database.clone(), self.credentials.or(embedded));
        store.ping().await?;

        match (self.sync_views, &self.catalog) {
            (true, Some(catalog)) => {
                store.sync_views(catalog).await?;
            }
            (true, None) => warn!(database = %self.database, "view sync requested without a catalog, skipping"),
            (false, _) => {}
        }

        Ok(store)
    }
}
