//! An in-process CouchDB stand-in speaking through the `HttpTransport` seam.

#![allow(dead_code)]

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD};
use docmap_couchdb::{HttpRequest, HttpResponse, HttpTransport, TransportError};
use reqwest::Method;
use serde_json::{Map as JsonMap, Value as JsonValue, json};
use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    sync::{Arc, Mutex},
};
use uuid::Uuid;

/// Computes the keys a document emits into a view.
pub type Emit = Arc<dyn Fn(&JsonMap<String, JsonValue>) -> Vec<JsonValue> + Send + Sync>;

#[derive(Debug, Clone)]
struct StoredAttachment {
    content_type: String,
    data: Vec<u8>,
}

#[derive(Debug, Clone)]
struct StoredDocument {
    generation: u64,
    revision: String,
    body: JsonMap<String, JsonValue>,
    attachments: BTreeMap<String, StoredAttachment>,
}

impl StoredDocument {
    fn bump(&mut self) -> String {
        self.generation += 1;
        self.revision = format!("{}-{}", self.generation, Uuid::new_v4().simple());
        self.revision.clone()
    }

    fn to_json(&self, id: &str) -> JsonMap<String, JsonValue> {
        let mut document = self.body.clone();
        document.insert("_id".into(), id.into());
        document.insert("_rev".into(), self.revision.clone().into());
        if !self.attachments.is_empty() {
            let stubs = self
                .attachments
                .iter()
                .map(|(name, attachment)| {
                    (
                        name.clone(),
                        json!({
                            "content_type": attachment.content_type,
                            "length": attachment.data.len(),
                            "stub": true,
                            "revpos": 1,
                        }),
                    )
                })
                .collect();
            document.insert("_attachments".into(), JsonValue::Object(stubs));
        }
        document
    }
}

type Database = BTreeMap<String, StoredDocument>;

#[derive(Default)]
struct State {
    databases: BTreeMap<String, Database>,
    admins: BTreeMap<String, String>,
    emitters: HashMap<(String, String), Emit>,
    faults: usize,
    requests: Vec<HttpRequest>,
}

pub struct FakeCouch {
    state: Mutex<State>,
}

impl fmt::Debug for FakeCouch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FakeCouch")
    }
}

fn respond(status: u16, body: JsonValue) -> HttpResponse {
    let reason = match status {
        200 => "OK",
        201 => "Created",
        400 => "Bad Request",
        401 => "Unauthorized",
        404 => "Object Not Found",
        405 => "Method Not Allowed",
        409 => "Conflict",
        412 => "Precondition Failed",
        _ => "Unknown",
    };

    HttpResponse {
        status,
        reason: reason.into(),
        body: serde_json::to_vec(&body).unwrap(),
    }
}

fn error(status: u16, error: &str, reason: &str) -> HttpResponse {
    respond(status, json!({"error": error, "reason": reason}))
}

fn not_found(reason: &str) -> HttpResponse {
    error(404, "not_found", reason)
}

fn conflict() -> HttpResponse {
    error(409, "conflict", "Document update conflict.")
}

fn body_json(request: &HttpRequest) -> Option<JsonValue> {
    request
        .body
        .as_deref()
        .and_then(|body| serde_json::from_slice(body).ok())
}

fn sort_key(key: &JsonValue) -> String {
    match key {
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    }
}

impl FakeCouch {
    pub fn new() -> Arc<Self> {
        let mut state = State::default();
        state.databases.insert("_users".into(), Database::new());

        Arc::new(Self { state: Mutex::new(state) })
    }

    /// Backs the view `tag/view` with `emit`. The view must also be synced to exist.
    pub fn emit(&self, tag: &str, view: &str, emit: impl Fn(&JsonMap<String, JsonValue>) -> Vec<JsonValue> + Send + Sync + 'static) {
        self.state
            .lock()
            .unwrap()
            .emitters
            .insert((tag.into(), view.into()), Arc::new(emit));
    }

    /// Makes the next `count` requests fail with a lost connection.
    pub fn fail_next(&self, count: usize) {
        self.state.lock().unwrap().faults = count;
    }

    pub fn request_count(&self) -> usize {
        self.state.lock().unwrap().requests.len()
    }

    pub fn last_request(&self) -> Option<HttpRequest> {
        self.state.lock().unwrap().requests.last().cloned()
    }

    pub fn document(&self, database: &str, id: &str) -> Option<JsonValue> {
        self.state
            .lock()
            .unwrap()
            .databases
            .get(database)
            .and_then(|db| db.get(id))
            .map(|doc| JsonValue::Object(doc.to_json(id)))
    }

    /// Adds a view to a stored design document behind the adapter's back.
    pub fn add_view(&self, database: &str, tag: &str, view: &str, map: &str) {
        let mut state = self.state.lock().unwrap();
        let design = state
            .databases
            .get_mut(database)
            .and_then(|db| db.get_mut(&format!("_design/{tag}")))
            .unwrap();
        design.body["views"]
            .as_object_mut()
            .unwrap()
            .insert(view.into(), json!({ "map": map }));
        design.bump();
    }

    pub fn document_count(&self, database: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .databases
            .get(database)
            .map(|db| db.keys().filter(|id| !id.starts_with("_design/")).count())
            .unwrap_or(0)
    }

    fn handle(state: &mut State, request: &HttpRequest) -> HttpResponse {
        let path = request.path.iter().map(String::as_str).collect::<Vec<_>>();
        let admin = Self::is_admin(state, request);

        match (&request.method, path.as_slice()) {
            (&Method::GET, []) => respond(200, json!({"couchdb": "Welcome", "version": "fake"})),
            (method, ["_config", "admins", name]) => {
                if !admin {
                    return error(401, "unauthorized", "You are not a server admin.");
                }
                match *method {
                    Method::PUT => {
                        let password = body_json(request)
                            .and_then(|body| body.as_str().map(str::to_string))
                            .unwrap_or_default();
                        state.admins.insert(name.to_string(), password);
                        respond(200, json!(""))
                    }
                    Method::DELETE => match state.admins.remove(*name) {
                        Some(_) => respond(200, json!("")),
                        None => not_found("missing"),
                    },
                    _ => error(405, "method_not_allowed", "Only GET,PUT,DELETE allowed"),
                }
            }
            (&Method::PUT, [db]) => {
                if !admin {
                    return error(401, "unauthorized", "You are not a server admin.");
                }
                if state.databases.contains_key(*db) {
                    return error(412, "file_exists", "The database could not be created, the file already exists.");
                }
                state.databases.insert(db.to_string(), Database::new());
                respond(201, json!({"ok": true}))
            }
            (&Method::DELETE, [db]) => {
                if !admin {
                    return error(401, "unauthorized", "You are not a server admin.");
                }
                match state.databases.remove(*db) {
                    Some(_) => respond(200, json!({"ok": true})),
                    None => not_found("Database does not exist."),
                }
            }
            (method, [db, rest @ ..]) => {
                let emitters = state.emitters.clone();
                let Some(database) = state.databases.get_mut(*db) else {
                    return not_found("Database does not exist.");
                };
                Self::handle_database(database, &emitters, method, rest, request)
            }
            _ => error(400, "bad_request", "unsupported request"),
        }
    }

    fn is_admin(state: &State, request: &HttpRequest) -> bool {
        if state.admins.is_empty() {
            return true;
        }

        request
            .header_value("Authorization")
            .and_then(|value| value.strip_prefix("Basic "))
            .and_then(|encoded| STANDARD.decode(encoded).ok())
            .and_then(|decoded| String::from_utf8(decoded).ok())
            .and_then(|pair| {
                pair.split_once(':')
                    .map(|(user, password)| state.admins.get(user).is_some_and(|expected| expected == password))
            })
            .unwrap_or(false)
    }

    fn handle_database(
        database: &mut Database,
        emitters: &HashMap<(String, String), Emit>,
        method: &Method,
        path: &[&str],
        request: &HttpRequest,
    ) -> HttpResponse {
        match (method, path) {
            (&Method::POST, []) => {
                let id = Uuid::new_v4().simple().to_string();
                Self::put_document(database, &id, body_json(request))
            }
            (&Method::GET | &Method::POST, ["_design", tag, "_view", view]) => {
                Self::query_view(database, emitters, tag, view, request)
            }
            (method, ["_design", tag]) => Self::document_request(database, &format!("_design/{tag}"), method, request),
            (method, [id]) => Self::document_request(database, id, method, request),
            (method, [id, name]) => Self::attachment_request(database, id, name, method, request),
            _ => error(400, "bad_request", "unsupported request"),
        }
    }

    fn document_request(database: &mut Database, id: &str, method: &Method, request: &HttpRequest) -> HttpResponse {
        match *method {
            Method::GET => match database.get(id) {
                Some(document) => respond(200, JsonValue::Object(document.to_json(id))),
                None => not_found("missing"),
            },
            Method::PUT => Self::put_document(database, id, body_json(request)),
            Method::DELETE => {
                let Some(document) = database.get(id) else {
                    return not_found("missing");
                };
                if request.query_value("rev") != Some(document.revision.as_str()) {
                    return conflict();
                }
                let revision = format!("{}-deleted", document.generation + 1);
                database.remove(id);
                respond(200, json!({"ok": true, "id": id, "rev": revision}))
            }
            _ => error(405, "method_not_allowed", "Only GET,PUT,DELETE allowed"),
        }
    }

    fn put_document(database: &mut Database, id: &str, body: Option<JsonValue>) -> HttpResponse {
        let Some(JsonValue::Object(mut body)) = body else {
            return error(400, "bad_request", "Document must be a JSON object");
        };
        body.remove("_id");
        let revision = body.remove("_rev");
        let stubs = match body.remove("_attachments") {
            Some(JsonValue::Object(stubs)) => stubs,
            _ => JsonMap::new(),
        };

        let mut document = match database.get(id) {
            Some(existing) => {
                if revision.as_ref().and_then(JsonValue::as_str) != Some(existing.revision.as_str()) {
                    return conflict();
                }
                existing.clone()
            }
            None => StoredDocument {
                generation: 0,
                revision: String::new(),
                body: JsonMap::new(),
                attachments: BTreeMap::new(),
            },
        };

        let mut attachments = BTreeMap::new();
        for (name, stub) in stubs {
            if let Some(data) = stub.get("data").and_then(JsonValue::as_str) {
                attachments.insert(
                    name,
                    StoredAttachment {
                        content_type: stub["content_type"].as_str().unwrap_or("application/octet-stream").into(),
                        data: STANDARD.decode(data).unwrap_or_default(),
                    },
                );
            } else if let Some(existing) = document.attachments.get(&name) {
                attachments.insert(name, existing.clone());
            } else {
                return error(412, "missing_stub", "Invalid attachment stub");
            }
        }

        document.body = body;
        document.attachments = attachments;
        let revision = document.bump();
        database.insert(id.to_string(), document);

        respond(201, json!({"ok": true, "id": id, "rev": revision}))
    }

    fn attachment_request(database: &mut Database, id: &str, name: &str, method: &Method, request: &HttpRequest) -> HttpResponse {
        let Some(document) = database.get_mut(id) else {
            return not_found("missing");
        };

        match *method {
            Method::GET => match document.attachments.get(name) {
                Some(attachment) => HttpResponse {
                    status: 200,
                    reason: "OK".into(),
                    body: attachment.data.clone(),
                },
                None => not_found("Document is missing attachment"),
            },
            Method::PUT | Method::DELETE => {
                if request.query_value("rev") != Some(document.revision.as_str()) {
                    return conflict();
                }
                if *method == Method::PUT {
                    document.attachments.insert(
                        name.to_string(),
                        StoredAttachment {
                            content_type: request
                                .header_value("Content-Type")
                                .unwrap_or("application/octet-stream")
                                .into(),
                            data: request.body.clone().unwrap_or_default(),
                        },
                    );
                } else if document.attachments.remove(name).is_none() {
                    return not_found("Document is missing attachment");
                }
                let revision = document.bump();
                respond(201, json!({"ok": true, "id": id, "rev": revision}))
            }
            _ => error(405, "method_not_allowed", "Only GET,PUT,DELETE allowed"),
        }
    }

    fn query_view(
        database: &Database,
        emitters: &HashMap<(String, String), Emit>,
        tag: &str,
        view: &str,
        request: &HttpRequest,
    ) -> HttpResponse {
        let declared = database
            .get(&format!("_design/{tag}"))
            .and_then(|design| design.body.get("views"))
            .and_then(|views| views.get(view))
            .is_some();
        let emitter = emitters.get(&(tag.to_string(), view.to_string()));
        let (true, Some(emitter)) = (declared, emitter) else {
            return not_found("missing_named_view");
        };

        let mut rows = Vec::new();
        for (id, document) in database.iter().filter(|(id, _)| !id.starts_with("_design/")) {
            let full = document.to_json(id);
            for key in emitter(&full) {
                rows.push((key, id.clone(), full.clone()));
            }
        }
        rows.sort_by(|a, b| (sort_key(&a.0), &a.1).cmp(&(sort_key(&b.0), &b.1)));
        let total_rows = rows.len();

        let rows = match body_json(request).and_then(|body| body.get("keys").cloned()) {
            Some(JsonValue::Array(keys)) => keys
                .iter()
                .flat_map(|key| rows.iter().filter(move |row| &row.0 == key).cloned())
                .collect(),
            _ => rows,
        };

        let skip = request
            .query_value("skip")
            .and_then(|skip| skip.parse().ok())
            .unwrap_or(0);
        let limit = request
            .query_value("limit")
            .and_then(|limit| limit.parse().ok())
            .unwrap_or(usize::MAX);
        let include_docs = request.query_value("include_docs") == Some("true");

        let rows = rows
            .into_iter()
            .skip(skip)
            .take(limit)
            .map(|(key, id, document)| {
                let mut row = json!({"id": id, "key": key, "value": null});
                if include_docs {
                    row["doc"] = JsonValue::Object(document);
                }
                row
            })
            .collect::<Vec<_>>();

        respond(200, json!({"total_rows": total_rows, "offset": skip, "rows": rows}))
    }
}

#[async_trait]
impl HttpTransport for FakeCouch {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let mut state = self.state.lock().unwrap();
        state.requests.push(request.clone());

        if state.faults > 0 {
            state.faults -= 1;
            return Err(TransportError::ConnectionLost("broken pipe".into()));
        }

        Ok(Self::handle(&mut state, &request))
    }
}
