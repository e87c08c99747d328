//! The HTTP seam between the adapter and the network.
//!
//! [`CouchDbStore`](crate::store::CouchDbStore) speaks to the server only through
//! [`HttpTransport`]. The default [`ReqwestTransport`] keeps one client per worker
//! thread; tests substitute an in-process server.

use async_trait::async_trait;
use reqwest::{Client, Method, Url};
use serde_json::Value as JsonValue;
use std::{cell::RefCell, error::Error as StdError, fmt::Debug, io::ErrorKind};
use thiserror::Error;

use docmap_core::error::{DatabaseError, DocumentError, DocumentResult};

thread_local! {
    static CLIENT: RefCell<Option<Client>> = const { RefCell::new(None) };
}

/// A failure below the HTTP layer.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    /// The connection was reset or went stale mid-request. Safe to retry on a fresh one.
    #[error("connection lost: {0}")]
    ConnectionLost(String),
    #[error("transport error: {0}")]
    Other(String),
}

/// One request against the server root. Path segments are percent-encoded by the transport.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    pub method: Method,
    pub path: Vec<String>,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
}

impl HttpRequest {
    pub fn new<S: Into<String>>(method: Method, path: impl IntoIterator<Item = S>) -> Self {
        Self {
            method,
            path: path.into_iter().map(Into::into).collect(),
            query: Vec::new(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn query(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.query.push((name.into(), value.to_string()));
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn json(self, body: &JsonValue) -> DocumentResult<Self> {
        Ok(self.bytes(serde_json::to_vec(body)?, "application/json"))
    }

    pub fn bytes(mut self, body: Vec<u8>, content_type: &str) -> Self {
        self.body = Some(body);
        self.header("Content-Type", content_type)
    }

    /// The value of a header, matched case-insensitively.
    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn query_value(&self, name: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub status: u16,
    pub reason: String,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn json(&self) -> DocumentResult<JsonValue> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    /// Maps a non-2xx response to a database error carrying status, reason and body.
    pub fn into_error(self) -> DocumentError {
        let body = serde_json::from_slice(&self.body).ok();
        DatabaseError::with_status(self.status, self.reason, body).into()
    }
}

/// Performs one HTTP exchange.
#[async_trait]
pub trait HttpTransport: Send + Sync + Debug {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError>;

    /// Drops the calling thread's connection so that the next request opens a fresh one.
    fn reset(&self) {}
}

/// The default transport, backed by `reqwest`.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    base_url: Url,
}

impl ReqwestTransport {
    pub fn new(base_url: Url) -> Self {
        Self { base_url }
    }

    fn client() -> Result<Client, TransportError> {
        CLIENT.with(|slot| {
            let mut slot = slot.borrow_mut();
            if let Some(client) = slot.as_ref() {
                return Ok(client.clone());
            }
            let client = Client::builder()
                .build()
                .map_err(|e| TransportError::Other(e.to_string()))?;
            *slot = Some(client.clone());
            Ok(client)
        })
    }

    fn url(&self, request: &HttpRequest) -> Result<Url, TransportError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| TransportError::Other(format!("{} cannot be a base url", self.base_url)))?
            .clear()
            .extend(&request.path);
        if !request.query.is_empty() {
            url.query_pairs_mut().extend_pairs(&request.query);
        }

        Ok(url)
    }
}

/// How hyper reports a pooled connection the server closed while it sat idle.
const CONNECTION_CLOSED: &str = "connection closed before message completed";

/// Resets, aborts, truncated reads and closed keep-alive connections are the
/// stale-connection class. Refused connections and timeouts are not.
fn is_stale_connection(err: &(dyn StdError + 'static)) -> bool {
    let mut source = Some(err);
    while let Some(cause) = source {
        if let Some(io) = cause.downcast_ref::<std::io::Error>() {
            if matches!(
                io.kind(),
                ErrorKind::BrokenPipe | ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted | ErrorKind::UnexpectedEof
            ) {
                return true;
            }
        }
        if cause.to_string().contains(CONNECTION_CLOSED) {
            return true;
        }
        source = cause.source();
    }

    false
}

fn classify(err: reqwest::Error) -> TransportError {
    if is_stale_connection(&err) {
        TransportError::ConnectionLost(err.to_string())
    } else {
        TransportError::Other(err.to_string())
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let url = self.url(&request)?;
        let HttpRequest { method, headers, body, .. } = request;

        let mut builder = Self::client()?.request(method, url);
        for (name, value) in &headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = body {
            builder = builder.body(body);
        }

        let response = builder.send().await.map_err(classify)?;
        let status = response.status();
        let body = response.bytes().await.map_err(classify)?;

        Ok(HttpResponse {
            status: status.as_u16(),
            reason: status.canonical_reason().unwrap_or("Unknown").to_string(),
            body: body.to_vec(),
        })
    }

    fn reset(&self) {
        CLIENT.with(|slot| slot.borrow_mut().take());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_url_encodes_path_segments() {
        let transport = ReqwestTransport::new(Url::parse("http://localhost:5984").unwrap());
        let request = HttpRequest::new(Method::GET, ["docs", "_design", "Sample Model"])
            .query("include_docs", true)
            .query("limit", 19);

        assert_eq!(
            transport.url(&request).unwrap().as_str(),
            "http://localhost:5984/docs/_design/Sample%20Model?include_docs=true&limit=19"
        );
        assert_eq!(
            transport.url(&HttpRequest::new::<String>(Method::GET, [])).unwrap().as_str(),
            "http://localhost:5984/"
        );
    }

    #[test]
    fn test_error_response_keeps_parsed_body() {
        let response = HttpResponse {
            status: 409,
            reason: "Conflict".into(),
            body: br#"{"error":"conflict","reason":"Document update conflict."}"#.to_vec(),
        };

        match response.into_error() {
            DocumentError::Database(err) => {
                assert_eq!(err.status, Some(409));
                assert_eq!(err.reason, "Conflict");
                assert_eq!(err.body, Some(json!({"error": "conflict", "reason": "Document update conflict."})));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[derive(Debug, Error)]
    #[error("error sending request")]
    struct Sending(#[source] Box<dyn StdError + Send + Sync>);

    #[derive(Debug, Error)]
    #[error("connection closed before message completed")]
    struct IncompleteMessage;

    #[test]
    fn test_stale_connection_classes() {
        let io = |kind| Sending(Box::new(std::io::Error::new(kind, "io")));

        for kind in [ErrorKind::BrokenPipe, ErrorKind::ConnectionReset, ErrorKind::ConnectionAborted, ErrorKind::UnexpectedEof] {
            assert!(is_stale_connection(&io(kind)), "{kind:?}");
        }
        assert!(is_stale_connection(&Sending(Box::new(IncompleteMessage))));

        for kind in [ErrorKind::ConnectionRefused, ErrorKind::TimedOut] {
            assert!(!is_stale_connection(&io(kind)), "{kind:?}");
        }
        assert!(!is_stale_connection(&Sending("dns error".into())));
    }

    #[test]
    fn test_json_body_sets_content_type() {
        let request = HttpRequest::new(Method::POST, ["docs"]).json(&json!({"a": 1})).unwrap();

        assert_eq!(request.header_value("content-type"), Some("application/json"));
        assert_eq!(request.body.as_deref(), Some(br#"{"a":1}"#.as_slice()));
    }
}
