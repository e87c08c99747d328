//! Binary blobs stored alongside documents.
//!
//! An [`Attachment`] is tracked on its owning [`ModelInstance`](crate::document::ModelInstance)
//! and written by the adapter on the next save. Attachments loaded from a store arrive
//! as stubs: their metadata is known and their bytes are fetched on demand.

use base64::{Engine, engine::general_purpose::STANDARD};
use serde_json::{Value as JsonValue, json};
use std::io::Read;

use crate::error::{DocumentError, DocumentResult};

const FALLBACK_CONTENT_TYPE: &str = "application/octet-stream";

const CONTENT_TYPES: &[(&str, &str)] = &[
    ("txt", "text/plain"),
    ("csv", "text/csv"),
    ("html", "text/html"),
    ("htm", "text/html"),
    ("css", "text/css"),
    ("js", "application/javascript"),
    ("json", "application/json"),
    ("xml", "application/xml"),
    ("pdf", "application/pdf"),
    ("zip", "application/zip"),
    ("gz", "application/gzip"),
    ("png", "image/png"),
    ("jpg", "image/jpeg"),
    ("jpeg", "image/jpeg"),
    ("gif", "image/gif"),
    ("svg", "image/svg+xml"),
    ("webp", "image/webp"),
    ("mp3", "audio/mpeg"),
    ("mp4", "video/mp4"),
];

/// Guesses a content type from the extension of `name`.
pub fn guess_content_type(name: &str) -> &'static str {
    name.rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .and_then(|ext| {
            CONTENT_TYPES
                .iter()
                .find(|(known, _)| *known == ext)
                .map(|(_, content_type)| *content_type)
        })
        .unwrap_or(FALLBACK_CONTENT_TYPE)
}

/// Where an attachment stands relative to the stored document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachmentState {
    /// Added locally and not yet written.
    New,
    /// Present in the store.
    Stub,
    /// Present in the store and to be removed on the next save.
    Deleted,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Attachment {
    name: String,
    content_type: String,
    length: Option<u64>,
    data: Option<Vec<u8>>,
    state: AttachmentState,
}

impl Attachment {
    /// Creates a pending attachment from in-memory bytes.
    ///
    /// Without an explicit `content_type` one is guessed from the name.
    pub fn new(name: impl Into<String>, data: impl Into<Vec<u8>>, content_type: Option<&str>) -> Self {
        let name = name.into();
        let data = data.into();

        Self {
            content_type: content_type
                .unwrap_or_else(|| guess_content_type(&name))
                .to_string(),
            length: Some(data.len() as u64),
            data: Some(data),
            state: AttachmentState::New,
            name,
        }
    }

    /// Creates a pending attachment by reading `reader` to the end.
    pub fn from_reader(name: impl Into<String>, mut reader: impl Read, content_type: Option<&str>) -> DocumentResult<Self> {
        let mut data = Vec::new();
        reader
            .read_to_end(&mut data)
            .map_err(|e| DocumentError::model(format!("could not read attachment source: {e}")))?;

        Ok(Self::new(name, data, content_type))
    }

    /// Describes an attachment that already exists in the store.
    pub fn stub(name: impl Into<String>, content_type: impl Into<String>, length: Option<u64>) -> Self {
        Self {
            name: name.into(),
            content_type: content_type.into(),
            length,
            data: None,
            state: AttachmentState::Stub,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    pub fn length(&self) -> Option<u64> {
        self.length
    }

    pub fn state(&self) -> AttachmentState {
        self.state
    }

    /// The bytes, when they are held locally.
    pub fn data(&self) -> Option<&[u8]> {
        self.data.as_deref()
    }

    /// Records that the attachment now exists in the store. Local bytes are kept.
    pub fn mark_stored(&mut self) {
        self.state = AttachmentState::Stub;
    }

    pub fn mark_deleted(&mut self) {
        self.state = AttachmentState::Deleted;
    }

    /// Caches bytes fetched from the store.
    pub fn set_data(&mut self, data: Vec<u8>) {
        self.length = Some(data.len() as u64);
        self.data = Some(data);
    }

    /// The local bytes as standard base64, for stores that inline attachment bodies.
    pub fn encoded(&self) -> Option<String> {
        self.data.as_ref().map(|data| STANDARD.encode(data))
    }

    /// The JSON entry for this attachment inside a stored document.
    ///
    /// The stub form only names the content type. With `inline` set and bytes held
    /// locally, the body is embedded base64-encoded instead.
    pub fn to_json(&self, inline: bool) -> JsonValue {
        match self.encoded().filter(|_| inline) {
            Some(data) => json!({
                "content_type": self.content_type,
                "data": data,
            }),
            None => json!({
                "content_type": self.content_type,
                "stub": true,
            }),
        }
    }
}
