//! Match spec translation to MongoDB filter documents.

use bson::{Document, ser::serialize_to_bson};

use docmap_core::{
    error::{DocumentError, DocumentResult},
    query::MatchSpec,
};

use crate::sanitizer::KeySanitizer;

/// Translates an exact-match spec into a MongoDB filter.
///
/// Values are compared in their transport form, the same form documents are stored
/// in, so nested documents and lists match only when equal as a whole.
pub(crate) fn match_filter(spec: &MatchSpec) -> DocumentResult<Document> {
    spec.to_json()?
        .into_iter()
        .map(|(field, value)| {
            let value = serialize_to_bson(&value).map_err(|e| DocumentError::Serialization(e.to_string()))?;
            Ok((KeySanitizer::sanitize_key(&field), KeySanitizer::sanitize_value(value)))
        })
        .collect()
}
