//! Key sanitization for MongoDB compatibility.
//!
//! MongoDB restricts field names from containing characters that carry meaning in its
//! query syntax. Mapping fields may hold arbitrary user keys, so every key is escaped on
//! the way in and restored on the way out. Values are never touched: they take part in
//! exact-match queries and must be stored verbatim.

use bson::Bson;

/// Escapes and restores document keys to handle MongoDB field name restrictions.
///
/// MongoDB does not allow field names (document keys) to contain:
/// - Dots (`.`) - used for nested field access in queries
/// - Dollar signs (`$`) - used for operators in queries
/// - Null bytes (`\0`) - field name terminators
pub(crate) struct KeySanitizer;

impl KeySanitizer {
    const REPLACEMENTS: [(&'static str, &'static str); 3] = [
        (".", "__dot__"),
        ("$", "__dollar__"),
        ("\0", "__null__"),
    ];

    /// Recursively escapes every key of every nested document.
    pub(crate) fn sanitize_value(value: Bson) -> Bson {
        match value {
            Bson::Array(items) => Bson::Array(items.into_iter().map(Self::sanitize_value).collect()),
            Bson::Document(doc) => Bson::Document(
                doc.into_iter()
                    .map(|(k, v)| (Self::sanitize_key(&k), Self::sanitize_value(v)))
                    .collect(),
            ),
            other => other,
        }
    }

    pub(crate) fn sanitize_key(input: &str) -> String {
        Self::REPLACEMENTS
            .iter()
            .fold(input.to_string(), |key, (target, replacement)| key.replace(target, replacement))
    }

    /// Recursively reverts [`sanitize_value`](Self::sanitize_value).
    pub(crate) fn restore_value(value: Bson) -> Bson {
        match value {
            Bson::Array(items) => Bson::Array(items.into_iter().map(Self::restore_value).collect()),
            Bson::Document(doc) => Bson::Document(
                doc.into_iter()
                    .map(|(k, v)| (Self::restore_key(&k), Self::restore_value(v)))
                    .collect(),
            ),
            other => other,
        }
    }

    pub(crate) fn restore_key(input: &str) -> String {
        Self::REPLACEMENTS
            .iter()
            .rev()
            .fold(input.to_string(), |key, (target, replacement)| key.replace(replacement, target))
    }
}
