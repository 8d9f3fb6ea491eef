//! Cache key derivation.
//!
//! A key is the action name, a `:`, and the canonical form of the call
//! parameters:
//!
//! - scalars render in their natural form (strings unquoted);
//! - sequences join their elements with `|`;
//! - records join `field|value` pairs with `|`, fields in sorted order so
//!   that records with the same content always produce the same key;
//! - `null` renders as `null`.
//!
//! When a container declares cache keys, only those top-level fields are
//! used, in the declared order. Keys longer than the configured maximum
//! are collapsed to a leading prefix plus the base64 SHA-256 digest of the
//! whole key.

use std::sync::Arc;

use crate::hasher::{HasherPool, DIGEST_LENGTH};
use mesh_types::{Value, KEY_SEPARATOR};

/// Derives cache keys from action names and call parameters.
#[derive(Debug, Clone)]
pub struct KeyDeriver {
    max_key_length: usize,
    hashers: Arc<HasherPool>,
}

impl KeyDeriver {
    /// Creates a deriver.
    ///
    /// `max_key_length == 0` disables hashing; values below 44 (the digest
    /// length) are raised to 44.
    pub fn new(max_key_length: usize, hashers: Arc<HasherPool>) -> Self {
        let max_key_length = if max_key_length > 0 && max_key_length < DIGEST_LENGTH {
            tracing::warn!(
                requested = max_key_length,
                "the minimum value of max_key_length is {}",
                DIGEST_LENGTH
            );
            DIGEST_LENGTH
        } else {
            max_key_length
        };
        Self {
            max_key_length,
            hashers,
        }
    }

    /// The effective maximum key length (`0` = unlimited).
    pub fn max_key_length(&self) -> usize {
        self.max_key_length
    }

    /// Derives the key for a call of `action` with `params`.
    ///
    /// `keys` restricts the parameters to the listed top-level fields;
    /// without parameters the key is the action name alone.
    pub fn derive_key(&self, action: &str, params: Option<&Value>, keys: Option<&[String]>) -> String {
        let Some(params) = params else {
            return self.bound(action.to_string());
        };

        let mut key = String::with_capacity(action.len() + 64);
        key.push_str(action);
        key.push(KEY_SEPARATOR);
        match keys {
            Some(keys) if !keys.is_empty() => append_projection(&mut key, params, keys),
            _ => append_value(&mut key, params),
        }
        self.bound(key)
    }

    fn bound(&self, key: String) -> String {
        if self.max_key_length < DIGEST_LENGTH {
            return key;
        }
        let length = key.chars().count();
        if length <= self.max_key_length {
            return key;
        }

        let digest = self.hashers.digest_base64(key.as_bytes());
        let prefix_length = self.max_key_length - DIGEST_LENGTH;
        if prefix_length == 0 {
            return digest;
        }
        let end = key
            .char_indices()
            .nth(prefix_length)
            .map_or(key.len(), |(i, _)| i);
        let mut bounded = String::with_capacity(end + DIGEST_LENGTH);
        bounded.push_str(&key[..end]);
        bounded.push_str(&digest);
        bounded
    }
}

/// Returns the canonical string form of a parameter value.
pub fn canonicalize(value: &Value) -> String {
    let mut out = String::new();
    append_value(&mut out, value);
    out
}

fn append_projection(out: &mut String, params: &Value, keys: &[String]) {
    for (i, name) in keys.iter().enumerate() {
        if i > 0 {
            out.push('|');
        }
        out.push_str(name);
        out.push('|');
        append_value(out, params.get(name).unwrap_or(&Value::Null));
    }
}

fn append_value(out: &mut String, value: &Value) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::String(s) => out.push_str(s),
        Value::Array(items) => {
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push('|');
                }
                append_value(out, item);
            }
        }
        Value::Object(fields) => {
            let mut fields: Vec<(&String, &Value)> = fields.iter().collect();
            fields.sort_unstable_by(|a, b| a.0.cmp(b.0));
            for (i, (name, field)) in fields.into_iter().enumerate() {
                if i > 0 {
                    out.push('|');
                }
                out.push_str(name);
                out.push('|');
                append_value(out, field);
            }
        }
    }
}
