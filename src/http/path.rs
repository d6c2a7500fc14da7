//! File endpoint URL grammar
//!
//! Two equivalent shapes name an archived file:
//!
//! - `/<hash><message_id>[/<ignored-suffix>]` with the hash inline
//! - `/<message_id>[/<ignored-suffix>]` with the hash in `?hash=`
//!
//! The hash is exactly [`SECURE_HASH_LENGTH`] characters of `[A-Za-z0-9_-]`
//! and is validated for form only; with several upstream accounts the same
//! file has different session-local unique ids, so byte-equality against
//! any of them is not enforceable.

use std::sync::LazyLock;

use regex::Regex;

use crate::error::{GatewayError, Result};
use crate::MessageId;

/// Length of the opaque hash prefix in stream URLs.
pub const SECURE_HASH_LENGTH: usize = 6;

static PATTERN_HASH_FIRST: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"^([A-Za-z0-9_-]{{{SECURE_HASH_LENGTH}}})(\d+)(?:/.*)?$"
    ))
    .expect("hash-first pattern")
});

static PATTERN_ID_FIRST: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d+)(?:/.*)?$").expect("id-first pattern"));

static VALID_HASH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]+$").expect("hash alphabet"));

/// Extract `(message_id, provided_hash)` from a request path and the
/// optional `hash` query parameter.
///
/// Returns [`GatewayError::InvalidUrl`] when neither shape matches.
pub fn parse_media_request(path: &str, query_hash: Option<&str>) -> Result<(MessageId, String)> {
    let clean = path.trim_matches('/');

    if let Some(captures) = PATTERN_HASH_FIRST.captures(clean) {
        let hash = captures.get(1).map(|m| m.as_str()).unwrap_or("");
        let id_str = captures.get(2).map(|m| m.as_str()).unwrap_or("");
        let message_id: MessageId = id_str.parse().map_err(|_| GatewayError::InvalidUrl)?;
        if message_id >= 1 {
            return Ok((message_id, hash.to_string()));
        }
        return Err(GatewayError::InvalidUrl);
    }

    if let Some(captures) = PATTERN_ID_FIRST.captures(clean) {
        let id_str = captures.get(1).map(|m| m.as_str()).unwrap_or("");
        let message_id: MessageId = id_str.parse().map_err(|_| GatewayError::InvalidUrl)?;
        let hash = query_hash.unwrap_or("").trim();
        if message_id >= 1 && hash.len() == SECURE_HASH_LENGTH && VALID_HASH.is_match(hash) {
            return Ok((message_id, hash.to_string()));
        }
        return Err(GatewayError::InvalidUrl);
    }

    Err(GatewayError::InvalidUrl)
}

/// Path of the direct stream URL for a file, hash-first shape.
pub fn build_stream_path(message_id: MessageId, hash: &str) -> String {
    format!("/{hash}{message_id}")
}
