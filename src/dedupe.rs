//! Content fingerprints for inbound events
//!
//! A dedupe key is `source:event_type:entity_id:<sha256>` where the hash is
//! taken over the RFC 8785 canonical JSON of the payload, so field order in
//! the delivered body never changes the key:
//! - identical content for the same triple collapses to one ledger row
//! - any content difference yields a distinct occurrence

use sha2::{Digest, Sha256};

use crate::domain::EventSource;
use crate::infra::{Result, SyncError};

/// Domain prefix for payload fingerprints
pub const DOMAIN_PAYLOAD: &[u8] = b"DF_PAYLOAD_V1";

/// Domain prefix for the best-effort message fingerprint
pub const DOMAIN_MESSAGE_FALLBACK: &[u8] = b"DF_MESSAGE_FALLBACK_V1";

// ============================================================================
// Encoding Helpers
// ============================================================================

/// Encode a string as length-prefixed UTF-8 bytes
///
/// Format: U32_BE(len) || UTF8_bytes
fn encode_string(s: &str) -> Vec<u8> {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(4 + bytes.len());
    out.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    out.extend_from_slice(bytes);
    out
}

// ============================================================================
// Canonical JSON (RFC 8785 JCS)
// ============================================================================

/// Canonical string form of a JSON value (sorted keys, no whitespace,
/// normalized numbers)
pub fn canonicalize_json(value: &serde_json::Value) -> Result<String> {
    serde_json_canonicalizer::to_string(value)
        .map_err(|e| SyncError::Serialization(format!("cannot canonicalize payload: {e}")))
}

/// Hex SHA-256 over the canonical payload
pub fn payload_fingerprint(payload: &serde_json::Value) -> Result<String> {
    let canonical = canonicalize_json(payload)?;

    let mut hasher = Sha256::new();
    hasher.update(DOMAIN_PAYLOAD);
    hasher.update(canonical.as_bytes());
    Ok(hex::encode(hasher.finalize()))
}

/// Deterministic dedupe key for one logical occurrence
pub fn compute_dedupe_key(
    source: EventSource,
    event_type: &str,
    entity_id: &str,
    payload: &serde_json::Value,
) -> Result<String> {
    let fingerprint = payload_fingerprint(payload)?;
    Ok(format!(
        "{}:{}:{}:{}",
        source.as_str(),
        event_type,
        entity_id,
        fingerprint
    ))
}

/// Stand-in message id for messaging payloads that carry none.
///
/// Best-effort only: two distinct messages with the same body and endpoints
/// sent within the same second produce the same id. They share one ledger row
/// only when the delivered payloads are also identical, since the dedupe key
/// hashes the whole body. `timestamp_seconds` must already be truncated to
/// seconds.
pub fn fallback_message_id(body: &str, timestamp_seconds: &str, from: &str, to: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(DOMAIN_MESSAGE_FALLBACK);
    hasher.update(encode_string(body));
    hasher.update(encode_string(timestamp_seconds));
    hasher.update(encode_string(from));
    hasher.update(encode_string(to));
    let digest = hasher.finalize();
    format!("msg_{}", hex::encode(&digest[..16]))
}
