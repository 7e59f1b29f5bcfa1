//! Loop-origin detection
//!
//! Every write this system makes to an external platform carries the
//! [`ORIGIN_MARKER`] (as a tag, in note text) or an external id prefixed with
//! [`EXTERNAL_ID_PREFIX`]. When the platform echoes the change back as a
//! webhook, [`detect_origin`] finds the marker and the correlation id of the
//! write. The router completes the event as a no-op only when that id names a
//! recent write to the same system; the marker outlives the write on the
//! remote record, so later edits by people still flow through.

use serde::Serialize;

use crate::domain::{CorrelationId, EventSource, ExternalSystem};

/// Signature stamped on outbound writes
pub const ORIGIN_MARKER: &str = "SYS:df_middleware_origin";

/// Prefix of external ids this system assigns
pub const EXTERNAL_ID_PREFIX: &str = "df_middleware:";

/// Depth limit when scanning nested marker locations
const MAX_SCAN_DEPTH: usize = 3;

const CRM_MARKER_PATHS: &[&str] = &[
    "/tags",
    "/contact/tags",
    "/customFields",
    "/contact/customFields",
    "/custom_fields",
    "/note",
    "/body",
    "/source",
];
const CRM_EXTERNAL_ID_PATHS: &[&str] = &["/externalId", "/contact/externalId"];

const DIALER_MARKER_PATHS: &[&str] = &["/notes", "/note", "/tags", "/data/notes", "/data/tags"];
const DIALER_EXTERNAL_ID_PATHS: &[&str] = &["/external_id", "/data/external_id"];

const MESSAGING_MARKER_PATHS: &[&str] = &["/body", "/message/body", "/metadata"];

const BROADCAST_MARKER_PATHS: &[&str] = &["/metadata", "/tags"];

/// Outcome of an origin check
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OriginCheck {
    pub is_origin: bool,
    /// Correlation id of the write that caused the echo, when recoverable
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin_id: Option<String>,
}

impl OriginCheck {
    fn not_origin() -> Self {
        Self::default()
    }

    fn origin(origin_id: Option<String>) -> Self {
        Self {
            is_origin: true,
            origin_id,
        }
    }
}

/// Inspect the source-specific marker locations of a payload
pub fn detect_origin(source: EventSource, payload: &serde_json::Value) -> OriginCheck {
    let (marker_paths, external_id_paths): (&[&str], &[&str]) = match source {
        EventSource::Crm => (CRM_MARKER_PATHS, CRM_EXTERNAL_ID_PATHS),
        EventSource::Dialer => (DIALER_MARKER_PATHS, DIALER_EXTERNAL_ID_PATHS),
        EventSource::Messaging => (MESSAGING_MARKER_PATHS, &[]),
        EventSource::Broadcast => (BROADCAST_MARKER_PATHS, &[]),
    };

    for path in marker_paths {
        if let Some(check) = payload.pointer(path).and_then(|v| scan(v, 0)) {
            return check;
        }
    }

    for path in external_id_paths {
        if let Some(id) = payload.pointer(path).and_then(|v| v.as_str()) {
            if let Some(rest) = id.strip_prefix(EXTERNAL_ID_PREFIX) {
                return OriginCheck::origin(Some(rest.to_string()).filter(|s| !s.is_empty()));
            }
        }
    }

    OriginCheck::not_origin()
}

fn scan(value: &serde_json::Value, depth: usize) -> Option<OriginCheck> {
    if depth > MAX_SCAN_DEPTH {
        return None;
    }
    match value {
        serde_json::Value::String(s) => marker_in_text(s),
        serde_json::Value::Array(items) => items.iter().find_map(|v| scan(v, depth + 1)),
        serde_json::Value::Object(map) => map.values().find_map(|v| scan(v, depth + 1)),
        _ => None,
    }
}

fn marker_in_text(text: &str) -> Option<OriginCheck> {
    let start = text.find(ORIGIN_MARKER)?;
    let rest = &text[start + ORIGIN_MARKER.len()..];
    let origin_id = rest
        .strip_prefix(':')
        .map(|r| {
            r.chars()
                .take_while(|c| !c.is_whitespace() && *c != ',' && *c != ';')
                .collect::<String>()
        })
        .filter(|s| !s.is_empty());
    Some(OriginCheck::origin(origin_id))
}

/// The tag form of the marker for one write
pub fn origin_tag(correlation_id: &CorrelationId) -> String {
    format!("{}:{}", ORIGIN_MARKER, correlation_id)
}

/// Stamp the origin marker onto an outbound write.
///
/// CRM writes get a tag; dialer writes get a tag plus an external id;
/// messaging writes get the marker appended to metadata.
pub fn stamp_origin(
    system: ExternalSystem,
    fields: &mut serde_json::Map<String, serde_json::Value>,
    correlation_id: &CorrelationId,
) {
    let tag = serde_json::Value::String(origin_tag(correlation_id));

    match system {
        ExternalSystem::Crm | ExternalSystem::Dialer => {
            use serde_json::Value;

            let stamped = match fields.remove("tags").unwrap_or(Value::Null) {
                Value::Array(mut items) => {
                    items.retain(|t| !t.as_str().is_some_and(|s| s.starts_with(ORIGIN_MARKER)));
                    items.push(tag);
                    Some(Value::Array(items))
                }
                Value::Null => Some(Value::Array(vec![tag])),
                Value::String(existing) if existing.is_empty() => Some(Value::Array(vec![tag])),
                Value::String(existing) => Some(Value::Array(vec![Value::String(existing), tag])),
                // Shapes we do not understand stay as they are; the marker goes in the note.
                other => {
                    fields.insert("tags".to_string(), other);
                    None
                }
            };
            match stamped {
                Some(tags) => {
                    fields.insert("tags".to_string(), tags);
                }
                None => append_note(fields, correlation_id),
            }
            if system == ExternalSystem::Dialer {
                fields.insert(
                    "external_id".to_string(),
                    serde_json::Value::String(format!("{EXTERNAL_ID_PREFIX}{correlation_id}")),
                );
            }
        }
        ExternalSystem::Messaging => {
            fields.insert(
                "metadata".to_string(),
                serde_json::json!({ "origin": origin_tag(correlation_id) }),
            );
        }
    }
}

fn append_note(
    fields: &mut serde_json::Map<String, serde_json::Value>,
    correlation_id: &CorrelationId,
) {
    let marker = origin_tag(correlation_id);
    let note = match fields.get("note").and_then(|v| v.as_str()) {
        Some(existing) if !existing.is_empty() => format!("{existing}\n{marker}"),
        _ => marker,
    };
    fields.insert("note".to_string(), serde_json::Value::String(note));
}

/// Whether a set of outbound fields carries the marker
pub fn is_stamped(system: ExternalSystem, fields: &serde_json::Value) -> bool {
    let source = match system {
        ExternalSystem::Crm => EventSource::Crm,
        ExternalSystem::Dialer => EventSource::Dialer,
        ExternalSystem::Messaging => EventSource::Messaging,
    };
    detect_origin(source, fields).is_origin
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_crm_tag_marker() {
        let payload = json!({
            "type": "ContactUpdate",
            "contactId": "C2",
            "tags": ["vip", "SYS:df_middleware_origin"]
        });
        let check = detect_origin(EventSource::Crm, &payload);
        assert!(check.is_origin);
        assert_eq!(check.origin_id, None);
    }

    #[test]
    fn test_marker_with_origin_id_in_note() {
        let payload = json!({
            "event": "contact.updated",
            "contact": {"id": "C2", "customFields": [{"id": "f1", "value": "synced SYS:df_middleware_origin:corr-42 ok"}]}
        });
        let check = detect_origin(EventSource::Crm, &payload);
        assert!(check.is_origin);
        assert_eq!(check.origin_id.as_deref(), Some("corr-42"));
    }

    #[test]
    fn test_dialer_external_id() {
        let payload = json!({"event": "contact.updated", "data": {"contact_id": "D1", "external_id": "df_middleware:corr-7"}});
        let check = detect_origin(EventSource::Dialer, &payload);
        assert!(check.is_origin);
        assert_eq!(check.origin_id.as_deref(), Some("corr-7"));
    }

    #[test]
    fn test_marker_outside_known_locations_is_ignored() {
        // Only documented marker locations count; free text elsewhere does not.
        let payload = json!({"type": "ContactUpdate", "contactId": "C3", "firstName": "SYS:df_middleware_origin"});
        assert!(!detect_origin(EventSource::Crm, &payload).is_origin);
    }

    #[test]
    fn test_plain_payloads_are_not_origin() {
        let payload = json!({"from": "+1", "to": "+2", "body": "call me back"});
        assert_eq!(
            detect_origin(EventSource::Messaging, &payload),
            OriginCheck::default()
        );
    }

    #[test]
    fn test_stamp_then_detect() {
        let corr = CorrelationId::from("corr-9");
        for system in [
            ExternalSystem::Crm,
            ExternalSystem::Dialer,
            ExternalSystem::Messaging,
        ] {
            let mut fields = serde_json::Map::new();
            fields.insert("firstName".into(), json!("Ada"));
            stamp_origin(system, &mut fields, &corr);
            assert!(is_stamped(system, &serde_json::Value::Object(fields)), "{system}");
        }
    }

    #[test]
    fn test_stamp_replaces_previous_marker_tag() {
        let mut fields = serde_json::Map::new();
        fields.insert("tags".into(), json!(["vip", "SYS:df_middleware_origin:old"]));
        stamp_origin(ExternalSystem::Crm, &mut fields, &CorrelationId::from("new"));
        assert_eq!(
            fields["tags"],
            json!(["vip", "SYS:df_middleware_origin:new"])
        );
    }

    #[test]
    fn test_stamp_keeps_non_array_tags() {
        let corr = CorrelationId::from("c1");

        let mut fields = serde_json::Map::new();
        fields.insert("tags".into(), json!("vip"));
        stamp_origin(ExternalSystem::Crm, &mut fields, &corr);
        assert_eq!(fields["tags"], json!(["vip", "SYS:df_middleware_origin:c1"]));

        let mut fields = serde_json::Map::new();
        fields.insert("tags".into(), json!({"segment": "hot"}));
        fields.insert("note".into(), json!("called twice"));
        stamp_origin(ExternalSystem::Crm, &mut fields, &corr);
        assert_eq!(fields["tags"], json!({"segment": "hot"}));
        assert_eq!(
            fields["note"],
            json!("called twice\nSYS:df_middleware_origin:c1")
        );
        assert!(is_stamped(ExternalSystem::Crm, &serde_json::Value::Object(fields)));
    }
}
