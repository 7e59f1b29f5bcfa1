//! Known inbound payload variants and their normalization
//!
//! Each platform delivers a handful of JSON shapes. They are modelled as one
//! sum type per source and reduced to a single [`NormalizedEvent`]. A payload
//! matching none of the known variants is rejected with
//! [`SyncError::UnrecognizedPayload`], never dropped.

use chrono::DateTime;
use serde::{Deserialize, Serialize};

use super::{CorrelationId, EventSource};
use crate::dedupe::fallback_message_id;
use crate::infra::{Result, SyncError};

/// Canonical internal shape of an inbound notification
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NormalizedEvent {
    pub source: EventSource,
    pub event_type: String,
    pub entity_type: String,
    pub entity_id: String,
    pub payload: serde_json::Value,
    pub correlation_id: Option<CorrelationId>,
}

// ============================================================================
// CRM
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct CrmContactRef {
    pub id: String,
}

/// CRM webhook shapes
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum CrmPayload {
    /// `{"event": "contact.updated", "contact": {"id": ...}}`
    Envelope {
        event: String,
        contact: CrmContactRef,
    },
    /// `{"type": "ContactUpdate", "contactId": ...}`
    ContactWebhook {
        #[serde(rename = "type")]
        kind: String,
        #[serde(rename = "contactId", alias = "contact_id")]
        contact_id: String,
    },
    /// `{"type": "OpportunityStatusUpdate", "id": ...}`
    EntityWebhook {
        #[serde(rename = "type")]
        kind: String,
        id: String,
    },
}

// ============================================================================
// Dialer
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct DialerData {
    #[serde(alias = "lead_id", alias = "contactId")]
    pub contact_id: Option<String>,
    pub call_id: Option<String>,
}

/// Dialer webhook shapes
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum DialerPayload {
    /// `{"event": "call.completed", "data": {...}}`
    Nested { event: String, data: DialerData },
    /// `{"event_type": "disposition.set", "contact_id": ...}`
    Flat {
        event_type: String,
        #[serde(alias = "lead_id")]
        contact_id: String,
    },
}

// ============================================================================
// Messaging
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct MessageBody {
    #[serde(alias = "message_id", alias = "sid")]
    pub id: Option<String>,
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub body: String,
    pub timestamp: Option<serde_json::Value>,
}

/// Messaging webhook shapes
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum MessagingPayload {
    /// `{"type": "message.received", "message": {...}}`
    Wrapped {
        #[serde(rename = "type")]
        kind: String,
        message: MessageBody,
    },
    /// The message object delivered directly
    Flat(MessageBody),
}

// ============================================================================
// Broadcast
// ============================================================================

/// Broadcast campaign notifications
#[derive(Debug, Deserialize)]
pub struct BroadcastPayload {
    pub broadcast_id: String,
    pub event: String,
}

// ============================================================================
// Normalization
// ============================================================================

/// Reduce a raw notification body to its canonical shape
pub fn normalize(source: EventSource, raw: serde_json::Value) -> Result<NormalizedEvent> {
    if !raw.is_object() {
        return Err(unrecognized(source, "payload is not a JSON object"));
    }

    let correlation_id = raw
        .get("correlation_id")
        .or_else(|| raw.get("correlationId"))
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(CorrelationId::from);

    let (event_type, entity_type, entity_id) = match source {
        EventSource::Crm => normalize_crm(&raw)?,
        EventSource::Dialer => normalize_dialer(&raw)?,
        EventSource::Messaging => normalize_messaging(&raw)?,
        EventSource::Broadcast => {
            let p: BroadcastPayload = serde_json::from_value(raw.clone())
                .map_err(|e| unrecognized(source, e.to_string()))?;
            (event_name(&p.event), "broadcast".to_string(), p.broadcast_id)
        }
    };

    if entity_id.trim().is_empty() {
        return Err(unrecognized(source, "empty entity id"));
    }

    Ok(NormalizedEvent {
        source,
        event_type,
        entity_type,
        entity_id,
        payload: raw,
        correlation_id,
    })
}

fn normalize_crm(raw: &serde_json::Value) -> Result<(String, String, String)> {
    let parsed: CrmPayload = serde_json::from_value(raw.clone())
        .map_err(|_| unrecognized(EventSource::Crm, "no known CRM payload shape matched"))?;

    Ok(match parsed {
        CrmPayload::Envelope { event, contact } => {
            let event_type = event_name(&event);
            (event_type, "contact".to_string(), contact.id)
        }
        CrmPayload::ContactWebhook { kind, contact_id } => {
            (event_name(&kind), "contact".to_string(), contact_id)
        }
        CrmPayload::EntityWebhook { kind, id } => {
            let event_type = event_name(&kind);
            let entity_type = entity_of(&event_type);
            (event_type, entity_type, id)
        }
    })
}

fn normalize_dialer(raw: &serde_json::Value) -> Result<(String, String, String)> {
    let parsed: DialerPayload = serde_json::from_value(raw.clone())
        .map_err(|_| unrecognized(EventSource::Dialer, "no known dialer payload shape matched"))?;

    match parsed {
        DialerPayload::Nested { event, data } => {
            let event_type = event_name(&event);
            match (data.contact_id, data.call_id) {
                (Some(contact_id), _) => Ok((event_type, "contact".to_string(), contact_id)),
                (None, Some(call_id)) => Ok((event_type, "call".to_string(), call_id)),
                (None, None) => Err(unrecognized(
                    EventSource::Dialer,
                    "data carries neither contact_id nor call_id",
                )),
            }
        }
        DialerPayload::Flat {
            event_type,
            contact_id,
        } => Ok((event_name(&event_type), "contact".to_string(), contact_id)),
    }
}

fn normalize_messaging(raw: &serde_json::Value) -> Result<(String, String, String)> {
    let parsed: MessagingPayload = serde_json::from_value(raw.clone()).map_err(|_| {
        unrecognized(EventSource::Messaging, "no known messaging payload shape matched")
    })?;

    let (event_type, message) = match parsed {
        MessagingPayload::Wrapped { kind, message } => (event_name(&kind), message),
        MessagingPayload::Flat(message) => ("message.received".to_string(), message),
    };

    // A natural message id wins; otherwise fall back to a best-effort content hash.
    let entity_id = match message.id.filter(|id| !id.is_empty()) {
        Some(id) => id,
        None => {
            let seconds = message
                .timestamp
                .as_ref()
                .map(timestamp_seconds)
                .unwrap_or_default();
            fallback_message_id(&message.body, &seconds, &message.from, &message.to)
        }
    };

    Ok((event_type, "message".to_string(), entity_id))
}

/// Normalize a platform event name to `entity.verb_past` form.
///
/// Dotted names are lowercased as they are; CamelCase names such as
/// `ContactUpdate` become `contact.updated`.
pub fn event_name(raw: &str) -> String {
    let raw = raw.trim();
    if raw.contains('.') {
        return raw.to_ascii_lowercase();
    }

    let mut words: Vec<String> = Vec::new();
    for ch in raw.chars() {
        if ch == '_' || ch == '-' || ch == ' ' {
            words.push(String::new());
            continue;
        }
        if ch.is_ascii_uppercase() || words.is_empty() {
            words.push(String::new());
        }
        if let Some(last) = words.last_mut() {
            last.push(ch.to_ascii_lowercase());
        }
    }
    words.retain(|w| !w.is_empty());

    match words.split_first() {
        None => String::new(),
        Some((entity, [])) => entity.clone(),
        Some((entity, rest)) => {
            let mut rest: Vec<String> = rest.to_vec();
            if let Some(last) = rest.last_mut() {
                *last = past_tense(last);
            }
            format!("{}.{}", entity, rest.join("_"))
        }
    }
}

fn past_tense(verb: &str) -> String {
    match verb {
        "create" => "created".to_string(),
        "update" => "updated".to_string(),
        "delete" => "deleted".to_string(),
        "add" => "added".to_string(),
        "remove" => "removed".to_string(),
        other => other.to_string(),
    }
}

fn entity_of(event_type: &str) -> String {
    event_type
        .split('.')
        .next()
        .filter(|s| !s.is_empty())
        .unwrap_or("unknown")
        .to_string()
}

/// Reduce a timestamp to whole seconds since the epoch.
///
/// Accepts epoch seconds, epoch milliseconds and RFC 3339 strings; anything
/// else is used verbatim.
pub fn timestamp_seconds(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(v) if v > 1_000_000_000_000 => (v / 1000).to_string(),
            Some(v) => v.to_string(),
            None => n
                .as_f64()
                .map(|f| (f as i64).to_string())
                .unwrap_or_else(|| n.to_string()),
        },
        serde_json::Value::String(s) => match DateTime::parse_from_rfc3339(s) {
            Ok(dt) => dt.timestamp().to_string(),
            Err(_) => s.clone(),
        },
        other => other.to_string(),
    }
}

fn unrecognized(source: EventSource, reason: impl Into<String>) -> SyncError {
    SyncError::UnrecognizedPayload {
        source_name: source.to_string(),
        reason: reason.into(),
    }
}
