//! Trigger payload validation
//!
//! Only the envelope is checked: `event` (non-empty string), `data` (object),
//! optional `workflowId` (string) and optional `timestamp` (ISO-8601). Anything
//! else in the document passes through untouched.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

/// First failing field of a rejected payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[error("\"{field}\" {reason}")]
pub struct ValidationError {
    pub field: String,
    pub reason: String,
}

impl ValidationError {
    pub fn new(field: &str, reason: &str) -> Self {
        Self {
            field: field.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// A payload whose envelope passed validation
#[derive(Debug, Clone)]
pub struct TriggerEnvelope {
    pub event: String,
    pub workflow_id: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
    /// The full document as received, unknown fields included
    pub document: Value,
}

impl TriggerEnvelope {
    pub fn data(&self) -> Option<&Map<String, Value>> {
        self.document.get("data").and_then(Value::as_object)
    }
}

/// Validate a generic webhook-trigger document.
///
/// Fields are checked in the order `workflowId`, `event`, `data`, `timestamp`
/// and the first violation is returned.
pub fn validate_trigger(document: Value) -> Result<TriggerEnvelope, ValidationError> {
    let fields = document
        .as_object()
        .ok_or_else(|| ValidationError::new("value", "must be of type object"))?;

    let workflow_id = match fields.get("workflowId") {
        None => None,
        Some(value) => Some(non_empty_string("workflowId", value)?.to_string()),
    };

    let event = match fields.get("event") {
        None => return Err(ValidationError::new("event", "is required")),
        Some(value) => non_empty_string("event", value)?.to_string(),
    };

    match fields.get("data") {
        None => return Err(ValidationError::new("data", "is required")),
        Some(Value::Object(_)) => {}
        Some(_) => return Err(ValidationError::new("data", "must be of type object")),
    }

    let timestamp = match fields.get("timestamp") {
        None => None,
        Some(Value::String(raw)) => Some(parse_iso8601(raw).ok_or_else(|| {
            ValidationError::new("timestamp", "must be in ISO 8601 date format")
        })?),
        Some(_) => {
            return Err(ValidationError::new(
                "timestamp",
                "must be in ISO 8601 date format",
            ))
        }
    };

    Ok(TriggerEnvelope {
        event,
        workflow_id,
        timestamp,
        document,
    })
}

fn non_empty_string<'a>(field: &str, value: &'a Value) -> Result<&'a str, ValidationError> {
    match value {
        Value::String(s) if s.is_empty() => {
            Err(ValidationError::new(field, "is not allowed to be empty"))
        }
        Value::String(s) => Ok(s),
        _ => Err(ValidationError::new(field, "must be a string")),
    }
}

/// Accepts RFC 3339, date-times without offset (read as UTC) and bare dates
pub fn parse_iso8601(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }

    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(naive.and_utc());
        }
    }

    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_minimal_payload_is_valid() {
        let envelope = validate_trigger(json!({"event": "lead_created", "data": {"id": 42}})).unwrap();
        assert_eq!(envelope.event, "lead_created");
        assert_eq!(envelope.data().unwrap()["id"], 42);
        assert!(envelope.workflow_id.is_none());
        assert!(envelope.timestamp.is_none());
    }

    #[test]
    fn test_unknown_fields_pass_through() {
        let doc = json!({
            "event": "lead_created",
            "data": {},
            "workflowId": "wf-1",
            "timestamp": "2024-05-01T10:00:00Z",
            "source": "crm",
            "nested": {"a": [1, 2]}
        });
        let envelope = validate_trigger(doc.clone()).unwrap();
        assert_eq!(envelope.document, doc);
        assert_eq!(envelope.workflow_id.as_deref(), Some("wf-1"));
        assert!(envelope.timestamp.is_some());
    }

    #[test]
    fn test_missing_event_or_data() {
        let err = validate_trigger(json!({"data": {}})).unwrap_err();
        assert_eq!(err, ValidationError::new("event", "is required"));

        let err = validate_trigger(json!({"event": "x"})).unwrap_err();
        assert_eq!(err, ValidationError::new("data", "is required"));
    }

    #[test]
    fn test_empty_event_is_rejected() {
        let err = validate_trigger(json!({"event": "", "data": {}})).unwrap_err();
        assert_eq!(err.field, "event");
        assert_eq!(err.to_string(), "\"event\" is not allowed to be empty");
    }

    #[test]
    fn test_wrong_types() {
        let err = validate_trigger(json!({"event": 7, "data": {}})).unwrap_err();
        assert_eq!(err, ValidationError::new("event", "must be a string"));

        let err = validate_trigger(json!({"event": "x", "data": [1]})).unwrap_err();
        assert_eq!(err, ValidationError::new("data", "must be of type object"));

        let err = validate_trigger(json!({"event": "x", "data": null})).unwrap_err();
        assert_eq!(err.field, "data");

        let err = validate_trigger(json!({"event": "x", "data": {}, "workflowId": 3})).unwrap_err();
        assert_eq!(err.field, "workflowId");

        let err = validate_trigger(json!(["event"])).unwrap_err();
        assert_eq!(err.field, "value");
    }

    #[test]
    fn test_first_failing_field_wins() {
        let err = validate_trigger(json!({"workflowId": 1})).unwrap_err();
        assert_eq!(err.field, "workflowId");
    }

    #[test]
    fn test_timestamp_formats() {
        for ok in [
            "2024-05-01",
            "2024-05-01T10:00",
            "2024-05-01T10:00:00",
            "2024-05-01T10:00:00.123",
            "2024-05-01T10:00:00Z",
            "2024-05-01T10:00:00.5+02:00",
        ] {
            assert!(parse_iso8601(ok).is_some(), "{} should parse", ok);
        }

        for bad in ["yesterday", "01/05/2024", "2024-13-01", ""] {
            let err =
                validate_trigger(json!({"event": "x", "data": {}, "timestamp": bad})).unwrap_err();
            assert_eq!(err.field, "timestamp", "{} should be rejected", bad);
        }

        let err = validate_trigger(json!({"event": "x", "data": {}, "timestamp": 1714557600}))
            .unwrap_err();
        assert_eq!(err.field, "timestamp");
    }

    #[test]
    fn test_offset_is_normalised_to_utc() {
        let ts = parse_iso8601("2024-05-01T12:00:00+02:00").unwrap();
        assert_eq!(ts.to_rfc3339(), "2024-05-01T10:00:00+00:00");
    }
}
