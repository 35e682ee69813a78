//! Execution records and the status machine
//!
//! One `ExecutionRecord` exists per submitted event. The record lives in two
//! stores at once: the document store keeps typed fields and is the source of
//! truth; the KV store keeps a string-only hash for hot-path reads by workers.
//! `to_kv_fields` / `from_kv_fields` are the only sanctioned conversions
//! between the two shapes; no call site sees both.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::RecordError;

/// Status of an execution.
///
/// `Completed` and `Failed` are absorbing for automatic processing; a manual
/// retry may force any record back to `Queued`. `Processing` and `Retrying`
/// are in-flight: a worker pool reclaims records left in either state by a
/// crashed worker at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Queued,
    Processing,
    Completed,
    Failed,
    Retrying,
}

impl ExecutionStatus {
    /// The wire string used in both stores.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Retrying => "retrying",
        }
    }

    /// Parse a wire string back into a status.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(Self::Queued),
            "processing" => Some(Self::Processing),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "retrying" => Some(Self::Retrying),
            _ => None,
        }
    }

    /// Whether a worker left this record in-flight (orphan candidate).
    pub fn is_in_flight(&self) -> bool {
        matches!(self, Self::Processing | Self::Retrying)
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// KV hash field names. The hash carries the same camelCase keys the document
// store exposes to the dashboard, so a raw HGETALL is directly readable.
pub mod fields {
    pub const ID: &str = "id";
    pub const EVENT_NAME: &str = "eventName";
    pub const EVENT_DATA: &str = "eventData";
    pub const STATUS: &str = "status";
    pub const ATTEMPT_COUNT: &str = "attemptCount";
    pub const RESULT: &str = "result";
    pub const ERROR: &str = "error";
    pub const ERROR_STACK: &str = "errorStack";
    pub const CREATED_AT: &str = "createdAt";
    pub const UPDATED_AT: &str = "updatedAt";
}

/// A single submitted event and its lifecycle state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRecord {
    /// Opaque unique id. Caller-supplied or generated at submission.
    pub id: String,
    /// Handler identifier the event dispatches to.
    pub event_name: String,
    /// Opaque payload, kept as serialized JSON text.
    pub event_data: String,
    pub status: ExecutionStatus,
    /// Number of failed attempts so far. Preserved on success.
    pub attempt_count: u32,
    /// Handler return value; present iff `status == Completed`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Most recent attempt's error; present iff failed or retrying.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_stack: Option<String>,
    /// Milliseconds since epoch.
    pub created_at: i64,
    pub updated_at: i64,
}

impl ExecutionRecord {
    /// Build a fresh `queued` record for a newly submitted event.
    pub fn queued(id: String, event_name: String, event_data: String, now: i64) -> Self {
        Self {
            id,
            event_name,
            event_data,
            status: ExecutionStatus::Queued,
            attempt_count: 0,
            result: None,
            error: None,
            error_stack: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Parse the raw payload into JSON.
    pub fn parse_event_data(&self) -> Result<Value, RecordError> {
        serde_json::from_str(&self.event_data)
            .map_err(|e| RecordError::MalformedPayload(e.to_string()))
    }

    /// Serialize to the string-only KV hash representation.
    ///
    /// Optional fields are omitted rather than written as empty strings, so
    /// `from_kv_fields` can tell "absent" from "empty".
    pub fn to_kv_fields(&self) -> Vec<(String, String)> {
        let mut out = vec![
            (fields::ID.into(), self.id.clone()),
            (fields::EVENT_NAME.into(), self.event_name.clone()),
            (fields::EVENT_DATA.into(), self.event_data.clone()),
            (fields::STATUS.into(), self.status.to_string()),
            (fields::ATTEMPT_COUNT.into(), self.attempt_count.to_string()),
            (fields::CREATED_AT.into(), self.created_at.to_string()),
            (fields::UPDATED_AT.into(), self.updated_at.to_string()),
        ];
        if let Some(result) = &self.result {
            out.push((fields::RESULT.into(), result.to_string()));
        }
        if let Some(error) = &self.error {
            out.push((fields::ERROR.into(), error.clone()));
        }
        if let Some(stack) = &self.error_stack {
            out.push((fields::ERROR_STACK.into(), stack.clone()));
        }
        out
    }

    /// Decode a KV hash back into a typed record.
    ///
    /// `eventName`, `eventData` and `createdAt` are required; a hash missing
    /// any of them is malformed. Bookkeeping fields degrade gracefully:
    /// an absent status reads as `queued`, an absent attempt count as zero.
    pub fn from_kv_fields(
        id: &str,
        map: &HashMap<String, String>,
    ) -> Result<Self, RecordError> {
        let event_name = map
            .get(fields::EVENT_NAME)
            .ok_or(RecordError::MissingField(fields::EVENT_NAME))?
            .clone();
        let event_data = map
            .get(fields::EVENT_DATA)
            .ok_or(RecordError::MissingField(fields::EVENT_DATA))?
            .clone();
        let created_at = parse_i64(map, fields::CREATED_AT)?
            .ok_or(RecordError::MissingField(fields::CREATED_AT))?;

        let status = match map.get(fields::STATUS) {
            Some(raw) => ExecutionStatus::parse(raw).ok_or_else(|| RecordError::InvalidField {
                field: fields::STATUS,
                value: raw.clone(),
            })?,
            None => ExecutionStatus::Queued,
        };
        let attempt_count = parse_u32(map, fields::ATTEMPT_COUNT)?.unwrap_or(0);
        let updated_at = parse_i64(map, fields::UPDATED_AT)?.unwrap_or(created_at);

        let result = match map.get(fields::RESULT) {
            Some(raw) => {
                Some(
                    serde_json::from_str(raw).map_err(|_| RecordError::InvalidField {
                        field: fields::RESULT,
                        value: raw.clone(),
                    })?,
                )
            }
            None => None,
        };

        Ok(Self {
            id: id.to_string(),
            event_name,
            event_data,
            status,
            attempt_count,
            result,
            error: map.get(fields::ERROR).cloned(),
            error_stack: map.get(fields::ERROR_STACK).cloned(),
            created_at,
            updated_at,
        })
    }
}

fn parse_i64(map: &HashMap<String, String>, field: &'static str) -> Result<Option<i64>, RecordError> {
    match map.get(field) {
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| RecordError::InvalidField {
                field,
                value: raw.clone(),
            }),
        None => Ok(None),
    }
}

fn parse_u32(map: &HashMap<String, String>, field: &'static str) -> Result<Option<u32>, RecordError> {
    match map.get(field) {
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| RecordError::InvalidField {
                field,
                value: raw.clone(),
            }),
        None => Ok(None),
    }
}

/// Generate an execution id: 128 uniformly random bits, hex-encoded.
pub fn generate_execution_id() -> String {
    Uuid::new_v4().simple().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> ExecutionRecord {
        ExecutionRecord::queued(
            "abc123".into(),
            "simple-event".into(),
            json!({"value": "hello"}).to_string(),
            1_700_000_000_000,
        )
    }

    #[test]
    fn kv_round_trip_preserves_record() {
        let mut rec = sample();
        rec.status = ExecutionStatus::Retrying;
        rec.attempt_count = 2;
        rec.error = Some("boom".into());
        rec.error_stack = Some("boom\n  at handler".into());

        let map: HashMap<String, String> = rec.to_kv_fields().into_iter().collect();
        let back = ExecutionRecord::from_kv_fields(&rec.id, &map).unwrap();
        assert_eq!(back, rec);
    }

    #[test]
    fn kv_round_trip_with_result() {
        let mut rec = sample();
        rec.status = ExecutionStatus::Completed;
        rec.result = Some(json!({"processed": "HELLO"}));

        let map: HashMap<String, String> = rec.to_kv_fields().into_iter().collect();
        let back = ExecutionRecord::from_kv_fields(&rec.id, &map).unwrap();
        assert_eq!(back.result, Some(json!({"processed": "HELLO"})));
    }

    #[test]
    fn missing_required_field_is_rejected() {
        let rec = sample();
        let mut map: HashMap<String, String> = rec.to_kv_fields().into_iter().collect();
        map.remove(fields::EVENT_DATA);

        let err = ExecutionRecord::from_kv_fields(&rec.id, &map).unwrap_err();
        assert!(matches!(err, RecordError::MissingField("eventData")));
    }

    #[test]
    fn absent_bookkeeping_fields_default() {
        let rec = sample();
        let mut map: HashMap<String, String> = rec.to_kv_fields().into_iter().collect();
        map.remove(fields::STATUS);
        map.remove(fields::ATTEMPT_COUNT);
        map.remove(fields::UPDATED_AT);

        let back = ExecutionRecord::from_kv_fields(&rec.id, &map).unwrap();
        assert_eq!(back.status, ExecutionStatus::Queued);
        assert_eq!(back.attempt_count, 0);
        assert_eq!(back.updated_at, back.created_at);
    }

    #[test]
    fn unparseable_payload_is_malformed() {
        let mut rec = sample();
        rec.event_data = "{not json".into();
        assert!(matches!(
            rec.parse_event_data(),
            Err(RecordError::MalformedPayload(_))
        ));
    }

    #[test]
    fn generated_ids_are_hex_128_bit() {
        let id = generate_execution_id();
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(id, generate_execution_id());
    }

    #[test]
    fn status_strings_round_trip() {
        for status in [
            ExecutionStatus::Queued,
            ExecutionStatus::Processing,
            ExecutionStatus::Completed,
            ExecutionStatus::Failed,
            ExecutionStatus::Retrying,
        ] {
            assert_eq!(ExecutionStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(ExecutionStatus::parse("bogus"), None);
    }
}
