//! Step records, the step digest, and the cache envelope
//!
//! A step is identified inside its execution by the md5 digest of its human
//! title. Digests only have to be distinct among the handful of step titles
//! one handler uses, so md5 is acceptable here; it is not a cryptographic
//! identifier.
//!
//! The KV cache stores each step result wrapped in an envelope,
//! `{"cached":true,"value":…}`, so that a step which legitimately returned
//! `null` still reads as a cache hit on retry. A missing or unparseable blob
//! is a miss.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

/// Deterministic step identifier: hex md5 of the step title.
pub fn step_id(title: &str) -> String {
    format!("{:x}", md5::compute(title.as_bytes()))
}

/// One successfully completed step of one execution.
///
/// Only successful steps are recorded; a failing compute writes nothing.
/// (`execution_id`, `step_id`) is unique in the document store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepRecord {
    pub execution_id: String,
    /// Digest of the title, see [`step_id`].
    pub step_id: String,
    /// The human step title.
    pub name: String,
    pub status: String,
    pub result: Value,
    /// Completion time, milliseconds since epoch.
    pub timestamp: i64,
}

impl StepRecord {
    pub fn completed(
        execution_id: impl Into<String>,
        name: impl Into<String>,
        result: Value,
        timestamp: i64,
    ) -> Self {
        let name = name.into();
        Self {
            execution_id: execution_id.into(),
            step_id: step_id(&name),
            name,
            status: "completed".to_string(),
            result,
            timestamp,
        }
    }
}

/// Envelope wrapping a cached step value in the KV store.
#[derive(Debug, Serialize, Deserialize)]
struct StepEnvelope {
    cached: bool,
    #[serde(default)]
    value: Value,
}

/// Outcome of a step cache probe.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheLookup {
    /// A prior attempt completed this step; carries its value (possibly null).
    Hit(Value),
    /// No usable cache entry; the step must compute.
    Miss,
}

/// Wrap a step value for the KV cache. Absent values are encoded as `null`.
pub fn encode_step_value(value: &Value) -> String {
    // Serialization of bool + Value cannot fail.
    serde_json::to_string(&StepEnvelope {
        cached: true,
        value: value.clone(),
    })
    .unwrap_or_else(|_| r#"{"cached":true,"value":null}"#.to_string())
}

/// Probe a raw cache blob.
///
/// Absent or empty blobs are misses. Parse failures are misses too: a
/// corrupt entry must not wedge the execution, so it is logged and the step
/// recomputes.
pub fn decode_step_blob(blob: Option<&str>) -> CacheLookup {
    let raw = match blob {
        Some(raw) if !raw.is_empty() => raw,
        _ => return CacheLookup::Miss,
    };
    match serde_json::from_str::<StepEnvelope>(raw) {
        Ok(envelope) if envelope.cached => CacheLookup::Hit(envelope.value),
        Ok(_) => CacheLookup::Miss,
        Err(e) => {
            warn!(error = %e, "unparseable step cache entry, treating as miss");
            CacheLookup::Miss
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn digest_is_stable_hex() {
        let id = step_id("fetch user");
        assert_eq!(id, step_id("fetch user"));
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(id, step_id("fetch users"));
    }

    #[test]
    fn envelope_round_trips_falsy_values() {
        for value in [
            Value::Null,
            json!(0),
            json!(""),
            json!(false),
            json!({}),
            json!([1, 2, 3]),
        ] {
            let blob = encode_step_value(&value);
            assert_eq!(decode_step_blob(Some(&blob)), CacheLookup::Hit(value));
        }
    }

    #[test]
    fn absent_and_empty_blobs_are_misses() {
        assert_eq!(decode_step_blob(None), CacheLookup::Miss);
        assert_eq!(decode_step_blob(Some("")), CacheLookup::Miss);
    }

    #[test]
    fn garbage_blob_is_a_miss() {
        assert_eq!(decode_step_blob(Some("{half a json")), CacheLookup::Miss);
        assert_eq!(decode_step_blob(Some("[]")), CacheLookup::Miss);
    }

    #[test]
    fn uncached_envelope_is_a_miss() {
        assert_eq!(
            decode_step_blob(Some(r#"{"cached":false,"value":42}"#)),
            CacheLookup::Miss
        );
    }

    #[test]
    fn envelope_without_value_field_reads_as_null_hit() {
        assert_eq!(
            decode_step_blob(Some(r#"{"cached":true}"#)),
            CacheLookup::Hit(Value::Null)
        );
    }

    #[test]
    fn record_derives_digest_from_title() {
        let rec = StepRecord::completed("ex1", "add ten", json!(15), 1);
        assert_eq!(rec.step_id, step_id("add ten"));
        assert_eq!(rec.status, "completed");
    }
}
