use serde::{Deserialize, Deserializer, Serialize};

use crate::analysis::value_to_text;

/// One record's structured output from the extraction phase.
///
/// Immutable once built: assembly derives new structures from it and never
/// edits it in place. Fields beyond the standard event schema (e.g.
/// `medications` for the expert-witness pipeline) land in `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedEvent {
    #[serde(default, deserialize_with = "lenient_string")]
    pub date: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub record_id: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub event_type: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub event_description: String,
    #[serde(
        default,
        deserialize_with = "lenient_opt_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub provider: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient_opt_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub confidence: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient_opt_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub diagnosis: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ExtractedEvent {
    pub fn new(record_id: &str, date: &str, event_type: &str, event_description: &str) -> Self {
        Self {
            date: date.to_string(),
            record_id: record_id.to_string(),
            event_type: event_type.to_string(),
            event_description: event_description.to_string(),
            provider: None,
            confidence: None,
            diagnosis: None,
            extra: serde_json::Map::new(),
        }
    }

    pub fn with_provider(mut self, provider: &str) -> Self {
        self.provider = Some(provider.to_string());
        self
    }

    pub fn with_confidence(mut self, confidence: &str) -> Self {
        self.confidence = Some(confidence.to_string());
        self
    }

    pub fn from_map(map: serde_json::Map<String, serde_json::Value>) -> Result<Self, serde_json::Error> {
        serde_json::from_value(serde_json::Value::Object(map))
    }

    /// Dedup key, `None` for records without an id.
    pub fn dedup_key(&self) -> Option<&str> {
        let id = self.record_id.trim();
        if id.is_empty() {
            None
        } else {
            Some(id)
        }
    }
}

/// Accept strings, numbers, booleans and null (the LLM is not consistent).
fn lenient_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(value_to_text(&value).trim().to_string())
}

/// Like `lenient_string`, with null, empty strings and "null" mapping to None.
fn lenient_opt_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let text = lenient_string(deserializer)?;
    if text.is_empty() || text.eq_ignore_ascii_case("null") || text.eq_ignore_ascii_case("none") {
        Ok(None)
    } else {
        Ok(Some(text))
    }
}

/// Result of extracting one raw record that did not produce an event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordFailure {
    /// Position in the submitted batch, when known.
    pub index: Option<usize>,
    /// Identifier found on the raw record, if any.
    pub record_id: Option<String>,
    pub error: String,
    #[serde(default)]
    pub unreachable: bool,
}

/// Outcome of the extraction phase: events in submission order plus the
/// records that were skipped.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtractionBatch {
    pub events: Vec<ExtractedEvent>,
    pub failures: Vec<RecordFailure>,
    pub backend_unreachable: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn lenient_fields_accept_mixed_types() {
        let event: ExtractedEvent = serde_json::from_value(json!({
            "date": "2023-01-18",
            "record_id": 1042,
            "event_type": null,
            "event_description": "  Initial evaluation  ",
            "provider": "",
            "confidence": "high",
            "medications": ["sertraline 50mg"]
        }))
        .unwrap();

        assert_eq!(event.record_id, "1042");
        assert_eq!(event.event_type, "");
        assert_eq!(event.event_description, "Initial evaluation");
        assert_eq!(event.provider, None);
        assert_eq!(event.confidence.as_deref(), Some("high"));
        assert_eq!(event.extra["medications"][0], "sertraline 50mg");
    }

    #[test]
    fn missing_fields_default_to_empty() {
        let event: ExtractedEvent = serde_json::from_value(json!({})).unwrap();
        assert_eq!(event.date, "");
        assert!(event.dedup_key().is_none());
    }

    #[test]
    fn serialization_skips_absent_optionals() {
        let event = ExtractedEvent::new("R1", "2023-01-18", "visit", "Checkup");
        let value = serde_json::to_value(&event).unwrap();
        assert!(value.get("provider").is_none());
        assert_eq!(value["record_id"], "R1");
    }

    #[test]
    fn whitespace_id_has_no_dedup_key() {
        let event = ExtractedEvent::new("  ", "2023-01-18", "visit", "x");
        assert!(event.dedup_key().is_none());
        let event = ExtractedEvent::new("R7", "2023-01-18", "visit", "x");
        assert_eq!(event.dedup_key(), Some("R7"));
    }
}
