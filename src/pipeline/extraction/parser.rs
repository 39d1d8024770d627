use super::{ExtractedEvent, ExtractionError};

/// Extract a JSON block from LLM response text.
/// Handles responses that include text before/after the JSON.
pub fn extract_json_block(response: &str) -> Result<&str, ExtractionError> {
    let trimmed = response.trim();

    // Strip markdown code fences if present
    if let Some(start) = trimmed.find("```json") {
        let after_fence = &trimmed[start + 7..];
        if let Some(end) = after_fence.find("```") {
            return Ok(after_fence[..end].trim());
        }
    }

    if let Some(start) = trimmed.find("```") {
        let after_fence = &trimmed[start + 3..];
        if let Some(end) = after_fence.find("```") {
            let block = after_fence[..end].trim();
            if block.starts_with('{') || block.starts_with('[') {
                return Ok(block);
            }
        }
    }

    // Find the first { and last }
    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}')) {
        if start < end {
            return Ok(&trimmed[start..=end]);
        }
    }

    Err(ExtractionError::JsonParsing(
        "No JSON block found in LLM response".to_string(),
    ))
}

/// Parse the LLM output for one record into a JSON object. A single-element
/// array is unwrapped (some models wrap their answer).
pub fn parse_extraction_output(
    response: &str,
) -> Result<serde_json::Map<String, serde_json::Value>, ExtractionError> {
    let block = extract_json_block(response)?;
    let value: serde_json::Value = serde_json::from_str(block)
        .map_err(|e| ExtractionError::JsonParsing(e.to_string()))?;

    match value {
        serde_json::Value::Object(map) => Ok(map),
        serde_json::Value::Array(items) => items
            .into_iter()
            .find_map(|item| match item {
                serde_json::Value::Object(map) => Some(map),
                _ => None,
            })
            .ok_or_else(|| ExtractionError::JsonParsing("Array holds no JSON object".into())),
        other => Err(ExtractionError::JsonParsing(format!(
            "Expected a JSON object, got {other}"
        ))),
    }
}

/// Pass-through merge: the raw record's fields, overlaid by whatever the
/// LLM produced. Non-object raw records contribute nothing.
pub fn overlay_record(
    raw: &serde_json::Value,
    output: serde_json::Map<String, serde_json::Value>,
) -> serde_json::Map<String, serde_json::Value> {
    let mut merged = match raw {
        serde_json::Value::Object(map) => map.clone(),
        _ => serde_json::Map::new(),
    };
    for (key, value) in output {
        merged.insert(key, value);
    }
    merged
}

/// Build the event from an overlaid map.
pub fn event_from_output(
    merged: serde_json::Map<String, serde_json::Value>,
) -> Result<ExtractedEvent, ExtractionError> {
    ExtractedEvent::from_map(merged).map_err(|e| ExtractionError::JsonParsing(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn extract_json_block_from_fenced() {
        let response = "Here you go:\n```json\n{\"date\": \"2023-01-18\"}\n```\nDone.";
        assert_eq!(extract_json_block(response).unwrap(), "{\"date\": \"2023-01-18\"}");
    }

    #[test]
    fn extract_json_block_from_bare() {
        let response = "The answer is {\"date\": \"2023-01-18\"} as requested";
        assert_eq!(extract_json_block(response).unwrap(), "{\"date\": \"2023-01-18\"}");
    }

    #[test]
    fn extract_json_block_no_json() {
        assert!(matches!(
            extract_json_block("I cannot help with that."),
            Err(ExtractionError::JsonParsing(_))
        ));
    }

    #[test]
    fn parse_unwraps_array_answer() {
        let map = parse_extraction_output("```\n[{\"record_id\": \"R1\"}]\n```").unwrap();
        assert_eq!(map["record_id"], "R1");
    }

    #[test]
    fn parse_rejects_invalid_json() {
        assert!(parse_extraction_output("{date: 2023}").is_err());
    }

    #[test]
    fn overlay_prefers_llm_output() {
        let raw = json!({"record_id": "R1", "text": "Seen in clinic", "date": "01/18/2023"});
        let output = json!({"date": "2023-01-18", "event_type": "visit"});
        let merged = overlay_record(&raw, output.as_object().unwrap().clone());
        assert_eq!(merged["date"], "2023-01-18");
        assert_eq!(merged["text"], "Seen in clinic");

        let event = event_from_output(merged).unwrap();
        assert_eq!(event.record_id, "R1");
        assert_eq!(event.extra["text"], "Seen in clinic");
    }
}
