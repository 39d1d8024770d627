use std::collections::BTreeMap;

use super::AugmentError;

/// Strip a ```json / ``` fence when present; otherwise return the bare
/// JSON value (object or array) found in the text.
pub fn extract_json_payload(raw: &str) -> Result<&str, AugmentError> {
    let trimmed = raw.trim();

    if let Some(start) = trimmed.find("```json") {
        let after_fence = &trimmed[start + 7..];
        if let Some(end) = after_fence.find("```") {
            return Ok(after_fence[..end].trim());
        }
    }

    if let Some(start) = trimmed.find("```") {
        let after_fence = &trimmed[start + 3..];
        if let Some(end) = after_fence.find("```") {
            return Ok(after_fence[..end].trim());
        }
    }

    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        return Ok(trimmed);
    }

    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}')) {
        if start < end {
            return Ok(&trimmed[start..=end]);
        }
    }

    Err(AugmentError::JsonParsing(
        "No JSON found in analysis response".to_string(),
    ))
}

/// Parse the augmenter answer into `section -> raw items`.
///
/// An array of objects (one per analysed group) is merged field by field,
/// concatenating items in array order. Scalars become single items; null
/// becomes an empty section.
pub fn parse_augmenter_response(
    raw: &str,
) -> Result<BTreeMap<String, Vec<serde_json::Value>>, AugmentError> {
    let payload = extract_json_payload(raw)?;
    let value: serde_json::Value =
        serde_json::from_str(payload).map_err(|e| AugmentError::JsonParsing(e.to_string()))?;

    let objects = match value {
        serde_json::Value::Object(map) => vec![map],
        serde_json::Value::Array(items) => items
            .into_iter()
            .filter_map(|item| match item {
                serde_json::Value::Object(map) => Some(map),
                other => {
                    tracing::debug!(item = %other, "Ignoring non-object analysis element");
                    None
                }
            })
            .collect(),
        other => {
            return Err(AugmentError::JsonParsing(format!(
                "Expected a JSON object, got {other}"
            )))
        }
    };

    let mut sections: BTreeMap<String, Vec<serde_json::Value>> = BTreeMap::new();
    for object in objects {
        for (field, value) in object {
            let items = sections.entry(field).or_default();
            match value {
                serde_json::Value::Array(values) => items.extend(values),
                serde_json::Value::Null => {}
                single => items.push(single),
            }
        }
    }
    Ok(sections)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn fenced_payload() {
        let raw = "Analysis:\n```json\n{\"red_flags\": []}\n```";
        assert_eq!(extract_json_payload(raw).unwrap(), "{\"red_flags\": []}");
    }

    #[test]
    fn bare_array_payload() {
        let raw = "  [{\"red_flags\": []}]  ";
        assert_eq!(extract_json_payload(raw).unwrap(), "[{\"red_flags\": []}]");
    }

    #[test]
    fn object_response() {
        let sections = parse_augmenter_response(
            r#"{"red_flags": [{"issue": "x", "records": ["R1"]}], "contradictions": null, "expert_opinions_needed": "Review dosage"}"#,
        )
        .unwrap();
        assert_eq!(sections["red_flags"].len(), 1);
        assert!(sections["contradictions"].is_empty());
        assert_eq!(sections["expert_opinions_needed"], vec![json!("Review dosage")]);
    }

    #[test]
    fn array_response_is_merged_per_field() {
        let sections = parse_augmenter_response(
            r#"[{"red_flags": ["a"], "contradictions": ["c1"]}, {"red_flags": ["b"]}, 7]"#,
        )
        .unwrap();
        assert_eq!(sections["red_flags"], vec![json!("a"), json!("b")]);
        assert_eq!(sections["contradictions"], vec![json!("c1")]);
    }

    #[test]
    fn unparsable_response_is_an_error() {
        assert!(matches!(
            parse_augmenter_response("I could not find any issues."),
            Err(AugmentError::JsonParsing(_))
        ));
        assert!(parse_augmenter_response("```json\n{broken\n```").is_err());
        assert!(parse_augmenter_response("\"just a string\"").is_err());
    }
}
