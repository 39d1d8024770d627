use crate::analysis::value_to_text;
use crate::pipeline::registry::ValidationRule;

/// Check an extraction output against the pipeline's rules. Returns the
/// first violated rule, rendered for logs.
pub fn validate_output(
    output: &serde_json::Map<String, serde_json::Value>,
    rules: &[ValidationRule],
) -> Result<(), String> {
    for rule in rules {
        match rule {
            ValidationRule::NonEmpty(field) => {
                let present = output
                    .get(field)
                    .map(|value| !value_to_text(value).trim().is_empty())
                    .unwrap_or(false);
                if !present {
                    return Err(rule.describe());
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rules() -> Vec<ValidationRule> {
        vec![
            ValidationRule::NonEmpty("date".into()),
            ValidationRule::NonEmpty("record_id".into()),
        ]
    }

    fn map(value: serde_json::Value) -> serde_json::Map<String, serde_json::Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn complete_output_passes() {
        let output = map(json!({"date": "2023-01-18", "record_id": "R1"}));
        assert!(validate_output(&output, &rules()).is_ok());
    }

    #[test]
    fn empty_or_missing_field_fails() {
        let output = map(json!({"date": "  ", "record_id": "R1"}));
        assert_eq!(
            validate_output(&output, &rules()).unwrap_err(),
            r#"output["date"] != """#
        );

        let output = map(json!({"date": "2023-01-18", "record_id": null}));
        assert!(validate_output(&output, &rules()).is_err());

        let output = map(json!({"date": "2023-01-18"}));
        assert!(validate_output(&output, &rules()).is_err());
    }

    #[test]
    fn numeric_id_counts_as_present() {
        let output = map(json!({"date": "2023-01-18", "record_id": 7}));
        assert!(validate_output(&output, &rules()).is_ok());
    }

    #[test]
    fn no_rules_always_pass() {
        assert!(validate_output(&serde_json::Map::new(), &[]).is_ok());
    }
}
