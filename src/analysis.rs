//! The analysis object produced by a pipeline run.
//!
//! Deterministic sections (`chronology`, `missing_records`) are always plain
//! strings. Augmenter-backed sections hold `SectionItem`s whose shape (text vs
//! structured object) is fixed per pipeline by its analysis schema.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub const CHRONOLOGY: &str = "chronology";
pub const MISSING_RECORDS: &str = "missing_records";
pub const RED_FLAGS: &str = "red_flags";
pub const CONTRADICTIONS: &str = "contradictions";
pub const EXPERT_OPINIONS_NEEDED: &str = "expert_opinions_needed";

/// One entry of an augmenter-backed section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SectionItem {
    Text(String),
    Object(serde_json::Map<String, serde_json::Value>),
}

impl SectionItem {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            Self::Object(_) => None,
        }
    }

    pub fn as_object(&self) -> Option<&serde_json::Map<String, serde_json::Value>> {
        match self {
            Self::Text(_) => None,
            Self::Object(map) => Some(map),
        }
    }

    /// Build an item from an arbitrary JSON value. Non-string scalars and
    /// arrays become their JSON text.
    pub fn from_value(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::String(s) => Self::Text(s),
            serde_json::Value::Object(map) => Self::Object(map),
            other => Self::Text(other.to_string()),
        }
    }

    /// Single-line rendering used by reports and logs regardless of shape.
    pub fn display_text(&self) -> String {
        match self {
            Self::Text(s) => s.clone(),
            Self::Object(map) => map
                .iter()
                .map(|(k, v)| format!("{k}: {}", value_to_text(v)))
                .collect::<Vec<_>>()
                .join(" | "),
        }
    }
}

impl From<&str> for SectionItem {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for SectionItem {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

/// Render a JSON value as human-readable text (strings unquoted, arrays
/// comma-joined).
pub fn value_to_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => String::new(),
        serde_json::Value::Array(items) => items
            .iter()
            .map(value_to_text)
            .collect::<Vec<_>>()
            .join(", "),
        other => other.to_string(),
    }
}

/// Final result of a pipeline run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalysisOutput {
    #[serde(default)]
    pub chronology: Vec<String>,
    #[serde(default)]
    pub missing_records: Vec<String>,
    #[serde(default)]
    pub red_flags: Vec<SectionItem>,
    #[serde(default)]
    pub contradictions: Vec<SectionItem>,
    #[serde(default)]
    pub expert_opinions_needed: Vec<SectionItem>,
    /// Pipeline-specific augmenter sections (e.g. `medication_adherence`).
    #[serde(default, flatten)]
    pub extra_sections: BTreeMap<String, Vec<SectionItem>>,
    /// Non-empty only for a degraded run.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub diagnostics: Vec<String>,
}

impl AnalysisOutput {
    /// Placeholder output for a run that failed as a whole.
    pub fn degraded(message: impl Into<String>) -> Self {
        Self {
            diagnostics: vec![format!("Pipeline error: {}", message.into())],
            ..Self::default()
        }
    }

    pub fn is_degraded(&self) -> bool {
        !self.diagnostics.is_empty()
    }

    /// Section names in presentation order.
    pub fn section_names(&self) -> Vec<String> {
        let mut names: Vec<String> = [
            CHRONOLOGY,
            MISSING_RECORDS,
            RED_FLAGS,
            CONTRADICTIONS,
            EXPERT_OPINIONS_NEEDED,
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        names.extend(self.extra_sections.keys().cloned());
        names
    }

    /// Items of a section as `SectionItem`s, deterministic sections included.
    pub fn section(&self, name: &str) -> Option<Vec<SectionItem>> {
        match name {
            CHRONOLOGY => Some(self.chronology.iter().cloned().map(SectionItem::Text).collect()),
            MISSING_RECORDS => Some(
                self.missing_records
                    .iter()
                    .cloned()
                    .map(SectionItem::Text)
                    .collect(),
            ),
            RED_FLAGS => Some(self.red_flags.clone()),
            CONTRADICTIONS => Some(self.contradictions.clone()),
            EXPERT_OPINIONS_NEEDED => Some(self.expert_opinions_needed.clone()),
            other => self.extra_sections.get(other).cloned(),
        }
    }

    /// Mutable access to an augmenter-backed section.
    pub fn augmented_section_mut(&mut self, name: &str) -> Option<&mut Vec<SectionItem>> {
        match name {
            RED_FLAGS => Some(&mut self.red_flags),
            CONTRADICTIONS => Some(&mut self.contradictions),
            EXPERT_OPINIONS_NEEDED => Some(&mut self.expert_opinions_needed),
            CHRONOLOGY | MISSING_RECORDS => None,
            other => self.extra_sections.get_mut(other),
        }
    }

    /// Item counts per section, for logging.
    pub fn section_counts(&self) -> Vec<(String, usize)> {
        self.section_names()
            .into_iter()
            .map(|name| {
                let count = self.section(&name).map(|items| items.len()).unwrap_or(0);
                (name, count)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn section_item_untagged_serde() {
        let text: SectionItem = serde_json::from_value(json!("plain")).unwrap();
        assert_eq!(text, SectionItem::Text("plain".into()));

        let object: SectionItem =
            serde_json::from_value(json!({"issue": "x", "records": ["R1"]})).unwrap();
        assert!(object.as_object().is_some());
        assert_eq!(serde_json::to_value(&object).unwrap()["issue"], "x");
    }

    #[test]
    fn display_text_joins_object_fields() {
        let item = SectionItem::from_value(json!({"category": "documentation_gap", "records": ["R1", "R2"]}));
        assert_eq!(item.display_text(), "category: documentation_gap | records: R1, R2");
    }

    #[test]
    fn extra_sections_flatten_into_top_level() {
        let mut output = AnalysisOutput::default();
        output
            .extra_sections
            .insert("medication_adherence".into(), vec!["took meds".into()]);
        let value = serde_json::to_value(&output).unwrap();
        assert_eq!(value["medication_adherence"][0], "took meds");
        assert!(value.get("diagnostics").is_none());

        let back: AnalysisOutput = serde_json::from_value(value).unwrap();
        assert_eq!(back, output);
    }

    #[test]
    fn degraded_output_carries_diagnostic() {
        let output = AnalysisOutput::degraded("backend unreachable");
        assert!(output.is_degraded());
        assert!(output.chronology.is_empty());
        assert_eq!(output.diagnostics, vec!["Pipeline error: backend unreachable"]);
    }

    #[test]
    fn section_lookup_covers_all_sections() {
        let mut output = AnalysisOutput::default();
        output.chronology.push("2023-01-01 | R1".into());
        output.extra_sections.insert("competency_timeline".into(), vec![]);

        assert_eq!(output.section(CHRONOLOGY).unwrap().len(), 1);
        assert!(output.section("competency_timeline").is_some());
        assert!(output.section("unknown").is_none());
        assert!(output.augmented_section_mut(CHRONOLOGY).is_none());
        assert_eq!(output.section_names().last().unwrap(), "competency_timeline");
    }
}
