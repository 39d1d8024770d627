use serde_json::{Map, Value};

use crate::analysis::{value_to_text, SectionItem, CONTRADICTIONS, EXPERT_OPINIONS_NEEDED, RED_FLAGS};
use crate::pipeline::registry::FieldRendering;

fn field_or(map: &Map<String, Value>, key: &str, default: &str) -> String {
    match map.get(key) {
        Some(value) => {
            let text = value_to_text(value);
            if text.trim().is_empty() {
                default.to_string()
            } else {
                text
            }
        }
        None => default.to_string(),
    }
}

pub fn format_red_flag(flag: &Map<String, Value>) -> String {
    format!(
        "Category: {} | Issue: {} | Records: {} | Legal Relevance: {}",
        field_or(flag, "category", "unknown"),
        field_or(flag, "issue", "No description"),
        field_or(flag, "records", ""),
        field_or(flag, "legal_relevance", "unknown"),
    )
}

pub fn format_contradiction(contradiction: &Map<String, Value>) -> String {
    format!(
        "Records {}: {} | Legal Relevance: {}",
        field_or(contradiction, "records", "Unknown"),
        field_or(contradiction, "description", "No description"),
        field_or(contradiction, "legal_relevance", "unknown"),
    )
}

pub fn format_expert_opinion(opinion: &Map<String, Value>) -> String {
    format!(
        "Topic: {} | Records: {} | Reason: {}",
        field_or(opinion, "topic", "Unknown"),
        field_or(opinion, "records", ""),
        field_or(opinion, "reason", "No description"),
    )
}

/// Text form of an object item for the given section.
pub fn format_section_object(section: &str, map: &Map<String, Value>) -> String {
    match section {
        RED_FLAGS => format_red_flag(map),
        CONTRADICTIONS => format_contradiction(map),
        EXPERT_OPINIONS_NEEDED => format_expert_opinion(map),
        _ => SectionItem::Object(map.clone()).display_text(),
    }
}

/// Reshape one item to the section's declared rendering.
pub fn shape_item(section: &str, item: SectionItem, rendering: FieldRendering) -> SectionItem {
    match (rendering, item) {
        (FieldRendering::Text, SectionItem::Object(map)) => {
            SectionItem::Text(format_section_object(section, &map))
        }
        (FieldRendering::Object, SectionItem::Text(text)) => {
            let mut map = Map::new();
            map.insert("description".to_string(), Value::String(text));
            SectionItem::Object(map)
        }
        (_, unchanged) => unchanged,
    }
}

pub fn shape_section(
    section: &str,
    items: Vec<SectionItem>,
    rendering: FieldRendering,
) -> Vec<SectionItem> {
    items
        .into_iter()
        .map(|item| shape_item(section, item, rendering))
        .collect()
}
