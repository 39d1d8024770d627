use serde_json::json;

use super::chronology::SortedChronology;
use crate::analysis::SectionItem;
use crate::pipeline::extraction::ExtractedEvent;
use crate::pipeline::registry::FieldRendering;

pub const DOCUMENTATION_GAP: &str = "documentation_gap";

fn invalid_date_issue(event: &ExtractedEvent) -> String {
    if event.date.trim().is_empty() {
        "Record has no date; chronological placement cannot be verified".to_string()
    } else {
        format!(
            "Invalid date '{}'; chronological placement cannot be verified",
            event.date
        )
    }
}

/// One `documentation_gap` red flag per record whose date failed to parse,
/// in chronology order.
pub fn flag_invalid_dates(sorted: &SortedChronology, rendering: FieldRendering) -> Vec<SectionItem> {
    sorted
        .entries
        .iter()
        .filter(|entry| !entry.has_valid_date())
        .map(|entry| {
            let event = &entry.event;
            let records: Vec<&str> = event.dedup_key().into_iter().collect();
            let issue = invalid_date_issue(event);
            match rendering {
                FieldRendering::Object => SectionItem::from_value(json!({
                    "category": DOCUMENTATION_GAP,
                    "issue": issue,
                    "records": records,
                    "severity": "high",
                    "legal_relevance": "high",
                })),
                FieldRendering::Text => SectionItem::Text(format!(
                    "Category: {} | Issue: {} | Records: {} | Severity: high | Legal Relevance: high",
                    DOCUMENTATION_GAP,
                    issue,
                    if records.is_empty() {
                        "(no id)".to_string()
                    } else {
                        records.join(", ")
                    }
                )),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::assembly::chronology::sort_chronologically;

    fn chronology() -> SortedChronology {
        sort_chronologically(vec![
            ExtractedEvent::new("R1", "2023-01-18", "visit", "a"),
            ExtractedEvent::new("R2", "INVALID-DATE", "visit", "b"),
            ExtractedEvent::new("R3", "2023-03-15", "visit", "c"),
        ])
    }

    #[test]
    fn object_flag_cites_record() {
        let flags = flag_invalid_dates(&chronology(), FieldRendering::Object);
        assert_eq!(flags.len(), 1);
        let flag = flags[0].as_object().unwrap();
        assert_eq!(flag["category"], DOCUMENTATION_GAP);
        assert_eq!(flag["records"], json!(["R2"]));
        assert_eq!(flag["severity"], "high");
        assert!(flag["issue"].as_str().unwrap().contains("INVALID-DATE"));
    }

    #[test]
    fn text_flag_rendering() {
        let flags = flag_invalid_dates(&chronology(), FieldRendering::Text);
        let text = flags[0].as_text().unwrap();
        assert!(text.starts_with("Category: documentation_gap | Issue: Invalid date 'INVALID-DATE'"));
        assert!(text.ends_with("| Records: R2 | Severity: high | Legal Relevance: high"));
    }

    #[test]
    fn valid_input_has_no_flags() {
        let sorted = sort_chronologically(vec![
            ExtractedEvent::new("A", "2023-01-01", "visit", "a"),
            ExtractedEvent::new("B", "2023-02-01", "visit", "b"),
        ]);
        assert!(flag_invalid_dates(&sorted, FieldRendering::Object).is_empty());
    }

    #[test]
    fn missing_date_is_flagged() {
        let sorted = sort_chronologically(vec![ExtractedEvent::new("A", "", "visit", "a")]);
        let flags = flag_invalid_dates(&sorted, FieldRendering::Text);
        assert!(flags[0].as_text().unwrap().contains("Record has no date"));
    }

    #[test]
    fn text_flag_matches_augmented_red_flag_fields() {
        let flags = flag_invalid_dates(&chronology(), FieldRendering::Text);
        let text = flags[0].as_text().unwrap();
        let labels: Vec<&str> = text
            .split(" | ")
            .filter_map(|part| part.split_once(": ").map(|(label, _)| label))
            .collect();
        assert_eq!(
            labels,
            ["Category", "Issue", "Records", "Severity", "Legal Relevance"]
        );
    }
}
