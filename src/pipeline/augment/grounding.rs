//! Hallucination grounding for augmenter citations.
//!
//! Every record id an augmenter item cites must belong to the assembled
//! record set. Object items cite through their `records` field; text items
//! cite with `[ID]` brackets. A bracketed word that is neither a known id nor
//! id-shaped (no digit) is ordinary prose such as `[sic]` or `[visit]`.

use std::collections::{BTreeMap, HashSet};
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::CitationPolicy;
use crate::analysis::{value_to_text, SectionItem};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroundingViolation {
    pub section: String,
    pub index: usize,
    pub record_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroundingReport {
    pub citations_checked: usize,
    pub violations: Vec<GroundingViolation>,
}

impl GroundingReport {
    pub fn is_clean(&self) -> bool {
        self.violations.is_empty()
    }
}

fn bracket_citation() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"\[([A-Za-z0-9][A-Za-z0-9_.:/#-]*)\]").ok())
        .as_ref()
}

fn bracket_tokens(text: &str) -> Vec<String> {
    match bracket_citation() {
        Some(pattern) => pattern
            .captures_iter(text)
            .map(|caps| caps[1].to_string())
            .collect(),
        None => Vec::new(),
    }
}

/// Record ids carry at least one digit (`R1`, `MRN-2024-001`).
pub fn looks_like_record_id(token: &str) -> bool {
    token.chars().any(|c| c.is_ascii_digit())
}

/// Record ids cited by one item, in order of appearance. Bracketed text
/// tokens count only when id-shaped.
pub fn cited_record_ids(item: &SectionItem) -> Vec<String> {
    match item {
        SectionItem::Object(map) => match map.get("records") {
            Some(serde_json::Value::Array(ids)) => ids
                .iter()
                .map(value_to_text)
                .map(|id| id.trim().to_string())
                .filter(|id| !id.is_empty())
                .collect(),
            Some(serde_json::Value::String(joined)) => joined
                .split(',')
                .map(str::trim)
                .filter(|id| !id.is_empty())
                .map(str::to_string)
                .collect(),
            Some(serde_json::Value::Null) | None => Vec::new(),
            Some(other) => vec![value_to_text(other)],
        },
        SectionItem::Text(text) => bracket_tokens(text)
            .into_iter()
            .filter(|token| looks_like_record_id(token))
            .collect(),
    }
}

/// Citations of one item as seen against a known id set: a bracketed text
/// token is a citation when it is a known id or looks like one.
pub fn citations_against(item: &SectionItem, known_ids: &HashSet<String>) -> Vec<String> {
    match item {
        SectionItem::Text(text) => bracket_tokens(text)
            .into_iter()
            .filter(|token| known_ids.contains(token) || looks_like_record_id(token))
            .collect(),
        SectionItem::Object(_) => cited_record_ids(item),
    }
}

/// Check every citation against the known id set. Observability only: the
/// sections are not modified here.
pub fn check_grounding(
    known_ids: &HashSet<String>,
    sections: &BTreeMap<String, Vec<SectionItem>>,
) -> GroundingReport {
    let mut report = GroundingReport::default();

    for (section, items) in sections {
        for (index, item) in items.iter().enumerate() {
            for record_id in citations_against(item, known_ids) {
                report.citations_checked += 1;
                if !known_ids.contains(&record_id) {
                    tracing::warn!(
                        section = %section,
                        index,
                        record_id = %record_id,
                        "Hallucinated citation: record id not in case"
                    );
                    report.violations.push(GroundingViolation {
                        section: section.clone(),
                        index,
                        record_id,
                    });
                }
            }
        }
    }

    report
}

/// Under `Exclude`, drop every item carrying at least one violation.
/// Returns the number of items removed.
pub fn apply_citation_policy(
    sections: &mut BTreeMap<String, Vec<SectionItem>>,
    report: &GroundingReport,
    policy: CitationPolicy,
) -> usize {
    if policy == CitationPolicy::Report || report.is_clean() {
        return 0;
    }

    let flagged: HashSet<(&str, usize)> = report
        .violations
        .iter()
        .map(|v| (v.section.as_str(), v.index))
        .collect();

    let mut removed = 0;
    for (section, items) in sections.iter_mut() {
        let before = items.len();
        let mut index = 0;
        items.retain(|_| {
            let keep = !flagged.contains(&(section.as_str(), index));
            index += 1;
            keep
        });
        removed += before - items.len();
    }

    if removed > 0 {
        tracing::warn!(removed, "Excluded augmenter items citing unknown records");
    }
    removed
}
