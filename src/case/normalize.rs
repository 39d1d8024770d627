use crate::analysis::{AnalysisOutput, SectionItem, CONTRADICTIONS, EXPERT_OPINIONS_NEEDED, RED_FLAGS};
use crate::pipeline::augment::format_section_object;

use super::Case;

fn normalize_items(section: &str, items: &mut [SectionItem]) -> usize {
    let mut converted = 0;
    for item in items.iter_mut() {
        if let SectionItem::Object(map) = item {
            *item = SectionItem::Text(format_section_object(section, map));
            converted += 1;
        }
    }
    converted
}

/// Convert structured red flags, contradictions and expert opinions to their
/// single-line text form. Returns true if anything changed.
pub fn normalize_sections(analysis: &mut AnalysisOutput) -> bool {
    let converted = normalize_items(RED_FLAGS, &mut analysis.red_flags)
        + normalize_items(CONTRADICTIONS, &mut analysis.contradictions)
        + normalize_items(EXPERT_OPINIONS_NEEDED, &mut analysis.expert_opinions_needed);
    converted > 0
}

/// Normalize both the stored analysis and the reviewer copy.
pub fn normalize_case(case: &mut Case) -> bool {
    let mut changed = false;
    if let Some(analysis) = case.analysis.as_mut() {
        changed |= normalize_sections(analysis);
    }
    if let Some(edits) = case.edits.as_mut() {
        changed |= normalize_sections(edits);
    }
    if changed {
        tracing::info!(case_id = %case.id, "Normalized structured sections to text");
    }
    changed
}
