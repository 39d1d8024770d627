//! Case report export.
//!
//! `build_report` turns an analysis (usually the reviewer's edited copy) into
//! a layout-free `ReportDocument`, marking each item against the original
//! analysis and attaching reviewer notes. `render_pdf` lays that document out
//! on A4 pages via `printpdf`.

use std::io::BufWriter;
use std::path::Path;

use chrono::NaiveDate;
use printpdf::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::analysis::{AnalysisOutput, SectionItem, CHRONOLOGY, CONTRADICTIONS, MISSING_RECORDS, RED_FLAGS};
use crate::case::{Case, Comments};

#[derive(Error, Debug)]
pub enum ReportError {
    #[error("PDF font error: {0}")]
    Font(String),

    #[error("PDF save error: {0}")]
    Save(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub const REPORT_TITLE: &str = "Record Analysis Report";
const FOOTER: &str = "Generated by ChronoScope. Every finding cites the source record it is based on.";

/// Case metadata printed in the report header.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportInfo {
    pub customer_name: String,
    /// Human-readable pipeline name, e.g. "Medical Chronology".
    pub domain_name: String,
    pub records_analyzed: usize,
    pub generated_on: NaiveDate,
}

impl ReportInfo {
    pub fn for_case(case: &Case, domain_name: &str, generated_on: NaiveDate) -> Self {
        Self {
            customer_name: case.customer_name.clone(),
            domain_name: domain_name.to_string(),
            records_analyzed: case.records_count,
            generated_on,
        }
    }
}

/// How an item differs from the original analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeMarker {
    Unchanged,
    Edited,
    Added,
    Removed,
}

impl ChangeMarker {
    pub fn label(&self) -> Option<&'static str> {
        match self {
            Self::Unchanged => None,
            Self::Edited => Some("[EDITED]"),
            Self::Added => Some("[ADDED]"),
            Self::Removed => Some("[REMOVED]"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportItem {
    /// 1-based position in its section (original position for removed items).
    pub number: usize,
    pub text: String,
    pub marker: ChangeMarker,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportSection {
    pub key: String,
    pub title: String,
    /// Rendered with a warning bullet.
    pub alert: bool,
    pub items: Vec<ReportItem>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportDocument {
    pub title: String,
    pub subtitle: String,
    pub metadata: Vec<(String, String)>,
    pub sections: Vec<ReportSection>,
    pub footer: String,
}

impl ReportDocument {
    pub fn section(&self, key: &str) -> Option<&ReportSection> {
        self.sections.iter().find(|s| s.key == key)
    }
}

// ═══════════════════════════════════════════
// Building
// ═══════════════════════════════════════════

/// Display title for a section key. Unknown keys are upper-cased.
pub fn section_title(key: &str) -> String {
    let known = match key {
        CHRONOLOGY => "MEDICAL CHRONOLOGY",
        MISSING_RECORDS => "MISSING RECORDS / GAPS IN CARE",
        RED_FLAGS => "RED FLAGS",
        CONTRADICTIONS => "CONTRADICTIONS",
        "expert_opinions_needed" => "EXPERT OPINIONS NEEDED",
        "medication_adherence" => "MEDICATION ADHERENCE",
        "standard_of_care_deviations" => "STANDARD OF CARE DEVIATIONS",
        "competency_timeline" => "COMPETENCY TIMELINE",
        _ => return key.replace('_', " ").to_uppercase(),
    };
    known.to_string()
}

fn is_alert_section(key: &str) -> bool {
    matches!(
        key,
        MISSING_RECORDS | RED_FLAGS | CONTRADICTIONS | "standard_of_care_deviations"
    )
}

fn mark_items(
    current: &[SectionItem],
    original: Option<&[SectionItem]>,
    notes: Option<&std::collections::BTreeMap<usize, String>>,
) -> Vec<ReportItem> {
    let mut items: Vec<ReportItem> = current
        .iter()
        .enumerate()
        .map(|(index, item)| {
            let marker = match original {
                None => ChangeMarker::Unchanged,
                Some(original) => match original.get(index) {
                    Some(before) if before == item => ChangeMarker::Unchanged,
                    Some(_) => ChangeMarker::Edited,
                    None => ChangeMarker::Added,
                },
            };
            ReportItem {
                number: index + 1,
                text: item.display_text(),
                marker,
                note: notes
                    .and_then(|n| n.get(&index))
                    .filter(|note| !note.trim().is_empty())
                    .cloned(),
            }
        })
        .collect();

    if let Some(original) = original {
        for (index, removed) in original.iter().enumerate().skip(current.len()) {
            items.push(ReportItem {
                number: index + 1,
                text: removed.display_text(),
                marker: ChangeMarker::Removed,
                note: None,
            });
        }
    }
    items
}

/// Lay out an analysis as report sections. With `original`, items are
/// compared by position: differing items are edited, extra items added,
/// and missing trailing items listed as removed. Empty sections are left out.
pub fn build_report(
    analysis: &AnalysisOutput,
    info: &ReportInfo,
    original: Option<&AnalysisOutput>,
    comments: &Comments,
) -> ReportDocument {
    let mut keys = analysis.section_names();
    if let Some(original) = original {
        for key in original.section_names() {
            if !keys.contains(&key) {
                keys.push(key);
            }
        }
    }

    let mut sections = Vec::new();
    for key in keys {
        let current = analysis.section(&key).unwrap_or_default();
        let before = original.map(|o| o.section(&key).unwrap_or_default());
        let items = mark_items(&current, before.as_deref(), comments.get(&key));
        if items.is_empty() {
            continue;
        }
        sections.push(ReportSection {
            title: section_title(&key),
            alert: is_alert_section(&key),
            key,
            items,
        });
    }

    if analysis.is_degraded() {
        sections.push(ReportSection {
            key: "diagnostics".into(),
            title: "PIPELINE DIAGNOSTICS".into(),
            alert: true,
            items: analysis
                .diagnostics
                .iter()
                .enumerate()
                .map(|(index, text)| ReportItem {
                    number: index + 1,
                    text: text.clone(),
                    marker: ChangeMarker::Unchanged,
                    note: None,
                })
                .collect(),
        });
    }

    ReportDocument {
        title: REPORT_TITLE.to_string(),
        subtitle: info.domain_name.clone(),
        metadata: vec![
            ("Case".into(), info.customer_name.clone()),
            ("Date".into(), info.generated_on.format("%B %d, %Y").to_string()),
            ("Documents Analyzed".into(), info.records_analyzed.to_string()),
        ],
        sections,
        footer: FOOTER.to_string(),
    }
}

// ═══════════════════════════════════════════
// PDF rendering
// ═══════════════════════════════════════════

const PAGE_WIDTH: f32 = 210.0;
const PAGE_HEIGHT: f32 = 297.0;
const TOP: f32 = 280.0;
const BOTTOM_MARGIN: f32 = 20.0;
const LEFT: f32 = 20.0;
const INDENT: f32 = 25.0;

/// Tracks the current layer and cursor, opening a new page when the
/// cursor would cross the bottom margin.
struct PageWriter<'a> {
    doc: &'a PdfDocumentReference,
    layer: PdfLayerReference,
    y: f32,
    pages: usize,
}

impl PageWriter<'_> {
    fn ensure_space(&mut self, needed: f32) {
        if self.y - needed >= BOTTOM_MARGIN {
            return;
        }
        let (page, layer) = self.doc.add_page(Mm(PAGE_WIDTH), Mm(PAGE_HEIGHT), "Layer 1");
        self.layer = self.doc.get_page(page).get_layer(layer);
        self.y = TOP;
        self.pages += 1;
    }

    fn line(&mut self, text: &str, size: f32, x: f32, advance: f32, font: &IndirectFontRef) {
        self.ensure_space(advance);
        self.layer.use_text(text, size, Mm(x), Mm(self.y), font);
        self.y -= advance;
    }

    fn wrapped(&mut self, text: &str, size: f32, x: f32, advance: f32, font: &IndirectFontRef) {
        for line in wrap_text(text, 95) {
            self.line(&line, size, x, advance, font);
        }
    }

    fn gap(&mut self, amount: f32) {
        self.y -= amount;
    }
}

pub fn render_pdf(report: &ReportDocument) -> Result<Vec<u8>, ReportError> {
    let (doc, page1, layer1) =
        PdfDocument::new(&report.title, Mm(PAGE_WIDTH), Mm(PAGE_HEIGHT), "Layer 1");
    let font = doc
        .add_builtin_font(BuiltinFont::Helvetica)
        .map_err(|e| ReportError::Font(e.to_string()))?;
    let bold = doc
        .add_builtin_font(BuiltinFont::HelveticaBold)
        .map_err(|e| ReportError::Font(e.to_string()))?;
    let italic = doc
        .add_builtin_font(BuiltinFont::HelveticaOblique)
        .map_err(|e| ReportError::Font(e.to_string()))?;

    let mut writer = PageWriter {
        doc: &doc,
        layer: doc.get_page(page1).get_layer(layer1),
        y: TOP,
        pages: 1,
    };

    // Header
    writer.line(&report.title, 16.0, LEFT, 8.0, &bold);
    writer.line(&report.subtitle, 11.0, LEFT, 8.0, &font);
    for (label, value) in &report.metadata {
        writer.line(&format!("{label}: {value}"), 10.0, LEFT, 5.0, &font);
    }
    writer.gap(6.0);

    for section in &report.sections {
        writer.ensure_space(16.0);
        writer.line(&section.title, 12.0, LEFT, 7.0, &bold);
        let bullet = if section.alert { "!" } else { "-" };
        for item in &section.items {
            let mut text = format!("{bullet} {}. {}", item.number, item.text);
            if let Some(label) = item.marker.label() {
                text = format!("{label} {text}");
            }
            let item_font = if item.marker == ChangeMarker::Removed {
                &italic
            } else {
                &font
            };
            writer.wrapped(&text, 9.0, INDENT, 4.5, item_font);
            if let Some(note) = &item.note {
                writer.wrapped(&format!("Reviewer note: {note}"), 8.0, INDENT + 5.0, 4.0, &italic);
            }
            writer.gap(1.5);
        }
        writer.gap(5.0);
    }

    writer.gap(6.0);
    writer.wrapped(&report.footer, 8.0, LEFT, 4.0, &italic);

    tracing::debug!(
        sections = report.sections.len(),
        pages = writer.pages,
        "Report rendered"
    );

    let mut buf = BufWriter::new(Vec::new());
    doc.save(&mut buf)
        .map_err(|e| ReportError::Save(e.to_string()))?;
    buf.into_inner()
        .map_err(|e| ReportError::Save(e.to_string()))
}

/// Render and write the report to `path`, creating parent directories.
pub fn export_pdf(report: &ReportDocument, path: &Path) -> Result<(), ReportError> {
    let bytes = render_pdf(report)?;
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    std::fs::write(path, bytes)?;
    tracing::info!(path = %path.display(), "Report exported");
    Ok(())
}

/// Simple word-wrap helper for PDF text rendering.
fn wrap_text(text: &str, max_chars: usize) -> Vec<String> {
    let mut lines = Vec::new();
    let mut current = String::new();

    for word in text.split_whitespace() {
        if current.len() + word.len() + 1 > max_chars && !current.is_empty() {
            lines.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(word);
    }
    if !current.is_empty() {
        lines.push(current);
    }
    if lines.is_empty() {
        lines.push(String::new());
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn info() -> ReportInfo {
        ReportInfo {
            customer_name: "Jane Roe".into(),
            domain_name: "Medical Chronology".into(),
            records_analyzed: 3,
            generated_on: NaiveDate::from_ymd_opt(2025, 1, 5).unwrap(),
        }
    }

    fn original() -> AnalysisOutput {
        AnalysisOutput {
            chronology: vec!["2023-01-18 | R1".into(), "2023-03-15 | R3".into()],
            red_flags: vec!["Flag A".into(), "Flag B".into()],
            contradictions: vec![SectionItem::from_value(json!({"description": "Dose", "records": ["R1"]}))],
            ..AnalysisOutput::default()
        }
    }

    #[test]
    fn header_metadata() {
        let report = build_report(&original(), &info(), None, &Comments::new());
        assert_eq!(report.subtitle, "Medical Chronology");
        assert_eq!(report.metadata[0], ("Case".to_string(), "Jane Roe".to_string()));
        assert_eq!(report.metadata[1].1, "January 05, 2025");
        assert_eq!(report.metadata[2].1, "3");
    }

    #[test]
    fn empty_sections_are_omitted() {
        let report = build_report(&original(), &info(), None, &Comments::new());
        let keys: Vec<&str> = report.sections.iter().map(|s| s.key.as_str()).collect();
        assert_eq!(keys, vec!["chronology", "red_flags", "contradictions"]);
        assert_eq!(report.sections[0].title, "MEDICAL CHRONOLOGY");
        assert!(report.sections[1].alert);
        assert_eq!(
            report.section("contradictions").unwrap().items[0].text,
            "description: Dose | records: R1"
        );
    }

    #[test]
    fn tracks_changes_against_original() {
        let mut edited = original();
        edited.chronology[1] = "2023-03-16 | R3".into();
        edited.chronology.push("2023-04-01 | R4".into());
        edited.red_flags.truncate(1);

        let report = build_report(&edited, &info(), Some(&original()), &Comments::new());

        let chronology = &report.section("chronology").unwrap().items;
        let markers: Vec<ChangeMarker> = chronology.iter().map(|i| i.marker).collect();
        assert_eq!(
            markers,
            vec![ChangeMarker::Unchanged, ChangeMarker::Edited, ChangeMarker::Added]
        );

        let flags = &report.section("red_flags").unwrap().items;
        assert_eq!(flags.len(), 2);
        assert_eq!(flags[1].marker, ChangeMarker::Removed);
        assert_eq!(flags[1].text, "Flag B");
        assert_eq!(flags[1].number, 2);
    }

    #[test]
    fn section_cleared_by_reviewer_still_shows_removals() {
        let mut edited = original();
        edited.contradictions.clear();
        let report = build_report(&edited, &info(), Some(&original()), &Comments::new());
        let items = &report.section("contradictions").unwrap().items;
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].marker, ChangeMarker::Removed);
    }

    #[test]
    fn reviewer_notes_attach_by_index() {
        let mut comments = Comments::new();
        comments
            .entry("red_flags".into())
            .or_default()
            .insert(1, "Confirm with facility".into());
        comments.entry("red_flags".into()).or_default().insert(0, "  ".into());

        let report = build_report(&original(), &info(), None, &comments);
        let flags = &report.section("red_flags").unwrap().items;
        assert_eq!(flags[0].note, None);
        assert_eq!(flags[1].note.as_deref(), Some("Confirm with facility"));
    }

    #[test]
    fn degraded_analysis_lists_diagnostics() {
        let report = build_report(
            &AnalysisOutput::degraded("timed out"),
            &info(),
            None,
            &Comments::new(),
        );
        assert_eq!(report.sections.len(), 1);
        assert_eq!(report.sections[0].title, "PIPELINE DIAGNOSTICS");
    }

    #[test]
    fn unknown_section_title_is_uppercased() {
        assert_eq!(section_title("medication_adherence"), "MEDICATION ADHERENCE");
        assert_eq!(section_title("causation_analysis"), "CAUSATION ANALYSIS");
    }

    #[test]
    fn pdf_renders() {
        let report = build_report(&original(), &info(), None, &Comments::new());
        let bytes = render_pdf(&report).unwrap();
        assert_eq!(&bytes[0..4], b"%PDF");
    }

    #[test]
    fn long_report_breaks_pages() {
        let analysis = AnalysisOutput {
            chronology: (0..200)
                .map(|i| format!("2023-01-01 | R{i} | [visit] A fairly long description of the visit that wraps onto a second line when rendered in the report body"))
                .collect(),
            ..AnalysisOutput::default()
        };
        let report = build_report(&analysis, &info(), None, &Comments::new());
        let bytes = render_pdf(&report).unwrap();
        assert_eq!(&bytes[0..4], b"%PDF");
    }

    #[test]
    fn export_writes_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("exports").join("case.pdf");
        let report = build_report(&original(), &info(), None, &Comments::new());
        export_pdf(&report, &path).unwrap();
        assert!(std::fs::read(&path).unwrap().starts_with(b"%PDF"));
    }

    #[test]
    fn test_wrap_text() {
        let text = "This is a long sentence that should be wrapped at around forty characters or so.";
        let lines = wrap_text(text, 40);
        assert!(lines.len() > 1);
        for line in &lines {
            assert!(line.len() <= 40);
        }
    }

    #[test]
    fn test_wrap_text_empty() {
        assert_eq!(wrap_text("", 40), vec![String::new()]);
    }
}
