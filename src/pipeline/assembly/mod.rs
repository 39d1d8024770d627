//! Deterministic case assembly: dedup → sort → gap scan → format → flag.
//!
//! Single-threaded and free of I/O. Every step consumes the previous step's
//! output and produces a new structure; extracted events are never edited.

pub mod chronology;
pub mod dedup;
pub mod flags;
pub mod format;
pub mod gaps;

pub use chronology::*;
pub use dedup::*;
pub use flags::*;
pub use format::*;
pub use gaps::*;

use serde::{Deserialize, Serialize};

use crate::analysis::SectionItem;
use crate::pipeline::extraction::ExtractedEvent;
use crate::pipeline::registry::FieldRendering;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum IntegrityStatus {
    Complete,
    /// Fewer events than submitted records (extraction skipped some).
    Missing { submitted: usize, extracted: usize },
    /// More events than submitted records.
    Surplus { submitted: usize, extracted: usize },
}

impl IntegrityStatus {
    pub fn is_complete(&self) -> bool {
        matches!(self, Self::Complete)
    }
}

/// Compare extracted vs submitted counts. Mismatches are logged, never raised.
pub fn check_integrity(extracted: usize, submitted: usize) -> IntegrityStatus {
    let status = if extracted == submitted {
        IntegrityStatus::Complete
    } else if extracted < submitted {
        IntegrityStatus::Missing {
            submitted,
            extracted,
        }
    } else {
        IntegrityStatus::Surplus {
            submitted,
            extracted,
        }
    };

    if !status.is_complete() {
        tracing::warn!(
            submitted,
            extracted,
            "Extracted record count does not match submission"
        );
    }
    status
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AssemblyOptions {
    pub gap_threshold_days: i64,
    /// Shape of the synthesized invalid-date red flags.
    pub red_flag_rendering: FieldRendering,
}

impl Default for AssemblyOptions {
    fn default() -> Self {
        Self {
            gap_threshold_days: DEFAULT_GAP_THRESHOLD_DAYS,
            red_flag_rendering: FieldRendering::Text,
        }
    }
}

/// Everything the deterministic stage produces for one run.
#[derive(Debug, Clone, PartialEq)]
pub struct AssembledCase {
    pub sorted: SortedChronology,
    pub chronology: Vec<String>,
    pub gaps: Vec<Gap>,
    pub missing_records: Vec<String>,
    pub invalid_date_flags: Vec<SectionItem>,
    pub duplicates_removed: usize,
    pub integrity: IntegrityStatus,
}

pub fn assemble(
    events: Vec<ExtractedEvent>,
    submitted: usize,
    options: &AssemblyOptions,
) -> AssembledCase {
    let integrity = check_integrity(events.len(), submitted);

    let Deduplicated {
        unique,
        duplicates_removed,
    } = deduplicate(events);
    let sorted = sort_chronologically(unique);
    let gaps = detect_gaps(&sorted, options.gap_threshold_days);
    let missing_records = gaps.iter().map(Gap::describe).collect();
    let chronology = format_chronology(&sorted);
    let invalid_date_flags = flag_invalid_dates(&sorted, options.red_flag_rendering);

    tracing::debug!(
        entries = chronology.len(),
        gaps = gaps.len(),
        invalid_dates = sorted.invalid_dates.len(),
        duplicates_removed,
        "Chronology assembled"
    );

    AssembledCase {
        sorted,
        chronology,
        gaps,
        missing_records,
        invalid_date_flags,
        duplicates_removed,
        integrity,
    }
}
