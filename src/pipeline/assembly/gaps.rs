use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use super::chronology::SortedChronology;

pub const DEFAULT_GAP_THRESHOLD_DAYS: i64 = 30;

/// Interval between two adjacent dated records longer than the threshold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Gap {
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub days: i64,
    pub from_record: String,
    pub to_record: String,
}

impl Gap {
    pub fn describe(&self) -> String {
        format!(
            "Gap of {} days without documented care between {} ({}) and {} ({})",
            self.days,
            self.start.format("%Y-%m-%d"),
            display_id(&self.from_record),
            self.end.format("%Y-%m-%d"),
            display_id(&self.to_record),
        )
    }
}

fn display_id(id: &str) -> &str {
    if id.trim().is_empty() {
        "(no id)"
    } else {
        id
    }
}

/// Gaps between consecutive records whose dates both parsed. A delta equal
/// to the threshold is not a gap.
pub fn detect_gaps(sorted: &SortedChronology, threshold_days: i64) -> Vec<Gap> {
    let mut gaps = Vec::new();

    for pair in sorted.entries.windows(2) {
        let (prev, next) = (&pair[0], &pair[1]);
        let (Some(start), Some(end)) = (prev.date, next.date) else {
            tracing::debug!(
                from_record = %prev.event.record_id,
                to_record = %next.event.record_id,
                "Skipping gap check next to an undated record"
            );
            continue;
        };

        let days = (end - start).num_days();
        if days > threshold_days {
            gaps.push(Gap {
                start,
                end,
                days,
                from_record: prev.event.record_id.clone(),
                to_record: next.event.record_id.clone(),
            });
        }
    }

    gaps
}
