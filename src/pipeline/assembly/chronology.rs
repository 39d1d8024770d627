use chrono::NaiveDate;

use crate::pipeline::extraction::ExtractedEvent;

pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// An event with its parsed date. `date` is `None` when the raw date failed
/// strict parsing; such events sort as the minimum date.
#[derive(Debug, Clone, PartialEq)]
pub struct DatedEvent {
    pub event: ExtractedEvent,
    pub date: Option<NaiveDate>,
}

impl DatedEvent {
    pub fn sort_key(&self) -> NaiveDate {
        self.date.unwrap_or(NaiveDate::MIN)
    }

    pub fn has_valid_date(&self) -> bool {
        self.date.is_some()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SortedChronology {
    pub entries: Vec<DatedEvent>,
    /// Raw date strings that failed to parse, one per offending record.
    pub invalid_dates: Vec<String>,
}

impl SortedChronology {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn events(&self) -> impl Iterator<Item = &ExtractedEvent> {
        self.entries.iter().map(|entry| &entry.event)
    }

    /// Non-empty record ids present in the chronology.
    pub fn record_ids(&self) -> Vec<String> {
        self.events()
            .filter_map(|event| event.dedup_key())
            .map(str::to_string)
            .collect()
    }
}

/// Strict `YYYY-MM-DD`. Chrono alone would accept unpadded fields, so the
/// shape is checked first.
pub fn parse_record_date(raw: &str) -> Option<NaiveDate> {
    let bytes = raw.as_bytes();
    let shape_ok = bytes.len() == 10
        && bytes[4] == b'-'
        && bytes[7] == b'-'
        && bytes
            .iter()
            .enumerate()
            .all(|(i, b)| i == 4 || i == 7 || b.is_ascii_digit());
    if !shape_ok {
        return None;
    }
    NaiveDate::parse_from_str(raw, DATE_FORMAT).ok()
}

/// Stable sort by parsed date; unparsable dates go first.
pub fn sort_chronologically(unique: Vec<ExtractedEvent>) -> SortedChronology {
    let mut invalid_dates = Vec::new();
    let mut entries: Vec<DatedEvent> = unique
        .into_iter()
        .map(|event| {
            let date = parse_record_date(&event.date);
            if date.is_none() {
                tracing::warn!(
                    record_id = %event.record_id,
                    raw_date = %event.date,
                    "Unparsable record date"
                );
                invalid_dates.push(event.date.clone());
            }
            DatedEvent { event, date }
        })
        .collect();

    entries.sort_by_key(DatedEvent::sort_key);

    SortedChronology {
        entries,
        invalid_dates,
    }
}
