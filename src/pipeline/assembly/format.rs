use super::chronology::SortedChronology;
use crate::pipeline::extraction::ExtractedEvent;

/// One chronology line. Purely textual; nothing is validated here.
pub fn format_entry(event: &ExtractedEvent) -> String {
    let record_id = if event.record_id.trim().is_empty() {
        "(no id)"
    } else {
        event.record_id.as_str()
    };
    let provider = event.provider.as_deref().unwrap_or("Unknown");

    let mut line = format!(
        "{} | {} | [{}] {} | Provider: {}",
        event.date, record_id, event.event_type, event.event_description, provider
    );
    if let Some(confidence) = &event.confidence {
        line.push_str(" | Confidence: ");
        line.push_str(confidence);
    }
    line
}

pub fn format_chronology(sorted: &SortedChronology) -> Vec<String> {
    sorted.events().map(format_entry).collect()
}
