use std::collections::HashSet;

use crate::pipeline::extraction::ExtractedEvent;

#[derive(Debug, Clone, PartialEq)]
pub struct Deduplicated {
    pub unique: Vec<ExtractedEvent>,
    pub duplicates_removed: usize,
}

/// First occurrence of each non-empty record id wins. Records without an id
/// are never treated as duplicates.
pub fn deduplicate(events: Vec<ExtractedEvent>) -> Deduplicated {
    let mut seen: HashSet<String> = HashSet::new();
    let mut unique = Vec::with_capacity(events.len());
    let mut duplicates_removed = 0;

    for event in events {
        match event.dedup_key() {
            Some(key) if seen.contains(key) => {
                tracing::debug!(record_id = %key, "Dropping duplicate record");
                duplicates_removed += 1;
            }
            Some(key) => {
                seen.insert(key.to_string());
                unique.push(event);
            }
            None => unique.push(event),
        }
    }

    if duplicates_removed > 0 {
        tracing::warn!(
            duplicates_removed,
            kept = unique.len(),
            "Duplicate record ids removed"
        );
    }

    Deduplicated {
        unique,
        duplicates_removed,
    }
}
