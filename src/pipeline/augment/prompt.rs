use crate::analysis::value_to_text;
use crate::pipeline::assembly::SortedChronology;
use crate::pipeline::registry::PipelineConfig;

/// Render the assembled chronology followed by the pipeline's analysis
/// instructions. The augmenter only ever sees deduplicated, sorted events.
pub fn build_analysis_prompt(config: &PipelineConfig, sorted: &SortedChronology) -> String {
    let mut prompt = format!("Records ({}), in chronological order:\n\n", sorted.len());

    for event in sorted.events() {
        let record_id = if event.record_id.trim().is_empty() {
            "(no id)"
        } else {
            event.record_id.as_str()
        };
        prompt.push_str(&format!("{} - {}:\n", event.date, record_id));
        prompt.push_str(&format!(
            "Provider: {}\n",
            event.provider.as_deref().unwrap_or("Unknown")
        ));
        prompt.push_str(&format!(
            "Event ({}): {}\n",
            event.event_type, event.event_description
        ));
        if let Some(diagnosis) = &event.diagnosis {
            prompt.push_str(&format!("Diagnosis: {diagnosis}\n"));
        }
        if let Some(confidence) = &event.confidence {
            prompt.push_str(&format!("Confidence: {confidence}\n"));
        }
        for (key, value) in &event.extra {
            let text = value_to_text(value);
            if !text.trim().is_empty() {
                prompt.push_str(&format!("{key}: {text}\n"));
            }
        }
        prompt.push_str("---\n");
    }

    let known = sorted.record_ids();
    if !known.is_empty() {
        prompt.push_str(&format!("\nKnown record IDs: {}\n", known.join(", ")));
    }

    prompt.push('\n');
    prompt.push_str(&config.analysis_prompt);
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::assembly::sort_chronologically;
    use crate::pipeline::extraction::ExtractedEvent;
    use crate::pipeline::registry::PipelineRegistry;

    #[test]
    fn prompt_lists_records_in_sorted_order() {
        let registry = PipelineRegistry::builtin();
        let config = registry.get("medical_chronology").unwrap();
        let mut late = ExtractedEvent::new("R3", "2023-03-15", "visit", "Follow-up")
            .with_provider("Dr. Patel");
        late.diagnosis = Some("PTSD".into());
        let sorted = sort_chronologically(vec![
            late,
            ExtractedEvent::new("R1", "2023-01-18", "evaluation", "Intake"),
        ]);

        let prompt = build_analysis_prompt(config, &sorted);
        let first = prompt.find("2023-01-18 - R1").unwrap();
        let second = prompt.find("2023-03-15 - R3").unwrap();
        assert!(first < second);
        assert!(prompt.contains("Provider: Unknown"));
        assert!(prompt.contains("Diagnosis: PTSD"));
        assert!(prompt.contains("Known record IDs: R1, R3"));
        assert!(prompt.ends_with(&config.analysis_prompt));
    }

    #[test]
    fn brackets_are_reserved_for_record_ids() {
        let registry = PipelineRegistry::builtin();
        let config = registry.get("medical_chronology").unwrap();
        let sorted = sort_chronologically(vec![ExtractedEvent::new(
            "R1",
            "2023-01-18",
            "visit",
            "Intake",
        )]);

        let prompt = build_analysis_prompt(config, &sorted);
        assert!(prompt.contains("Event (visit): Intake"));
        assert!(!prompt.contains("[visit]"));
    }
}
