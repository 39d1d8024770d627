use crate::pipeline::registry::PipelineConfig;

const INPUT_PLACEHOLDERS: &[&str] = &["{{ input }}", "{{input}}"];

/// Substitute the raw record (compact JSON) into an extraction template.
pub fn render_extraction_prompt(template: &str, record: &serde_json::Value) -> String {
    let record_json = record.to_string();
    INPUT_PLACEHOLDERS
        .iter()
        .fold(template.to_string(), |prompt, placeholder| {
            prompt.replace(placeholder, &record_json)
        })
}

/// Everything a worker needs to extract one record, independent of the
/// pipeline registry's lifetime.
#[derive(Debug, Clone)]
pub struct ExtractionPrompt {
    pub model: String,
    pub system: String,
    pub template: String,
}

impl ExtractionPrompt {
    pub fn for_pipeline(config: &PipelineConfig) -> Self {
        Self {
            model: config.extraction_model.clone(),
            system: config.system_prompt(),
            template: config.extraction_prompt.clone(),
        }
    }

    pub fn render(&self, record: &serde_json::Value) -> String {
        render_extraction_prompt(&self.template, record)
    }
}
