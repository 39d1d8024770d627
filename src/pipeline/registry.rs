//! Pipeline definitions: prompts, models, validation and analysis schema.
//!
//! Field renderings are resolved once here, when a pipeline is built or
//! loaded, so the augmenter never re-inspects schema strings per item.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::PipelineError;
use crate::analysis::{CHRONOLOGY, CONTRADICTIONS, EXPERT_OPINIONS_NEEDED, MISSING_RECORDS, RED_FLAGS};

/// Analysis model used for the augmentation phase in hybrid mode.
pub const HYBRID_ANALYSIS_MODEL: &str = "claude-sonnet-4-5-20250929";

/// Pipelines exposed to customers. The rest stay registered for internal use.
pub const MVP_PIPELINES: &[&str] = &["medical_chronology", "psych_timeline"];

// ═══════════════════════════════════════════
// Schema types
// ═══════════════════════════════════════════

/// How the items of one augmenter-backed section are rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldRendering {
    /// `list[str]`: one formatted line per item.
    Text,
    /// `list[dict]`: structured objects passed through.
    Object,
}

impl FieldRendering {
    pub fn as_schema_str(&self) -> &'static str {
        match self {
            Self::Text => "list[str]",
            Self::Object => "list[dict]",
        }
    }

    pub fn from_schema_str(s: &str) -> Option<Self> {
        match s.trim().replace(' ', "").to_ascii_lowercase().as_str() {
            "list[str]" | "list[string]" | "str" | "string" => Some(Self::Text),
            "list[dict]" | "list[object]" | "dict" | "object" => Some(Self::Object),
            _ => None,
        }
    }
}

/// Per-section rendering for everything the augmenter can produce.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisSchema {
    pub red_flags: FieldRendering,
    pub contradictions: FieldRendering,
    pub expert_opinions_needed: FieldRendering,
    /// Pipeline-specific sections, e.g. `medication_adherence`.
    #[serde(default)]
    pub extra_sections: BTreeMap<String, FieldRendering>,
}

impl AnalysisSchema {
    pub fn uniform(rendering: FieldRendering) -> Self {
        Self {
            red_flags: rendering,
            contradictions: rendering,
            expert_opinions_needed: rendering,
            extra_sections: BTreeMap::new(),
        }
    }

    pub fn rendering_for(&self, section: &str) -> Option<FieldRendering> {
        match section {
            RED_FLAGS => Some(self.red_flags),
            CONTRADICTIONS => Some(self.contradictions),
            EXPERT_OPINIONS_NEEDED => Some(self.expert_opinions_needed),
            other => self.extra_sections.get(other).copied(),
        }
    }

    /// Every augmenter-backed section with its rendering, core sections first.
    pub fn augmented_sections(&self) -> Vec<(String, FieldRendering)> {
        let mut sections = vec![
            (RED_FLAGS.to_string(), self.red_flags),
            (CONTRADICTIONS.to_string(), self.contradictions),
            (EXPERT_OPINIONS_NEEDED.to_string(), self.expert_opinions_needed),
        ];
        sections.extend(
            self.extra_sections
                .iter()
                .map(|(name, rendering)| (name.clone(), *rendering)),
        );
        sections
    }

    /// Build from `section -> "list[str]" | "list[dict]"` declarations.
    /// Sections assembled deterministically are ignored; undeclared core
    /// sections default to text.
    pub fn from_declarations(
        declarations: &BTreeMap<String, String>,
    ) -> Result<Self, PipelineError> {
        let mut schema = Self::uniform(FieldRendering::Text);
        for (section, declared) in declarations {
            if is_deterministic_section(section) {
                continue;
            }
            let rendering = FieldRendering::from_schema_str(declared).ok_or_else(|| {
                PipelineError::RegistryFormat(format!(
                    "section '{section}' has unsupported type '{declared}'"
                ))
            })?;
            match section.as_str() {
                RED_FLAGS => schema.red_flags = rendering,
                CONTRADICTIONS => schema.contradictions = rendering,
                EXPERT_OPINIONS_NEEDED => schema.expert_opinions_needed = rendering,
                other => {
                    schema.extra_sections.insert(other.to_string(), rendering);
                }
            }
        }
        Ok(schema)
    }
}

/// Sections built by the assembly engine, never by the augmenter.
/// `timeline` and `treatment_gaps` are the older names some pipeline
/// files still declare.
fn is_deterministic_section(section: &str) -> bool {
    matches!(
        section,
        CHRONOLOGY | MISSING_RECORDS | "timeline" | "treatment_gaps"
    )
}

/// Predicate an extraction output must satisfy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "rule", content = "field", rename_all = "snake_case")]
pub enum ValidationRule {
    NonEmpty(String),
}

impl ValidationRule {
    /// Parse a declaration of the form `output["field"] != ""`.
    pub fn parse(expr: &str) -> Option<Self> {
        static NON_EMPTY: OnceLock<Option<Regex>> = OnceLock::new();
        let re = NON_EMPTY
            .get_or_init(|| Regex::new(r#"^output\[\s*["'](\w+)["']\s*\]\s*!=\s*(""|'')$"#).ok())
            .as_ref()?;
        let caps = re.captures(expr.trim())?;
        Some(Self::NonEmpty(caps[1].to_string()))
    }

    pub fn describe(&self) -> String {
        match self {
            Self::NonEmpty(field) => format!("output[\"{field}\"] != \"\""),
        }
    }
}

// ═══════════════════════════════════════════
// Pipeline config
// ═══════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub id: String,
    pub name: String,
    pub dataset_description: String,
    pub persona: String,
    pub extraction_model: String,
    pub analysis_model: String,
    pub requires_augmentation: bool,
    pub num_retries_on_validate_failure: u32,
    pub extraction_validation: Vec<ValidationRule>,
    /// Template with a `{{ input }}` placeholder for the raw record JSON.
    pub extraction_prompt: String,
    /// Instructions appended after the rendered chronology.
    pub analysis_prompt: String,
    pub analysis_schema: AnalysisSchema,
}

impl PipelineConfig {
    /// System prompt shared by both phases.
    pub fn system_prompt(&self) -> String {
        format!(
            "You are {}. You are working with {}. Respond with JSON only.",
            self.persona, self.dataset_description
        )
    }

    pub fn analysis_model_for(&self, hybrid_mode: bool) -> &str {
        if hybrid_mode {
            HYBRID_ANALYSIS_MODEL
        } else {
            &self.analysis_model
        }
    }
}

/// Entry returned by `list_pipelines`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineSummary {
    pub id: String,
    pub name: String,
}

/// On-disk pipeline definition (the historical JSON layout).
#[derive(Debug, Deserialize)]
struct PipelineFile {
    name: String,
    dataset_description: String,
    persona: String,
    extraction_model: String,
    analysis_model: String,
    #[serde(default)]
    requires_llm_analysis: bool,
    #[serde(default)]
    num_retries_on_validate_failure: u32,
    #[serde(default)]
    extraction_validation: Vec<String>,
    extraction_prompt: String,
    #[serde(default)]
    analysis_prompt: String,
    #[serde(default)]
    analysis_schema: BTreeMap<String, String>,
}

impl PipelineFile {
    fn into_config(self, id: &str) -> Result<PipelineConfig, PipelineError> {
        let extraction_validation = self
            .extraction_validation
            .iter()
            .map(|expr| {
                ValidationRule::parse(expr).ok_or_else(|| {
                    PipelineError::RegistryFormat(format!(
                        "pipeline '{id}': unsupported validation '{expr}'"
                    ))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        if !self.extraction_prompt.contains("{{ input }}") {
            return Err(PipelineError::RegistryFormat(format!(
                "pipeline '{id}': extraction_prompt has no {{{{ input }}}} placeholder"
            )));
        }

        Ok(PipelineConfig {
            id: id.to_string(),
            name: self.name,
            dataset_description: self.dataset_description,
            persona: self.persona,
            extraction_model: self.extraction_model,
            analysis_model: self.analysis_model,
            requires_augmentation: self.requires_llm_analysis,
            num_retries_on_validate_failure: self.num_retries_on_validate_failure,
            extraction_validation,
            extraction_prompt: self.extraction_prompt,
            analysis_prompt: self.analysis_prompt,
            analysis_schema: AnalysisSchema::from_declarations(&self.analysis_schema)?,
        })
    }
}

// ═══════════════════════════════════════════
// Registry
// ═══════════════════════════════════════════

#[derive(Debug, Clone)]
pub struct PipelineRegistry {
    pipelines: BTreeMap<String, PipelineConfig>,
}

impl Default for PipelineRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl PipelineRegistry {
    pub fn builtin() -> Self {
        let mut pipelines = BTreeMap::new();
        for config in [psych_timeline(), psych_expert_witness(), medical_chronology()] {
            pipelines.insert(config.id.clone(), config);
        }
        Self { pipelines }
    }

    pub fn get(&self, id: &str) -> Result<&PipelineConfig, PipelineError> {
        self.pipelines
            .get(id)
            .ok_or_else(|| PipelineError::UnknownPipeline {
                id: id.to_string(),
                available: self.ids().join(", "),
            })
    }

    pub fn ids(&self) -> Vec<String> {
        self.pipelines.keys().cloned().collect()
    }

    /// Customer-facing pipelines only.
    pub fn list_pipelines(&self) -> Vec<PipelineSummary> {
        self.pipelines
            .values()
            .filter(|config| MVP_PIPELINES.contains(&config.id.as_str()))
            .map(|config| PipelineSummary {
                id: config.id.clone(),
                name: config.name.clone(),
            })
            .collect()
    }

    pub fn insert(&mut self, config: PipelineConfig) {
        self.pipelines.insert(config.id.clone(), config);
    }

    /// Built-ins extended (or overridden by id) with the pipelines in a JSON
    /// object keyed by pipeline id.
    pub fn from_json_str(json: &str) -> Result<Self, PipelineError> {
        let files: BTreeMap<String, PipelineFile> = serde_json::from_str(json)
            .map_err(|e| PipelineError::RegistryFormat(e.to_string()))?;

        let mut registry = Self::builtin();
        for (id, file) in files {
            let config = file.into_config(&id)?;
            tracing::info!(pipeline = %id, "Loaded pipeline definition");
            registry.insert(config);
        }
        Ok(registry)
    }

    pub fn load_json(path: &Path) -> Result<Self, PipelineError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }
}

// ═══════════════════════════════════════════
// Built-in pipelines
// ═══════════════════════════════════════════

fn required_fields() -> Vec<ValidationRule> {
    vec![
        ValidationRule::NonEmpty("date".into()),
        ValidationRule::NonEmpty("record_id".into()),
    ]
}

fn psych_timeline() -> PipelineConfig {
    PipelineConfig {
        id: "psych_timeline".into(),
        name: "Basic Timeline".into(),
        dataset_description: "medical and psychiatric records".into(),
        persona: "a forensic psychiatrist reviewing records for timeline construction".into(),
        extraction_model: "gpt-4o-mini".into(),
        analysis_model: "gpt-4o-mini".into(),
        requires_augmentation: false,
        num_retries_on_validate_failure: 2,
        extraction_validation: required_fields(),
        extraction_prompt: "Extract from this record:

Record: {{ input }}

Return JSON with:
- date: Record date (YYYY-MM-DD)
- record_id: Record ID if mentioned (or use date as fallback)
- event_type: (evaluation, treatment, incident, hospitalization, medication_change, other)
- event_description: One to two sentence description of what happened
- provider: Provider name if mentioned
"
        .into(),
        analysis_prompt: String::new(),
        analysis_schema: AnalysisSchema::uniform(FieldRendering::Text),
    }
}

fn psych_expert_witness() -> PipelineConfig {
    let mut schema = AnalysisSchema::uniform(FieldRendering::Text);
    for section in [
        "medication_adherence",
        "standard_of_care_deviations",
        "competency_timeline",
    ] {
        schema
            .extra_sections
            .insert(section.to_string(), FieldRendering::Text);
    }

    PipelineConfig {
        id: "psych_expert_witness".into(),
        name: "Expert Witness Package".into(),
        dataset_description: "medical and psychiatric records for legal proceedings".into(),
        persona: "a forensic psychiatrist preparing expert witness testimony".into(),
        extraction_model: "gpt-4o-mini".into(),
        analysis_model: "gpt-4o-mini".into(),
        requires_augmentation: true,
        num_retries_on_validate_failure: 2,
        extraction_validation: required_fields(),
        extraction_prompt: "Extract from this record:

Record: {{ input }}

Return JSON with:
- date: Record date (YYYY-MM-DD)
- record_id: Record ID
- event_type: (evaluation, treatment, incident, hospitalization, medication_change, other)
- event_description: One to two sentence description of what happened
- provider: Provider name
- diagnoses: Psychiatric diagnoses
- medications: Medications and doses
- competency_assessments: Any competency evaluations
- treatment_recommendations: Recommendations made
- patient_statements: Relevant patient statements or behaviors
- standard_of_care_issues: Potential deviations from standard care
"
        .into(),
        analysis_prompt: "Prepare expert witness analysis of the records above.

Cite record IDs in square brackets, e.g. [MRN-2024-001]. Only cite IDs that appear above.

Return JSON with:
- red_flags: Documentation or care issues with record ID citations
- medication_adherence: Medication compliance with citations
- contradictions: Conflicting information across records with citations
- standard_of_care_deviations: Care that deviates from accepted standards with citations
- competency_timeline: Changes in patient competency over time
- expert_opinions_needed: Areas requiring expert psychiatric interpretation
"
        .into(),
        analysis_schema: schema,
    }
}

fn medical_chronology() -> PipelineConfig {
    PipelineConfig {
        id: "medical_chronology".into(),
        name: "Medical Chronology".into(),
        dataset_description: "medical records from various healthcare providers".into(),
        persona: "a medical chronologist extracting structured data from records".into(),
        extraction_model: "gpt-4o-mini".into(),
        analysis_model: "gpt-4o-mini".into(),
        requires_augmentation: true,
        num_retries_on_validate_failure: 2,
        extraction_validation: required_fields(),
        extraction_prompt: "Extract from this medical record:

Record: {{ input }}

Return JSON with:
- date: Record date (YYYY-MM-DD format)
- record_id: Record ID or identifier if mentioned (or use date as fallback)
- provider: Physician or facility name
- event_type: (visit, procedure, test, medication, hospitalization, discharge)
- event_description: One to two sentence summary of the event
- diagnosis: Diagnosis mentioned (if any)
- confidence: Confidence level (high, medium, or low)
"
        .into(),
        analysis_prompt: "Perform forensic medical analysis on the records above.

Return JSON with:
- contradictions: List of contradiction objects, each with:
  * description (string): Clear description of the contradiction found across records
  * records (list of strings): Record IDs involved (e.g., [\"MRN-2024-001\", \"MRN-2024-002\"])
  * category (string): diagnosis|treatment|timeline|documentation|medication|other
  * severity (string): critical|moderate|minor
  * legal_relevance (string): high|medium|low

- red_flags: List of red flag objects, each with:
  * category (string): Documentation Gaps|Standard of Care|Inconsistent Treatment|Missing Records|other
  * issue (string): Specific description of the issue or gap identified
  * records (list of strings): Record IDs involved
  * legal_relevance (string): high|medium|low

- expert_opinions_needed: List of expert opinion objects, each with:
  * topic (string): Brief topic heading describing area requiring expert review
  * reason (string): Why expert medical opinion is needed for this topic
  * records (list of strings): Relevant record IDs

Only cite record IDs that appear above. Focus on medical-legal issues relevant to litigation, malpractice review, or expert witness testimony.
"
        .into(),
        analysis_schema: AnalysisSchema::uniform(FieldRendering::Object),
    }
}
