//! Optional LLM analysis over the assembled chronology.
//!
//! Failures here are stage-local: a failed call or an unparsable answer
//! leaves every augmenter section empty and the deterministic output intact.

pub mod grounding;
pub mod parser;
pub mod prompt;
pub mod shaping;

pub use grounding::*;
pub use parser::*;
pub use prompt::*;
pub use shaping::*;

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::analysis::SectionItem;
use crate::pipeline::assembly::SortedChronology;
use crate::pipeline::cost::{CostLedger, Phase};
use crate::pipeline::llm::{LlmClient, LlmError};
use crate::pipeline::registry::PipelineConfig;

#[derive(Error, Debug)]
pub enum AugmentError {
    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("JSON parsing error: {0}")]
    JsonParsing(String),
}

/// What happens to augmenter items that cite unknown record ids.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CitationPolicy {
    /// Log and keep; violations are still returned in the run report.
    #[default]
    Report,
    /// Drop every item with at least one unknown citation.
    Exclude,
}

impl CitationPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Report => "report",
            Self::Exclude => "exclude",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "report" => Some(Self::Report),
            "exclude" => Some(Self::Exclude),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum AugmentationStatus {
    /// The pipeline does not use augmentation.
    Skipped,
    Completed,
    Failed { reason: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct AugmentOutcome {
    /// Shaped items per declared section. Empty when the stage failed.
    pub sections: BTreeMap<String, Vec<SectionItem>>,
    pub grounding: GroundingReport,
    pub excluded: usize,
    pub status: AugmentationStatus,
}

impl AugmentOutcome {
    pub fn failed(reason: String) -> Self {
        Self {
            sections: BTreeMap::new(),
            grounding: GroundingReport::default(),
            excluded: 0,
            status: AugmentationStatus::Failed { reason },
        }
    }
}

#[derive(Clone)]
pub struct Augmenter {
    client: Arc<dyn LlmClient>,
    policy: CitationPolicy,
}

impl Augmenter {
    pub fn new(client: Arc<dyn LlmClient>, policy: CitationPolicy) -> Self {
        Self { client, policy }
    }

    pub fn policy(&self) -> CitationPolicy {
        self.policy
    }

    /// Run one analysis call over the sorted chronology. Blocking.
    pub fn augment(
        &self,
        config: &PipelineConfig,
        sorted: &SortedChronology,
        model: &str,
        ledger: &CostLedger,
    ) -> AugmentOutcome {
        match self.try_augment(config, sorted, model, ledger) {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::warn!(
                    pipeline = %config.id,
                    model,
                    error = %e,
                    "Augmentation failed, continuing with deterministic output"
                );
                AugmentOutcome::failed(e.to_string())
            }
        }
    }

    fn try_augment(
        &self,
        config: &PipelineConfig,
        sorted: &SortedChronology,
        model: &str,
        ledger: &CostLedger,
    ) -> Result<AugmentOutcome, AugmentError> {
        let prompt = build_analysis_prompt(config, sorted);
        let completion = self
            .client
            .generate(model, &prompt, &config.system_prompt())?;
        ledger.record_usage(
            model,
            Phase::Analysis,
            completion.usage,
            completion.reported_cost,
        );

        let mut raw = parse_augmenter_response(&completion.text)?;

        let mut sections: BTreeMap<String, Vec<SectionItem>> = BTreeMap::new();
        for (section, _) in config.analysis_schema.augmented_sections() {
            let items = raw
                .remove(&section)
                .unwrap_or_default()
                .into_iter()
                .map(SectionItem::from_value)
                .collect();
            sections.insert(section, items);
        }
        for ignored in raw.keys() {
            tracing::debug!(section = %ignored, "Ignoring undeclared analysis section");
        }

        let known: HashSet<String> = sorted.record_ids().into_iter().collect();
        let grounding = check_grounding(&known, &sections);
        let excluded = apply_citation_policy(&mut sections, &grounding, self.policy);

        let shaped = sections
            .into_iter()
            .map(|(section, items)| {
                let shaped = match config.analysis_schema.rendering_for(&section) {
                    Some(rendering) => shape_section(&section, items, rendering),
                    None => items,
                };
                (section, shaped)
            })
            .collect();

        tracing::info!(
            pipeline = %config.id,
            model,
            citations = grounding.citations_checked,
            violations = grounding.violations.len(),
            excluded,
            "Augmentation completed"
        );

        Ok(AugmentOutcome {
            sections: shaped,
            grounding,
            excluded,
            status: AugmentationStatus::Completed,
        })
    }
}
