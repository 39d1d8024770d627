//! Run entry point: extraction → assembly → optional augmentation.
//!
//! `Engine::run_pipeline` never fails. Record and stage failures become data
//! in the run report; a run-level failure becomes a degraded analysis. Each
//! run owns a fresh cost ledger which is drained exactly once, on every path.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::assembly::{assemble, AssemblyOptions, Gap, IntegrityStatus};
use super::augment::{AugmentOutcome, AugmentationStatus, Augmenter, GroundingViolation};
use super::cost::{CostBreakdown, CostLedger};
use super::extraction::{ExtractionInvoker, RecordFailure};
use super::llm::{client_from_settings, LlmClient, LlmError};
use super::registry::PipelineRegistry;
use super::PipelineError;
use crate::analysis::AnalysisOutput;
use crate::case::{Case, CaseError, CaseStore, NewCase};
use crate::config::EngineSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    /// The run failed as a whole; `analysis` carries the diagnostic.
    Degraded,
}

/// What happened during a run, beyond the analysis itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub records_submitted: usize,
    pub records_extracted: usize,
    pub extraction_failures: Vec<RecordFailure>,
    pub duplicates_removed: usize,
    /// Raw date strings that failed strict parsing, one per occurrence.
    pub invalid_dates: Vec<String>,
    pub gaps: Vec<Gap>,
    pub integrity: IntegrityStatus,
    pub grounding_violations: Vec<GroundingViolation>,
    /// Augmenter items dropped by the citation policy.
    pub excluded_items: usize,
    /// Extraction calls still running when the phase timed out. Whatever
    /// they cost is not in this run's breakdown.
    #[serde(default)]
    pub abandoned_calls: usize,
    pub augmentation: AugmentationStatus,
}

impl RunReport {
    fn new(records_submitted: usize) -> Self {
        Self {
            records_submitted,
            records_extracted: 0,
            extraction_failures: Vec::new(),
            duplicates_removed: 0,
            invalid_dates: Vec::new(),
            gaps: Vec::new(),
            integrity: IntegrityStatus::Complete,
            grounding_violations: Vec::new(),
            excluded_items: 0,
            abandoned_calls: 0,
            augmentation: AugmentationStatus::Skipped,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRun {
    pub status: RunStatus,
    pub analysis: AnalysisOutput,
    pub cost: CostBreakdown,
    pub report: RunReport,
}

impl PipelineRun {
    pub fn is_degraded(&self) -> bool {
        self.status == RunStatus::Degraded
    }
}

pub struct Engine {
    registry: PipelineRegistry,
    settings: EngineSettings,
    client: Arc<dyn LlmClient>,
}

impl Engine {
    pub fn new(
        registry: PipelineRegistry,
        settings: EngineSettings,
        client: Arc<dyn LlmClient>,
    ) -> Self {
        Self {
            registry,
            settings,
            client,
        }
    }

    /// Engine over the built-in pipelines, talking to the configured backend.
    pub fn from_settings(settings: EngineSettings) -> Result<Self, LlmError> {
        let client = client_from_settings(&settings)?;
        Ok(Self::new(PipelineRegistry::builtin(), settings, client))
    }

    pub fn registry(&self) -> &PipelineRegistry {
        &self.registry
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub async fn run_pipeline(
        &self,
        records: &[serde_json::Value],
        pipeline_id: &str,
        hybrid_mode: bool,
    ) -> PipelineRun {
        let started = std::time::Instant::now();
        let ledger = Arc::new(CostLedger::new());
        let mut report = RunReport::new(records.len());

        let result = self
            .execute(records, pipeline_id, hybrid_mode, &ledger, &mut report)
            .await;

        let mut cost = ledger.drain();
        cost.records_processed = records.len();
        if let Ok(config) = self.registry.get(pipeline_id) {
            cost.extraction_model = config.extraction_model.clone();
            cost.analysis_model = config.analysis_model_for(hybrid_mode).to_string();
        }

        let (status, analysis) = match result {
            Ok(analysis) => (RunStatus::Completed, analysis),
            Err(e) => {
                tracing::error!(
                    pipeline = pipeline_id,
                    error = %e,
                    partial_cost = cost.total_cost,
                    "Pipeline run failed, returning degraded analysis"
                );
                (RunStatus::Degraded, AnalysisOutput::degraded(e.to_string()))
            }
        };

        tracing::info!(
            pipeline = pipeline_id,
            status = ?status,
            records = records.len(),
            total_cost = cost.total_cost,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Pipeline run finished"
        );

        PipelineRun {
            status,
            analysis,
            cost,
            report,
        }
    }

    async fn execute(
        &self,
        records: &[serde_json::Value],
        pipeline_id: &str,
        hybrid_mode: bool,
        ledger: &Arc<CostLedger>,
        report: &mut RunReport,
    ) -> Result<AnalysisOutput, PipelineError> {
        let config = self.registry.get(pipeline_id)?.clone();

        // Extraction
        let invoker = ExtractionInvoker::new(
            Arc::clone(&self.client),
            self.settings.max_concurrency,
            self.settings.extraction_timeout(),
        );
        let batch = match invoker
            .extract_all(&config, records, Arc::clone(ledger))
            .await
        {
            Ok(batch) => batch,
            Err(e) => {
                if let PipelineError::ExtractionTimeout { abandoned, .. } = &e {
                    report.abandoned_calls = *abandoned;
                }
                return Err(e);
            }
        };
        report.records_extracted = batch.events.len();
        report.extraction_failures = batch.failures;

        // Assembly
        let options = AssemblyOptions {
            gap_threshold_days: self.settings.gap_threshold_days,
            red_flag_rendering: config.analysis_schema.red_flags,
        };
        let assembled = assemble(batch.events, records.len(), &options);
        report.duplicates_removed = assembled.duplicates_removed;
        report.invalid_dates = assembled.sorted.invalid_dates.clone();
        report.gaps = assembled.gaps.clone();
        report.integrity = assembled.integrity;

        let mut analysis = AnalysisOutput {
            chronology: assembled.chronology,
            missing_records: assembled.missing_records,
            red_flags: assembled.invalid_date_flags,
            ..AnalysisOutput::default()
        };

        if !config.requires_augmentation {
            report.augmentation = AugmentationStatus::Skipped;
            return Ok(analysis);
        }

        // Augmentation
        for name in config.analysis_schema.extra_sections.keys() {
            analysis.extra_sections.entry(name.clone()).or_default();
        }

        let augmenter = Augmenter::new(Arc::clone(&self.client), self.settings.citation_policy);
        let model = config.analysis_model_for(hybrid_mode).to_string();
        let sorted = assembled.sorted;
        let ledger = Arc::clone(ledger);
        let outcome = tokio::task::spawn_blocking(move || {
            augmenter.augment(&config, &sorted, &model, &ledger)
        })
        .await
        .unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Augmentation task aborted");
            AugmentOutcome::failed(format!("Augmentation task aborted: {e}"))
        });

        // Synthesized invalid-date flags stay ahead of augmenter flags.
        for (section, items) in outcome.sections {
            match analysis.augmented_section_mut(&section) {
                Some(existing) => existing.extend(items),
                None => {
                    analysis.extra_sections.insert(section, items);
                }
            }
        }
        report.grounding_violations = outcome.grounding.violations;
        report.excluded_items = outcome.excluded;
        report.augmentation = outcome.status;

        Ok(analysis)
    }
}

// ═══════════════════════════════════════════
// Submission flow
// ═══════════════════════════════════════════

#[derive(Error, Debug)]
pub enum SubmissionError {
    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error(transparent)]
    Case(#[from] CaseError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Submission {
    pub customer_name: String,
    pub customer_email: String,
    pub pipeline: String,
    #[serde(default)]
    pub hybrid_mode: bool,
    pub records: Vec<serde_json::Value>,
}

#[derive(Debug, Clone)]
pub struct ProcessedCase {
    pub case: Case,
    pub run: PipelineRun,
}

/// Create a case, run its pipeline and store the analysis and costs.
/// An unknown pipeline is rejected before any case is created; a degraded
/// run is still stored so a reviewer can see the diagnostic.
pub async fn process_submission(
    store: &dyn CaseStore,
    engine: &Engine,
    submission: Submission,
) -> Result<ProcessedCase, SubmissionError> {
    engine.registry().get(&submission.pipeline)?;

    let Submission {
        customer_name,
        customer_email,
        pipeline,
        hybrid_mode,
        records,
    } = submission;

    let case = store.create_case(NewCase {
        customer_name,
        customer_email,
        pipeline: pipeline.clone(),
        records_count: records.len(),
    })?;

    let run = engine.run_pipeline(&records, &pipeline, hybrid_mode).await;

    store.update_analysis(&case.id, &run.analysis, Some(records))?;
    store.update_costs(&case.id, &run.cost)?;
    let case = store.get_case(&case.id)?;

    tracing::info!(
        case_id = %case.id,
        degraded = run.is_degraded(),
        "Submission processed"
    );

    Ok(ProcessedCase { case, run })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::{SectionItem, CONTRADICTIONS};
    use crate::case::{CaseStatus, MemoryCaseStore};
    use crate::pipeline::llm::{Completion, MockLlmClient, TokenUsage};
    use serde_json::json;

    fn records() -> Vec<serde_json::Value> {
        vec![
            json!({"record_id": "R1", "date": "2023-01-18", "event_type": "visit", "event_description": "Intake"}),
            json!({"record_id": "R2", "date": "INVALID-DATE", "event_type": "visit", "event_description": "Undated note"}),
            json!({"record_id": "R3", "date": "2023-03-15", "event_type": "visit", "event_description": "Follow-up"}),
        ]
    }

    fn is_analysis(prompt: &str) -> bool {
        prompt.contains("Known record IDs")
    }

    /// Extraction passes raw records through; analysis returns `analysis`.
    fn engine_with(analysis: &'static str) -> (Engine, Arc<MockLlmClient>) {
        let client = Arc::new(MockLlmClient::new(move |_, prompt| {
            if is_analysis(prompt) {
                Ok(Completion::new(analysis, TokenUsage::new(1000, 500)))
            } else {
                Ok(Completion::new("{}", TokenUsage::new(100, 20)))
            }
        }));
        let engine = Engine::new(
            PipelineRegistry::builtin(),
            EngineSettings::default(),
            client.clone(),
        );
        (engine, client)
    }

    #[tokio::test]
    async fn deterministic_pipeline_three_records() {
        let (engine, client) = engine_with("{}");
        let run = engine.run_pipeline(&records(), "psych_timeline", false).await;

        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(client.call_count(), 3);
        assert_eq!(run.analysis.chronology.len(), 3);
        assert!(run.analysis.chronology[0].contains("R2"));
        assert!(run.analysis.chronology[1].contains("R1"));
        assert!(run.analysis.chronology[2].contains("R3"));
        assert_eq!(run.analysis.missing_records.len(), 1);
        assert!(run.analysis.missing_records[0].contains("56"));
        assert_eq!(run.analysis.red_flags.len(), 1);
        assert!(run.analysis.red_flags[0]
            .as_text()
            .unwrap()
            .contains("documentation_gap"));
        assert_eq!(run.report.invalid_dates, vec!["INVALID-DATE"]);
        assert_eq!(run.report.augmentation, AugmentationStatus::Skipped);
        assert_eq!(run.cost.records_processed, 3);
        assert_eq!(run.cost.invocations, 3);
        assert_eq!(run.cost.analysis_tokens, 0);
    }

    #[tokio::test]
    async fn augmented_pipeline_merges_sections() {
        let (engine, client) = engine_with(
            r#"{"red_flags": [{"category": "Care", "issue": "No labs", "records": ["R1"]}],
                "contradictions": [{"description": "Dose", "records": ["R1", "R9"]}],
                "expert_opinions_needed": []}"#,
        );
        let run = engine.run_pipeline(&records(), "medical_chronology", true).await;

        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(client.call_count(), 4);
        // Invalid-date flag first, then the augmenter's.
        assert_eq!(run.analysis.red_flags.len(), 2);
        assert_eq!(
            run.analysis.red_flags[0].as_object().unwrap()["category"],
            "documentation_gap"
        );
        assert_eq!(run.analysis.red_flags[1].as_object().unwrap()["issue"], "No labs");
        assert_eq!(run.analysis.section(CONTRADICTIONS).unwrap().len(), 1);
        assert_eq!(run.report.grounding_violations.len(), 1);
        assert_eq!(run.report.grounding_violations[0].record_id, "R9");
        assert_eq!(run.report.augmentation, AugmentationStatus::Completed);
        assert!(run.cost.analysis_tokens > 0);
        assert_eq!(run.cost.analysis_model, crate::pipeline::registry::HYBRID_ANALYSIS_MODEL);
    }

    #[tokio::test]
    async fn failed_augmentation_keeps_deterministic_output() {
        let (engine, _) = engine_with("not json at all");
        let run = engine
            .run_pipeline(&records(), "psych_expert_witness", false)
            .await;

        assert_eq!(run.status, RunStatus::Completed);
        assert!(matches!(run.report.augmentation, AugmentationStatus::Failed { .. }));
        assert_eq!(run.analysis.chronology.len(), 3);
        assert_eq!(run.analysis.red_flags.len(), 1);
        assert!(run.analysis.contradictions.is_empty());
        assert_eq!(
            run.analysis.extra_sections.get("medication_adherence"),
            Some(&Vec::<SectionItem>::new())
        );
    }

    #[tokio::test]
    async fn unreachable_backend_degrades() {
        let client = Arc::new(MockLlmClient::failing(LlmError::Connection(
            "connection refused".into(),
        )));
        let engine = Engine::new(PipelineRegistry::builtin(), EngineSettings::default(), client);
        let run = engine.run_pipeline(&records(), "psych_timeline", false).await;

        assert!(run.is_degraded());
        assert!(run.analysis.is_degraded());
        assert!(run.analysis.chronology.is_empty());
        assert!(run.analysis.diagnostics[0].starts_with("Pipeline error:"));
        assert!(run.cost.is_zero());
    }

    #[tokio::test]
    async fn extraction_timeout_keeps_cost_of_finished_calls() {
        let client = Arc::new(MockLlmClient::new(|_, prompt| {
            if prompt.contains("R2") {
                std::thread::sleep(std::time::Duration::from_millis(2500));
            }
            Ok(Completion::new("{}", TokenUsage::new(1000, 500)))
        }));
        let settings = EngineSettings {
            extraction_timeout_secs: 1,
            ..EngineSettings::default()
        };
        let engine = Engine::new(PipelineRegistry::builtin(), settings, client);
        let run = engine
            .run_pipeline(&records()[..2], "psych_timeline", false)
            .await;

        assert!(run.is_degraded());
        assert!(run.analysis.diagnostics[0].contains("timed out after 1s"));
        // R1 finished before the deadline and stays billed; R2 is abandoned.
        assert_eq!(run.cost.invocations, 1);
        assert!(run.cost.total_cost > 0.0);
        assert_eq!(run.report.abandoned_calls, 1);
    }

    #[tokio::test]
    async fn unknown_pipeline_degrades() {
        let (engine, client) = engine_with("{}");
        let run = engine.run_pipeline(&records(), "nope", false).await;
        assert!(run.is_degraded());
        assert!(run.analysis.diagnostics[0].contains("Unknown pipeline 'nope'"));
        assert_eq!(client.call_count(), 0);
    }

    #[tokio::test]
    async fn skipped_record_shows_in_report() {
        let client = Arc::new(MockLlmClient::new(|_, prompt| {
            if prompt.contains("R2") {
                Ok(Completion::new("garbage", TokenUsage::default()))
            } else {
                Ok(Completion::new("{}", TokenUsage::default()))
            }
        }));
        let engine = Engine::new(PipelineRegistry::builtin(), EngineSettings::default(), client);
        let run = engine.run_pipeline(&records(), "psych_timeline", false).await;

        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.report.records_extracted, 2);
        assert_eq!(run.report.extraction_failures.len(), 1);
        assert_eq!(run.report.extraction_failures[0].record_id.as_deref(), Some("R2"));
        assert!(!run.report.integrity.is_complete());
        assert!(run.analysis.red_flags.is_empty());
    }

    #[tokio::test]
    async fn process_submission_stores_case() {
        let (engine, _) = engine_with(r#"{"red_flags": [], "contradictions": [], "expert_opinions_needed": []}"#);
        let store = MemoryCaseStore::new();
        let processed = process_submission(
            &store,
            &engine,
            Submission {
                customer_name: "Jane Roe".into(),
                customer_email: "jane@example.com".into(),
                pipeline: "medical_chronology".into(),
                hybrid_mode: false,
                records: records(),
            },
        )
        .await
        .unwrap();

        let case = processed.case;
        assert_eq!(case.status, CaseStatus::PendingReview);
        assert_eq!(case.records_count, 3);
        assert_eq!(case.analysis.as_ref(), Some(&processed.run.analysis));
        assert_eq!(case.edits, case.analysis);
        assert_eq!(case.original_records.as_ref().map(Vec::len), Some(3));
        // gpt-4o-mini usage is billable, so costs were stored.
        assert!(case.actual_cost.unwrap() > 0.0);
        assert_eq!(store.list_cases().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn process_submission_rejects_unknown_pipeline() {
        let (engine, _) = engine_with("{}");
        let store = MemoryCaseStore::new();
        let err = process_submission(
            &store,
            &engine,
            Submission {
                customer_name: "A".into(),
                customer_email: "a@example.com".into(),
                pipeline: "nope".into(),
                hybrid_mode: false,
                records: records(),
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(
            err,
            SubmissionError::Pipeline(PipelineError::UnknownPipeline { .. })
        ));
        assert!(store.list_cases().unwrap().is_empty());
    }
}
