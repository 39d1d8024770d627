//! Parallel per-record extraction.
//!
//! Each record is one blocking LLM call on the blocking pool, bounded by a
//! semaphore. The whole phase is bounded by a wall-clock timeout; calls
//! already in flight when it fires are left to finish in the background and
//! their late costs are rejected by the (by then drained) ledger.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use super::{
    event_from_output, overlay_record, parse_extraction_output, validate_output, ExtractedEvent,
    ExtractionBatch, ExtractionError, ExtractionPrompt, RecordFailure,
};
use crate::analysis::value_to_text;
use crate::pipeline::cost::{CostLedger, Phase};
use crate::pipeline::llm::LlmClient;
use crate::pipeline::registry::{PipelineConfig, ValidationRule};
use crate::pipeline::PipelineError;

/// Per-run extraction settings shared by every worker.
struct ExtractionJob {
    client: Arc<dyn LlmClient>,
    ledger: Arc<CostLedger>,
    prompt: ExtractionPrompt,
    rules: Vec<ValidationRule>,
    retries: u32,
}

pub struct ExtractionInvoker {
    client: Arc<dyn LlmClient>,
    max_concurrency: usize,
    timeout: Duration,
}

impl ExtractionInvoker {
    pub fn new(client: Arc<dyn LlmClient>, max_concurrency: usize, timeout: Duration) -> Self {
        Self {
            client,
            max_concurrency: max_concurrency.max(1),
            timeout,
        }
    }

    /// Extract every record. Per-record failures are collected, not raised.
    /// Fails only when the phase times out, or when nothing was extracted
    /// because the backend could not be reached.
    pub async fn extract_all(
        &self,
        config: &PipelineConfig,
        records: &[serde_json::Value],
        ledger: Arc<CostLedger>,
    ) -> Result<ExtractionBatch, PipelineError> {
        let job = Arc::new(ExtractionJob {
            client: Arc::clone(&self.client),
            ledger,
            prompt: ExtractionPrompt::for_pipeline(config),
            rules: config.extraction_validation.clone(),
            retries: config.num_retries_on_validate_failure,
        });
        let semaphore = Arc::new(Semaphore::new(self.max_concurrency));
        let mut set = JoinSet::new();

        tracing::info!(
            pipeline = %config.id,
            records = records.len(),
            concurrency = self.max_concurrency,
            model = %job.prompt.model,
            "Starting extraction"
        );

        let collected = tokio::time::timeout(self.timeout, async {
            for (index, record) in records.iter().enumerate() {
                let permit = Arc::clone(&semaphore)
                    .acquire_owned()
                    .await
                    .map_err(|e| ExtractionError::Join(e.to_string()))?;
                let job = Arc::clone(&job);
                let record = record.clone();
                set.spawn_blocking(move || {
                    let _permit = permit;
                    let result = extract_record(&job, &record);
                    (index, record, result)
                });
            }

            let mut results = Vec::with_capacity(records.len());
            while let Some(joined) = set.join_next().await {
                results.push(joined);
            }
            Ok::<_, ExtractionError>(results)
        })
        .await;

        let joined = match collected {
            Ok(Ok(joined)) => joined,
            Ok(Err(e)) => return Err(PipelineError::Extraction(e)),
            Err(_) => {
                // In-flight calls are not cancelled.
                let abandoned = set.len();
                set.detach_all();
                tracing::error!(
                    timeout_secs = self.timeout.as_secs(),
                    abandoned,
                    "Extraction phase timed out"
                );
                return Err(PipelineError::ExtractionTimeout {
                    secs: self.timeout.as_secs(),
                    abandoned,
                });
            }
        };

        let mut extracted: Vec<(usize, ExtractedEvent)> = Vec::new();
        let mut failures = Vec::new();
        for outcome in joined {
            match outcome {
                Ok((index, _, Ok(event))) => extracted.push((index, event)),
                Ok((index, record, Err(e))) => {
                    let record_id = raw_record_id(&record);
                    tracing::warn!(
                        index,
                        record_id = record_id.as_deref().unwrap_or("(no id)"),
                        error = %e,
                        "Record extraction failed, skipping"
                    );
                    failures.push(RecordFailure {
                        index: Some(index),
                        record_id,
                        unreachable: e.is_unreachable(),
                        error: e.to_string(),
                    });
                }
                Err(join_error) => {
                    tracing::warn!(error = %join_error, "Extraction task aborted");
                    failures.push(RecordFailure {
                        index: None,
                        record_id: None,
                        unreachable: false,
                        error: ExtractionError::Join(join_error.to_string()).to_string(),
                    });
                }
            }
        }

        // Submission order keeps dedup tie-breaks reproducible.
        extracted.sort_by_key(|(index, _)| *index);
        failures.sort_by_key(|f| f.index.unwrap_or(usize::MAX));

        let backend_unreachable = failures.iter().any(|f| f.unreachable);
        if extracted.is_empty() && backend_unreachable {
            let reason = failures
                .iter()
                .find(|f| f.unreachable)
                .map(|f| f.error.clone())
                .unwrap_or_default();
            return Err(PipelineError::BackendUnreachable(reason));
        }

        tracing::info!(
            extracted = extracted.len(),
            failed = failures.len(),
            "Extraction finished"
        );

        Ok(ExtractionBatch {
            events: extracted.into_iter().map(|(_, event)| event).collect(),
            failures,
            backend_unreachable,
        })
    }
}

/// One record, with validation retries. Runs on the blocking pool.
fn extract_record(
    job: &ExtractionJob,
    record: &serde_json::Value,
) -> Result<ExtractedEvent, ExtractionError> {
    let prompt = job.prompt.render(record);
    let attempts = job.retries + 1;
    let mut last_reason = String::new();

    for attempt in 1..=attempts {
        let completion = job
            .client
            .generate(&job.prompt.model, &prompt, &job.prompt.system)?;
        job.ledger.record_usage(
            &job.prompt.model,
            Phase::Extraction,
            completion.usage,
            completion.reported_cost,
        );

        let output = match parse_extraction_output(&completion.text) {
            Ok(output) => output,
            Err(e) => {
                tracing::debug!(attempt, error = %e, "Unparsable extraction output");
                last_reason = e.to_string();
                continue;
            }
        };

        let merged = overlay_record(record, output);
        match validate_output(&merged, &job.rules) {
            Ok(()) => return event_from_output(merged),
            Err(rule) => {
                tracing::debug!(attempt, rule = %rule, "Extraction output failed validation");
                last_reason = format!("{rule} not satisfied");
            }
        }
    }

    Err(ExtractionError::Validation {
        attempts,
        reason: last_reason,
    })
}

/// Best-effort identifier of a raw record, for failure reports.
pub(crate) fn raw_record_id(record: &serde_json::Value) -> Option<String> {
    ["record_id", "id"]
        .iter()
        .filter_map(|key| record.get(*key))
        .map(value_to_text)
        .find(|id| !id.trim().is_empty())
}
