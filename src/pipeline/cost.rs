//! Per-run cost ledger.
//!
//! Every completion call reports its usage together with the phase it ran
//! in. The phase travels with the call; the ledger holds no "current phase".
//! A ledger belongs to exactly one run and is drained exactly once.

use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use super::llm::TokenUsage;

// ═══════════════════════════════════════════
// Phase + pricing
// ═══════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Extraction,
    Analysis,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Extraction => "extraction",
            Self::Analysis => "analysis",
        }
    }
}

/// USD per 1k tokens.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelPricing {
    pub prompt_per_1k: f64,
    pub completion_per_1k: f64,
}

impl ModelPricing {
    const FREE: Self = Self {
        prompt_per_1k: 0.0,
        completion_per_1k: 0.0,
    };
}

/// Published list prices for the models the built-in pipelines use.
/// Local and unknown models cost nothing.
pub fn pricing_for(model: &str) -> ModelPricing {
    let name = model.rsplit('/').next().unwrap_or(model);
    if name.starts_with("gpt-4o-mini") {
        ModelPricing {
            prompt_per_1k: 0.00015,
            completion_per_1k: 0.0006,
        }
    } else if name.starts_with("gpt-4o") {
        ModelPricing {
            prompt_per_1k: 0.0025,
            completion_per_1k: 0.01,
        }
    } else if name.starts_with("claude-sonnet-4-5") {
        ModelPricing {
            prompt_per_1k: 0.003,
            completion_per_1k: 0.015,
        }
    } else {
        ModelPricing::FREE
    }
}

/// Cost of one call. A backend-reported cost wins over the price table.
pub fn compute_cost(model: &str, usage: TokenUsage, reported: Option<f64>) -> f64 {
    if let Some(cost) = reported {
        return cost.max(0.0);
    }
    let rate = pricing_for(model);
    usage.prompt_tokens as f64 / 1000.0 * rate.prompt_per_1k
        + usage.completion_tokens as f64 / 1000.0 * rate.completion_per_1k
}

/// Round to micro-dollar precision.
fn round_cost(value: f64) -> f64 {
    (value * 1_000_000.0).round() / 1_000_000.0
}

// ═══════════════════════════════════════════
// Records + breakdown
// ═══════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostRecord {
    pub model: String,
    pub phase: Phase,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub cost: f64,
}

impl CostRecord {
    pub fn new(model: &str, phase: Phase, usage: TokenUsage, cost: f64) -> Self {
        Self {
            model: model.to_string(),
            phase,
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            cost,
        }
    }

    pub fn tokens(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }
}

/// Cost totals for one run, summed by phase.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CostBreakdown {
    pub extraction_cost: f64,
    pub analysis_cost: f64,
    pub total_cost: f64,
    pub extraction_tokens: u64,
    pub analysis_tokens: u64,
    pub total_tokens: u64,
    pub invocations: usize,
    #[serde(default)]
    pub records_processed: usize,
    #[serde(default)]
    pub extraction_model: String,
    #[serde(default)]
    pub analysis_model: String,
}

impl CostBreakdown {
    pub fn from_records(records: &[CostRecord]) -> Self {
        let mut breakdown = Self::default();
        for record in records {
            match record.phase {
                Phase::Extraction => {
                    breakdown.extraction_cost += record.cost;
                    breakdown.extraction_tokens += record.tokens();
                }
                Phase::Analysis => {
                    breakdown.analysis_cost += record.cost;
                    breakdown.analysis_tokens += record.tokens();
                }
            }
        }
        breakdown.extraction_cost = round_cost(breakdown.extraction_cost);
        breakdown.analysis_cost = round_cost(breakdown.analysis_cost);
        breakdown.total_cost = round_cost(breakdown.extraction_cost + breakdown.analysis_cost);
        breakdown.total_tokens = breakdown.extraction_tokens + breakdown.analysis_tokens;
        breakdown.invocations = records.len();
        breakdown
    }

    pub fn is_zero(&self) -> bool {
        self.total_cost <= 0.0
    }
}

// ═══════════════════════════════════════════
// Ledger
// ═══════════════════════════════════════════

#[derive(Default)]
struct LedgerState {
    records: Vec<CostRecord>,
    sealed: bool,
    rejected: usize,
}

/// Shared, lock-protected ledger for one pipeline run.
#[derive(Default)]
pub struct CostLedger {
    state: Mutex<LedgerState>,
}

impl CostLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one invocation. Returns false when the ledger was already
    /// drained; the record is then discarded.
    pub fn record(&self, record: CostRecord) -> bool {
        let mut state = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if state.sealed {
            tracing::warn!(
                model = %record.model,
                phase = record.phase.as_str(),
                cost = record.cost,
                "Cost reported after ledger drain, discarding"
            );
            state.rejected += 1;
            return false;
        }
        state.records.push(record);
        true
    }

    /// Price and append one completion.
    pub fn record_usage(
        &self,
        model: &str,
        phase: Phase,
        usage: TokenUsage,
        reported_cost: Option<f64>,
    ) -> bool {
        let cost = compute_cost(model, usage, reported_cost);
        self.record(CostRecord::new(model, phase, usage, cost))
    }

    pub fn len(&self) -> usize {
        match self.state.lock() {
            Ok(guard) => guard.records.len(),
            Err(poisoned) => poisoned.into_inner().records.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Invocations discarded because they arrived after the drain.
    pub fn rejected(&self) -> usize {
        match self.state.lock() {
            Ok(guard) => guard.rejected,
            Err(poisoned) => poisoned.into_inner().rejected,
        }
    }

    /// Take every record and seal the ledger in one lock acquisition, then
    /// sum by phase. A second drain returns an empty breakdown.
    pub fn drain(&self) -> CostBreakdown {
        let records = {
            let mut state = match self.state.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            state.sealed = true;
            std::mem::take(&mut state.records)
        };
        CostBreakdown::from_records(&records)
    }
}
