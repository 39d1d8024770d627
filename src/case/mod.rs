//! Case tracking: metadata, analysis, reviewer edits and costs per case.
//!
//! `CaseStore` implementors only provide raw get/put/list; every state
//! transition is a provided method so all stores enforce the same rules.

pub mod chat;
pub mod json_store;
pub mod memory;
pub mod normalize;

pub use chat::{chat_with_case, ChatError, ChatReply};
pub use json_store::JsonCaseStore;
pub use memory::MemoryCaseStore;
pub use normalize::{normalize_case, normalize_sections};

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::analysis::AnalysisOutput;
use crate::pipeline::cost::CostBreakdown;

/// Quoted per-record price shown before processing.
pub const ESTIMATED_COST_PER_PAGE: f64 = 0.15;

/// Reviewer notes: `section -> item index -> note`.
pub type Comments = BTreeMap<String, BTreeMap<usize, String>>;

#[derive(Error, Debug)]
pub enum CaseError {
    #[error("Case not found: {0}")]
    NotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid status transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Invalid case status: {0}")]
    InvalidStatus(String),
}

// ═══════════════════════════════════════════
// Status
// ═══════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseStatus {
    Processing,
    PendingReview,
    Approved,
    Delivered,
}

impl CaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Processing => "processing",
            Self::PendingReview => "pending_review",
            Self::Approved => "approved",
            Self::Delivered => "delivered",
        }
    }

    /// Status only ever moves forward (skipping ahead is allowed).
    pub fn can_transition_to(&self, next: CaseStatus) -> bool {
        next > *self
    }
}

impl std::str::FromStr for CaseStatus {
    type Err = CaseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "processing" => Ok(Self::Processing),
            "pending_review" => Ok(Self::PendingReview),
            "approved" => Ok(Self::Approved),
            "delivered" => Ok(Self::Delivered),
            _ => Err(CaseError::InvalidStatus(s.into())),
        }
    }
}

impl std::fmt::Display for CaseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusChange {
    pub status: CaseStatus,
    pub at: DateTime<Utc>,
}

// ═══════════════════════════════════════════
// Case entity
// ═══════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewCase {
    pub customer_name: String,
    pub customer_email: String,
    pub pipeline: String,
    pub records_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Case {
    pub id: String,
    pub customer_name: String,
    pub customer_email: String,
    pub pipeline: String,
    pub records_count: usize,
    pub uploaded_at: DateTime<Utc>,
    pub status: CaseStatus,
    #[serde(default)]
    pub status_history: Vec<StatusChange>,
    pub estimated_cost_per_page: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analysis: Option<AnalysisOutput>,
    /// Reviewer-editable copy of `analysis`, independent of it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edits: Option<AnalysisOutput>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub comments: Comments,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_records: Option<Vec<serde_json::Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analyzed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_edited: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual_cost: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_per_page: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_breakdown: Option<CostBreakdown>,
}

impl Case {
    pub fn new(new: NewCase, now: DateTime<Utc>) -> Self {
        Self {
            id: generate_case_id(now),
            customer_name: new.customer_name,
            customer_email: new.customer_email,
            pipeline: new.pipeline,
            records_count: new.records_count,
            uploaded_at: now,
            status: CaseStatus::Processing,
            status_history: vec![StatusChange {
                status: CaseStatus::Processing,
                at: now,
            }],
            estimated_cost_per_page: ESTIMATED_COST_PER_PAGE,
            analysis: None,
            edits: None,
            comments: Comments::new(),
            original_records: None,
            analyzed_at: None,
            last_edited: None,
            actual_cost: None,
            cost_per_page: None,
            cost_breakdown: None,
        }
    }

    fn transition(&mut self, next: CaseStatus, now: DateTime<Utc>) -> Result<(), CaseError> {
        if !self.status.can_transition_to(next) {
            return Err(CaseError::InvalidTransition {
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        self.status_history.push(StatusChange { status: next, at: now });
        Ok(())
    }

    /// A fresh analysis supersedes any review: the case goes back to
    /// pending review from whatever status it had reached.
    fn reopen_for_review(&mut self, now: DateTime<Utc>) {
        if self.status == CaseStatus::PendingReview {
            return;
        }
        tracing::info!(case_id = %self.id, from = %self.status, "Case reopened for review");
        self.status = CaseStatus::PendingReview;
        self.status_history.push(StatusChange {
            status: CaseStatus::PendingReview,
            at: now,
        });
    }

    /// The reviewed version if any, otherwise the raw analysis.
    pub fn current_analysis(&self) -> Option<&AnalysisOutput> {
        self.edits.as_ref().or(self.analysis.as_ref())
    }
}

/// `YYYYMMDD_HHMMSS_<8 hex>`: sortable by creation time, unique within a second.
pub fn generate_case_id(now: DateTime<Utc>) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}_{}", now.format("%Y%m%d_%H%M%S"), &suffix[..8])
}

// ═══════════════════════════════════════════
// Store
// ═══════════════════════════════════════════

pub trait CaseStore: Send + Sync {
    fn get_case(&self, id: &str) -> Result<Case, CaseError>;

    /// Insert or replace a case wholesale.
    fn put_case(&self, case: &Case) -> Result<(), CaseError>;

    /// All cases, newest upload first.
    fn list_cases(&self) -> Result<Vec<Case>, CaseError>;

    fn create_case(&self, new: NewCase) -> Result<Case, CaseError> {
        let case = Case::new(new, Utc::now());
        self.put_case(&case)?;
        tracing::info!(
            case_id = %case.id,
            pipeline = %case.pipeline,
            records = case.records_count,
            "Case created"
        );
        Ok(case)
    }

    /// Store the analysis, snapshot it into `edits`, and move the case to
    /// pending review. Reprocessing an approved or delivered case replaces
    /// the reviewed copy and reopens it; `update_status` stays forward-only.
    fn update_analysis(
        &self,
        id: &str,
        analysis: &AnalysisOutput,
        original_records: Option<Vec<serde_json::Value>>,
    ) -> Result<Case, CaseError> {
        let mut case = self.get_case(id)?;
        let now = Utc::now();
        case.reopen_for_review(now);
        case.analysis = Some(analysis.clone());
        case.edits = Some(analysis.clone());
        case.analyzed_at = Some(now);
        if let Some(records) = original_records {
            tracing::debug!(case_id = %id, records = records.len(), "Storing original records");
            case.original_records = Some(records);
        }
        self.put_case(&case)?;
        tracing::info!(case_id = %id, "Case analysis updated");
        Ok(case)
    }

    fn update_edits(
        &self,
        id: &str,
        edits: AnalysisOutput,
        comments: Option<Comments>,
    ) -> Result<Case, CaseError> {
        let mut case = self.get_case(id)?;
        case.edits = Some(edits);
        case.last_edited = Some(Utc::now());
        if let Some(comments) = comments {
            case.comments = comments;
        }
        self.put_case(&case)?;
        tracing::info!(case_id = %id, "Case edits updated");
        Ok(case)
    }

    fn update_status(&self, id: &str, status: CaseStatus) -> Result<Case, CaseError> {
        let mut case = self.get_case(id)?;
        case.transition(status, Utc::now())?;
        self.put_case(&case)?;
        tracing::info!(case_id = %id, status = status.as_str(), "Case status updated");
        Ok(case)
    }

    /// Record actual costs. A zero-cost breakdown (no billable calls) is
    /// not stored; returns whether anything was written.
    fn update_costs(&self, id: &str, cost: &CostBreakdown) -> Result<bool, CaseError> {
        if cost.is_zero() {
            tracing::info!(case_id = %id, "No costs to track for case");
            return Ok(false);
        }
        let mut case = self.get_case(id)?;
        let pages = if case.records_count > 0 {
            case.records_count
        } else {
            cost.records_processed
        };
        let cost_per_page = if pages > 0 {
            cost.total_cost / pages as f64
        } else {
            0.0
        };
        case.actual_cost = Some(cost.total_cost);
        case.cost_per_page = Some(cost_per_page);
        case.cost_breakdown = Some(cost.clone());
        self.put_case(&case)?;
        tracing::info!(
            case_id = %id,
            total_cost = cost.total_cost,
            cost_per_page,
            "Case costs updated"
        );
        Ok(true)
    }
}
