//! Question answering over one case's reviewed analysis.
//!
//! The model only sees the extracted sections, numbered by list position so
//! "the third event" means the third chronology line. Record ids cited in
//! the answer are checked against the case's own records.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{Case, CaseError, CaseStore};
use crate::analysis::{AnalysisOutput, SectionItem, CHRONOLOGY};
use crate::pipeline::augment::{check_grounding, citations_against, GroundingReport};
use crate::pipeline::cost::compute_cost;
use crate::pipeline::extraction::invoker::raw_record_id;
use crate::pipeline::llm::{ChatTurn, LlmClient, LlmError, TokenUsage};
use crate::pipeline::registry::HYBRID_ANALYSIS_MODEL;

pub const DEFAULT_CHAT_MODEL: &str = HYBRID_ANALYSIS_MODEL;

/// Chronology lines beyond this are left out of the context.
pub const CHRONOLOGY_CONTEXT_LIMIT: usize = 100;

pub const MAX_MESSAGE_CHARS: usize = 2000;

pub const NOT_AVAILABLE: &str = "This information is not available in the extracted analysis";

/// Section name used when reporting citation problems in an answer.
const ANSWER_SECTION: &str = "answer";

#[derive(Error, Debug)]
pub enum ChatError {
    #[error("Message cannot be empty")]
    EmptyMessage,

    #[error("Message too long ({len} chars, max {max})")]
    MessageTooLong { len: usize, max: usize },

    #[error("Case {0} has no analysis yet")]
    NoAnalysis(String),

    #[error(transparent)]
    Case(#[from] CaseError),

    #[error("Chat completion failed: {0}")]
    Llm(#[from] LlmError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatReply {
    pub case_id: String,
    pub answer: String,
    /// `[ID]` citations in the answer, in order of appearance.
    pub citations: Vec<String>,
    pub grounding: GroundingReport,
    pub model: String,
    pub usage: TokenUsage,
    pub cost: f64,
}

impl ChatReply {
    pub fn is_grounded(&self) -> bool {
        self.grounding.is_clean()
    }
}

// ═══════════════════════════════════════════
// Context
// ═══════════════════════════════════════════

fn section_key(name: &str) -> String {
    name.to_uppercase()
}

/// Render every non-empty section as a numbered list. Only the first
/// `CHRONOLOGY_CONTEXT_LIMIT` chronology lines are included; the header
/// still states the full count.
pub fn build_case_context(analysis: &AnalysisOutput) -> String {
    let mut blocks = Vec::new();

    for name in analysis.section_names() {
        let items = match analysis.section(&name) {
            Some(items) if !items.is_empty() => items,
            _ => continue,
        };
        let total = items.len();

        let header = if name == CHRONOLOGY && total > CHRONOLOGY_CONTEXT_LIMIT {
            format!(
                "{} ({} total events, showing first {}):",
                section_key(&name),
                total,
                CHRONOLOGY_CONTEXT_LIMIT
            )
        } else {
            format!("{} ({}):", section_key(&name), total)
        };

        let limit = if name == CHRONOLOGY {
            CHRONOLOGY_CONTEXT_LIMIT
        } else {
            total
        };
        let lines: Vec<String> = items
            .iter()
            .take(limit)
            .enumerate()
            .map(|(i, item)| format!("{}. {}", i + 1, item.display_text()))
            .collect();

        blocks.push(format!("{header}\n{}", lines.join("\n")));
    }

    blocks.join("\n\n")
}

pub fn chat_system_prompt(case_id: &str, context: &str) -> String {
    format!(
        "You are a medical chronology assistant analyzing Case {case_id}.

EXTRACTED CASE DATA:
{context}

INSTRUCTIONS:
1. Answer ONLY from the extracted case data above.
2. When asked for the Nth event, use its numbered position in the list.
3. Cite record IDs in square brackets, e.g. [MRN-2024-001]. Use square brackets for nothing else.
4. If the data does not answer the question, say \"{NOT_AVAILABLE}\".
5. Be concise. Give exact counts and dates as YYYY-MM-DD.
6. Do not speculate beyond the data."
    )
}

/// Record ids a chat answer may cite: the submitted records plus the ids
/// on the chronology lines.
pub fn case_record_ids(case: &Case, analysis: &AnalysisOutput) -> HashSet<String> {
    let mut known: HashSet<String> = case
        .original_records
        .iter()
        .flatten()
        .filter_map(raw_record_id)
        .map(|id| id.trim().to_string())
        .collect();

    for line in &analysis.chronology {
        if let Some(id) = line.split(" | ").nth(1) {
            let id = id.trim();
            if !id.is_empty() && id != "(no id)" {
                known.insert(id.to_string());
            }
        }
    }
    known
}

// ═══════════════════════════════════════════
// Chat
// ═══════════════════════════════════════════

/// Answer one question about a case. Uses the reviewed copy when present.
/// `history` is the earlier conversation, oldest first; the new message is
/// appended as the last user turn. Blocking: call from `spawn_blocking`
/// inside a runtime.
pub fn chat_with_case(
    store: &dyn CaseStore,
    client: &dyn LlmClient,
    model: &str,
    case_id: &str,
    message: &str,
    history: &[ChatTurn],
) -> Result<ChatReply, ChatError> {
    let message = message.trim();
    if message.is_empty() {
        return Err(ChatError::EmptyMessage);
    }
    let len = message.chars().count();
    if len > MAX_MESSAGE_CHARS {
        return Err(ChatError::MessageTooLong {
            len,
            max: MAX_MESSAGE_CHARS,
        });
    }

    let case = store.get_case(case_id)?;
    let analysis = case
        .current_analysis()
        .ok_or_else(|| ChatError::NoAnalysis(case_id.to_string()))?;

    let system = chat_system_prompt(&case.id, &build_case_context(analysis));
    let mut turns = history.to_vec();
    turns.push(ChatTurn::user(message));

    tracing::info!(
        case_id = %case.id,
        model = %model,
        history = history.len(),
        "Answering case question"
    );
    let completion = client.chat(model, &system, &turns)?;

    let known = case_record_ids(&case, analysis);
    let item = SectionItem::Text(completion.text.clone());
    let citations = citations_against(&item, &known);
    let mut sections = BTreeMap::new();
    sections.insert(ANSWER_SECTION.to_string(), vec![item]);
    let grounding = check_grounding(&known, &sections);
    if !grounding.is_clean() {
        tracing::warn!(
            case_id = %case.id,
            violations = grounding.violations.len(),
            "Chat answer cites records outside the case"
        );
    }

    Ok(ChatReply {
        case_id: case.id.clone(),
        answer: completion.text,
        citations,
        grounding,
        model: model.to_string(),
        usage: completion.usage,
        cost: compute_cost(model, completion.usage, completion.reported_cost),
    })
}
