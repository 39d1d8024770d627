pub mod invoker;
pub mod parser;
pub mod prompt;
pub mod types;
pub mod validation;

pub use invoker::*;
pub use parser::*;
pub use prompt::*;
pub use types::*;
pub use validation::*;

use thiserror::Error;

use crate::pipeline::llm::LlmError;

#[derive(Error, Debug)]
pub enum ExtractionError {
    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("JSON parsing error: {0}")]
    JsonParsing(String),

    #[error("Validation failed after {attempts} attempt(s): {reason}")]
    Validation { attempts: u32, reason: String },

    #[error("Extraction task failed: {0}")]
    Join(String),
}

impl ExtractionError {
    pub fn is_unreachable(&self) -> bool {
        matches!(self, Self::Llm(e) if e.is_unreachable())
    }
}
