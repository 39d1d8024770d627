//! Record pipeline: extraction → assembly → optional augmentation.

pub mod assembly;
pub mod augment;
pub mod cost;
pub mod engine;
pub mod extraction;
pub mod llm;
pub mod registry;

use thiserror::Error;

use self::extraction::ExtractionError;

/// Run-level failures. The engine converts every one of these into a
/// degraded analysis; they never cross `Engine::run_pipeline`.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Unknown pipeline '{id}'. Available pipelines: {available}")]
    UnknownPipeline { id: String, available: String },

    /// `abandoned` extraction calls were still running; their cost lands
    /// after the ledger is drained and is discarded.
    #[error("Extraction phase timed out after {secs}s with {abandoned} calls still running")]
    ExtractionTimeout { secs: u64, abandoned: usize },

    #[error("Extraction backend unreachable: {0}")]
    BackendUnreachable(String),

    #[error("Extraction failed: {0}")]
    Extraction(#[from] ExtractionError),

    #[error("Pipeline registry I/O error: {0}")]
    RegistryIo(#[from] std::io::Error),

    #[error("Invalid pipeline registry: {0}")]
    RegistryFormat(String),
}
