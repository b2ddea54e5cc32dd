//! Error definitions for the summarization pipeline.

use crate::pipeline::PipelineError;
use thiserror::Error;

/// Errors emitted by the summarizers.
#[derive(Debug, Error)]
pub enum SummarizationError {
    /// Neither the requested language nor the `default` entry has a summarization model.
    #[error("No summarization model is configured for '{0}'")]
    NotConfigured(String),
    /// Model loading, tokenization, or generation failed.
    #[error("Summarization pipeline failed: {0}")]
    Pipeline(#[from] PipelineError),
    /// The blocking worker running the summarization panicked or was cancelled.
    #[error("Summarization worker failed: {0}")]
    Worker(String),
}
