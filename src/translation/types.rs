//! Error definitions for the translation pipeline.

use crate::pipeline::PipelineError;
use thiserror::Error;

/// Errors produced while splitting token sequences into model-sized chunks.
#[derive(Debug, Error)]
pub enum ChunkingError {
    /// The token budget leaves no room for content plus the end-of-sequence marker.
    #[error("chunk size must be at least 2 tokens, got {0}")]
    InvalidChunkSize(usize),
}

/// Errors emitted by the translator.
#[derive(Debug, Error)]
pub enum TranslationError {
    /// The short language code is not in the registry.
    #[error("{0} is not a supported language.")]
    UnsupportedLanguage(String),
    /// Chunking rejected the token sequence.
    #[error("Failed to chunk document: {0}")]
    Chunking(#[from] ChunkingError),
    /// Model loading, tokenization, or generation failed.
    #[error("Translation pipeline failed: {0}")]
    Pipeline(#[from] PipelineError),
    /// The blocking worker running the translation panicked or was cancelled.
    #[error("Translation worker failed: {0}")]
    Worker(String),
}

impl TranslationError {
    /// Whether the caller's input caused the failure.
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::UnsupportedLanguage(_))
    }
}
