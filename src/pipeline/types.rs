use anyhow::Error as LoaderError;
use thiserror::Error;

/// Failures raised by the model lifecycle outside of request validation.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Model weights or configuration could not be loaded.
    #[error("failed to load model '{model}': {source}")]
    ModelLoad {
        /// Model name we attempted to load.
        model: String,
        /// Underlying loader error.
        #[source]
        source: LoaderError,
    },
    /// Tokenizer resources could not be loaded.
    #[error("failed to load tokenizer for model '{model}': {source}")]
    TokenizerLoad {
        /// Model name whose tokenizer we attempted to load.
        model: String,
        /// Underlying loader error.
        #[source]
        source: LoaderError,
    },
    /// Tokenizer rejected the input or output.
    #[error("tokenization failed: {0}")]
    Tokenization(String),
    /// A token the pipeline relies on is absent from the vocabulary.
    #[error("token '{0}' is missing from the tokenizer vocabulary")]
    MissingToken(String),
    /// The compute device could not be initialized.
    #[error("failed to initialize compute device: {0}")]
    Device(#[source] candle_core::Error),
    /// Building or reading a tensor failed.
    #[error("tensor operation failed: {0}")]
    Tensor(#[source] candle_core::Error),
    /// Moving tensors between host and device failed.
    #[error("failed to move tensors between devices: {0}")]
    Transfer(#[source] candle_core::Error),
    /// The model's generation routine failed.
    #[error("generation failed: {0}")]
    Generation(#[source] candle_core::Error),
}
