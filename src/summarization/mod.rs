//! Summarization pipeline: per-language BART summarizers behind an async service facade.

mod service;
mod summarizer;
pub mod types;

pub use service::{DEFAULT_SUMMARIZER, SummarizationApi, SummarizationService};
pub use summarizer::Summarizer;
pub use types::SummarizationError;
