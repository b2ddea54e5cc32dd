//! Translation pipeline: language registry, chunking, translator, and service facade.

pub mod chunking;
pub mod languages;
mod service;
mod translator;
pub mod types;

pub use service::{TranslationApi, TranslationService};
pub use translator::{TranslationBatch, TranslationRequest, Translator, chunk_token_budget};
pub use types::{ChunkingError, TranslationError};
