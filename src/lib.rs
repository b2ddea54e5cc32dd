#![deny(missing_docs)]

//! Core library for the AI runner translation and summarization server.

/// HTTP routing and REST handlers.
pub mod api;
/// File and environment driven configuration management.
pub mod config;
/// Structured logging and tracing setup.
pub mod logging;
/// Request outcome counters.
pub mod metrics;
/// Sequence-to-sequence model backends and tokenizers.
pub mod models;
/// Model pipeline lifecycle and device placement.
pub mod pipeline;
/// Per-language summarization on top of the model pipeline.
pub mod summarization;
/// Chunked translation on top of the model pipeline.
pub mod translation;
