//! Async facade that routes summaries to per-language models and records outcomes.

use crate::{
    config::SummaryConfig,
    metrics::{MetricsSnapshot, RequestMetrics},
    models::{BartLoader, Seq2SeqModel, TextTokenizer},
    pipeline::ModelLoader,
    summarization::{SummarizationError, Summarizer},
};
use async_trait::async_trait;
use candle_core::Device;
use std::collections::HashMap;
use std::sync::Arc;

/// Summarizer entry used when a request names no language or one without its own model.
pub const DEFAULT_SUMMARIZER: &str = "default";

/// Abstraction over the summarizers used by external surfaces.
#[async_trait]
pub trait SummarizationApi: Send + Sync {
    /// Summarize `text` with the model configured for `src_lang`.
    async fn summarize(
        &self,
        text: String,
        src_lang: Option<String>,
    ) -> Result<String, SummarizationError>;

    /// Retrieve the current metrics snapshot for diagnostics.
    fn metrics_snapshot(&self) -> MetricsSnapshot;
}

/// Per-language summarizers sharing one set of counters.
///
/// Each model loads on its first request, so languages nobody asks for never touch the device.
pub struct SummarizationService<L: ModelLoader = BartLoader> {
    summarizers: HashMap<String, Arc<Summarizer<L>>>,
    metrics: Arc<RequestMetrics>,
}

impl SummarizationService<BartLoader> {
    /// Build one summarizer per configured language, all placed on `device`.
    pub fn from_config(config: &HashMap<String, SummaryConfig>, device: &Device) -> Self {
        if !config.contains_key(DEFAULT_SUMMARIZER) {
            tracing::warn!("No default summarization model configured");
        }
        let summarizers = config
            .iter()
            .map(|(lang, entry)| {
                tracing::info!(lang = %lang, model = %entry.model_name, "Summarizer ready");
                (lang.clone(), Summarizer::from_config(entry, device.clone()))
            })
            .collect();
        Self::new(summarizers)
    }
}

impl<L> SummarizationService<L>
where
    L: ModelLoader + 'static,
    L::Model: Seq2SeqModel,
    L::Tokenizer: TextTokenizer,
{
    /// Wrap existing summarizers keyed by source language.
    pub fn new(summarizers: HashMap<String, Summarizer<L>>) -> Self {
        Self {
            summarizers: summarizers
                .into_iter()
                .map(|(lang, summarizer)| (lang, Arc::new(summarizer)))
                .collect(),
            metrics: Arc::new(RequestMetrics::new()),
        }
    }

    /// Summarizer for `lang`, falling back to the `default` entry.
    fn summarizer_for(&self, lang: &str) -> Result<Arc<Summarizer<L>>, SummarizationError> {
        self.summarizers
            .get(lang)
            .or_else(|| self.summarizers.get(DEFAULT_SUMMARIZER))
            .cloned()
            .ok_or_else(|| SummarizationError::NotConfigured(lang.to_string()))
    }
}

async fn run_blocking<L>(
    summarizer: Arc<Summarizer<L>>,
    text: String,
) -> Result<String, SummarizationError>
where
    L: ModelLoader + 'static,
    L::Model: Seq2SeqModel,
    L::Tokenizer: TextTokenizer,
{
    tokio::task::spawn_blocking(move || summarizer.summarize(&text))
        .await
        .map_err(|join_error| SummarizationError::Worker(join_error.to_string()))?
}

#[async_trait]
impl<L> SummarizationApi for SummarizationService<L>
where
    L: ModelLoader + 'static,
    L::Model: Seq2SeqModel,
    L::Tokenizer: TextTokenizer,
{
    async fn summarize(
        &self,
        text: String,
        src_lang: Option<String>,
    ) -> Result<String, SummarizationError> {
        let lang = src_lang.unwrap_or_else(|| DEFAULT_SUMMARIZER.to_string());
        let result = match self.summarizer_for(&lang) {
            Ok(summarizer) => run_blocking(summarizer, text).await,
            Err(error) => Err(error),
        };

        match &result {
            Ok(_) => self.metrics.record_completed(),
            Err(error) => {
                tracing::error!(lang = %lang, error = %error, "Summarization failed");
                self.metrics.record_failed();
            }
        }
        result
    }

    fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }
}
