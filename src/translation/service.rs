//! Async facade that runs blocking translations off the runtime and records outcomes.

use crate::{
    config::TranslationConfig,
    metrics::{MetricsSnapshot, RequestMetrics},
    models::{NllbLoader, Seq2SeqModel, TextTokenizer},
    pipeline::ModelLoader,
    translation::{TranslationError, Translator},
};
use async_trait::async_trait;
use candle_core::Device;
use std::sync::Arc;

/// Abstraction over the translator used by external surfaces.
#[async_trait]
pub trait TranslationApi: Send + Sync {
    /// Translate `text` from `src_lang` to `tgt_lang`.
    async fn translate(
        &self,
        text: String,
        src_lang: String,
        tgt_lang: String,
    ) -> Result<String, TranslationError>;

    /// Retrieve the current metrics snapshot for diagnostics.
    fn metrics_snapshot(&self) -> MetricsSnapshot;
}

/// Shares one translator across requests and runs each generation on the blocking pool.
///
/// Construct the service once near process start and share it through an `Arc`.
pub struct TranslationService<L: ModelLoader = NllbLoader> {
    translator: Arc<Translator<L>>,
    metrics: Arc<RequestMetrics>,
}

impl TranslationService<NllbLoader> {
    /// Build the service from the translation section. The model itself loads on first use.
    pub fn from_config(config: &TranslationConfig, device: &Device) -> Self {
        tracing::info!(model = %config.model_name, "Translation service ready");
        Self::new(Translator::from_config(config, device.clone()))
    }
}

impl<L> TranslationService<L>
where
    L: ModelLoader + 'static,
    L::Model: Seq2SeqModel,
    L::Tokenizer: TextTokenizer,
{
    /// Wrap an existing translator.
    pub fn new(translator: Translator<L>) -> Self {
        Self {
            translator: Arc::new(translator),
            metrics: Arc::new(RequestMetrics::new()),
        }
    }
}

#[async_trait]
impl<L> TranslationApi for TranslationService<L>
where
    L: ModelLoader + 'static,
    L::Model: Seq2SeqModel,
    L::Tokenizer: TextTokenizer,
{
    async fn translate(
        &self,
        text: String,
        src_lang: String,
        tgt_lang: String,
    ) -> Result<String, TranslationError> {
        let translator = Arc::clone(&self.translator);
        let result = match tokio::task::spawn_blocking(move || {
            translator.translate(&text, &src_lang, &tgt_lang)
        })
        .await
        {
            Ok(result) => result,
            Err(join_error) => Err(TranslationError::Worker(join_error.to_string())),
        };

        match &result {
            Ok(_) => self.metrics.record_completed(),
            Err(error) if error.is_client_error() => {
                tracing::debug!(error = %error, "Rejected translation request");
                self.metrics.record_rejected();
            }
            Err(error) => {
                tracing::error!(error = %error, "Translation failed");
                self.metrics.record_failed();
            }
        }
        result
    }

    fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }
}
