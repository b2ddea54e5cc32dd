use candle_core::Device;
use once_cell::sync::OnceCell;
use std::time::Instant;

use super::{PipelineError, device_label};

/// Source of model weights and tokenizers for a pipeline.
///
/// Loaders run on the calling thread and may block on disk or network I/O.
pub trait ModelLoader: Send + Sync {
    /// Loaded model type.
    type Model: Send + Sync;
    /// Loaded tokenizer type.
    type Tokenizer: Send + Sync;

    /// Load the model named `model_name` and place it on `device`.
    fn load_model(&self, model_name: &str, device: &Device) -> Result<Self::Model, PipelineError>;

    /// Load the tokenizer matching `model_name`.
    fn load_tokenizer(&self, model_name: &str) -> Result<Self::Tokenizer, PipelineError>;
}

/// Lazily populated model and tokenizer for one pipeline instance.
///
/// Each slot is filled at most once. Concurrent first callers block until the winning load
/// finishes and then share its result. A failed load leaves the slot empty, so the next call
/// retries.
pub struct ModelSlots<L: ModelLoader> {
    model_name: String,
    device: Device,
    loader: L,
    model: OnceCell<L::Model>,
    tokenizer: OnceCell<L::Tokenizer>,
}

impl<L: ModelLoader> ModelSlots<L> {
    /// Create empty slots for `model_name` targeting `device`.
    pub fn new(model_name: impl Into<String>, device: Device, loader: L) -> Self {
        Self {
            model_name: model_name.into(),
            device,
            loader,
            model: OnceCell::new(),
            tokenizer: OnceCell::new(),
        }
    }

    /// Model identifier handed to the loader.
    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    /// Device the model is placed on.
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Return the model, loading it on first use.
    pub fn acquire_model(&self) -> Result<&L::Model, PipelineError> {
        self.model.get_or_try_init(|| {
            let started = Instant::now();
            tracing::info!(
                model = %self.model_name,
                device = device_label(&self.device),
                "Loading model"
            );
            let model = self.loader.load_model(&self.model_name, &self.device)?;
            tracing::info!(
                model = %self.model_name,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Model loaded"
            );
            Ok(model)
        })
    }

    /// Return the tokenizer, loading it on first use.
    pub fn acquire_tokenizer(&self) -> Result<&L::Tokenizer, PipelineError> {
        self.tokenizer.get_or_try_init(|| {
            tracing::info!(model = %self.model_name, "Loading tokenizer");
            self.loader.load_tokenizer(&self.model_name)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    #[derive(Default)]
    struct LoadCounts {
        model: AtomicUsize,
        tokenizer: AtomicUsize,
    }

    impl LoadCounts {
        fn models(&self) -> usize {
            self.model.load(Ordering::SeqCst)
        }

        fn tokenizers(&self) -> usize {
            self.tokenizer.load(Ordering::SeqCst)
        }
    }

    #[derive(Default)]
    struct CountingLoader {
        counts: Arc<LoadCounts>,
        failures_remaining: AtomicUsize,
    }

    impl CountingLoader {
        fn failing_first(failures: usize) -> Self {
            Self {
                failures_remaining: AtomicUsize::new(failures),
                ..Self::default()
            }
        }
    }

    fn slots(loader: CountingLoader) -> (ModelSlots<CountingLoader>, Arc<LoadCounts>) {
        let counts = Arc::clone(&loader.counts);
        (ModelSlots::new("demo", Device::Cpu, loader), counts)
    }

    impl ModelLoader for CountingLoader {
        type Model = String;
        type Tokenizer = usize;

        fn load_model(&self, model_name: &str, _device: &Device) -> Result<String, PipelineError> {
            self.counts.model.fetch_add(1, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(20));
            let remaining = self.failures_remaining.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures_remaining.store(remaining - 1, Ordering::SeqCst);
                return Err(PipelineError::ModelLoad {
                    model: model_name.to_string(),
                    source: anyhow::anyhow!("weights unavailable"),
                });
            }
            Ok(format!("weights:{model_name}"))
        }

        fn load_tokenizer(&self, _model_name: &str) -> Result<usize, PipelineError> {
            Ok(self.counts.tokenizer.fetch_add(1, Ordering::SeqCst))
        }
    }

    #[test]
    fn concurrent_first_use_loads_model_once() {
        let (slots, counts) = slots(CountingLoader::default());

        let addresses: Vec<usize> = thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    scope.spawn(|| {
                        let model = slots.acquire_model().expect("model loads");
                        model as *const String as usize
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| handle.join().expect("thread completes"))
                .collect()
        });

        assert_eq!(counts.models(), 1);
        assert!(addresses.windows(2).all(|pair| pair[0] == pair[1]));
        assert_eq!(slots.acquire_model().expect("cached model"), "weights:demo");
        assert_eq!(counts.models(), 1);
    }

    #[test]
    fn failed_load_is_retried_on_next_acquire() {
        let (slots, counts) = slots(CountingLoader::failing_first(1));

        let error = slots.acquire_model().expect_err("first load fails");
        assert!(matches!(error, PipelineError::ModelLoad { .. }));

        assert_eq!(slots.acquire_model().expect("second load"), "weights:demo");
        assert_eq!(slots.acquire_model().expect("cached model"), "weights:demo");
        assert_eq!(counts.models(), 2);
    }

    #[test]
    fn tokenizer_slot_is_independent_of_model_slot() {
        let (slots, counts) = slots(CountingLoader::default());

        assert_eq!(*slots.acquire_tokenizer().expect("tokenizer"), 0);
        assert_eq!(*slots.acquire_tokenizer().expect("cached tokenizer"), 0);
        assert_eq!(counts.tokenizers(), 1);
        assert_eq!(counts.models(), 0);
    }
}
