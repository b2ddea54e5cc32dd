use anyhow::{Context, Error as E, Result};
use candle_core::{DType, Device};
use candle_nn::VarBuilder;
use hf_hub::{Repo, RepoType, api::sync::Api};
use serde::de::DeserializeOwned;
use std::fmt;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use tokenizers::Tokenizer;

use super::{BartModel, M2M100Model, TextTokenizer};
use crate::pipeline::{ModelLoader, PipelineError};

const CONFIG_FILE: &str = "config.json";
const TOKENIZER_FILE: &str = "tokenizer.json";
const WEIGHTS_FILE: &str = "model.safetensors";
const DEFAULT_REVISION: &str = "main";

/// Model architecture that can be built from a `config.json` and safetensors weights.
pub trait CheckpointModel: Sized + Send + Sync {
    /// Hyperparameters read from `config.json`.
    type Config: DeserializeOwned;

    /// Build the model from `config` and the weights behind `vb`.
    fn from_checkpoint(config: &Self::Config, vb: VarBuilder) -> candle_core::Result<Self>;
}

/// Loads checkpoints of architecture `M` from a local directory or the Hugging Face Hub.
///
/// A model name that points at an existing directory is read from disk; anything else is treated
/// as a Hub repository id and fetched into the local Hub cache.
pub struct HubLoader<M = M2M100Model> {
    revision: String,
    model: PhantomData<fn() -> M>,
}

/// Loader for NLLB translation checkpoints.
pub type NllbLoader = HubLoader<M2M100Model>;
/// Loader for BART summarization checkpoints.
pub type BartLoader = HubLoader<BartModel>;

impl<M> fmt::Debug for HubLoader<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HubLoader")
            .field("revision", &self.revision)
            .finish()
    }
}

impl<M> Clone for HubLoader<M> {
    fn clone(&self) -> Self {
        Self::new(self.revision.clone())
    }
}

impl<M> Default for HubLoader<M> {
    fn default() -> Self {
        Self::new(DEFAULT_REVISION)
    }
}

impl<M> HubLoader<M> {
    /// Create a loader pinned to a Hub revision.
    pub fn new(revision: impl Into<String>) -> Self {
        Self {
            revision: revision.into(),
            model: PhantomData,
        }
    }

    fn resolve(&self, model_name: &str, file: &str) -> Result<PathBuf> {
        let local = Path::new(model_name);
        if local.is_dir() {
            let path = local.join(file);
            anyhow::ensure!(path.is_file(), "{} is missing {file}", local.display());
            return Ok(path);
        }

        let api = Api::new()?;
        let repo = api.repo(Repo::with_revision(
            model_name.to_string(),
            RepoType::Model,
            self.revision.clone(),
        ));
        repo.get(file)
            .with_context(|| format!("failed to fetch {file} from {model_name}"))
    }

}

impl<M: CheckpointModel> HubLoader<M> {
    fn load_model_files(&self, model_name: &str, device: &Device) -> Result<M> {
        let config_path = self.resolve(model_name, CONFIG_FILE)?;
        let config: M::Config = serde_json::from_str(&std::fs::read_to_string(&config_path)?)
            .with_context(|| format!("invalid model config {}", config_path.display()))?;
        let weights = self.resolve(model_name, WEIGHTS_FILE)?;

        // SAFETY: the safetensors file is memory-mapped read-only and stays untouched while the
        // model is alive.
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[weights], DType::F32, device)? };
        Ok(M::from_checkpoint(&config, vb)?)
    }
}

impl<M: CheckpointModel> ModelLoader for HubLoader<M> {
    type Model = M;
    type Tokenizer = HfTokenizer;

    fn load_model(&self, model_name: &str, device: &Device) -> Result<M, PipelineError> {
        self.load_model_files(model_name, device)
            .map_err(|source| PipelineError::ModelLoad {
                model: model_name.to_string(),
                source,
            })
    }

    fn load_tokenizer(&self, model_name: &str) -> Result<HfTokenizer, PipelineError> {
        self.resolve(model_name, TOKENIZER_FILE)
            .and_then(|path| HfTokenizer::from_file(&path))
            .map_err(|source| PipelineError::TokenizerLoad {
                model: model_name.to_string(),
                source,
            })
    }
}

/// [`TextTokenizer`] backed by a Hugging Face `tokenizer.json`.
pub struct HfTokenizer {
    inner: Tokenizer,
}

impl HfTokenizer {
    /// Wrap an already constructed tokenizer.
    pub fn new(inner: Tokenizer) -> Self {
        Self { inner }
    }

    /// Read a `tokenizer.json` file.
    pub fn from_file(path: &Path) -> Result<Self> {
        Tokenizer::from_file(path).map(Self::new).map_err(E::msg)
    }
}

impl TextTokenizer for HfTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>, PipelineError> {
        self.inner
            .encode(text, false)
            .map(|encoding| encoding.get_ids().to_vec())
            .map_err(|err| PipelineError::Tokenization(err.to_string()))
    }

    fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<String, PipelineError> {
        self.inner
            .decode(ids, skip_special_tokens)
            .map_err(|err| PipelineError::Tokenization(err.to_string()))
    }

    fn token_to_id(&self, token: &str) -> Option<u32> {
        self.inner.token_to_id(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn scratch_dir(name: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock after epoch")
            .as_nanos();
        let dir = std::env::temp_dir().join(format!("ai-runner-{name}-{nanos}"));
        std::fs::create_dir_all(&dir).expect("create scratch dir");
        dir
    }

    #[test]
    fn local_directory_missing_tokenizer_reports_the_file() {
        let dir = scratch_dir("missing-tokenizer");
        let model_name = dir.to_string_lossy().into_owned();

        let error = match NllbLoader::default().load_tokenizer(&model_name) {
            Err(error) => error,
            Ok(_) => panic!("tokenizer should not load from an empty directory"),
        };
        assert!(matches!(error, PipelineError::TokenizerLoad { .. }));
        assert!(error.to_string().contains(TOKENIZER_FILE));

        std::fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn local_directory_with_invalid_config_fails_model_load() {
        let dir = scratch_dir("invalid-config");
        std::fs::write(dir.join(CONFIG_FILE), "{ not json").expect("write config");
        let model_name = dir.to_string_lossy().into_owned();

        let error = match NllbLoader::default().load_model(&model_name, &Device::Cpu) {
            Err(error) => error,
            Ok(_) => panic!("model should not load from an invalid config"),
        };
        assert!(matches!(error, PipelineError::ModelLoad { .. }));

        std::fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn bart_loader_reports_missing_weights() {
        let dir = scratch_dir("missing-weights");
        std::fs::write(
            dir.join(CONFIG_FILE),
            r#"{"vocab_size": 16, "d_model": 8, "encoder_layers": 1, "decoder_layers": 1,
                "encoder_attention_heads": 2, "decoder_attention_heads": 2,
                "encoder_ffn_dim": 16, "decoder_ffn_dim": 16}"#,
        )
        .expect("write config");
        let model_name = dir.to_string_lossy().into_owned();

        let error = match BartLoader::default().load_model(&model_name, &Device::Cpu) {
            Err(error) => error,
            Ok(_) => panic!("model should not load without weights"),
        };
        assert!(error.to_string().contains(WEIGHTS_FILE));

        std::fs::remove_dir_all(dir).ok();
    }
}
