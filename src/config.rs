use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use thiserror::Error;

const DEFAULT_CONFIG_PATH: &str = "config.json";
const DEFAULT_LOG_FILE: &str = "logs/ai-runner.log";
const DEFAULT_MAX_LENGTH: usize = 200;
const DEFAULT_MAX_INPUT_TOKENS: usize = 1024;
const FALLBACK_PORTS: RangeInclusive<u16> = 5000..=5099;

/// Errors encountered while loading configuration from the environment and config file.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Environment variable contained a value that could not be parsed.
    #[error("Invalid value for environment variable: {0}")]
    InvalidValue(String),
    /// Configuration file could not be read.
    #[error("Failed to read config file {}: {source}", .path.display())]
    Io {
        /// Path we attempted to read.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// Configuration file was not valid JSON or missed required sections.
    #[error("Failed to parse config file {}: {source}", .path.display())]
    Parse {
        /// Path of the offending file.
        path: PathBuf,
        /// Underlying deserialization error.
        #[source]
        source: serde_json::Error,
    },
}

/// Runtime configuration for the AI runner.
#[derive(Debug, Clone)]
pub struct Config {
    /// Location of the JSON file the model sections were read from.
    pub config_path: PathBuf,
    /// Translation model and generation parameters.
    pub translation: TranslationConfig,
    /// Summarization models keyed by source language, with a `default` fallback entry.
    pub summary: HashMap<String, SummaryConfig>,
    /// Optional bearer-token authentication for protected routes.
    pub auth: Option<AuthConfig>,
    /// Optional override for the HTTP server port.
    pub server_port: Option<u16>,
    /// Compute device preference for model placement.
    pub device: DevicePreference,
    /// File mirroring the process logs.
    pub log_file: PathBuf,
}

/// Sections of the JSON configuration file understood by this server.
///
/// Unknown sections are ignored so that a file shared with other services still loads.
#[derive(Debug, Clone, Deserialize)]
pub struct FileConfig {
    /// Optional authentication section; routes stay open when absent.
    #[serde(default)]
    pub auth: Option<AuthConfig>,
    /// Summarization models keyed by source language.
    #[serde(default)]
    pub summary: HashMap<String, SummaryConfig>,
    /// Translation model section.
    pub translation: TranslationConfig,
}

/// Model identifier and generation parameters for the translator.
#[derive(Debug, Clone, Deserialize)]
pub struct TranslationConfig {
    /// Hugging Face Hub repository id or local model directory.
    pub model_name: String,
    /// Parameters forwarded to the model's generation routine.
    #[serde(default)]
    pub generation_config: GenerationConfig,
}

/// Model identifier and generation parameters for one summarizer.
#[derive(Debug, Clone, Deserialize)]
pub struct SummaryConfig {
    /// Hugging Face Hub repository id or local model directory.
    pub model_name: String,
    /// Parameters forwarded to the model's generation routine.
    #[serde(default)]
    pub generation_config: GenerationConfig,
    /// Longest encoder input; longer documents are truncated.
    #[serde(default = "default_max_input_tokens")]
    pub max_input_tokens: usize,
}

fn default_max_input_tokens() -> usize {
    DEFAULT_MAX_INPUT_TOKENS
}

/// Generation parameters applied uniformly to every row of a request.
///
/// Parameters the generation loop does not implement are rejected when the file is parsed.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GenerationConfig {
    /// Maximum decoder length, including the decoder start token.
    pub max_length: usize,
    /// Number of tokens to generate after the decoder start token; overrides `max_length`.
    pub max_new_tokens: Option<usize>,
    /// End-of-sequence is suppressed until a row reaches this length.
    pub min_length: usize,
    /// Beam count; `1` selects greedy decoding.
    pub num_beams: usize,
    /// Exponent applied to hypothesis length when ranking finished beams.
    pub length_penalty: f32,
    /// Stop beam search as soon as every input row has `num_beams` finished hypotheses.
    pub early_stopping: bool,
    /// Optional penalty applied to logits of tokens already generated.
    pub repetition_penalty: Option<f32>,
    /// Forbid repeating any n-gram of this size within a row; `0` disables the check.
    pub no_repeat_ngram_size: usize,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_length: DEFAULT_MAX_LENGTH,
            max_new_tokens: None,
            min_length: 0,
            num_beams: 1,
            length_penalty: 1.0,
            early_stopping: false,
            repetition_penalty: None,
            no_repeat_ngram_size: 0,
        }
    }
}

/// Static bearer tokens accepted by the protected HTTP routes.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthConfig {
    /// Accepted `Authorization: Bearer <token>` values.
    #[serde(default)]
    pub api_tokens: Vec<String>,
}

/// Where models should be placed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DevicePreference {
    /// Fastest available accelerator, falling back to the CPU.
    #[default]
    Auto,
    /// Always use the CPU.
    Cpu,
}

impl Config {
    /// Load configuration from environment variables and the file named by `CONFIG_PATH`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let config_path = load_env_optional("CONFIG_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
        Self::from_path(&config_path)
    }

    /// Load configuration from an explicit file, still honoring environment overrides.
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let FileConfig {
            auth,
            summary,
            translation,
        } = FileConfig::load(path)?;
        Ok(Self {
            config_path: path.to_path_buf(),
            translation,
            summary,
            auth,
            server_port: parse_env("SERVER_PORT")?,
            device: parse_env("AI_RUNNER_DEVICE")?.unwrap_or_default(),
            log_file: log_file_from_env(),
        })
    }

    /// Ports the server may bind, tried in order.
    ///
    /// A configured `SERVER_PORT` is the only candidate; otherwise the first free port of
    /// `5000..=5099` wins.
    pub fn listen_ports(&self) -> RangeInclusive<u16> {
        match self.server_port {
            Some(port) => port..=port,
            None => FALLBACK_PORTS,
        }
    }
}

impl FileConfig {
    /// Read and parse a JSON configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Parse configuration from a JSON string.
    pub fn parse(contents: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(contents)
    }
}

/// Log file named by `AI_RUNNER_LOG_FILE`, or `logs/ai-runner.log`.
///
/// Shared by the server and the command-line tools so both write to the same place.
pub fn log_file_from_env() -> PathBuf {
    load_env_optional("AI_RUNNER_LOG_FILE")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_LOG_FILE))
}

fn load_env_optional(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Result<Option<T>, ConfigError> {
    load_env_optional(key)
        .map(|value| {
            value
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidValue(key.into()))
        })
        .transpose()
}

impl std::str::FromStr for DevicePreference {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "cpu" => Ok(Self::Cpu),
            _ => Err(()),
        }
    }
}

/// Global configuration cache populated during process start.
pub static CONFIG: OnceLock<Config> = OnceLock::new();

/// Retrieve the loaded configuration, panicking if initialization has not occurred.
pub fn get_config() -> &'static Config {
    CONFIG.get().expect("Config not initialized")
}

/// Load configuration from the environment and install it in the global cache.
pub fn init_config() {
    dotenvy::dotenv().ok();
    let config = Config::from_env().expect("Failed to load configuration");
    CONFIG.set(config).expect("Failed to set config");
}
