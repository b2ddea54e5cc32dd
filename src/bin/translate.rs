//! Command-line translation entrypoint.
//!
//! Runs the same chunked translator as the HTTP server without starting it. Text comes from
//! `--text` or stdin and the translation is printed on stdout; logs go to stderr and the log file.
use airunner::{
    config::{self, Config, DevicePreference, GenerationConfig, TranslationConfig},
    logging,
    pipeline::select_device,
    translation::Translator,
};
use anyhow::{Context, Result};
use clap::Parser;
use std::io::Read;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "translate", about = "Translate text with an NLLB model")]
struct Cli {
    /// Short code of the source language (for example `en`).
    #[arg(long)]
    src: String,
    /// Short code of the target language (for example `fr`).
    #[arg(long)]
    tgt: String,
    /// Text to translate; read from stdin when omitted.
    #[arg(long)]
    text: Option<String>,
    /// JSON configuration file providing the `translation` section.
    #[arg(long, default_value = "config.json")]
    config: PathBuf,
    /// Model repository id or local directory overriding the configuration file.
    #[arg(long)]
    model: Option<String>,
    /// Override `generation_config.max_length`.
    #[arg(long)]
    max_length: Option<usize>,
    /// Override `generation_config.num_beams`.
    #[arg(long)]
    num_beams: Option<usize>,
    /// Force CPU execution.
    #[arg(long)]
    cpu: bool,
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    logging::init_cli_tracing(&config::log_file_from_env());
    let cli = Cli::parse();

    let (mut translation, preference) = match cli.model.clone() {
        Some(model_name) => (
            TranslationConfig {
                model_name,
                generation_config: GenerationConfig::default(),
            },
            DevicePreference::Auto,
        ),
        None => {
            let config = Config::from_path(&cli.config)
                .with_context(|| format!("failed to load {}", cli.config.display()))?;
            (config.translation, config.device)
        }
    };
    if let Some(max_length) = cli.max_length {
        translation.generation_config.max_length = max_length;
    }
    if let Some(num_beams) = cli.num_beams {
        translation.generation_config.num_beams = num_beams;
    }
    let preference = if cli.cpu { DevicePreference::Cpu } else { preference };

    let text = match cli.text {
        Some(text) => text,
        None => {
            let mut buffer = String::new();
            std::io::stdin()
                .read_to_string(&mut buffer)
                .context("failed to read text from stdin")?;
            buffer
        }
    };
    let text = text.trim();
    anyhow::ensure!(!text.is_empty(), "no text to translate");

    let device = select_device(preference)?;
    let translator = Translator::from_config(&translation, device);
    let output = translator
        .translate(text, &cli.src, &cli.tgt)
        .with_context(|| format!("failed to translate {} -> {}", cli.src, cli.tgt))?;
    println!("{output}");
    Ok(())
}
