use airunner::{
    config::{GenerationConfig, SummaryConfig, TranslationConfig},
    summarization::Summarizer,
    translation::Translator,
};
use candle_core::Device;

const LIVE_MODEL: &str = "facebook/nllb-200-distilled-600M";
const LIVE_SUMMARY_MODEL: &str = "facebook/bart-large-cnn";

fn live_translator() -> Translator {
    let model_name = std::env::var("AI_RUNNER_LIVE_MODEL").unwrap_or_else(|_| LIVE_MODEL.into());
    Translator::from_config(
        &TranslationConfig {
            model_name,
            generation_config: GenerationConfig::default(),
        },
        Device::Cpu,
    )
}

#[test]
#[ignore = "Downloads NLLB weights from the Hugging Face Hub"]
fn live_nllb_translates_a_sentence() {
    let translator = live_translator();
    let output = translator
        .translate("The weather is nice today.", "en", "fr")
        .expect("live translation");
    assert!(!output.trim().is_empty(), "empty translation");
    assert!(!output.contains('\n'), "short input must stay on one line: {output}");
}

#[test]
#[ignore = "Downloads NLLB weights from the Hugging Face Hub"]
fn live_nllb_chunks_long_documents() {
    let translator = live_translator();
    let sentence = "The committee reviewed the annual report and approved the budget. ";
    let document = sentence.repeat(40);
    let output = translator
        .translate(&document, "en", "de")
        .expect("live translation");
    assert!(output.lines().count() > 1, "long input should produce several segments");
}

#[test]
#[ignore = "Downloads BART weights from the Hugging Face Hub"]
fn live_bart_summarizes_a_paragraph() {
    let model_name =
        std::env::var("AI_RUNNER_LIVE_SUMMARY_MODEL").unwrap_or_else(|_| LIVE_SUMMARY_MODEL.into());
    let summarizer = Summarizer::from_config(
        &SummaryConfig {
            model_name,
            generation_config: GenerationConfig {
                max_length: 60,
                min_length: 10,
                num_beams: 2,
                no_repeat_ngram_size: 3,
                ..GenerationConfig::default()
            },
            max_input_tokens: 1024,
        },
        Device::Cpu,
    );
    let document = "The city council met on Tuesday to discuss the new transit plan. \
        Members debated the cost of extending the tram line to the northern suburbs. \
        After three hours, the council approved a budget of twelve million euros, \
        and construction is expected to begin next spring.";
    let summary = summarizer.summarize(document).expect("live summary");
    assert!(!summary.trim().is_empty(), "empty summary");
    assert!(summary.len() < document.len(), "summary should be shorter: {summary}");
}
