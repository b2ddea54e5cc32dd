//! Registry mapping short language codes to NLLB locale tags.
//!
//! Lookups are exact and case-sensitive. The Norwegian entries are intentionally crossed
//! (`nb` maps to Nynorsk and `nn` to Bokmål) so that existing clients keep receiving the
//! output they were built against.

use once_cell::sync::Lazy;
use std::collections::HashMap;

use super::TranslationError;

/// NLLB locale tag such as `eng_Latn`.
pub type LocaleTag = &'static str;

/// Supported `(code, locale)` pairs, ordered by code.
const LANGUAGE_CODES: &[(&str, LocaleTag)] = &[
    ("ar", "arb_Arab"),
    ("bg", "bul_Cyrl"),
    ("ca", "cat_Latn"),
    ("cs", "ces_Latn"),
    ("da", "dan_Latn"),
    ("de", "deu_Latn"),
    ("el", "ell_Grek"),
    ("en", "eng_Latn"),
    ("es", "spa_Latn"),
    ("et", "est_Latn"),
    ("fa", "pes_Arab"),
    ("fi", "fin_Latn"),
    ("fr", "fra_Latn"),
    ("he", "heb_Hebr"),
    ("hi", "hin_Deva"),
    ("hr", "hrv_Latn"),
    ("hu", "hun_Latn"),
    ("id", "ind_Latn"),
    ("it", "ita_Latn"),
    ("ja", "jpn_Jpan"),
    ("ko", "kor_Hang"),
    ("lt", "lit_Latn"),
    ("lv", "lvs_Latn"),
    ("nb", "nno_Latn"),
    ("nl", "nld_Latn"),
    ("nn", "nob_Latn"),
    ("pl", "pol_Latn"),
    ("pt", "por_Latn"),
    ("ro", "ron_Latn"),
    ("ru", "rus_Cyrl"),
    ("sk", "slk_Latn"),
    ("sl", "slv_Latn"),
    ("sr", "srp_Cyrl"),
    ("sv", "swe_Latn"),
    ("th", "tha_Thai"),
    ("tr", "tur_Latn"),
    ("uk", "ukr_Cyrl"),
    ("vi", "vie_Latn"),
    ("zh", "zho_Hans"),
];

static BY_CODE: Lazy<HashMap<&'static str, LocaleTag>> =
    Lazy::new(|| LANGUAGE_CODES.iter().copied().collect());

static BY_LOCALE: Lazy<HashMap<LocaleTag, &'static str>> = Lazy::new(|| {
    LANGUAGE_CODES
        .iter()
        .map(|&(code, locale)| (locale, code))
        .collect()
});

/// Resolve a short code to its locale tag.
pub fn resolve(code: &str) -> Result<LocaleTag, TranslationError> {
    BY_CODE
        .get(code)
        .copied()
        .ok_or_else(|| TranslationError::UnsupportedLanguage(code.to_string()))
}

/// Reverse lookup from locale tag to short code.
pub fn code_for(locale: &str) -> Option<&'static str> {
    BY_LOCALE.get(locale).copied()
}

/// Every supported `(code, locale)` pair, ordered by code.
pub fn supported_languages() -> &'static [(&'static str, LocaleTag)] {
    LANGUAGE_CODES
}
