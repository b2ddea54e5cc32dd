//! HTTP surface for the AI runner.
//!
//! This module exposes a compact Axum router with a handful of endpoints:
//!
//! - `POST /translate` – Translate a form-encoded document (`doc`, `src_lang`, `tgt_lang`) and
//!   return `{ "translation": string }`. Long documents are chunked at sentence boundaries and
//!   the translated chunks are joined with newlines.
//! - `POST /summarize` – Summarize a form-encoded document (`doc`, optional `src_lang`) and
//!   return `{ "summary": string }`. Languages without their own model use the `default` one.
//! - `GET /languages` – List the supported short codes and their model locale tags.
//! - `GET /metrics` – Observe translation and summarization counters.
//! - `GET /health` – Liveness check; never requires authentication.
//!
//! When the configuration carries an `auth` section, every route except `/health` requires an
//! `Authorization: Bearer <token>` header matching one of the configured tokens.

use crate::config::AuthConfig;
use crate::metrics::MetricsSnapshot;
use crate::summarization::{SummarizationApi, SummarizationError};
use crate::translation::{TranslationApi, TranslationError, languages};
use axum::{
    Form, Json, Router,
    extract::{Request, State},
    http::{StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

const UNAUTHORIZED: &str = "Error: Unauthorized";
const MISSING_CONTENT: &str = "Error: Missing file content";

/// Services shared by the protected handlers.
struct AppState<T, S> {
    translator: Arc<T>,
    summarizer: Arc<S>,
}

impl<T, S> Clone for AppState<T, S> {
    fn clone(&self) -> Self {
        Self {
            translator: Arc::clone(&self.translator),
            summarizer: Arc::clone(&self.summarizer),
        }
    }
}

/// Build the HTTP router exposing the translation and summarization API surface.
pub fn create_router<T, S>(
    translator: Arc<T>,
    summarizer: Arc<S>,
    auth: Option<AuthConfig>,
) -> Router
where
    T: TranslationApi + 'static,
    S: SummarizationApi + 'static,
{
    let mut protected = Router::new()
        .route("/translate", post(translate_document::<T, S>))
        .route("/summarize", post(summarize_document::<T, S>))
        .route("/languages", get(list_languages))
        .route("/metrics", get(get_metrics::<T, S>))
        .with_state(AppState {
            translator,
            summarizer,
        });

    if let Some(auth) = auth {
        tracing::info!(tokens = auth.api_tokens.len(), "Bearer token authentication enabled");
        let tokens = Arc::new(auth.api_tokens);
        protected =
            protected.route_layer(middleware::from_fn_with_state(tokens, require_bearer_token));
    }

    Router::new()
        .route("/health", get(health_check))
        .merge(protected)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Reject requests whose bearer token is not in the configured set.
async fn require_bearer_token(
    State(tokens): State<Arc<Vec<String>>>,
    request: Request,
    next: Next,
) -> Response {
    let authorized = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .is_some_and(|token| tokens.iter().any(|accepted| accepted == token.trim()));

    if authorized {
        return next.run(request).await;
    }
    tracing::debug!(path = %request.uri().path(), "Rejected unauthenticated request");
    (StatusCode::UNAUTHORIZED, UNAUTHORIZED).into_response()
}

/// Form body for the `POST /translate` endpoint.
#[derive(Deserialize)]
struct TranslateForm {
    /// Document text to translate.
    #[serde(default)]
    doc: Option<String>,
    /// Short code of the source language.
    #[serde(default)]
    src_lang: Option<String>,
    /// Short code of the target language.
    #[serde(default)]
    tgt_lang: Option<String>,
}

/// Success response for the `POST /translate` endpoint.
#[derive(Serialize)]
struct TranslateResponse {
    translation: String,
}

/// Translate a document.
async fn translate_document<T, S>(
    State(state): State<AppState<T, S>>,
    Form(form): Form<TranslateForm>,
) -> Result<Json<TranslateResponse>, AppError>
where
    T: TranslationApi,
    S: SummarizationApi,
{
    let text = form.doc.ok_or(AppError::BadRequest(MISSING_CONTENT))?;
    let src_lang = form
        .src_lang
        .ok_or(AppError::BadRequest("Error: Missing source language"))?;
    let tgt_lang = form
        .tgt_lang
        .ok_or(AppError::BadRequest("Error: Missing target language"))?;

    let characters = text.chars().count();
    let translation = state
        .translator
        .translate(text, src_lang.clone(), tgt_lang.clone())
        .await?;
    tracing::info!(
        src = %src_lang,
        tgt = %tgt_lang,
        characters,
        "Translate request completed"
    );
    Ok(Json(TranslateResponse { translation }))
}

/// Form body for the `POST /summarize` endpoint.
#[derive(Deserialize)]
struct SummarizeForm {
    /// Document text to summarize.
    #[serde(default)]
    doc: Option<String>,
    /// Language selecting the summarization model.
    #[serde(default)]
    src_lang: Option<String>,
}

/// Success response for the `POST /summarize` endpoint.
#[derive(Serialize)]
struct SummarizeResponse {
    summary: String,
}

/// Summarize a document.
async fn summarize_document<T, S>(
    State(state): State<AppState<T, S>>,
    Form(form): Form<SummarizeForm>,
) -> Result<Json<SummarizeResponse>, AppError>
where
    T: TranslationApi,
    S: SummarizationApi,
{
    let text = form.doc.ok_or(AppError::BadRequest(MISSING_CONTENT))?;

    let characters = text.chars().count();
    let summary = state.summarizer.summarize(text, form.src_lang).await?;
    tracing::info!(characters, "Summarize request completed");
    Ok(Json(SummarizeResponse { summary }))
}

/// Entry of the `GET /languages` response.
#[derive(Serialize)]
struct LanguageEntry {
    code: &'static str,
    locale: &'static str,
}

/// Response body for `GET /languages`.
#[derive(Serialize)]
struct LanguagesResponse {
    languages: Vec<LanguageEntry>,
}

/// List supported languages.
async fn list_languages() -> Json<LanguagesResponse> {
    Json(LanguagesResponse {
        languages: languages::supported_languages()
            .iter()
            .map(|&(code, locale)| LanguageEntry { code, locale })
            .collect(),
    })
}

/// Response body for `GET /metrics`.
#[derive(Serialize)]
struct MetricsResponse {
    translation: MetricsSnapshot,
    summarization: MetricsSnapshot,
}

/// Return the request counters of both services.
async fn get_metrics<T, S>(State(state): State<AppState<T, S>>) -> Json<MetricsResponse>
where
    T: TranslationApi,
    S: SummarizationApi,
{
    Json(MetricsResponse {
        translation: state.translator.metrics_snapshot(),
        summarization: state.summarizer.metrics_snapshot(),
    })
}

async fn health_check() -> &'static str {
    "OK"
}

enum AppError {
    BadRequest(&'static str),
    Translation(TranslationError),
    Summarization(SummarizationError),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            Self::BadRequest(message) => (StatusCode::BAD_REQUEST, message).into_response(),
            Self::Translation(error) if error.is_client_error() => {
                (StatusCode::BAD_REQUEST, format!("Error: {error}")).into_response()
            }
            Self::Translation(error) => {
                (StatusCode::INTERNAL_SERVER_ERROR, error.to_string()).into_response()
            }
            Self::Summarization(error) => {
                (StatusCode::INTERNAL_SERVER_ERROR, error.to_string()).into_response()
            }
        }
    }
}

impl From<TranslationError> for AppError {
    fn from(inner: TranslationError) -> Self {
        Self::Translation(inner)
    }
}

impl From<SummarizationError> for AppError {
    fn from(inner: SummarizationError) -> Self {
        Self::Summarization(inner)
    }
}
