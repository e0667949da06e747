use crate::app::AppState;
use crate::auth::AuthResult;
use crate::config::ModelConfig;
use crate::context::AbortOnDrop;
use crate::dispatch::DispatchOutcome;
use crate::envelope::Envelope;
use crate::error::{AppError, AppResult, DispatchError};
use crate::relay::ClientSink;
use crate::selector::select_candidates;
use crate::validation::validate_chat_request;
use axum::Json;
use axum::body::Body;
use axum::extract::State;
use axum::http::header::{CACHE_CONTROL, CONTENT_TYPE};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use chrono::{SecondsFormat, Utc};
use futures_util::StreamExt;
use serde::Serialize;
use serde_json::{Value, json};
use std::collections::HashSet;
use std::convert::Infallible;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;

const CLIENT_BUFFER: usize = 64;
const PROVIDER_HEADER: &str = "provider";
const JSON_CONTENT_TYPE: &str = "application/json; charset=utf-8";

pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    state.metrics.render()
}

pub async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "time": Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
    }))
}

#[derive(Debug, Serialize)]
struct DisplayModel {
    id: String,
    name: String,
    object: &'static str,
    description: String,
    supported_parameters: Vec<String>,
    #[serde(skip_serializing_if = "is_zero")]
    context_length: u64,
    #[serde(skip_serializing_if = "is_zero")]
    max_completion_tokens: u64,
    architecture: Architecture,
    pricing: Pricing,
}

#[derive(Debug, Serialize)]
struct Architecture {
    modality: String,
    input_modalities: Vec<&'static str>,
    output_modalities: Vec<&'static str>,
}

#[derive(Debug, Serialize)]
struct Pricing {
    prompt: String,
    completion: String,
}

fn is_zero(v: &u64) -> bool {
    *v == 0
}

/// Renders a per-token price with at most ten decimals and no trailing zeros.
fn format_price(price: f64) -> String {
    let fixed = format!("{price:.10}");
    fixed
        .trim_end_matches('0')
        .trim_end_matches('.')
        .to_string()
}

fn display_model(model: &ModelConfig) -> DisplayModel {
    let mut input_modalities = Vec::new();
    let mut output_modalities = Vec::new();
    if model.supports_completion {
        input_modalities.push("text");
        output_modalities.push("text");
    } else if model.supports_image_gen {
        input_modalities.push("text");
        output_modalities.push("image");
    }
    if model.supports_input_image {
        input_modalities.push("image");
    }
    let modality = format!(
        "{}->{}",
        input_modalities.join("+"),
        output_modalities.join("+")
    );

    DisplayModel {
        id: model.name.clone(),
        name: model.display_name.clone(),
        object: "model",
        description: model.description.clone(),
        supported_parameters: model.supported_parameters.clone(),
        context_length: model.context_length,
        max_completion_tokens: model.max_tokens,
        architecture: Architecture {
            modality,
            input_modalities,
            output_modalities,
        },
        pricing: Pricing {
            prompt: format_price(model.input_price_per_token),
            completion: format_price(model.output_price_per_token),
        },
    }
}

pub async fn list_models(State(state): State<AppState>) -> Json<Value> {
    let mut seen = HashSet::new();
    let data: Vec<DisplayModel> = state
        .config
        .models
        .iter()
        .filter(|m| m.enabled && m.visible)
        .filter(|m| seen.insert(m.name.as_str()))
        .map(display_model)
        .collect();
    Json(json!({ "object": "list", "data": data }))
}

/// Pulls the provider filter out of the body (`provider`, string or array) or, when
/// the body has none, out of the comma-separated `Provider` header. Array entries and
/// header values are lower-cased; a single string is used as sent.
fn take_provider_filters(envelope: &mut Envelope, headers: &HeaderMap) -> Vec<String> {
    let normalize = |raw: &str| raw.trim().to_lowercase();
    let filters: Vec<String> = match envelope.delete("provider") {
        Some(Value::String(one)) => vec![one],
        Some(Value::Array(many)) => many
            .iter()
            .filter_map(Value::as_str)
            .map(normalize)
            .collect(),
        Some(_) => Vec::new(),
        None => headers
            .get(PROVIDER_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(|raw| raw.split(',').map(normalize).collect())
            .unwrap_or_default(),
    };
    filters.into_iter().filter(|f| !f.is_empty()).collect()
}

fn log_outcome(caller: &AuthResult, outcome: &DispatchOutcome, stream: bool) {
    tracing::debug!(
        api_key_id = caller.key_id,
        api_key_name = %caller.key_name,
        model = %outcome.model,
        upstream_model = %outcome.upstream_model,
        attempts = outcome.attempts,
        stream,
        prompt_tokens = outcome.usage.prompt_tokens,
        completion_tokens = outcome.usage.completion_tokens,
        total_tokens = outcome.usage.total_tokens,
        cached_tokens = outcome.usage.prompt_tokens_details.cached_tokens,
        reasoning_tokens = outcome.usage.completion_tokens_details.reasoning_tokens,
        "chat completion served"
    );
}

pub async fn create_chat_completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<Response> {
    let caller = state.auth.authenticate(&headers)?;
    let mut envelope = Envelope::from_slice(&body).map_err(|err| {
        DispatchError::RequestMalformed(format!("Invalid request body: {err}"))
    })?;
    let filters = take_provider_filters(&mut envelope, &headers);
    validate_chat_request(&envelope)?;

    let model_name = envelope.get_str("model").unwrap_or_default().to_string();
    let selection = select_candidates(
        &state.config.models,
        &model_name,
        &filters,
        state.rotation.as_ref(),
    )?;
    let stream = envelope.get_bool("stream").unwrap_or(false);
    tracing::debug!(
        model = %model_name,
        load_balance_key = %selection.load_balance_key,
        start = selection.start,
        candidates = selection.candidates.len(),
        stream,
        "dispatching chat completion"
    );

    if stream {
        return stream_chat_completion(state, caller, selection.candidates, envelope).await;
    }

    let (outcome, body) = state
        .dispatcher
        .dispatch(&selection.candidates, &envelope)
        .await?;
    log_outcome(&caller, &outcome, false);
    Ok(([(CONTENT_TYPE, JSON_CONTENT_TYPE)], body).into_response())
}

fn event_stream(rx: mpsc::Receiver<Bytes>) -> Response {
    let body = Body::from_stream(ReceiverStream::new(rx).map(Ok::<_, Infallible>));
    (
        [
            (CONTENT_TYPE, "text/event-stream"),
            (CACHE_CONTROL, "no-cache"),
        ],
        body,
    )
        .into_response()
}

/// Runs streaming dispatch on its own task. The response is returned as soon as the
/// first byte is ready; if every candidate fails before that, the caller gets a
/// regular JSON error with the right status instead.
async fn stream_chat_completion(
    state: AppState,
    caller: AuthResult,
    candidates: Vec<ModelConfig>,
    envelope: Envelope,
) -> AppResult<Response> {
    let (tx, rx) = mpsc::channel::<Bytes>(CLIENT_BUFFER);
    let (commit_tx, commit_rx) = oneshot::channel();
    let dispatcher = state.dispatcher.clone();
    let mut task = AbortOnDrop::new(tokio::spawn(async move {
        let sink = ClientSink::new(tx, commit_tx);
        let result = dispatcher
            .dispatch_streaming(&candidates, &envelope, sink)
            .await;
        match &result {
            Ok(outcome) => log_outcome(&caller, outcome, true),
            Err(err) => tracing::debug!(error = %err, "streaming dispatch ended with error"),
        }
        result
    }));

    if commit_rx.await.is_ok() {
        task.release();
        return Ok(event_stream(rx));
    }

    let joined = match task.handle_mut() {
        Some(handle) => handle.await,
        None => return Ok(event_stream(rx)),
    };
    match joined {
        Ok(Ok(_)) => Ok(event_stream(rx)),
        Ok(Err(err)) => Err(err.into()),
        Err(err) => Err(AppError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "dispatch_failed",
            err.to_string(),
        )
        .with_type("server_error")),
    }
}
