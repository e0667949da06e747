use crate::config::ModelConfig;
use crate::context::{CALL_CEILING, CallContext};
use crate::envelope::Envelope;
use crate::error::{AppError, DispatchError};
use crate::provider::{DONE_FRAME, Provider, ProviderRegistry};
use crate::relay::{ClientSink, StreamRelay};
use crate::thinking::{apply_reasoning_effort, extract_message_thoughts};
use crate::usage::Usage;
use bytes::Bytes;
use std::time::Duration;

/// Which candidate served a request and what it reported.
#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    pub model: String,
    pub upstream_model: String,
    pub attempts: usize,
    pub usage: Usage,
}

/// Tries candidates in order until one succeeds.
#[derive(Clone)]
pub struct Dispatcher {
    registry: ProviderRegistry,
    call_ceiling: Duration,
}

/// Builds the request one candidate receives from the caller's envelope.
pub fn prepare_request(original: &Envelope, model: &ModelConfig, stream: bool) -> Envelope {
    let mut request = original.clone();
    if model.supports_thinking {
        apply_reasoning_effort(&mut request);
    }
    request.set("model", model.upstream_model());
    if !stream {
        request.delete("stream_options");
    }
    request
}

fn exhausted(last_error: Option<DispatchError>) -> DispatchError {
    let detail = last_error
        .map(|err| err.to_string())
        .unwrap_or_else(|| "no candidate attempted".to_string());
    DispatchError::AllProvidersFailed(detail)
}

impl Dispatcher {
    pub fn new(registry: ProviderRegistry) -> Self {
        Self {
            registry,
            call_ceiling: CALL_CEILING,
        }
    }

    pub fn with_call_ceiling(mut self, ceiling: Duration) -> Self {
        self.call_ceiling = ceiling;
        self
    }

    fn instantiate(&self, model: &ModelConfig) -> Result<Box<dyn Provider>, DispatchError> {
        metrics::counter!("minirouter_dispatch_attempts_total", "model" => model.name.clone())
            .increment(1);
        self.registry.instantiate(model)
    }

    fn record_failure(&self, model: &ModelConfig, attempt: usize, err: &DispatchError) {
        metrics::counter!("minirouter_dispatch_failures_total", "model" => model.name.clone())
            .increment(1);
        tracing::warn!(
            model = %model.name,
            upstream_model = %model.upstream_model(),
            base_url = %model.base_url,
            attempt,
            error = %err,
            "candidate failed"
        );
    }

    async fn close(provider: Box<dyn Provider>, model: &ModelConfig) {
        if let Err(err) = provider.close().await {
            tracing::debug!(model = %model.name, error = %err, "provider close failed");
        }
    }

    /// Non-streaming dispatch. Returns the body from the first candidate that succeeds.
    pub async fn dispatch(
        &self,
        candidates: &[ModelConfig],
        envelope: &Envelope,
    ) -> Result<(DispatchOutcome, Bytes), DispatchError> {
        let mut last_error = None;
        for (attempt, model) in candidates.iter().enumerate() {
            let provider = match self.instantiate(model) {
                Ok(provider) => provider,
                Err(err) => {
                    self.record_failure(model, attempt, &err);
                    last_error = Some(err);
                    continue;
                }
            };
            let ctx = CallContext::new(self.call_ceiling);
            let request = prepare_request(envelope, model, false);
            let result = provider.invoke(&ctx, request, model).await;
            Self::close(provider, model).await;

            match result {
                Ok(completion) => {
                    let body = if model.supports_thinking {
                        rewrite_thoughts(completion.body)
                    } else {
                        completion.body
                    };
                    let outcome = DispatchOutcome {
                        model: model.name.clone(),
                        upstream_model: model.upstream_model().to_string(),
                        attempts: attempt + 1,
                        usage: completion.usage,
                    };
                    return Ok((outcome, body));
                }
                Err(err) => {
                    self.record_failure(model, attempt, &err);
                    last_error = Some(err);
                }
            }
        }
        metrics::counter!("minirouter_all_providers_failed_total").increment(1);
        Err(exhausted(last_error))
    }

    /// Streaming dispatch. Candidates are only abandoned while nothing has reached the
    /// client; after that a failure is written as a trailing error frame.
    pub async fn dispatch_streaming(
        &self,
        candidates: &[ModelConfig],
        envelope: &Envelope,
        mut sink: ClientSink,
    ) -> Result<DispatchOutcome, DispatchError> {
        let mut last_error = None;
        for (attempt, model) in candidates.iter().enumerate() {
            let provider = match self.instantiate(model) {
                Ok(provider) => provider,
                Err(err) => {
                    self.record_failure(model, attempt, &err);
                    last_error = Some(err);
                    continue;
                }
            };
            let ctx = CallContext::new(self.call_ceiling);
            let request = prepare_request(envelope, model, true);
            let result = match provider.invoke_streaming(&ctx, request, model).await {
                Ok(upstream) => StreamRelay::new(model.supports_thinking)
                    .run(&ctx, upstream.frames, &mut sink)
                    .await
                    .map(|()| upstream.usage.snapshot()),
                Err(err) => Err(err),
            };
            Self::close(provider, model).await;

            match result {
                Ok(usage) => {
                    return Ok(DispatchOutcome {
                        model: model.name.clone(),
                        upstream_model: model.upstream_model().to_string(),
                        attempts: attempt + 1,
                        usage,
                    });
                }
                Err(err) => {
                    self.record_failure(model, attempt, &err);
                    if sink.is_committed() {
                        if !matches!(err, DispatchError::Canceled) {
                            let frame = AppError::from(err.clone()).to_sse_frame();
                            let _ = sink.send(Bytes::from(frame)).await;
                            let _ = sink.send(Bytes::from_static(DONE_FRAME)).await;
                        }
                        return Err(err);
                    }
                    last_error = Some(err);
                }
            }
        }
        metrics::counter!("minirouter_all_providers_failed_total").increment(1);
        Err(exhausted(last_error))
    }
}

fn rewrite_thoughts(body: Bytes) -> Bytes {
    let Ok(mut envelope) = Envelope::from_slice(&body) else {
        return body;
    };
    if !extract_message_thoughts(&mut envelope) {
        return body;
    }
    envelope.to_bytes().unwrap_or(body)
}
