use crate::aggregator::aggregate;
use crate::config::{ModelConfig, ProviderKind};
use crate::context::CallContext;
use crate::envelope::Envelope;
use crate::error::DispatchError;
use crate::provider::{Completion, DONE_FRAME, Provider, ProviderDeps, UpstreamStream};
use crate::rotation::KeyRotator;
use crate::usage::{SharedUsage, Usage};
use async_trait::async_trait;
use bytes::Bytes;
use eventsource_stream::Eventsource;
use futures_util::StreamExt;
use reqwest::StatusCode;
use reqwest::header::{ACCEPT, CONTENT_TYPE, HeaderMap};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
const TCP_KEEPALIVE: Duration = Duration::from_secs(30);
const FRAME_BUFFER: usize = 32;

/// Backends speaking the OpenAI chat-completions wire format.
pub struct OpenAiCompatible {
    endpoint: String,
    keys: KeyRotator,
    http: reqwest::Client,
}

pub fn build(deps: &ProviderDeps, model: &ModelConfig) -> Result<Box<dyn Provider>, DispatchError> {
    let http = reqwest::Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .tcp_keepalive(TCP_KEEPALIVE)
        .build()
        .map_err(|err| DispatchError::Network(err.to_string()))?;
    Ok(Box::new(OpenAiCompatible {
        endpoint: endpoint_for(model),
        keys: deps.keys.clone(),
        http,
    }))
}

fn endpoint_for(model: &ModelConfig) -> String {
    if model.base_url_direct {
        model.base_url.clone()
    } else {
        format!("{}/chat/completions", model.base_url.trim_end_matches('/'))
    }
}

impl OpenAiCompatible {
    fn post(&self, model: &ModelConfig, body: Bytes) -> reqwest::RequestBuilder {
        let req = self
            .http
            .post(&self.endpoint)
            .header(CONTENT_TYPE, "application/json")
            .body(body);
        match self.keys.next_key(model) {
            Some(key) => req.bearer_auth(key),
            None => req,
        }
    }

    async fn send(
        &self,
        ctx: &CallContext,
        req: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, DispatchError> {
        let resp = ctx
            .guard(async { req.send().await.map_err(network_error) })
            .await?;
        let status = resp.status();
        if status != StatusCode::OK {
            let body = ctx
                .guard(async { resp.bytes().await.map_err(network_error) })
                .await
                .unwrap_or_default();
            return Err(DispatchError::Upstream {
                status,
                body: String::from_utf8_lossy(&body).into_owned(),
            });
        }
        Ok(resp)
    }

    async fn invoke_via_stream(
        &self,
        ctx: &CallContext,
        mut request: Envelope,
        model: &ModelConfig,
    ) -> Result<Completion, DispatchError> {
        request.set("stream", true);
        let upstream = self.invoke_streaming(ctx, request, model).await?;
        let response = aggregate(upstream.frames).await?;
        let body = serde_json::to_vec(&response)
            .map_err(|err| DispatchError::Protocol(err.to_string()))?;
        Ok(Completion {
            body: Bytes::from(body),
            usage: response.usage,
        })
    }
}

#[async_trait]
impl Provider for OpenAiCompatible {
    fn kind(&self) -> ProviderKind {
        ProviderKind::OpenaiCompatible
    }

    async fn invoke(
        &self,
        ctx: &CallContext,
        request: Envelope,
        model: &ModelConfig,
    ) -> Result<Completion, DispatchError> {
        if model.stream_only {
            return self.invoke_via_stream(ctx, request, model).await;
        }

        let body = request.to_bytes().map_err(protocol_error)?;
        let resp = self.send(ctx, self.post(model, body)).await?;
        let raw = ctx
            .guard(async { resp.bytes().await.map_err(network_error) })
            .await?;
        normalize_completion(&raw, &model.name)
    }

    async fn invoke_streaming(
        &self,
        ctx: &CallContext,
        mut request: Envelope,
        model: &ModelConfig,
    ) -> Result<UpstreamStream, DispatchError> {
        request.set("stream_options.include_usage", true);
        let body = request.to_bytes().map_err(protocol_error)?;
        let req = self
            .post(model, body)
            .header(ACCEPT, "text/event-stream");
        let resp = self.send(ctx, req).await?;
        if !is_event_stream(resp.headers()) {
            let body = ctx
                .guard(async { resp.bytes().await.map_err(network_error) })
                .await?;
            return Err(DispatchError::Protocol(
                String::from_utf8_lossy(body.trim_ascii()).into_owned(),
            ));
        }

        let usage = SharedUsage::default();
        let (tx, rx) = mpsc::channel::<Result<Bytes, DispatchError>>(FRAME_BUFFER);
        let task_ctx = ctx.clone();
        let task_usage = usage.clone();
        let model_name = model.name.clone();
        tokio::spawn(async move {
            let mut events = resp.bytes_stream().eventsource();
            let mut seen_event = false;
            loop {
                let next = tokio::select! {
                    _ = task_ctx.cancelled() => break,
                    _ = tx.closed() => break,
                    next = events.next() => next,
                };
                let event = match next {
                    None if !seen_event => {
                        let _ = tx
                            .send(Err(DispatchError::Protocol(
                                "stream ended without any event".to_string(),
                            )))
                            .await;
                        break;
                    }
                    None => break,
                    Some(Ok(event)) => {
                        seen_event = true;
                        event
                    }
                    Some(Err(err)) => {
                        let _ = tx
                            .send(Err(DispatchError::Network(format!(
                                "stream read failed: {err}"
                            ))))
                            .await;
                        task_ctx.cancel();
                        break;
                    }
                };
                let data = event.data.trim();
                if data.is_empty() {
                    continue;
                }
                if data == "[DONE]" {
                    let _ = tx.send(Ok(Bytes::from_static(DONE_FRAME))).await;
                    break;
                }
                let frame = rewrite_frame(data, &model_name, &task_usage);
                if tx.send(Ok(frame)).await.is_err() {
                    break;
                }
            }
        });

        Ok(UpstreamStream {
            frames: Box::pin(ReceiverStream::new(rx)),
            usage,
        })
    }
}

/// A missing `Content-Type` is taken on trust; anything else must be SSE.
fn is_event_stream(headers: &HeaderMap) -> bool {
    match headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok()) {
        Some(value) => value
            .trim_start()
            .to_ascii_lowercase()
            .starts_with("text/event-stream"),
        None => true,
    }
}

fn network_error(err: reqwest::Error) -> DispatchError {
    DispatchError::Network(err.to_string())
}

fn protocol_error(err: serde_json::Error) -> DispatchError {
    DispatchError::Protocol(err.to_string())
}

/// Checks a non-streaming body looks like a completion and rewrites it for the caller.
pub fn normalize_completion(raw: &[u8], model_name: &str) -> Result<Completion, DispatchError> {
    let unexpected = || DispatchError::Protocol(String::from_utf8_lossy(raw).into_owned());
    let mut envelope = Envelope::from_slice(raw).map_err(|_| unexpected())?;
    if envelope.get_present("id").is_none() && envelope.get_present("object").is_none() {
        return Err(unexpected());
    }
    envelope.delete("provider");
    envelope.set("model", model_name);

    let mut usage = Usage::default();
    usage.absorb_body(raw, &envelope);
    Ok(Completion {
        body: envelope.to_bytes().map_err(protocol_error)?,
        usage,
    })
}

/// Rewrites one upstream `data:` payload into an outbound frame. Payloads that are not
/// JSON are forwarded untouched.
pub fn rewrite_frame(data: &str, model_name: &str, usage: &SharedUsage) -> Bytes {
    let Ok(mut envelope) = Envelope::from_slice(data.as_bytes()) else {
        return Bytes::from(format!("data: {data}\n\n"));
    };
    envelope.delete("provider");
    envelope.set("model", model_name);
    usage.absorb_body(data.as_bytes(), &envelope);
    match envelope.to_bytes() {
        Ok(json) => {
            let mut frame = Vec::with_capacity(json.len() + 8);
            frame.extend_from_slice(b"data: ");
            frame.extend_from_slice(&json);
            frame.extend_from_slice(b"\n\n");
            Bytes::from(frame)
        }
        Err(_) => Bytes::from(format!("data: {data}\n\n")),
    }
}
