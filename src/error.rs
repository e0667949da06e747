use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use serde_json::json;

#[derive(Debug, Clone)]
pub struct AppError {
    pub status: StatusCode,
    pub code: String,
    pub message: String,
    pub error_type: String,
    pub param: Option<String>,
}

impl AppError {
    pub fn new(status: StatusCode, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.into(),
            message: message.into(),
            error_type: "invalid_request_error".to_string(),
            param: None,
        }
    }

    pub fn with_type(mut self, error_type: impl Into<String>) -> Self {
        self.error_type = error_type.into();
        self
    }

    pub fn with_param(mut self, param: impl Into<String>) -> Self {
        self.param = Some(param.into());
        self
    }

    fn envelope(&self) -> ErrorEnvelope<'_> {
        ErrorEnvelope {
            error: ErrorBody {
                message: &self.message,
                error_type: &self.error_type,
                param: self.param.as_deref(),
                code: &self.code,
            },
        }
    }

    /// Renders the error as one SSE `data:` frame, for failures that happen after a
    /// stream has already started.
    pub fn to_sse_frame(&self) -> String {
        let payload = serde_json::to_string(&self.envelope()).unwrap_or_else(|_| {
            json!({ "error": { "message": self.message, "code": self.code } }).to_string()
        });
        format!("data: {payload}\n\n")
    }
}

#[derive(Debug, Serialize)]
struct ErrorEnvelope<'a> {
    error: ErrorBody<'a>,
}

#[derive(Debug, Serialize)]
struct ErrorBody<'a> {
    message: &'a str,
    #[serde(rename = "type")]
    error_type: &'a str,
    param: Option<&'a str>,
    code: &'a str,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status;
        (status, axum::Json(self.envelope())).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;

/// Failure of one dispatch step. Everything except `RequestMalformed`, `ModelNotFound`
/// and `AllProvidersFailed` is a per-candidate failure that moves dispatch on to the
/// next candidate.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DispatchError {
    #[error("{0}")]
    RequestMalformed(String),
    #[error("model {0} not found or not available")]
    ModelNotFound(String),
    #[error("unexpected status code {status}: {body}")]
    Upstream { status: StatusCode, body: String },
    #[error("network error: {0}")]
    Network(String),
    #[error("unexpected response: {0}")]
    Protocol(String),
    #[error("failed to parse streaming response")]
    EmptyStream,
    #[error("no provider registered for kind {0}")]
    ProviderUnavailable(String),
    #[error("request canceled")]
    Canceled,
    #[error("all providers failed: {0}")]
    AllProvidersFailed(String),
}

impl DispatchError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::RequestMalformed(_) => StatusCode::BAD_REQUEST,
            Self::ModelNotFound(_) => StatusCode::NOT_FOUND,
            Self::Upstream { .. }
            | Self::Network(_)
            | Self::Protocol(_)
            | Self::EmptyStream
            | Self::ProviderUnavailable(_) => StatusCode::BAD_GATEWAY,
            Self::Canceled => StatusCode::REQUEST_TIMEOUT,
            Self::AllProvidersFailed(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::RequestMalformed(_) => "invalid_request",
            Self::ModelNotFound(_) => "model_not_found",
            Self::Upstream { .. } => "upstream_error",
            Self::Network(_) => "upstream_network_error",
            Self::Protocol(_) => "upstream_protocol_error",
            Self::EmptyStream => "upstream_empty_stream",
            Self::ProviderUnavailable(_) => "provider_unavailable",
            Self::Canceled => "request_canceled",
            Self::AllProvidersFailed(_) => "all_providers_failed",
        }
    }
}

impl From<DispatchError> for AppError {
    fn from(err: DispatchError) -> Self {
        let error_type = match &err {
            DispatchError::RequestMalformed(_) | DispatchError::ModelNotFound(_) => {
                "invalid_request_error"
            }
            _ => "upstream_error",
        };
        AppError::new(err.status(), err.code(), err.to_string()).with_type(error_type)
    }
}
