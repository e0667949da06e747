use crate::auth::AuthState;
use crate::config::GatewayConfig;
use crate::dispatch::Dispatcher;
use crate::error::{AppError, AppResult};
use crate::provider::ProviderRegistry;
use crate::rotation::{KeyCursorStore, KeyRotator, MemoryKeyCursorStore, MemoryRotationStore, RotationStore};
use axum::Router;
use axum::http::header::{AUTHORIZATION, CONTENT_TYPE, HeaderName};
use axum::http::{Method, StatusCode};
use axum::routing::{get, post};
use metrics_exporter_prometheus::PrometheusHandle;
use std::path::PathBuf;
use std::sync::{Arc, Once, OnceLock};
use tower_http::cors::{Any, CorsLayer};
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub runtime: Arc<RuntimeConfig>,
    pub config: Arc<GatewayConfig>,
    pub auth: AuthState,
    pub rotation: Arc<dyn RotationStore>,
    pub dispatcher: Dispatcher,
    pub metrics: PrometheusHandle,
}

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();
static METRICS_ERROR: OnceLock<AppError> = OnceLock::new();
static METRICS_INIT: Once = Once::new();

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub listen: String,
    pub metrics_path: String,
    pub config_path: PathBuf,
}

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

impl RuntimeConfig {
    pub fn from_env() -> Self {
        Self {
            listen: env_or("MINIROUTER_LISTEN", "0.0.0.0:8080"),
            metrics_path: env_or("MINIROUTER_METRICS_PATH", "/metrics"),
            config_path: PathBuf::from(env_or("MINIROUTER_CONFIG", "config.yaml")),
        }
    }
}

impl AppState {
    /// Address to bind: `server.port` from the config file wins over the env default.
    pub fn listen_addr(&self) -> String {
        match self.config.server.port.as_deref() {
            Some(port) => format!("0.0.0.0:{port}"),
            None => self.runtime.listen.clone(),
        }
    }
}

pub async fn load_state() -> AppResult<AppState> {
    load_state_with_runtime(RuntimeConfig::from_env()).await
}

pub async fn load_state_with_runtime(runtime: RuntimeConfig) -> AppResult<AppState> {
    let config = GatewayConfig::load(&runtime.config_path).await?;
    state_from_config(runtime, config)
}

pub fn state_from_config(runtime: RuntimeConfig, config: GatewayConfig) -> AppResult<AppState> {
    state_with_stores(
        runtime,
        config,
        Arc::new(MemoryRotationStore::new()),
        Arc::new(MemoryKeyCursorStore::new()),
    )
}

/// Builds state around caller-supplied cursor stores.
pub fn state_with_stores(
    runtime: RuntimeConfig,
    config: GatewayConfig,
    rotation: Arc<dyn RotationStore>,
    key_cursors: Arc<dyn KeyCursorStore>,
) -> AppResult<AppState> {
    let metrics = init_metrics()?;
    let registry = ProviderRegistry::new(KeyRotator::new(key_cursors));
    tracing::info!(
        models = config.models.len(),
        enabled = config.models.iter().filter(|m| m.enabled).count(),
        api_keys = config.api_keys.len(),
        "gateway config loaded"
    );
    Ok(AppState {
        runtime: Arc::new(runtime),
        auth: AuthState::new(&config.api_keys),
        config: Arc::new(config),
        rotation,
        dispatcher: Dispatcher::new(registry),
        metrics,
    })
}

fn init_metrics() -> AppResult<PrometheusHandle> {
    METRICS_INIT.call_once(|| {
        match metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder() {
            Ok(handle) => {
                let _ = METRICS_HANDLE.set(handle);
            }
            Err(err) => {
                let _ = METRICS_ERROR.set(AppError::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "metrics_init_failed",
                    err.to_string(),
                ));
            }
        }
    });

    if let Some(err) = METRICS_ERROR.get() {
        return Err(err.clone());
    }
    METRICS_HANDLE.get().cloned().ok_or_else(|| {
        AppError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "metrics_init_failed",
            "metrics recorder not available",
        )
    })
}

fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([
            CONTENT_TYPE,
            AUTHORIZATION,
            HeaderName::from_static("provider"),
            HeaderName::from_static("x-requested-with"),
        ])
}

pub fn build_app(state: AppState) -> Router {
    let metrics_path = state.runtime.metrics_path.clone();
    Router::<AppState>::new()
        .route("/health", get(crate::handlers::health))
        .route("/v1/models", get(crate::handlers::list_models))
        .route(
            "/v1/chat/completions",
            post(crate::handlers::create_chat_completions),
        )
        .route(&metrics_path, get(crate::handlers::metrics))
        .with_state(state)
        .layer(cors_layer())
        .layer(PropagateRequestIdLayer::new(HeaderName::from_static(
            "x-request-id",
        )))
        .layer(SetRequestIdLayer::new(
            HeaderName::from_static("x-request-id"),
            MakeRequestUuid,
        ))
        .layer(TraceLayer::new_for_http())
}
