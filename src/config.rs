use crate::error::{AppError, AppResult};
use axum::http::StatusCode;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::path::Path;
use std::time::Duration;

/// Gateway configuration loaded once at startup and shared read-only afterwards.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub models: Vec<ModelConfig>,
    #[serde(default)]
    pub api_keys: Vec<ApiKeyConfig>,
}

impl GatewayConfig {
    pub fn from_yaml_str(raw: &str) -> AppResult<Self> {
        serde_yaml::from_str(raw).map_err(|err| {
            AppError::new(
                StatusCode::BAD_REQUEST,
                "config_parse_failed",
                format!("failed to parse config file: {err}"),
            )
        })
    }

    pub async fn load(path: &Path) -> AppResult<Self> {
        let raw = tokio::fs::read_to_string(path).await.map_err(|err| {
            AppError::new(
                StatusCode::BAD_REQUEST,
                "config_read_failed",
                format!("failed to read config file {}: {err}", path.display()),
            )
        })?;
        Self::from_yaml_str(&raw)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default, deserialize_with = "deserialize_port")]
    pub port: Option<String>,
    #[serde(
        default = "default_shutdown_timeout",
        deserialize_with = "deserialize_duration"
    )]
    pub shutdown_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: None,
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    #[default]
    OpenaiCompatible,
}

impl ProviderKind {
    pub const ALL: &'static [ProviderKind] = &[ProviderKind::OpenaiCompatible];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::OpenaiCompatible => "openai_compatible",
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModelConfig {
    #[serde(default)]
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub provider_model_name: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub supports_chat: bool,
    #[serde(default)]
    pub supports_completion: bool,
    #[serde(default)]
    pub supports_input_image: bool,
    #[serde(default)]
    pub supports_image_gen: bool,
    #[serde(default, rename = "support_google_thinking")]
    pub supports_thinking: bool,

    // Parsed for config compatibility; no limiter enforces these yet.
    #[serde(default)]
    pub rpm: u64,
    #[serde(default)]
    pub rph: u64,
    #[serde(default)]
    pub rpd: u64,
    #[serde(default)]
    pub tpm: u64,
    #[serde(default)]
    pub tph: u64,
    #[serde(default)]
    pub tpd: u64,

    #[serde(default)]
    pub max_tokens: u64,
    #[serde(default)]
    pub context_length: u64,
    #[serde(default)]
    pub supported_parameters: Vec<String>,
    #[serde(default)]
    pub input_price_per_token: f64,
    #[serde(default)]
    pub output_price_per_token: f64,

    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub base_url_direct: bool,
    #[serde(default)]
    pub provider: ProviderKind,
    #[serde(default)]
    pub stream_only: bool,
    #[serde(default)]
    pub provider_api_key: Vec<String>,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub visible: bool,
}

impl ModelConfig {
    /// Name sent upstream in the `model` field.
    pub fn upstream_model(&self) -> &str {
        if self.provider_model_name.is_empty() {
            &self.name
        } else {
            &self.provider_model_name
        }
    }

    /// Stable identity used to key per-model state such as the API key cursor.
    pub fn identity(&self) -> String {
        format!("{}|{}|{}", self.id, self.upstream_model(), self.base_url)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApiKeyConfig {
    #[serde(default)]
    pub id: u64,
    pub key: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_active: bool,

    #[serde(default)]
    pub rps: u64,
    #[serde(default)]
    pub tps: u64,
    #[serde(default)]
    pub rpm: u64,
    #[serde(default)]
    pub tpm: u64,
    #[serde(default)]
    pub rph: u64,
    #[serde(default)]
    pub tph: u64,
    #[serde(default)]
    pub rpd: u64,
    #[serde(default)]
    pub tpd: u64,
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(5)
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Scalar {
    Int(u64),
    Text(String),
}

fn deserialize_port<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<Scalar> = Option::deserialize(deserializer)?;
    Ok(match raw {
        Some(Scalar::Int(port)) => Some(port.to_string()),
        Some(Scalar::Text(port)) => Some(port.trim().trim_start_matches(':').to_string())
            .filter(|port| !port.is_empty()),
        None => None,
    })
}

fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    match Scalar::deserialize(deserializer)? {
        Scalar::Int(secs) => Ok(Duration::from_secs(secs)),
        Scalar::Text(text) => parse_duration(&text).map_err(serde::de::Error::custom),
    }
}

/// Parses `"500ms"`, `"5s"`, `"1m"`, `"2h"` or a bare number of seconds.
pub fn parse_duration(raw: &str) -> Result<Duration, String> {
    let raw = raw.trim();
    let split = raw
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(raw.len());
    let (digits, unit) = raw.split_at(split);
    let value: u64 = digits
        .parse()
        .map_err(|_| format!("invalid duration `{raw}`"))?;
    match unit.trim() {
        "" | "s" => Ok(Duration::from_secs(value)),
        "ms" => Ok(Duration::from_millis(value)),
        "m" => Ok(Duration::from_secs(value * 60)),
        "h" => Ok(Duration::from_secs(value * 3600)),
        other => Err(format!("unknown duration unit `{other}` in `{raw}`")),
    }
}
