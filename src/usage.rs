use crate::envelope::Envelope;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::{Arc, Mutex, PoisonError};

/// Bodies without this marker never carry usage, so they skip the lookup.
const USAGE_MARKER: &[u8] = b"prompt_tokens";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
    #[serde(default)]
    pub prompt_tokens_details: PromptTokensDetails,
    #[serde(default)]
    pub completion_tokens_details: CompletionTokensDetails,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptTokensDetails {
    #[serde(default)]
    pub cached_tokens: u64,
    #[serde(default)]
    pub audio_tokens: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionTokensDetails {
    #[serde(default)]
    pub audio_tokens: u64,
    #[serde(default)]
    pub reasoning_tokens: u64,
}

impl Usage {
    /// Overwrites every counter that `usage` reports; counters it omits keep their
    /// current value.
    pub fn absorb(&mut self, usage: &Value) {
        let read = |path: &str| usage.pointer(path).and_then(Value::as_u64);
        if let Some(v) = read("/prompt_tokens") {
            self.prompt_tokens = v;
        }
        if let Some(v) = read("/completion_tokens") {
            self.completion_tokens = v;
        }
        if let Some(v) = read("/total_tokens") {
            self.total_tokens = v;
        }
        if let Some(v) = read("/prompt_tokens_details/cached_tokens") {
            self.prompt_tokens_details.cached_tokens = v;
        }
        if let Some(v) = read("/prompt_tokens_details/audio_tokens") {
            self.prompt_tokens_details.audio_tokens = v;
        }
        if let Some(v) = read("/completion_tokens_details/audio_tokens") {
            self.completion_tokens_details.audio_tokens = v;
        }
        if let Some(v) = read("/completion_tokens_details/reasoning_tokens") {
            self.completion_tokens_details.reasoning_tokens = v;
        }
    }

    /// Absorbs the `usage` object of a response body, if the raw body mentions token
    /// counts at all.
    pub fn absorb_body(&mut self, raw: &[u8], envelope: &Envelope) -> bool {
        if !contains_marker(raw) {
            return false;
        }
        match envelope.get("usage") {
            Some(usage) if usage.is_object() => {
                self.absorb(usage);
                true
            }
            _ => false,
        }
    }
}

fn contains_marker(raw: &[u8]) -> bool {
    raw.windows(USAGE_MARKER.len()).any(|w| w == USAGE_MARKER)
}

/// Usage accumulator shared between a streaming call's reader task and whoever
/// reports on the call once the stream is done.
#[derive(Debug, Clone, Default)]
pub struct SharedUsage(Arc<Mutex<Usage>>);

impl SharedUsage {
    pub fn absorb_body(&self, raw: &[u8], envelope: &Envelope) {
        let mut usage = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        usage.absorb_body(raw, envelope);
    }

    pub fn snapshot(&self) -> Usage {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}
