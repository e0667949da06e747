use crate::error::DispatchError;
use crate::provider::FrameStream;
use crate::usage::Usage;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Highest tool-call index accepted from an upstream; fragments beyond it are dropped.
const MAX_TOOL_CALLS: usize = 128;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatCompletion {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_fingerprint: Option<String>,
    pub choices: Vec<Choice>,
    pub usage: Usage,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Choice {
    pub index: u32,
    pub message: AssistantMessage,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssistantMessage {
    pub role: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub index: usize,
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub function: FunctionCall,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    pub arguments: String,
}

#[derive(Debug)]
struct Header {
    id: String,
    created: i64,
    model: String,
    system_fingerprint: Option<String>,
}

/// Folds `chat.completion.chunk` frames into one `chat.completion`.
#[derive(Debug, Default)]
pub struct StreamAggregator {
    header: Option<Header>,
    content: String,
    tool_calls: Vec<ToolCall>,
    finish_reason: Option<String>,
    usage: Usage,
    done: bool,
}

impl StreamAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Feeds one raw SSE frame. Comment lines and unparseable payloads are skipped.
    pub fn push_frame(&mut self, frame: &[u8]) {
        let text = String::from_utf8_lossy(frame);
        for line in text.lines() {
            let Some(payload) = line.trim().strip_prefix("data:") else {
                continue;
            };
            let payload = payload.trim();
            if payload == "[DONE]" {
                self.done = true;
                continue;
            }
            if let Ok(chunk) = serde_json::from_str::<Value>(payload) {
                self.push_chunk(&chunk);
            }
        }
    }

    pub fn push_chunk(&mut self, chunk: &Value) {
        if self.header.is_none() {
            let Some(id) = chunk.get("id").and_then(Value::as_str) else {
                return;
            };
            self.header = Some(Header {
                id: id.to_string(),
                created: chunk
                    .get("created")
                    .and_then(|v| v.as_i64().or_else(|| v.as_f64().map(|f| f as i64)))
                    .unwrap_or_default(),
                model: chunk
                    .get("model")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                system_fingerprint: chunk
                    .get("system_fingerprint")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            });
        }

        if let Some(choice) = chunk
            .get("choices")
            .and_then(Value::as_array)
            .and_then(|choices| choices.first())
        {
            if let Some(delta) = choice.get("delta") {
                if let Some(content) = delta.get("content").and_then(Value::as_str) {
                    self.content.push_str(content);
                }
                if let Some(calls) = delta.get("tool_calls").and_then(Value::as_array) {
                    for (position, call) in calls.iter().enumerate() {
                        self.merge_tool_call(position, call);
                    }
                }
            }
            if let Some(reason) = choice
                .get("finish_reason")
                .and_then(Value::as_str)
                .filter(|r| !r.is_empty())
            {
                self.finish_reason = Some(reason.to_string());
            }
        }

        if let Some(usage) = chunk.get("usage").filter(|u| u.is_object()) {
            self.usage.absorb(usage);
        }
    }

    fn merge_tool_call(&mut self, position: usize, call: &Value) {
        let index = call
            .get("index")
            .and_then(Value::as_u64)
            .map(|i| i as usize)
            .unwrap_or(position);
        if index >= MAX_TOOL_CALLS {
            tracing::debug!(index, "dropping tool call fragment with out-of-range index");
            return;
        }
        while self.tool_calls.len() <= index {
            let next = self.tool_calls.len();
            self.tool_calls.push(ToolCall {
                index: next,
                ..ToolCall::default()
            });
        }
        let slot = &mut self.tool_calls[index];

        let non_empty = |v: Option<&Value>| {
            v.and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };
        if let Some(id) = non_empty(call.get("id")) {
            slot.id = id;
        }
        if let Some(kind) = non_empty(call.get("type")) {
            slot.kind = kind;
        }
        let function = call.get("function");
        if let Some(name) = non_empty(function.and_then(|f| f.get("name"))) {
            slot.function.name = name;
        }
        if let Some(arguments) = function
            .and_then(|f| f.get("arguments"))
            .and_then(Value::as_str)
        {
            slot.function.arguments.push_str(arguments);
        }
    }

    pub fn finish(self) -> Result<ChatCompletion, DispatchError> {
        let header = self.header.ok_or(DispatchError::EmptyStream)?;
        Ok(ChatCompletion {
            id: header.id,
            object: "chat.completion".to_string(),
            created: header.created,
            model: header.model,
            system_fingerprint: header.system_fingerprint,
            choices: vec![Choice {
                index: 0,
                message: AssistantMessage {
                    role: "assistant".to_string(),
                    content: self.content,
                    tool_calls: self.tool_calls,
                },
                finish_reason: self.finish_reason,
            }],
            usage: self.usage,
        })
    }
}

/// Drains `frames` and folds them into one response. The first read error aborts.
pub async fn aggregate(mut frames: FrameStream) -> Result<ChatCompletion, DispatchError> {
    let mut aggregator = StreamAggregator::new();
    while let Some(frame) = frames.next().await {
        aggregator.push_frame(&frame?);
        if aggregator.is_done() {
            break;
        }
    }
    aggregator.finish()
}
