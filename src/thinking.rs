//! Vendor "thinking" support for backends that speak Gemini's OpenAI-compatible
//! dialect: request-side budget translation and response-side reasoning extraction.

use crate::envelope::Envelope;

const THOUGHT_OPEN: &str = "<thought>";
const THOUGHT_CLOSE: &str = "</thought>";

const BUDGET_PATH: &str = "extra_body.google.thinking_config.thinking_budget";
const INCLUDE_THOUGHTS_PATH: &str = "extra_body.google.thinking_config.include_thoughts";

/// Maps a `reasoning_effort` hint to `(thinking_budget, include_thoughts)`.
pub fn effort_to_budget(effort: &str) -> Option<(i64, bool)> {
    match effort {
        "none" => Some((0, false)),
        "auto" => Some((-1, true)),
        "low" => Some((1024, true)),
        "medium" => Some((8192, true)),
        "high" => Some((24576, true)),
        _ => None,
    }
}

/// Replaces a string `reasoning_effort` with the vendor thinking config. Unknown
/// hints are dropped without writing a budget. Non-string hints are left alone.
pub fn apply_reasoning_effort(request: &mut Envelope) {
    let Some(effort) = request.get_str("reasoning_effort").map(str::to_owned) else {
        return;
    };
    if let Some((budget, include_thoughts)) = effort_to_budget(&effort) {
        request.set(BUDGET_PATH, budget);
        request.set(INCLUDE_THOUGHTS_PATH, include_thoughts);
    }
    request.delete("reasoning_effort");
}

/// Per-stream state for moving thought deltas into `reasoning_content`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ThinkingState {
    thinking: bool,
}

impl ThinkingState {
    pub fn is_thinking(&self) -> bool {
        self.thinking
    }

    pub fn rewrite(&mut self, frame: &mut Envelope) {
        let flagged =
            frame.get_bool("choices.0.delta.extra_content.google.thought") == Some(true);
        if flagged {
            self.thinking = true;
            let Some(content) = frame.get_str("choices.0.delta.content").map(str::to_owned)
            else {
                return;
            };
            let reasoning = content.strip_prefix(THOUGHT_OPEN).unwrap_or(&content);
            frame.set("choices.0.delta.reasoning_content", reasoning);
            frame.delete("choices.0.delta.content");
            frame.delete("choices.0.delta.extra_content");
            return;
        }

        if !self.thinking {
            return;
        }
        let Some(content) = frame.get_str("choices.0.delta.content").map(str::to_owned) else {
            return;
        };
        if let Some(rest) = content.strip_prefix(THOUGHT_CLOSE) {
            frame.set("choices.0.delta.content", rest);
            self.thinking = false;
        }
    }
}

/// Splits a `<thought>...</thought>` block out of a non-streaming message into
/// `reasoning_content`. Returns whether the message was rewritten.
pub fn extract_message_thoughts(response: &mut Envelope) -> bool {
    if response.get_bool("choices.0.message.extra_content.google.thought") != Some(true) {
        return false;
    }
    let Some(content) = response.get_str("choices.0.message.content").map(str::to_owned) else {
        return false;
    };
    let Some(open) = content.find(THOUGHT_OPEN) else {
        return false;
    };
    let inner_start = open + THOUGHT_OPEN.len();
    let Some(close) = content[inner_start..].find(THOUGHT_CLOSE).map(|i| i + inner_start) else {
        return false;
    };

    let reasoning = &content[inner_start..close];
    let remainder = format!("{}{}", &content[..open], &content[close + THOUGHT_CLOSE.len()..]);
    response.set("choices.0.message.reasoning_content", reasoning);
    response.set("choices.0.message.content", remainder);
    response.delete("choices.0.message.extra_content");
    true
}
