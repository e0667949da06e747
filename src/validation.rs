use crate::envelope::Envelope;
use crate::error::DispatchError;
use serde_json::Value;

const ROLES: &[&str] = &["system", "developer", "user", "assistant", "tool", "function"];
const NUMERIC_FIELDS: &[&str] = &[
    "temperature",
    "top_p",
    "max_tokens",
    "max_completion_tokens",
    "n",
];

fn invalid(message: impl Into<String>) -> DispatchError {
    DispatchError::RequestMalformed(format!("Invalid request: {}", message.into()))
}

/// Shape checks on an inbound chat-completions body. Unknown fields are allowed.
pub fn validate_chat_request(request: &Envelope) -> Result<(), DispatchError> {
    let Some(body) = request.as_value().as_object() else {
        return Err(invalid("body must be a JSON object"));
    };

    match body.get("model") {
        Some(Value::String(model)) if !model.trim().is_empty() => {}
        Some(Value::String(_)) => return Err(invalid("Field `model` must not be empty")),
        Some(_) => return Err(invalid("Field `model` must be a string")),
        None => return Err(invalid("Field `model` is required")),
    }

    let messages = match body.get("messages") {
        Some(Value::Array(messages)) => messages,
        Some(_) => return Err(invalid("Field `messages` must be an array")),
        None => return Err(invalid("Field `messages` is required")),
    };
    if messages.is_empty() {
        return Err(invalid("Field `messages` must not be empty"));
    }
    for (i, message) in messages.iter().enumerate() {
        let Some(message) = message.as_object() else {
            return Err(invalid(format!("Field `messages[{i}]` must be an object")));
        };
        match message.get("role").and_then(Value::as_str) {
            Some(role) if ROLES.contains(&role) => {}
            Some(role) => {
                return Err(invalid(format!(
                    "Field `messages[{i}].role` has unsupported value `{role}`"
                )));
            }
            None => {
                return Err(invalid(format!(
                    "Field `messages[{i}].role` must be a string"
                )));
            }
        }
    }

    if let Some(stream) = body.get("stream") {
        if !stream.is_boolean() {
            return Err(invalid("Field `stream` must be a boolean"));
        }
    }
    if let Some(effort) = body.get("reasoning_effort") {
        if !effort.is_string() {
            return Err(invalid("Field `reasoning_effort` must be a string"));
        }
    }
    for field in NUMERIC_FIELDS {
        if let Some(value) = body.get(*field) {
            if !value.is_number() && !value.is_null() {
                return Err(invalid(format!("Field `{field}` must be a number")));
            }
        }
    }
    Ok(())
}
