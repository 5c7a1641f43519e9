// Response translator - upstream generateContent result to an OpenAI
// chat.completion body

use rand::distr::Alphanumeric;
use rand::Rng;
use serde_json::{json, Map, Value};

/// Separator placed between the text parts of one candidate.
pub const PART_SEPARATOR: &str = "\n\n|>";

/// `chatcmpl-` followed by 29 random alphanumerics.
pub fn generate_chatcmpl_id() -> String {
    let suffix: String = rand::rng()
        .sample_iter(&Alphanumeric)
        .take(29)
        .map(char::from)
        .collect();
    format!("chatcmpl-{}", suffix)
}

/// Map an upstream finish reason onto the OpenAI vocabulary. Unknown reasons
/// pass through unchanged.
pub fn map_finish_reason(reason: &str) -> &str {
    match reason {
        "STOP" => "stop",
        "MAX_TOKENS" => "length",
        "SAFETY" | "RECITATION" => "content_filter",
        other => other,
    }
}

pub(crate) fn finish_reason_of(candidate: &Value) -> Value {
    candidate
        .get("finishReason")
        .and_then(|v| v.as_str())
        .map(|r| json!(map_finish_reason(r)))
        .unwrap_or(Value::Null)
}

pub(crate) fn candidate_index(candidate: &Value) -> u64 {
    candidate.get("index").and_then(|v| v.as_u64()).unwrap_or(0)
}

/// Text parts of a candidate joined with [`PART_SEPARATOR`]; `None` when the
/// candidate carries no content.
pub(crate) fn candidate_text(candidate: &Value) -> Option<String> {
    let parts = candidate.get("content")?.get("parts")?.as_array()?;
    let texts: Vec<&str> = parts
        .iter()
        .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
        .collect();
    Some(texts.join(PART_SEPARATOR))
}

pub(crate) fn transform_usage(usage: &Value) -> Value {
    let mut out = Map::new();
    for (from, to) in [
        ("candidatesTokenCount", "completion_tokens"),
        ("promptTokenCount", "prompt_tokens"),
        ("totalTokenCount", "total_tokens"),
    ] {
        if let Some(count) = usage.get(from) {
            out.insert(to.to_string(), count.clone());
        }
    }
    Value::Object(out)
}

/// Build a `chat.completion` body from an upstream response.
pub fn to_openai_response(native: &Value, model: &str, id: &str) -> Value {
    let choices: Vec<Value> = native
        .get("candidates")
        .and_then(|v| v.as_array())
        .map(|candidates| {
            candidates
                .iter()
                .map(|candidate| {
                    json!({
                        "index": candidate_index(candidate),
                        "message": {
                            "role": "assistant",
                            "content": candidate_text(candidate),
                        },
                        "logprobs": null,
                        "finish_reason": finish_reason_of(candidate),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    let mut response = json!({
        "id": id,
        "choices": choices,
        "created": chrono::Utc::now().timestamp(),
        "model": model,
        "object": "chat.completion",
    });
    if let Some(usage) = native.get("usageMetadata") {
        response["usage"] = transform_usage(usage);
    }
    response
}
