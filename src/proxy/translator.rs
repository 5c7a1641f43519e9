// Request translator - OpenAI chat body to the upstream generateContent shape

use base64::{engine::general_purpose::STANDARD, Engine as _};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::error::{ProxyError, ProxyResult};

/// Safety setting for the upstream API
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SafetySetting {
    pub category: String,
    pub threshold: String,
}

const HARM_CATEGORIES: [&str; 5] = [
    "HARM_CATEGORY_HATE_SPEECH",
    "HARM_CATEGORY_SEXUALLY_EXPLICIT",
    "HARM_CATEGORY_DANGEROUS_CONTENT",
    "HARM_CATEGORY_HARASSMENT",
    "HARM_CATEGORY_CIVIC_INTEGRITY",
];

/// Most permissive threshold for every category. Fixed for the OpenAI path.
pub fn default_safety_settings() -> Vec<SafetySetting> {
    HARM_CATEGORIES
        .iter()
        .map(|category| SafetySetting {
            category: category.to_string(),
            threshold: "BLOCK_NONE".to_string(),
        })
        .collect()
}

/// OpenAI generation fields and their upstream names. Later entries win when
/// two map to the same target.
const GENERATION_FIELDS: &[(&str, &str)] = &[
    ("stop", "stopSequences"),
    ("n", "candidateCount"),
    ("max_tokens", "maxOutputTokens"),
    ("max_completion_tokens", "maxOutputTokens"),
    ("temperature", "temperature"),
    ("top_p", "topP"),
    ("top_k", "topK"),
    ("frequency_penalty", "frequencyPenalty"),
    ("presence_penalty", "presencePenalty"),
];

static DATA_URI: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^data:(?P<mime>[^\r\n]*?)(?:;base64)?,(?P<data>[^\r\n]*)$")
        .expect("data URI pattern compiles")
});

/// Translate an OpenAI chat request into the upstream request shape.
/// Image URLs are fetched with `http` and inlined.
pub async fn to_native_request(http: &reqwest::Client, req: &Value) -> ProxyResult<Value> {
    let mut request = Map::new();

    let (system_instruction, contents) = match req.get("messages").and_then(|v| v.as_array()) {
        Some(messages) => transform_messages(http, messages).await?,
        None => (None, Vec::new()),
    };
    if let Some(system) = system_instruction {
        request.insert("system_instruction".to_string(), system);
    }
    request.insert("contents".to_string(), Value::Array(contents));
    request.insert("safetySettings".to_string(), json!(default_safety_settings()));
    request.insert(
        "generationConfig".to_string(),
        Value::Object(transform_config(req)?),
    );

    Ok(Value::Object(request))
}

/// Prepare a native-format body for forwarding: client-only fields are
/// dropped, safety settings and generation config get defaults when absent.
pub fn normalize_native_request(req: Value) -> ProxyResult<Value> {
    let Value::Object(mut request) = req else {
        return Err(ProxyError::BadRequest(
            "Request body must be a JSON object".to_string(),
        ));
    };

    for field in ["stream", "stream_format", "model"] {
        request.remove(field);
    }
    request
        .entry("safetySettings")
        .or_insert_with(|| json!(default_safety_settings()));
    request
        .entry("generationConfig")
        .or_insert_with(|| json!({}));

    Ok(Value::Object(request))
}

fn transform_config(req: &Value) -> ProxyResult<Map<String, Value>> {
    let mut config = Map::new();

    for (from, to) in GENERATION_FIELDS {
        if let Some(value) = req.get(*from).filter(|v| !v.is_null()) {
            config.insert(to.to_string(), value.clone());
        }
    }

    if let Some(format) = req.get("response_format").filter(|v| !v.is_null()) {
        let mime = match format.get("type").and_then(|v| v.as_str()) {
            Some("json_schema") => {
                let schema = format.get("json_schema").and_then(|v| v.get("schema"));
                let is_enum = schema.map(|s| s.get("enum").is_some()).unwrap_or(false);
                if let Some(schema) = schema {
                    config.insert("responseSchema".to_string(), schema.clone());
                }
                if is_enum {
                    "text/x.enum"
                } else {
                    "application/json"
                }
            }
            Some("json_object") => "application/json",
            Some("text") => "text/plain",
            _ => return Err(ProxyError::UnsupportedFormat),
        };
        config.insert("responseMimeType".to_string(), json!(mime));
    }

    Ok(config)
}

async fn transform_messages(
    http: &reqwest::Client,
    messages: &[Value],
) -> ProxyResult<(Option<Value>, Vec<Value>)> {
    let mut system_instruction = None;
    let mut contents = Vec::new();

    for message in messages {
        let role = message.get("role").and_then(|v| v.as_str()).unwrap_or("");
        let parts = transform_content(http, message.get("content")).await?;

        if role == "system" && system_instruction.is_none() {
            system_instruction = Some(json!({ "parts": parts }));
            continue;
        }

        let role = if role == "assistant" { "model" } else { "user" };
        contents.push(json!({ "role": role, "parts": parts }));
    }

    // upstream rejects a request whose only turn is the system instruction
    if system_instruction.is_some() && contents.is_empty() {
        contents.push(json!({ "role": "model", "parts": [{ "text": " " }] }));
    }

    Ok((system_instruction, contents))
}

async fn transform_content(http: &reqwest::Client, content: Option<&Value>) -> ProxyResult<Vec<Value>> {
    let items = match content {
        Some(Value::Array(items)) => items,
        Some(Value::String(text)) => return Ok(vec![json!({ "text": text })]),
        Some(Value::Null) | None => return Ok(vec![json!({ "text": "" })]),
        Some(other) => return Ok(vec![json!({ "text": other.to_string() })]),
    };

    let mut parts = Vec::with_capacity(items.len() + 1);
    let mut only_images = true;

    for item in items {
        let item_type = item.get("type").and_then(|v| v.as_str()).unwrap_or("");
        if item_type != "image_url" {
            only_images = false;
        }
        match item_type {
            "text" => {
                let text = item.get("text").and_then(|v| v.as_str()).unwrap_or("");
                parts.push(json!({ "text": text }));
            }
            "image_url" => {
                let image = item.get("image_url");
                let url = image
                    .and_then(|v| v.get("url"))
                    .or(image)
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| ProxyError::InvalidImageData("missing image_url.url".to_string()))?;
                parts.push(resolve_image(http, url).await?);
            }
            "input_audio" => {
                let audio = item.get("input_audio");
                let format = audio
                    .and_then(|v| v.get("format"))
                    .and_then(|v| v.as_str())
                    .unwrap_or("");
                let data = audio
                    .and_then(|v| v.get("data"))
                    .and_then(|v| v.as_str())
                    .unwrap_or("");
                parts.push(json!({
                    "inlineData": { "mimeType": format!("audio/{}", format), "data": data }
                }));
            }
            other => return Err(ProxyError::TypeMismatch(other.to_string())),
        }
    }

    // upstream refuses turns without a text part
    if only_images {
        parts.push(json!({ "text": "" }));
    }

    Ok(parts)
}

/// Inline an `image_url` value: http(s) URLs are downloaded, `data:` URIs
/// are split in place.
async fn resolve_image(http: &reqwest::Client, url: &str) -> ProxyResult<Value> {
    if url.starts_with("http://") || url.starts_with("https://") {
        let (mime_type, data) = fetch_image(http, url).await?;
        return Ok(json!({ "inlineData": { "mimeType": mime_type, "data": data } }));
    }

    let (mime_type, data) =
        parse_data_url(url).ok_or_else(|| ProxyError::InvalidImageData(url.to_string()))?;
    Ok(json!({ "inlineData": { "mimeType": mime_type, "data": data } }))
}

async fn fetch_image(http: &reqwest::Client, url: &str) -> ProxyResult<(String, String)> {
    let response = http
        .get(url)
        .send()
        .await
        .map_err(|e| ProxyError::ImageFetch(e.to_string()))?;

    let status = response.status();
    if !status.is_success() {
        return Err(ProxyError::ImageFetch(format!("{} ({})", status, url)));
    }

    let mime_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/octet-stream")
        .to_string();
    let bytes = response
        .bytes()
        .await
        .map_err(|e| ProxyError::ImageFetch(e.to_string()))?;

    tracing::debug!("Fetched image {} ({}, {} bytes)", url, mime_type, bytes.len());
    Ok((mime_type, STANDARD.encode(&bytes)))
}

/// `data:<mime>[;base64],<data>`
fn parse_data_url(url: &str) -> Option<(String, String)> {
    let caps = DATA_URI.captures(url)?;
    Some((caps["mime"].to_string(), caps["data"].to_string()))
}
