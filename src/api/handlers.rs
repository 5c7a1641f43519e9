// API request handlers - authenticate, classify, dispatch, translate

use axum::{
    body::{Body, Bytes},
    extract::State,
    http::{header, HeaderMap, HeaderValue, Method, StatusCode, Uri},
    response::{IntoResponse, Json, Response},
};
use serde_json::{json, Value};

use super::gemini::StreamAlt;
use super::management::{self, Pool};
use super::streaming::{self, OpenAiChunkMapper};
use super::AppState;
use crate::error::{ProxyError, ProxyResult};
use crate::proxy::credentials::mask_credential;
use crate::proxy::response::{generate_chatcmpl_id, to_openai_response};
use crate::proxy::route::{self, Endpoint, Format, Route};
use crate::proxy::translator;

/// Single entry point for every inbound request. OPTIONS never gets here, the
/// CORS layer answers it.
pub async fn dispatch(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    match handle(&state, &method, uri.path(), &headers, body).await {
        Ok(response) => response,
        Err(e) => e.into_response(),
    }
}

async fn handle(
    state: &AppState,
    method: &Method,
    path: &str,
    headers: &HeaderMap,
    body: Bytes,
) -> ProxyResult<Response> {
    authenticate(state, path, headers)?;

    let info = route::classify(path, method);
    let route = info.route().ok_or(ProxyError::NotFound)?;
    tracing::info!(
        "{} {} -> format: {}, endpoint: {}",
        method,
        path,
        route.format.as_str(),
        route.endpoint
    );

    match &route.endpoint {
        Endpoint::ChatCompletions => {
            require_method(method, Method::POST)?;
            let key = next_api_key(state)?;
            completions(state, route, parse_json(&body)?, &key).await
        }
        Endpoint::Embeddings => {
            require_method(method, Method::POST)?;
            let key = next_api_key(state)?;
            embeddings(state, parse_json(&body)?, &key).await
        }
        Endpoint::Models => {
            require_method(method, Method::GET)?;
            let key = next_api_key(state)?;
            models(state, route.format, &key).await
        }
        Endpoint::Batch => {
            require_method(method, Method::POST)?;
            let key = next_api_key(state)?;
            batch(state, route.format, parse_json(&body)?, &key).await
        }
        Endpoint::ApiKeys => management::handle(&state.credentials, Pool::ApiKeys, method, &body),
        Endpoint::AuthTokens => {
            management::handle(&state.credentials, Pool::AuthTokens, method, &body)
        }
        Endpoint::Other(_) => Err(ProxyError::NotFound),
    }
}

/// `Bearer <token>` with any casing of the scheme, or a bare token.
fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?.trim();
    let token = match value.split_once(' ') {
        Some((scheme, rest)) if scheme.eq_ignore_ascii_case("bearer") => rest.trim(),
        _ => value,
    };
    (!token.is_empty()).then_some(token)
}

fn authenticate(state: &AppState, path: &str, headers: &HeaderMap) -> ProxyResult<()> {
    match bearer_token(headers) {
        Some(token) if state.credentials.is_valid_auth_token(token) => Ok(()),
        Some(token) => {
            tracing::debug!("Rejected auth token {}", mask_credential(token));
            Err(ProxyError::Authentication(
                "Invalid authentication token".to_string(),
            ))
        }
        None if state.config.allow_unauthenticated_native && is_native_generate_path(path) => {
            tracing::warn!(
                "Unauthenticated request to {} let through by allow-unauthenticated-native",
                path
            );
            Ok(())
        }
        None => Err(ProxyError::Authentication(
            "Authentication required".to_string(),
        )),
    }
}

fn is_native_generate_path(path: &str) -> bool {
    path.contains("/v1beta/models/") && path.contains(":generateContent")
}

fn require_method(method: &Method, expected: Method) -> ProxyResult<()> {
    if *method == expected {
        Ok(())
    } else {
        Err(ProxyError::MethodNotAllowed)
    }
}

fn next_api_key(state: &AppState) -> ProxyResult<String> {
    let key = state
        .credentials
        .next_api_key()
        .ok_or(ProxyError::NoCredentialAvailable)?;
    tracing::debug!("Using API Key: {}", mask_credential(&key));
    Ok(key)
}

fn parse_json(body: &Bytes) -> ProxyResult<Value> {
    serde_json::from_slice(body)
        .map_err(|e| ProxyError::BadRequest(format!("Invalid JSON body: {}", e)))
}

/// `models/` is stripped, `gemini-` and `learnlm-` names pass through,
/// anything else falls back to `default`.
fn resolve_model(requested: Option<&str>, default: &str) -> String {
    match requested {
        Some(model) => {
            if let Some(stripped) = model.strip_prefix("models/") {
                stripped.to_string()
            } else if model.starts_with("gemini-") || model.starts_with("learnlm-") {
                model.to_string()
            } else {
                tracing::info!("Unknown model format: {}, using default: {}", model, default);
                default.to_string()
            }
        }
        None => default.to_string(),
    }
}

/// Upstream call ready to send.
struct PreparedCall {
    model: String,
    stream: Option<StreamAlt>,
    include_usage: bool,
    payload: Value,
}

/// Resolve model and stream mode, then build the upstream body. `force_stream`
/// replaces whatever the body asks for.
async fn prepare_call(
    state: &AppState,
    format: Format,
    route_model: Option<&str>,
    force_stream: Option<bool>,
    req: Value,
) -> ProxyResult<PreparedCall> {
    let requested = route_model.or_else(|| req.get("model").and_then(|v| v.as_str()));
    let model = resolve_model(requested, &state.config.default_model);

    let wants_stream = force_stream
        .unwrap_or_else(|| req.get("stream").and_then(|v| v.as_bool()).unwrap_or(false));
    // the OpenAI re-framer only understands SSE, so `streamable` is a
    // native-format option
    let stream = wants_stream.then(|| {
        match req.get("stream_format").and_then(|v| v.as_str()) {
            Some("streamable") if format.is_native() => StreamAlt::Json,
            _ => StreamAlt::Sse,
        }
    });
    let include_usage = req
        .get("stream_options")
        .and_then(|o| o.get("include_usage"))
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    let payload = if format.is_native() {
        translator::normalize_native_request(req)?
    } else {
        translator::to_native_request(state.gemini.http(), &req).await?
    };

    Ok(PreparedCall {
        model,
        stream,
        include_usage,
        payload,
    })
}

async fn completions(
    state: &AppState,
    route: &Route,
    req: Value,
    api_key: &str,
) -> ProxyResult<Response> {
    let call = prepare_call(state, route.format, route.model.as_deref(), route.stream, req).await?;
    let response = state
        .gemini
        .generate_content(&call.model, call.stream, api_key, &call.payload)
        .await?;

    if route.format.is_native() {
        return Ok(passthrough(response, call.stream.is_some()));
    }

    let id = generate_chatcmpl_id();
    if call.stream.is_some() {
        let mapper = OpenAiChunkMapper::new(id, call.model, call.include_usage);
        let events = streaming::openai_event_stream(response.bytes_stream(), mapper);
        return Ok((
            [
                (header::CONTENT_TYPE, "text/event-stream"),
                (header::CACHE_CONTROL, "no-cache"),
            ],
            Body::from_stream(events),
        )
            .into_response());
    }

    let native: Value = response.json().await?;
    Ok(Json(to_openai_response(&native, &call.model, &id)).into_response())
}

// Native formats get the upstream body byte for byte.
fn passthrough(response: reqwest::Response, stream: bool) -> Response {
    let fallback = if stream {
        "text/event-stream"
    } else {
        "application/json"
    };
    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| HeaderValue::from_str(v).ok())
        .unwrap_or_else(|| HeaderValue::from_static(fallback));

    (
        [(header::CONTENT_TYPE, content_type)],
        Body::from_stream(response.bytes_stream()),
    )
        .into_response()
}

async fn embeddings(state: &AppState, req: Value, api_key: &str) -> ProxyResult<Response> {
    let requested = req
        .get("model")
        .and_then(|v| v.as_str())
        .ok_or_else(|| ProxyError::BadRequest("model is not specified".to_string()))?;

    let (model, echoed) = if requested.starts_with("models/") {
        (requested.to_string(), requested.to_string())
    } else {
        let default = &state.config.default_embeddings_model;
        (format!("models/{}", default), default.clone())
    };

    let inputs = match req.get("input") {
        Some(Value::Array(items)) => items.clone(),
        Some(item) => vec![item.clone()],
        None => Vec::new(),
    };
    let dimensions = req.get("dimensions").filter(|v| !v.is_null());

    let requests: Vec<Value> = inputs
        .into_iter()
        .map(|text| {
            let mut request = json!({
                "model": model,
                "content": { "parts": [{ "text": text }] },
            });
            if let Some(dimensions) = dimensions {
                request["outputDimensionality"] = dimensions.clone();
            }
            request
        })
        .collect();

    let native = state
        .gemini
        .batch_embed_contents(&model, api_key, &json!({ "requests": requests }))
        .await?;

    let data: Vec<Value> = native
        .get("embeddings")
        .and_then(|v| v.as_array())
        .map(|embeddings| {
            embeddings
                .iter()
                .enumerate()
                .map(|(index, e)| {
                    json!({
                        "object": "embedding",
                        "index": index,
                        "embedding": e.get("values").cloned().unwrap_or(Value::Null),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    Ok(Json(json!({
        "object": "list",
        "data": data,
        "model": echoed,
    }))
    .into_response())
}

async fn models(state: &AppState, format: Format, api_key: &str) -> ProxyResult<Response> {
    let native = state.gemini.list_models(api_key).await?;
    let models = native.get("models").cloned().unwrap_or_else(|| json!([]));

    if format.is_native() {
        return Ok(Json(json!({ "models": models })).into_response());
    }

    let data: Vec<Value> = models
        .as_array()
        .map(|models| {
            models
                .iter()
                .filter_map(|m| m.get("name").and_then(|n| n.as_str()))
                .map(|name| {
                    json!({
                        "id": name.strip_prefix("models/").unwrap_or(name),
                        "object": "model",
                        "created": 0,
                        "owned_by": "",
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    Ok(Json(json!({ "object": "list", "data": data })).into_response())
}

/// One non-streaming completion, returned as a JSON body.
async fn complete_unary(
    state: &AppState,
    format: Format,
    req: Value,
    api_key: &str,
) -> ProxyResult<Value> {
    let call = prepare_call(state, format, None, Some(false), req).await?;
    let response = state
        .gemini
        .generate_content(&call.model, None, api_key, &call.payload)
        .await?;
    let native: Value = response.json().await?;

    if format.is_native() {
        Ok(native)
    } else {
        Ok(to_openai_response(&native, &call.model, &generate_chatcmpl_id()))
    }
}

async fn batch(state: &AppState, format: Format, req: Value, api_key: &str) -> ProxyResult<Response> {
    let requests = req
        .get("requests")
        .and_then(|v| v.as_array())
        .ok_or_else(|| ProxyError::BadRequest("requests must be an array".to_string()))?;

    tracing::info!("Batch of {} requests", requests.len());

    let jobs = requests.iter().enumerate().map(|(index, item)| async move {
        let id = item
            .get("custom_id")
            .and_then(|v| v.as_str())
            .map(String::from)
            .unwrap_or_else(|| format!("batch_{}", index));

        let (status_code, body) = match complete_unary(state, format, item.clone(), api_key).await {
            Ok(body) => (StatusCode::OK.as_u16(), body),
            Err(e) => {
                tracing::warn!("Batch item {} failed: {}", id, e);
                (e.status().as_u16(), json!({ "error": { "message": e.to_string() } }))
            }
        };

        json!({
            "id": id,
            "response": { "status_code": status_code, "body": body },
        })
    });
    let data = futures::future::join_all(jobs).await;

    Ok(Json(json!({
        "object": "list",
        "data": data,
        "has_more": false,
    }))
    .into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_resolution() {
        let default = "gemini-2.5-pro";
        assert_eq!(resolve_model(Some("models/gemini-1.5-flash"), default), "gemini-1.5-flash");
        assert_eq!(resolve_model(Some("gemini-2.0-flash"), default), "gemini-2.0-flash");
        assert_eq!(resolve_model(Some("learnlm-1.5-pro"), default), "learnlm-1.5-pro");
        assert_eq!(resolve_model(Some("gpt-4o"), default), default);
        assert_eq!(resolve_model(None, default), default);
    }

    #[test]
    fn bearer_extraction() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), None);

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer tok"));
        assert_eq!(bearer_token(&headers), Some("tok"));

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("bearer  tok2 "));
        assert_eq!(bearer_token(&headers), Some("tok2"));

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("rawtoken"));
        assert_eq!(bearer_token(&headers), Some("rawtoken"));

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("   "));
        assert_eq!(bearer_token(&headers), None);
    }

    #[test]
    fn native_generate_path_detection() {
        assert!(is_native_generate_path("/v1beta/models/gemini-2.5-pro:generateContent"));
        assert!(!is_native_generate_path("/v1beta/models/gemini-2.5-pro:streamGenerateContent"));
        assert!(!is_native_generate_path("/v1/openai/chat/completions"));
    }
}
