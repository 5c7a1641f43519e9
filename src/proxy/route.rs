// Route classifier - maps an inbound path to the protocol format and logical
// endpoint it addresses

use axum::http::Method;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    /// OpenAI-shaped bodies, translated both ways.
    OpenAi,
    /// Native upstream bodies under a dual-format or `/gemini` prefix.
    Gemini,
    /// Native upstream bodies on the Google SDK path layout; model and stream
    /// flag come from the URL.
    GoogleSdk,
}

impl Format {
    pub fn is_native(self) -> bool {
        matches!(self, Format::Gemini | Format::GoogleSdk)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Format::OpenAi => "openai",
            Format::Gemini => "gemini",
            Format::GoogleSdk => "google-sdk",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    ChatCompletions,
    Embeddings,
    Models,
    Batch,
    ApiKeys,
    AuthTokens,
    /// Remainder of a prefix-routed path that names no known endpoint.
    Other(String),
}

impl Endpoint {
    fn parse(raw: &str) -> Self {
        match raw {
            "chat/completions" => Endpoint::ChatCompletions,
            "embeddings" => Endpoint::Embeddings,
            "models" => Endpoint::Models,
            "batch" => Endpoint::Batch,
            "api-keys" => Endpoint::ApiKeys,
            "auth-tokens" => Endpoint::AuthTokens,
            other => Endpoint::Other(other.to_string()),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Endpoint::ChatCompletions => "chat/completions",
            Endpoint::Embeddings => "embeddings",
            Endpoint::Models => "models",
            Endpoint::Batch => "batch",
            Endpoint::ApiKeys => "api-keys",
            Endpoint::AuthTokens => "auth-tokens",
            Endpoint::Other(s) => s,
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub format: Format,
    pub endpoint: Endpoint,
    /// Model named in the path (Google SDK layout only).
    pub model: Option<String>,
    /// Stream flag derived from the path (Google SDK layout only).
    pub stream: Option<bool>,
}

impl Route {
    fn new(format: Format, endpoint: Endpoint) -> Self {
        Self {
            format,
            endpoint,
            model: None,
            stream: None,
        }
    }
}

/// Result of classification; `None` format/endpoint means unroutable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteInfo(pub Option<Route>);

impl RouteInfo {
    pub fn route(&self) -> Option<&Route> {
        self.0.as_ref()
    }
}

type Matcher = fn(&str, &[&str], &Method) -> Option<Route>;

/// Evaluated top to bottom, first match wins. The looser prefix rules at the
/// end must stay below the native and dual-format ones.
const MATCHERS: &[Matcher] = &[
    native_model_list,
    native_generate,
    dual_format,
    legacy_suffix,
    batch,
    gemini_prefix,
    v1_fallback,
    bare_generate,
];

/// Classify a request by path and method. Only the Google SDK model listing is
/// method-qualified; every other verb check happens at dispatch.
pub fn classify(path: &str, method: &Method) -> RouteInfo {
    let parts: Vec<&str> = path.split('/').filter(|p| !p.is_empty()).collect();
    let route = MATCHERS.iter().find_map(|matcher| matcher(path, &parts, method));
    if route.is_none() {
        tracing::debug!("No route match found for {}", path);
    }
    RouteInfo(route)
}

// GET /v1beta/models
fn native_model_list(_path: &str, parts: &[&str], method: &Method) -> Option<Route> {
    (*method == Method::GET && parts == ["v1beta", "models"])
        .then(|| Route::new(Format::GoogleSdk, Endpoint::Models))
}

// /v1beta/models/{model}:generateContent | :streamGenerateContent
fn native_generate(_path: &str, parts: &[&str], _method: &Method) -> Option<Route> {
    match parts {
        ["v1beta", "models", action] => generate_route(action),
        _ => None,
    }
}

// /v1/{openai|gemini}/{endpoint...}
fn dual_format(_path: &str, parts: &[&str], _method: &Method) -> Option<Route> {
    if parts.len() < 3 || parts[0] != "v1" {
        return None;
    }
    let format = match parts[1] {
        "openai" => Format::OpenAi,
        "gemini" => Format::Gemini,
        _ => return None,
    };
    Some(Route::new(format, Endpoint::parse(&parts[2..].join("/"))))
}

fn legacy_suffix(path: &str, _parts: &[&str], _method: &Method) -> Option<Route> {
    const SUFFIXES: &[(&str, Endpoint)] = &[
        ("/chat/completions", Endpoint::ChatCompletions),
        ("/embeddings", Endpoint::Embeddings),
        ("/models", Endpoint::Models),
        ("/api-keys", Endpoint::ApiKeys),
        ("/auth-tokens", Endpoint::AuthTokens),
    ];
    SUFFIXES
        .iter()
        .find(|(suffix, _)| path.ends_with(suffix))
        .map(|(_, endpoint)| Route::new(Format::OpenAi, endpoint.clone()))
}

fn batch(path: &str, _parts: &[&str], _method: &Method) -> Option<Route> {
    if !path.contains("/batch") {
        return None;
    }
    let format = if path.contains("/v1/gemini/") {
        Format::Gemini
    } else {
        Format::OpenAi
    };
    Some(Route::new(format, Endpoint::Batch))
}

// /gemini/{endpoint...}
fn gemini_prefix(_path: &str, parts: &[&str], _method: &Method) -> Option<Route> {
    match parts {
        ["gemini", rest @ ..] if !rest.is_empty() => {
            Some(Route::new(Format::Gemini, Endpoint::parse(&rest.join("/"))))
        }
        _ => None,
    }
}

// /v1/{x}/... where x is neither openai nor gemini
fn v1_fallback(_path: &str, parts: &[&str], _method: &Method) -> Option<Route> {
    match parts {
        ["v1", rest @ ..] if !rest.is_empty() && !matches!(rest[0], "openai" | "gemini") => {
            Some(Route::new(Format::Gemini, Endpoint::parse(&rest.join("/"))))
        }
        _ => None,
    }
}

// /models/{model}:generateContent
fn bare_generate(_path: &str, parts: &[&str], _method: &Method) -> Option<Route> {
    match parts {
        ["models", action, ..] => generate_route(action),
        _ => None,
    }
}

fn generate_route(action: &str) -> Option<Route> {
    let (model, method) = action.split_once(':')?;
    if method != "generateContent" && method != "streamGenerateContent" {
        return None;
    }
    Some(Route {
        format: Format::GoogleSdk,
        endpoint: Endpoint::ChatCompletions,
        model: Some(model.to_string()),
        stream: Some(method.contains("stream")),
    })
}
