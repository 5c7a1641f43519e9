// Proxy error taxonomy and its HTTP rendering

use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use thiserror::Error;

pub type ProxyResult<T> = std::result::Result<T, ProxyError>;

#[derive(Debug, Error)]
pub enum ProxyError {
    /// Missing or unknown bearer token.
    #[error("{0}")]
    Authentication(String),

    /// Verb not accepted by a proxied endpoint.
    #[error("The specified HTTP method is not allowed for the requested resource")]
    MethodNotAllowed,

    /// Verb not accepted by a credential management endpoint.
    #[error("Method not allowed")]
    ManagementMethodNotAllowed,

    #[error("Unsupported response_format.type")]
    UnsupportedFormat,

    #[error("Unknown \"content\" item type: \"{0}\"")]
    TypeMismatch(String),

    #[error("Invalid image data: {0}")]
    InvalidImageData(String),

    #[error("Error fetching image: {0}")]
    ImageFetch(String),

    #[error("{0}")]
    BadRequest(String),

    /// Upstream answered with a non-2xx status.
    #[error("Gemini API Error: {status} - {message}")]
    Upstream { status: u16, message: String },

    #[error("Request timeout")]
    Timeout,

    #[error("Network error: {0}")]
    Network(String),

    #[error("404 Not Found")]
    NotFound,

    #[error("No API Key available")]
    NoCredentialAvailable,
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::Authentication(_) => StatusCode::UNAUTHORIZED,
            ProxyError::MethodNotAllowed
            | ProxyError::UnsupportedFormat
            | ProxyError::TypeMismatch(_)
            | ProxyError::InvalidImageData(_)
            | ProxyError::ImageFetch(_)
            | ProxyError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ProxyError::ManagementMethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            ProxyError::Upstream { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            ProxyError::Timeout => StatusCode::REQUEST_TIMEOUT,
            ProxyError::Network(_) | ProxyError::NoCredentialAvailable => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            ProxyError::NotFound => StatusCode::NOT_FOUND,
        }
    }
}

impl From<reqwest::Error> for ProxyError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ProxyError::Timeout
        } else {
            ProxyError::Network(err.to_string())
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!("{}", self);
        } else {
            tracing::warn!("{}", self);
        }
        (
            status,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            self.to_string(),
        )
            .into_response()
    }
}
