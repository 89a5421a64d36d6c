use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

/// Errors surfaced by the proxy, each mapped to a specific HTTP status and
/// Registry v2 error-envelope `code` per the distribution spec.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("unauthenticated")]
    Unauthenticated,

    #[error("forbidden: missing {0:?}")]
    Forbidden(Vec<String>),

    #[error("name unknown: {0}")]
    NameUnknown(String),

    #[error("manifest unknown: {0}")]
    ManifestUnknown(String),

    #[error("blob unknown: {0}")]
    BlobUnknown(String),

    #[error("upstream authentication failed: {0}")]
    UpstreamAuth(String),

    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("upstream request error: {0}")]
    Upstream(#[from] reqwest::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ProxyError {
    fn code(&self) -> &'static str {
        match self {
            ProxyError::BadRequest(_) => "UNSUPPORTED",
            ProxyError::Unauthenticated => "UNAUTHORIZED",
            ProxyError::Forbidden(_) => "DENIED",
            ProxyError::NameUnknown(_) => "NAME_UNKNOWN",
            ProxyError::ManifestUnknown(_) => "MANIFEST_UNKNOWN",
            ProxyError::BlobUnknown(_) => "BLOB_UNKNOWN",
            ProxyError::UpstreamAuth(_) => "UNAUTHORIZED",
            ProxyError::UpstreamUnavailable(_) => "UNAVAILABLE",
            ProxyError::Upstream(_) => "UNAVAILABLE",
            ProxyError::Internal(_) => "UNKNOWN",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            ProxyError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ProxyError::Unauthenticated => StatusCode::UNAUTHORIZED,
            ProxyError::Forbidden(_) => StatusCode::FORBIDDEN,
            ProxyError::NameUnknown(_) | ProxyError::ManifestUnknown(_) | ProxyError::BlobUnknown(_) => {
                StatusCode::NOT_FOUND
            }
            ProxyError::UpstreamAuth(_) => StatusCode::BAD_GATEWAY,
            ProxyError::UpstreamUnavailable(_) => StatusCode::BAD_GATEWAY,
            ProxyError::Upstream(e) => {
                if e.is_timeout() {
                    StatusCode::GATEWAY_TIMEOUT
                } else {
                    StatusCode::BAD_GATEWAY
                }
            }
            ProxyError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Detail payload for the error envelope: missing permission URIs for
    /// `Forbidden`, the message otherwise.
    fn detail(&self) -> serde_json::Value {
        match self {
            ProxyError::Forbidden(missing) => json!(missing),
            other => json!(other.to_string()),
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        if matches!(
            self,
            ProxyError::UpstreamAuth(_) | ProxyError::Upstream(_) | ProxyError::UpstreamUnavailable(_)
        ) {
            tracing::error!(error = %self, "upstream failure");
        }
        if matches!(self, ProxyError::Internal(_)) {
            tracing::error!(error = %self, "internal error");
        }

        let status = self.status();
        let code = self.code();
        let message = self.to_string();
        let detail = self.detail();

        let body = Json(json!({
            "errors": [{
                "code": code,
                "message": message,
                "detail": detail,
            }]
        }));

        let mut response = (status, body).into_response();

        if matches!(self, ProxyError::Unauthenticated) {
            response.headers_mut().insert(
                header::WWW_AUTHENTICATE,
                HeaderValue::from_static(r#"Basic realm="Registry""#),
            );
        }

        response
    }
}

pub type Result<T> = std::result::Result<T, ProxyError>;
