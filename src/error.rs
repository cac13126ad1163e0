use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use tracing::{error, warn};

/// Everything that can go wrong between accepting a request and handing the
/// client a response. The edge translates each variant to an HTTP status;
/// release of any held GPUs is the caller's job and happens on every path.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("{0}")]
    BadRequest(String),

    #[error("Content-Type must be application/json")]
    UnsupportedMediaType,

    /// The relational store failed while resolving assignments. Cache
    /// failures never produce this — they degrade to the store path.
    #[error("assignment lookup failed: {0}")]
    Catalog(#[from] sqlx::Error),

    /// Cache-side failure surfaced from an explicit cache operation
    /// (invalidation). Read-through failures are swallowed in the catalog.
    #[error("cache operation failed: {0}")]
    Cache(#[from] redis::RedisError),

    #[error("timed out waiting for a free GPU")]
    ReserveTimeout,

    #[error("upstream request failed: {0}")]
    Upstream(#[from] reqwest::Error),

    /// `get_reserved` found no assignment fully held by the request. A waiter
    /// only calls it after its wakeup signal fired, so this is a logic bug,
    /// not a client-visible class.
    #[error("no reservation held for request {request_id} on model '{model}'")]
    NotReserved { model: String, request_id: String },

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::UnsupportedMediaType => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            Self::ReserveTimeout => StatusCode::GATEWAY_TIMEOUT,
            Self::Catalog(_)
            | Self::Cache(_)
            | Self::Upstream(_)
            | Self::NotReserved { .. }
            | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = %self, "request failed");
        } else {
            warn!(error = %self, "request rejected");
        }
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}
