pub mod streaming;

use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::{header, HeaderMap, HeaderValue, Uri};
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::GatewayError;
use crate::scheduler::{ReleaseGuard, Reservation};
use crate::AppState;

/// Decoded inference request body. `model` routes the request; `keep_alive`
/// and `stream` are forwarded when present; everything else lands in the
/// extras bag and is passed through untouched (backends accept knobs the
/// gateway does not enumerate).
#[derive(Debug, Serialize, Deserialize)]
pub struct InferenceRequest {
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keep_alive: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    #[serde(flatten)]
    pub extras: serde_json::Map<String, serde_json::Value>,
}

fn is_json(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(';').next().unwrap_or("").trim() == "application/json")
        .unwrap_or(false)
}

/// Shared handler behind every forwarded route. Reserves a GPU set for the
/// named model (waiting up to the configured deadline), proxies the
/// normalised body to the chosen backend, and guarantees release on every
/// exit path.
pub async fn inference_handler(
    State(state): State<Arc<AppState>>,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request_id = Uuid::new_v4().to_string();

    let mut response = match proxy_inference(&state, &uri, &headers, body, &request_id).await {
        Ok(resp) => resp,
        Err(err) => err.into_response(),
    };

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert("x-request-id", value);
    }
    response
}

async fn proxy_inference(
    state: &Arc<AppState>,
    uri: &Uri,
    headers: &HeaderMap,
    body: Bytes,
    request_id: &str,
) -> Result<Response, GatewayError> {
    if !is_json(headers) {
        return Err(GatewayError::UnsupportedMediaType);
    }

    let parsed: InferenceRequest = serde_json::from_slice(&body)
        .map_err(|e| GatewayError::BadRequest(format!("invalid request body: {e}")))?;

    // One canonical object: known fields plus the extras bag. These bytes are
    // what the backend receives.
    let merged = serde_json::to_vec(&parsed)
        .map_err(|e| GatewayError::Internal(anyhow::anyhow!("re-encoding request body: {e}")))?;

    info!(
        request_id = %request_id,
        model = %parsed.model,
        stream = parsed.stream.unwrap_or(false),
        path = %uri.path(),
        "Inference request"
    );

    // Armed before the reservation attempt: every exit from here on releases,
    // including cancellation when the client disconnects mid-wait.
    let guard = ReleaseGuard::new(state.engine.clone(), &parsed.model, request_id);
    let deadline = Duration::from_secs(state.config.reserve_timeout_secs);

    let reserve_flow = async {
        match state.engine.reserve(&parsed.model, request_id).await? {
            Reservation::Ready(assignment) => Ok(assignment),
            Reservation::Queued(rx) => {
                let stats = state.engine.queue_stats(&parsed.model).await;
                info!(
                    request_id = %request_id,
                    model = %parsed.model,
                    depth = stats.depth,
                    avg_wait_ms = stats.avg_wait_ms,
                    "All assignments busy; queued"
                );
                rx.await.map_err(|_| {
                    GatewayError::Internal(anyhow::anyhow!("wait queue closed before wakeup"))
                })?;
                state.engine.get_reserved(&parsed.model, request_id).await
            }
        }
    };

    let assignment = match tokio::time::timeout(deadline, reserve_flow).await {
        Ok(Ok(assignment)) => assignment,
        Ok(Err(err)) => {
            guard.release_now().await;
            return Err(err);
        }
        Err(_) => {
            warn!(
                request_id = %request_id,
                model = %parsed.model,
                "Timed out waiting for a free GPU"
            );
            let freed = guard.release_now().await;
            if !freed.is_empty() {
                // The sweep woke this request right at the deadline; the
                // holds it was handed go straight back.
                info!(request_id = %request_id, gpus = ?freed, "Released GPUs");
            }
            return Err(GatewayError::ReserveTimeout);
        }
    };

    let upstream_url = format!("http://{}:{}{}", assignment.ip_addr, assignment.port, uri);
    info!(
        request_id = %request_id,
        backend = %assignment.name,
        upstream = %upstream_url,
        "Proxying request"
    );

    let is_streaming = parsed.stream.unwrap_or(false);
    streaming::forward_to_backend(
        &state.http,
        &upstream_url,
        Bytes::from(merged),
        is_streaming,
        guard,
    )
    .await
}

/// DELETE /cache — drop every cached assignment list so the next resolution
/// re-reads the store.
pub async fn clear_cache_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.catalog.invalidate().await {
        Ok(deleted) => {
            info!(deleted, "Assignment cache cleared");
            Json(serde_json::json!({ "message": "Cache cleared successfully" })).into_response()
        }
        Err(err) => err.into_response(),
    }
}
