use axum::body::Body;
use axum::http::{header, Response};
use bytes::Bytes;
use futures::StreamExt;
use reqwest::Client;
use tracing::{error, info};

use crate::error::GatewayError;
use crate::scheduler::ReleaseGuard;

fn log_freed(freed: &[String]) {
    if !freed.is_empty() {
        info!(gpus = ?freed, "Released GPUs");
    }
}

/// Forward a normalised request to an inference backend and hand the response
/// back, streamed or buffered. Upstream status and content type pass through
/// verbatim; connect and read failures surface as [`GatewayError::Upstream`].
///
/// The `ReleaseGuard` is consumed here: the buffered path releases as soon as
/// the upstream body has been read, while the streaming path carries the
/// guard inside the body stream so release fires when the last chunk is
/// delivered or the client disconnects.
pub async fn forward_to_backend(
    client: &Client,
    upstream_url: &str,
    body: Bytes,
    is_streaming: bool,
    guard: ReleaseGuard,
) -> Result<Response<Body>, GatewayError> {
    let response = match client
        .post(upstream_url)
        .header(header::CONTENT_TYPE, "application/json")
        .body(body)
        .send()
        .await
    {
        Ok(resp) => resp,
        Err(e) => {
            error!(error = %e, upstream = %upstream_url, "Failed to reach backend");
            log_freed(&guard.release_now().await);
            return Err(GatewayError::Upstream(e));
        }
    };

    let status = response.status();
    let headers = response.headers().clone();

    if is_streaming {
        // Chunks are forwarded as they arrive; the transport flushes each
        // one. The guard lives inside the closure for the lifetime of the
        // body stream.
        let stream = response.bytes_stream().map(move |chunk| {
            let _held = &guard;
            chunk.map_err(|e| {
                error!(error = %e, "Error streaming from backend");
                std::io::Error::other(e)
            })
        });

        let mut builder = Response::builder().status(status.as_u16());
        if let Some(ct) = headers.get(header::CONTENT_TYPE) {
            builder = builder.header(header::CONTENT_TYPE, ct);
        }
        Ok(builder.body(Body::from_stream(stream)).unwrap())
    } else {
        match response.bytes().await {
            Ok(body_bytes) => {
                log_freed(&guard.release_now().await);

                let mut builder = Response::builder().status(status.as_u16());
                if let Some(ct) = headers.get(header::CONTENT_TYPE) {
                    builder = builder.header(header::CONTENT_TYPE, ct);
                } else {
                    builder = builder.header(header::CONTENT_TYPE, "application/json");
                }
                Ok(builder.body(Body::from(body_bytes)).unwrap())
            }
            Err(e) => {
                error!(error = %e, "Failed to read backend response body");
                log_freed(&guard.release_now().await);
                Err(GatewayError::Upstream(e))
            }
        }
    }
}
