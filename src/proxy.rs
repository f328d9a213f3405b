//! Front Door
//!
//! Single endpoint in front of both instances. Each `/api/...` request is
//! forwarded to a healthy instance (primary preferred) and the response is
//! returned unchanged. Writes an instance accepted are handed to the
//! capture filter so the other instance receives them later.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    http::{header, HeaderMap, HeaderValue, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    Json, Router,
};
use tokio::sync::watch;
use tower_http::trace::TraceLayer;

use crate::capture::{AcceptedWrite, CaptureFilter};
use crate::error::Result;
use crate::health::HealthTracker;
use crate::instance::{Instances, RawResponse};
use crate::wal::Instance;

/// Request headers not forwarded to an instance
const HOP_HEADERS: [&str; 5] = [
    "host",
    "connection",
    "content-length",
    "transfer-encoding",
    "keep-alive",
];

/// Shared front door state
pub struct FrontDoor {
    instances: Arc<Instances>,
    health: Arc<HealthTracker>,
    capture: Arc<CaptureFilter>,
}

impl FrontDoor {
    pub fn new(instances: Arc<Instances>, health: Arc<HealthTracker>, capture: Arc<CaptureFilter>) -> Self {
        Self {
            instances,
            health,
            capture,
        }
    }

    /// Forward to the first instance that answers; None when neither does
    async fn forward(
        &self,
        method: &Method,
        path: &str,
        headers: &HeaderMap,
        body: Bytes,
    ) -> Option<(Instance, RawResponse)> {
        let method = reqwest::Method::from_bytes(method.as_str().as_bytes()).ok()?;
        let forwarded = forwarded_headers(headers);

        for instance in self.health.routing_order() {
            match self
                .instances
                .get(instance)
                .send(method.clone(), path, &forwarded, body.clone())
                .await
            {
                Ok(response) if response.status == 503 => {
                    tracing::warn!("{} unavailable for {} {}, trying the other instance", instance, method, path);
                    self.health.record_failure(instance);
                }
                Ok(response) => {
                    self.health.record_success(instance);
                    return Some((instance, response));
                }
                Err(e) => {
                    tracing::warn!("Forwarding {} {} to {} failed: {}", method, path, instance, e);
                    self.health.record_failure(instance);
                }
            }
        }
        None
    }

    /// Log an accepted write for the other instance.
    ///
    /// The instance has applied the write, so the client still gets its
    /// answer. The capture filter retries the append and counts writes it
    /// could not log; those show on the operator status.
    async fn record_accepted(&self, write: AcceptedWrite, received_by: Instance, response: &RawResponse) {
        if !response.is_success() {
            return;
        }
        if let Err(e) = self
            .capture
            .observe_response(&write, received_by, response.status, &response.body)
            .await
        {
            tracing::error!("Could not record collection id from {}: {}", received_by, e);
        }
        if let Err(e) = self.capture.capture(&write, received_by).await {
            tracing::debug!("Capture of {} {} gave up: {}", write.method, write.path, e);
        }
    }
}

/// Router forwarding everything under `/api/`
pub fn router(door: Arc<FrontDoor>) -> Router {
    Router::new()
        .fallback(handle_forward)
        .layer(TraceLayer::new_for_http())
        .with_state(door)
}

/// Serve the front door until `shutdown` flips to true
pub async fn serve(door: Arc<FrontDoor>, bind_address: &str, mut shutdown: watch::Receiver<bool>) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind_address).await?;
    tracing::info!("Front door listening on {}", bind_address);

    axum::serve(listener, router(door))
        .with_graceful_shutdown(async move {
            while shutdown.changed().await.is_ok() {
                if *shutdown.borrow() {
                    break;
                }
            }
        })
        .await?;
    Ok(())
}

async fn handle_forward(
    State(door): State<Arc<FrontDoor>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if !uri.path().starts_with("/api/") {
        return StatusCode::NOT_FOUND.into_response();
    }
    let path = uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| uri.path().to_string());

    let Some((received_by, response)) = door.forward(&method, &path, &headers, body.clone()).await else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "error": "No database instance is available",
                "code": "NO_INSTANCE",
            })),
        )
            .into_response();
    };

    let write = AcceptedWrite {
        method,
        path,
        headers,
        body,
    };
    door.record_accepted(write, received_by, &response).await;

    into_response(response)
}

fn forwarded_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
    headers
        .iter()
        .filter(|(name, _)| !HOP_HEADERS.contains(&name.as_str()))
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}

fn into_response(raw: RawResponse) -> Response {
    let status = StatusCode::from_u16(raw.status).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut response = (status, raw.body).into_response();
    if let Some(value) = raw.content_type.and_then(|ct| HeaderValue::from_str(&ct).ok()) {
        response.headers_mut().insert(header::CONTENT_TYPE, value);
    }
    response
}
