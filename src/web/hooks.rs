use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::Json;
use serde_json::{json, Value};
use tracing::debug;

use crate::error::Result;
use crate::ingest::{Delivery, Signatures};
use crate::scheduler::Job;
use crate::web::WebState;

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

/// `POST /github/:hook`
pub async fn github(
    State(state): State<WebState>,
    Path(hook): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Job>> {
    debug!(
        hook = %hook,
        delivery = header(&headers, "x-github-delivery").unwrap_or("-"),
        hook_id = header(&headers, "x-github-hook-id").unwrap_or("-"),
        "Webhook received"
    );

    let delivery = Delivery {
        hook_id: &hook,
        event: header(&headers, "x-github-event"),
        signatures: Signatures {
            sha256: header(&headers, "x-hub-signature-256"),
            sha1: header(&headers, "x-hub-signature"),
        },
        body: &body,
    };
    let job = state.ingestor.ingest(delivery).await?;
    Ok(Json(job))
}

/// `GET /ping`
pub async fn ping() -> Json<Value> {
    Json(json!({ "ping": "pong" }))
}
