//! HTTP surface: webhook ingestion plus job queries and operator actions.

pub mod auth;
pub mod handlers;
pub mod hooks;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::collab::{ContentStore, Identity, WorkerClient};
use crate::error::Result;
use crate::ingest::Ingestor;
use crate::scheduler::JobStateMachine;

/// How long `POST /cancel` waits for a worker to pick the job up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CancelPolicy {
    pub attempts: u32,
    pub interval: Duration,
}

impl Default for CancelPolicy {
    fn default() -> Self {
        Self {
            attempts: 10,
            interval: Duration::from_secs(2),
        }
    }
}

#[derive(Clone)]
pub struct WebState {
    pub machine: Arc<JobStateMachine>,
    pub ingestor: Arc<Ingestor>,
    pub identity: Arc<dyn Identity>,
    pub workers: Arc<dyn WorkerClient>,
    pub content: Arc<dyn ContentStore>,
    pub cancel: CancelPolicy,
}

pub fn router(state: WebState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let jobs = Router::new()
        .route("/jobs/:project_id", get(handlers::project_jobs))
        .route("/job/:jid", get(handlers::job))
        .route("/download/:job_id/:resource_id", get(handlers::download))
        .route("/logs/:cid", get(handlers::logs))
        .route("/cancel/:jid", post(handlers::cancel))
        .route("/retry/:jid", post(handlers::retry))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_token,
        ));

    Router::new()
        .route("/github/:hook", post(hooks::github))
        .route("/ping", get(hooks::ping))
        .merge(jobs)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Serves until `shutdown` fires.
pub async fn run_http(
    addr: SocketAddr,
    state: WebState,
    shutdown: CancellationToken,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %addr, "Starting HTTP server");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    tracing::info!("HTTP server stopped");
    Ok(())
}
