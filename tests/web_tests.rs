mod common;

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    http::{header, Request, StatusCode},
    Router,
};
use http_body_util::BodyExt;
use serde_json::Value;
use tower::ServiceExt;

use patrick::collab::{
    IdentitySeed, MemoryContent, MemoryNaming, NoticeWorkerClient, StaticIdentity,
};
use patrick::dispatch::Dispatcher;
use patrick::ingest::signature::sign_sha256;
use patrick::ingest::{IngestSettings, Ingestor};
use patrick::scheduler::{Caller, JobStatus, Located, Report};
use patrick::web::{router, CancelPolicy, WebState};

use common::{push_body, Harness};

const TOKEN: &str = "tok-1";
const SECRET: &str = "s3cret";

struct App {
    h: Harness,
    content: Arc<MemoryContent>,
    router: Router,
}

fn create_test_app() -> App {
    let h = Harness::new(2);

    let mut seed = IdentitySeed::default();
    seed.hooks.insert("hook-1".to_string(), SECRET.to_string());
    seed.repositories.insert(42, "proj-1".to_string());
    seed.tokens.push(TOKEN.to_string());
    let identity = Arc::new(StaticIdentity::from_seed(&seed));

    let ingestor = Arc::new(Ingestor::new(
        h.machine.clone(),
        identity.clone(),
        Arc::new(MemoryNaming::new()),
        IngestSettings::default(),
    ));
    let content = Arc::new(MemoryContent::new());
    let dispatcher = Dispatcher::new(Arc::new(h.publisher.clone()));

    let state = WebState {
        machine: h.machine.clone(),
        ingestor,
        identity,
        workers: Arc::new(NoticeWorkerClient::new(dispatcher)),
        content: content.clone(),
        cancel: CancelPolicy {
            attempts: 2,
            interval: Duration::from_millis(10),
        },
    };

    App {
        h,
        content,
        router: router(state),
    }
}

fn authed(method: &str, uri: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::AUTHORIZATION, format!("Bearer {}", TOKEN))
        .body(Body::empty())
        .unwrap()
}

async fn send(app: &App, request: Request<Body>) -> (StatusCode, Vec<u8>, Option<String>) {
    let response = app.router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let content_type = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, body.to_vec(), content_type)
}

async fn send_json(app: &App, request: Request<Body>) -> (StatusCode, Value) {
    let (status, body, _) = send(app, request).await;
    (status, serde_json::from_slice(&body).unwrap_or(Value::Null))
}

/// Finishes `jid` with one build output.
async fn finish(app: &App, jid: &str, cid: &str) {
    app.h.machine.lock(jid, "A", 60).await.unwrap();
    let report = Report {
        asset_cid: [("out".to_string(), cid.to_string())].into_iter().collect(),
        ..Default::default()
    };
    app.h
        .machine
        .done(jid, &Caller::peer("A"), report)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_ping_needs_no_token() {
    let app = create_test_app();
    let request = Request::builder()
        .uri("/ping")
        .body(Body::empty())
        .unwrap();

    let (status, body) = send_json(&app, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ping"], "pong");
}

#[tokio::test]
async fn test_job_routes_require_token() {
    let app = create_test_app();
    app.h.open_job("j1", "proj-1").await;

    let missing = Request::builder()
        .uri("/job/j1")
        .body(Body::empty())
        .unwrap();
    let (status, body) = send_json(&app, missing).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(body["error"].is_string());

    let wrong = Request::builder()
        .uri("/job/j1")
        .header(header::AUTHORIZATION, "Bearer nope")
        .body(Body::empty())
        .unwrap();
    let (status, _) = send_json(&app, wrong).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let other_scheme = Request::builder()
        .uri("/job/j1")
        .header(header::AUTHORIZATION, format!("github {}", TOKEN))
        .body(Body::empty())
        .unwrap();
    let (status, _) = send_json(&app, other_scheme).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_project_jobs() {
    let app = create_test_app();
    app.h.open_job("j1", "proj-1").await;
    app.h.open_job("j2", "proj-1").await;

    let (status, body) = send_json(&app, authed("GET", "/jobs/proj-1")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ProjectId"], "proj-1");
    assert_eq!(body["JobIds"], serde_json::json!(["j1", "j2"]));
}

#[tokio::test]
async fn test_job_lookup() {
    let app = create_test_app();
    app.h.open_job("j1", "proj-1").await;

    let (status, body) = send_json(&app, authed("GET", "/job/j1")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["job"]["id"], "j1");
    assert_eq!(body["job"]["status"], "open");
    assert_eq!(body["job"]["meta"]["ref"], "refs/heads/main");

    let (status, _) = send_json(&app, authed("GET", "/job/missing")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_download_detects_archive_type() {
    let app = create_test_app();
    app.h.open_job("wasm-job", "proj-1").await;
    app.h.open_job("zip-job", "proj-1").await;
    finish(&app, "wasm-job", "cid-wasm").await;
    finish(&app, "zip-job", "cid-zip").await;
    app.content
        .insert("cid-wasm", b"\0asm\x01\0\0\0".to_vec())
        .await;
    app.content
        .insert("cid-zip", b"PK\x03\x04rest".to_vec())
        .await;

    let (status, body, content_type) = send(&app, authed("GET", "/download/wasm-job/out")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(content_type.as_deref(), Some("application/wasm"));
    assert_eq!(body, b"\0asm\x01\0\0\0");

    let (status, _, content_type) = send(&app, authed("GET", "/download/zip-job/out")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(content_type.as_deref(), Some("application/zip"));

    let (status, _) = send_json(&app, authed("GET", "/download/zip-job/nope")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_download_of_active_job_rejected() {
    let app = create_test_app();
    app.h.open_job("j1", "proj-1").await;

    let (status, _) = send_json(&app, authed("GET", "/download/j1/out")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_logs_served_as_text() {
    let app = create_test_app();
    app.content.insert("cid-log", b"step 1 ok\n".to_vec()).await;

    let (status, body, content_type) = send(&app, authed("GET", "/logs/cid-log")).await;
    assert_eq!(status, StatusCode::OK);
    assert!(content_type.unwrap().starts_with("text/plain"));
    assert_eq!(body, b"step 1 ok\n");

    let (status, _) = send_json(&app, authed("GET", "/logs/cid-missing")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

/// A cancel for a job a worker holds is forwarded to that worker as a
/// directed notice; the job stays active until the worker reports.
#[tokio::test]
async fn test_cancel_forwards_to_holder() {
    let app = create_test_app();
    app.h.open_job("j1", "proj-1").await;
    app.h.machine.lock("j1", "A", 60).await.unwrap();
    let mut rx = app.h.subscribe();

    let (status, body) = send_json(&app, authed("POST", "/cancel/j1")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["cancelled"], "j1");

    let notice = rx.try_recv().unwrap();
    assert_eq!(notice.topic, "patrick/notice");
    assert_eq!(notice.target.as_deref(), Some("A"));
    let payload: Value = serde_json::from_slice(&notice.payload).unwrap();
    assert_eq!(payload["action"], "cancel");
    assert_eq!(payload["jid"], "j1");

    assert!(matches!(
        app.h.machine.find("j1").await.unwrap(),
        Some(Located::Active(_))
    ));
}

/// A job nobody claims within the polling window is cancelled directly.
#[tokio::test]
async fn test_cancel_unclaimed_job() {
    let app = create_test_app();
    app.h.open_job("j1", "proj-1").await;

    let (status, body) = send_json(&app, authed("POST", "/cancel/j1")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["cancelled"], "j1");

    let job = app.h.machine.info("j1").await.unwrap();
    assert_eq!(job.status(), JobStatus::Cancelled);
}

#[tokio::test]
async fn test_cancel_finished_or_missing_job() {
    let app = create_test_app();
    app.h.open_job("j1", "proj-1").await;
    finish(&app, "j1", "cid").await;

    let (status, _) = send_json(&app, authed("POST", "/cancel/j1")).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, _) = send_json(&app, authed("POST", "/cancel/missing")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_retry_via_http() {
    let app = create_test_app();
    app.h.open_job("j1", "proj-1").await;
    app.h.open_job("j2", "proj-1").await;
    finish(&app, "j1", "cid").await;

    let (status, body) = send_json(&app, authed("POST", "/retry/j1")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["retry"], "j1");
    assert_eq!(
        app.h.machine.active("j1").await.unwrap().unwrap().status(),
        JobStatus::Open
    );

    let (status, body) = send_json(&app, authed("POST", "/retry/j2")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, serde_json::json!({}));
}

#[tokio::test]
async fn test_github_hook_creates_job() {
    let app = create_test_app();
    let body = push_body(42, "main");
    let signature = sign_sha256(SECRET, &body).unwrap();

    let request = Request::builder()
        .method("POST")
        .uri("/github/hook-1")
        .header("x-github-event", "push")
        .header("x-hub-signature-256", signature)
        .header("x-github-hook-id", "1")
        .body(Body::from(body))
        .unwrap();
    let (status, job) = send_json(&app, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(job["status"], "open");
    assert_eq!(job["attempt"], 0);

    let jid = job["id"].as_str().unwrap();
    assert_eq!(
        app.h.machine.list_project("proj-1").await.unwrap(),
        vec![jid.to_string()]
    );
}

#[tokio::test]
async fn test_github_hook_rejections() {
    let app = create_test_app();
    let body = push_body(42, "main");

    let unsigned = Request::builder()
        .method("POST")
        .uri("/github/hook-1")
        .header("x-github-event", "push")
        .header("x-hub-signature-256", "sha256=00")
        .body(Body::from(body))
        .unwrap();
    let (status, _) = send_json(&app, unsigned).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let body = push_body(42, "dev");
    let signature = sign_sha256(SECRET, &body).unwrap();
    let wrong_branch = Request::builder()
        .method("POST")
        .uri("/github/hook-1")
        .header("x-github-event", "push")
        .header("x-hub-signature-256", signature)
        .body(Body::from(body))
        .unwrap();
    let (status, _) = send_json(&app, wrong_branch).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    assert!(app.h.machine.list().await.unwrap().is_empty());
}
