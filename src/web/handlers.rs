use std::collections::BTreeMap;

use axum::extract::{Path, State};
use axum::http::header::CONTENT_TYPE;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::info;

use crate::error::{PatrickError, Result};
use crate::scheduler::{Caller, Located, LockState, RetryOutcome};
use crate::web::WebState;

const ZIP_MAGIC: [&[u8]; 3] = [b"PK\x03\x04", b"PK\x05\x06", b"PK\x07\x08"];

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ProjectJobs {
    pub project_id: String,
    pub job_ids: Vec<String>,
}

/// `GET /jobs/:project_id`
pub async fn project_jobs(
    State(state): State<WebState>,
    Path(project_id): Path<String>,
) -> Result<Json<ProjectJobs>> {
    let job_ids = state.machine.list_project(&project_id).await?;
    Ok(Json(ProjectJobs {
        project_id,
        job_ids,
    }))
}

/// `GET /job/:jid`, archive copy first.
pub async fn job(State(state): State<WebState>, Path(jid): Path<String>) -> Result<Json<Value>> {
    let job = state.machine.info(&jid).await?;
    Ok(Json(json!({ "job": job })))
}

/// `GET /download/:job_id/:resource_id`, only for finished jobs.
pub async fn download(
    State(state): State<WebState>,
    Path((job_id, resource_id)): Path<(String, String)>,
) -> Result<Response> {
    let job = match state.machine.find(&job_id).await? {
        Some(Located::Archived(job)) => job,
        Some(Located::Active(_)) => {
            return Err(PatrickError::InvalidArgument(format!(
                "job {} has not finished",
                job_id
            )))
        }
        None => return Err(PatrickError::JobNotFound(job_id)),
    };

    let cid = job.asset_cid.get(&resource_id).ok_or_else(|| {
        PatrickError::ContentNotFound(format!("job {} resource {}", job_id, resource_id))
    })?;
    let data = state
        .content
        .get(cid)
        .await?
        .ok_or_else(|| PatrickError::ContentNotFound(cid.clone()))?;

    let content_type = if ZIP_MAGIC.iter().any(|magic| data.starts_with(magic)) {
        "application/zip"
    } else {
        "application/wasm"
    };
    Ok(([(CONTENT_TYPE, content_type)], data).into_response())
}

/// `GET /logs/:cid`
pub async fn logs(State(state): State<WebState>, Path(cid): Path<String>) -> Result<Response> {
    let data = state
        .content
        .get(&cid)
        .await?
        .ok_or(PatrickError::ContentNotFound(cid))?;
    Ok(([(CONTENT_TYPE, "text/plain; charset=utf-8")], data).into_response())
}

/// `POST /cancel/:jid`
///
/// Waits for a worker to lock the job and asks that worker to stop. The
/// worker then reports `cancel` itself. A job nobody picked up within the
/// polling window is cancelled directly.
pub async fn cancel(State(state): State<WebState>, Path(jid): Path<String>) -> Result<Json<Value>> {
    match state.machine.find(&jid).await? {
        Some(Located::Active(_)) => {}
        Some(Located::Archived(_)) => return Err(PatrickError::AlreadyFinished(jid)),
        None => return Err(PatrickError::JobNotFound(jid)),
    }

    let mut polls = 0;
    let owner = loop {
        if let LockState::Held(lock) = state.machine.is_locked(&jid).await? {
            break Some(lock.owner);
        }
        polls += 1;
        if polls >= state.cancel.attempts {
            break None;
        }
        tokio::time::sleep(state.cancel.interval).await;
    };

    match owner {
        Some(owner) => {
            state.workers.cancel(&owner, &jid).await?;
            info!(job_id = %jid, peer = %owner, "Cancel forwarded to worker");
        }
        None => {
            state
                .machine
                .cancel(&jid, &Caller::Operator, BTreeMap::new())
                .await?;
            info!(job_id = %jid, "Unclaimed job cancelled");
        }
    }
    Ok(Json(json!({ "cancelled": jid })))
}

/// `POST /retry/:jid`
pub async fn retry(State(state): State<WebState>, Path(jid): Path<String>) -> Result<Json<Value>> {
    match state.machine.retry(&jid).await? {
        RetryOutcome::Reopened(job) => Ok(Json(json!({ "retry": job.id }))),
        RetryOutcome::AlreadyActive(_) => Ok(Json(json!({}))),
    }
}
