use std::collections::HashSet;
use std::path::PathBuf;

use chrono::Utc;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::db;
use crate::ipc::error::{err, ingest_err, ingest_error_details, ok, storage_err};
use crate::ipc::handlers::setup::resolve_config;
use crate::ipc::handlers::storage::open_manager;
use crate::ipc::types::{AppState, Request};
use crate::pipeline::Pipeline;
use crate::report::ProgressSnapshot;

const DEFAULT_JOB_LIST_LIMIT: i64 = 50;

fn read_input(req: &Request) -> Result<(Vec<u8>, String), Value> {
    let Some(path) = req
        .params
        .get("inPath")
        .and_then(|v| v.as_str())
        .map(PathBuf::from)
    else {
        return Err(err(&req.id, "bad_params", "missing params.inPath", None));
    };
    let bytes = std::fs::read(&path).map_err(|e| {
        err(
            &req.id,
            "read_failed",
            e.to_string(),
            Some(json!({ "path": path.to_string_lossy() })),
        )
    })?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.to_string_lossy().to_string());
    Ok((bytes, name))
}

fn handle_ingest_preview(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(directory) = state.directory.clone() else {
        return err(&req.id, "no_directory", "load a directory first", None);
    };
    let (bytes, _) = match read_input(req) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let cfg = match resolve_config(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    // Without a workspace nothing is stored yet, so nothing is a duplicate.
    let existing = match state.workspace.as_ref() {
        Some(ws) => match open_manager(ws, &cfg) {
            Ok(m) => m.ids().ids,
            Err(e) => return storage_err(&req.id, &e),
        },
        None => HashSet::new(),
    };

    let pipeline = Pipeline::new(&*directory, cfg);
    match pipeline.preview(&bytes, &existing) {
        Ok(preview) => ok(&req.id, json!(preview)),
        Err(e) => ingest_err(&req.id, &e, None),
    }
}

fn handle_ingest_run(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(workspace) = state.workspace.clone() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(directory) = state.directory.clone() else {
        return err(&req.id, "no_directory", "load a directory first", None);
    };
    let (bytes, source_name) = match read_input(req) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let cfg = match resolve_config(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let job_id = req
        .params
        .get("jobId")
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let mut manager = match open_manager(&workspace, &cfg) {
        Ok(m) => m,
        Err(e) => return storage_err(&req.id, &e),
    };
    let sha256 = format!("{:x}", Sha256::digest(&bytes));
    if let Err(e) = db::job_start(conn, &job_id, &source_name, &sha256, &Utc::now().to_rfc3339()) {
        return err(
            &req.id,
            "db_update_failed",
            e.to_string(),
            Some(json!({ "jobId": job_id })),
        );
    }

    let progress = |snap: &ProgressSnapshot| {
        tracing::debug!(
            job = %snap.job_id,
            percent = snap.percent,
            succeeded = snap.succeeded,
            failed = snap.failed,
            mode = snap.storage_mode.as_str(),
            "progress"
        );
    };
    let pipeline = Pipeline::new(&*directory, cfg);
    let result = pipeline.run(&job_id, &bytes, &mut manager, &progress);
    let finished_at = Utc::now().to_rfc3339();

    match result {
        Ok(report) => {
            let status = if report.cancelled {
                "cancelled"
            } else if report.failed == 0 {
                "completed"
            } else {
                "completed_with_errors"
            };
            let body = json!(report);
            if let Err(e) = db::job_finish(conn, &job_id, status, &finished_at, &body) {
                return err(&req.id, "db_update_failed", e.to_string(), None);
            }
            ok(
                &req.id,
                json!({ "jobId": job_id, "status": status, "report": body }),
            )
        }
        Err(e) => {
            let failure = json!({
                "error": { "code": e.code(), "message": e.to_string(), "details": ingest_error_details(&e) }
            });
            if let Err(db_err) = db::job_finish(conn, &job_id, "failed", &finished_at, &failure) {
                tracing::warn!(job = %job_id, error = %db_err, "failed job not recorded");
            }
            ingest_err(&req.id, &e, Some(&job_id))
        }
    }
}

fn job_json(job: db::JobRow) -> Value {
    json!({
        "jobId": job.id,
        "sourceName": job.source_name,
        "sourceSha256": job.source_sha256,
        "startedAt": job.started_at,
        "finishedAt": job.finished_at,
        "status": job.status,
        "report": job.report,
    })
}

fn handle_ingest_job(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(job_id) = req.params.get("jobId").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing params.jobId", None);
    };
    match db::job_get(conn, job_id) {
        Ok(Some(job)) => ok(&req.id, job_json(job)),
        Ok(None) => err(&req.id, "not_found", format!("unknown job: {}", job_id), None),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_ingest_jobs(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let limit = req
        .params
        .get("limit")
        .and_then(|v| v.as_i64())
        .unwrap_or(DEFAULT_JOB_LIST_LIMIT)
        .clamp(1, 500) as usize;
    match db::job_list(conn, limit) {
        Ok(jobs) => ok(
            &req.id,
            json!({ "jobs": jobs.into_iter().map(job_json).collect::<Vec<_>>() }),
        ),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "ingest.preview" => Some(handle_ingest_preview(state, req)),
        "ingest.run" => Some(handle_ingest_run(state, req)),
        "ingest.job" => Some(handle_ingest_job(state, req)),
        "ingest.jobs" => Some(handle_ingest_jobs(state, req)),
        _ => None,
    }
}
