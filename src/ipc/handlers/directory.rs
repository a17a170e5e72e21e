use crate::db;
use crate::directory::DirectorySnapshot;
use crate::ipc::error::{err, ok};
use crate::ipc::handlers::core::DIRECTORY_PATH_KEY;
use crate::ipc::types::{AppState, Request};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;

fn handle_directory_load(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(path) = req
        .params
        .get("path")
        .and_then(|v| v.as_str())
        .map(PathBuf::from)
    else {
        return err(&req.id, "bad_params", "missing params.path", None);
    };

    let snapshot = match DirectorySnapshot::load(&path) {
        Ok(d) => d,
        Err(e) => {
            return err(
                &req.id,
                "read_failed",
                format!("{e:#}"),
                Some(json!({ "path": path.to_string_lossy() })),
            )
        }
    };
    let summary = snapshot.summary();
    if let Some(conn) = state.db.as_ref() {
        let saved = json!(path.to_string_lossy());
        if let Err(e) = db::settings_set_json(conn, DIRECTORY_PATH_KEY, &saved) {
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }
    state.directory = Some(Arc::new(snapshot));
    ok(&req.id, json!({ "summary": summary }))
}

fn handle_directory_summary(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(directory) = state.directory.as_ref() else {
        return err(&req.id, "no_directory", "load a directory first", None);
    };
    ok(&req.id, json!({ "summary": directory.summary() }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "directory.load" => Some(handle_directory_load(state, req)),
        "directory.summary" => Some(handle_directory_summary(state, req)),
        _ => None,
    }
}
