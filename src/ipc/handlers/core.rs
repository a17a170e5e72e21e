use crate::db;
use crate::directory::DirectorySnapshot;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;

/// Settings key remembering the last directory snapshot loaded in a workspace.
pub const DIRECTORY_PATH_KEY: &str = "directory.path";

fn handle_health(state: &mut AppState, req: &Request) -> serde_json::Value {
    ok(
        &req.id,
        json!({
            "version": env!("CARGO_PKG_VERSION"),
            "workspacePath": state.workspace.as_ref().map(|p| p.to_string_lossy().to_string()),
            "directoryLoaded": state.directory.is_some(),
        }),
    )
}

fn handle_workspace_select(state: &mut AppState, req: &Request) -> serde_json::Value {
    let p = req
        .params
        .get("path")
        .and_then(|v| v.as_str())
        .map(PathBuf::from);
    let Some(path) = p else {
        return err(&req.id, "bad_params", "missing params.path", None);
    };

    match db::open_db(&path) {
        Ok(conn) => {
            state.workspace = Some(path.clone());
            // Best-effort: reload the directory this workspace last used.
            // A missing or broken snapshot must not prevent the workspace from opening.
            if let Ok(Some(saved)) = db::settings_get_json(&conn, DIRECTORY_PATH_KEY) {
                if let Some(dir_path) = saved.as_str() {
                    match DirectorySnapshot::load(std::path::Path::new(dir_path)) {
                        Ok(d) => state.directory = Some(Arc::new(d)),
                        Err(e) => tracing::warn!(path = dir_path, error = %e, "saved directory not reloaded"),
                    }
                }
            }

            tracing::info!(workspace = %path.to_string_lossy(), "workspace selected");
            state.db = Some(conn);
            ok(
                &req.id,
                json!({
                    "workspacePath": path.to_string_lossy(),
                    "directoryLoaded": state.directory.is_some(),
                }),
            )
        }
        Err(e) => err(&req.id, "db_open_failed", format!("{e:?}"), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "health" => Some(handle_health(state, req)),
        "workspace.select" => Some(handle_workspace_select(state, req)),
        _ => None,
    }
}
