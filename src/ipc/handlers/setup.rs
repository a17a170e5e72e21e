use crate::config::{merge_patch, IngestConfig, SETTINGS_KEY};
use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use serde_json::{json, Value};

fn load_saved(conn: &rusqlite::Connection) -> anyhow::Result<Option<Value>> {
    db::settings_get_json(conn, SETTINGS_KEY)
}

/// Defaults, the workspace's saved section, then `params.config`.
pub(super) fn resolve_config(state: &AppState, req: &Request) -> Result<IngestConfig, Value> {
    let saved = match state.db.as_ref().map(load_saved).transpose() {
        Ok(v) => v.flatten(),
        Err(e) => return Err(err(&req.id, "db_query_failed", e.to_string(), None)),
    };
    let overrides = match req.params.get("config") {
        None | Some(Value::Null) => None,
        Some(Value::Object(m)) => Some(m),
        Some(_) => return Err(err(&req.id, "bad_params", "config must be an object", None)),
    };
    IngestConfig::layered(saved.as_ref(), overrides)
        .map_err(|msg| err(&req.id, "bad_params", msg, None))
}

fn handle_setup_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let saved = match load_saved(conn) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    // Malformed historical values fall back to defaults here rather than failing.
    let cfg = IngestConfig::layered(saved.as_ref(), None).unwrap_or_default();
    ok(&req.id, json!({ "ingest": cfg.to_value() }))
}

fn handle_setup_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match req.params.get("section").and_then(|v| v.as_str()) {
        None | Some("ingest") => {}
        Some(_) => return err(&req.id, "bad_params", "unknown section", None),
    }
    let Some(patch_obj) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "patch must be an object", None);
    };

    let saved = match load_saved(conn) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let mut current = IngestConfig::layered(saved.as_ref(), None)
        .unwrap_or_default()
        .to_value();
    if let Err(msg) = merge_patch(&mut current, patch_obj) {
        return err(&req.id, "bad_params", msg, None);
    }
    if let Err(e) = db::settings_set_json(conn, SETTINGS_KEY, &current) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "ok": true, "ingest": current }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "setup.get" => Some(handle_setup_get(state, req)),
        "setup.update" => Some(handle_setup_update(state, req)),
        _ => None,
    }
}
