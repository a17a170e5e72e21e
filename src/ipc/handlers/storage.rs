use std::path::Path;

use crate::config::IngestConfig;
use crate::db::DB_FILE;
use crate::error::StoreError;
use crate::ipc::error::{err, ok, storage_err};
use crate::ipc::handlers::setup::resolve_config;
use crate::ipc::types::{AppState, Request};
use crate::storage::{RemoteStore, SqliteRemote, SqliteStore, StorageManager};
use serde_json::json;

/// Storage ladder over the workspace DB, with the remote DB when enabled.
pub(super) fn open_manager(workspace: &Path, cfg: &IngestConfig) -> Result<StorageManager, StoreError> {
    let local = SqliteStore::open(&workspace.join(DB_FILE), cfg.local_budget_bytes)?;
    let remote: Option<Box<dyn RemoteStore>> = if cfg.remote_enabled {
        match SqliteRemote::open_in_workspace(workspace) {
            Ok(r) => Some(Box::new(r)),
            Err(e) => {
                tracing::warn!(error = %e, "remote store not available");
                None
            }
        }
    } else {
        None
    };
    StorageManager::open(Box::new(local), remote, cfg.storage_options())
}

fn with_manager(
    state: &AppState,
    req: &Request,
) -> Result<StorageManager, serde_json::Value> {
    let Some(workspace) = state.workspace.as_ref() else {
        return Err(err(&req.id, "no_workspace", "select a workspace first", None));
    };
    let cfg = resolve_config(state, req)?;
    open_manager(workspace, &cfg).map_err(|e| storage_err(&req.id, &e))
}

fn handle_storage_status(state: &mut AppState, req: &Request) -> serde_json::Value {
    let manager = match with_manager(state, req) {
        Ok(m) => m,
        Err(resp) => return resp,
    };
    match manager.status() {
        Ok(s) => ok(&req.id, json!(s)),
        Err(e) => storage_err(&req.id, &e),
    }
}

fn handle_storage_read_all(state: &mut AppState, req: &Request) -> serde_json::Value {
    let manager = match with_manager(state, req) {
        Ok(m) => m,
        Err(resp) => return resp,
    };
    match manager.read_all() {
        Ok(stored) => ok(
            &req.id,
            json!({
                "mode": stored.mode,
                "detailLost": stored.detail_lost(),
                "count": stored.len(),
                "records": stored.full,
                "essentialRecords": stored.essential,
                "remoteUnread": stored.remote_unread,
            }),
        ),
        Err(e) => storage_err(&req.id, &e),
    }
}

fn handle_storage_reset(state: &mut AppState, req: &Request) -> serde_json::Value {
    let mut manager = match with_manager(state, req) {
        Ok(m) => m,
        Err(resp) => return resp,
    };
    match manager.reset() {
        Ok(()) => ok(&req.id, json!({ "ok": true, "mode": manager.mode() })),
        Err(e) => storage_err(&req.id, &e),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "storage.status" => Some(handle_storage_status(state, req)),
        "storage.readAll" => Some(handle_storage_read_all(state, req)),
        "storage.reset" => Some(handle_storage_reset(state, req)),
        _ => None,
    }
}
