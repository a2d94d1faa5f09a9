use std::path::PathBuf;

use serde_json::json;
use tracing::{info, warn};

use crate::db;
use crate::ipc::error::err;
use crate::ipc::helpers::{respond, Reply};
use crate::ipc::types::{AppState, Request};

fn handle_health(state: &mut AppState, _req: &Request) -> Reply {
    Ok(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "workspacePath": state.workspace.as_ref().map(|p| p.to_string_lossy().to_string()),
        "statsCacheTtlS": state.config.stats_cache_ttl_s,
        "gracePeriodMinS": state.config.grace_period_min_s,
    }))
}

fn handle_workspace_select(state: &mut AppState, req: &Request) -> Reply {
    let Some(path) = req
        .params
        .get("path")
        .and_then(|v| v.as_str())
        .map(PathBuf::from)
    else {
        return Err(err(&req.id, "bad_params", "missing params.path", None));
    };

    let conn = db::open_db(&path).map_err(|e| {
        warn!(path = %path.display(), error = ?e, "workspace open failed");
        err(&req.id, "db_open_failed", format!("{e:?}"), None)
    })?;
    info!(path = %path.display(), "workspace selected");
    state.workspace = Some(path.clone());
    state.db = Some(conn);
    Ok(json!({ "workspacePath": path.to_string_lossy() }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let reply = match req.method.as_str() {
        "health" => handle_health(state, req),
        "workspace.select" => handle_workspace_select(state, req),
        _ => return None,
    };
    Some(respond(req, reply))
}
