use serde_json::json;

use crate::cron;
use crate::ipc::helpers::{db_conn, now_param, opt_i64, respond, OrReply, Reply};
use crate::ipc::types::{AppState, Request};

fn handle_update_overdue(state: &mut AppState, req: &Request) -> Reply {
    let conn = db_conn(state, req)?;
    let now = now_param(req)?;
    let process_up_to = opt_i64(req, "processUpTo")?;
    let summary = cron::update_overdue_attempts(conn, &state.services, &state.config, now, process_up_to)
        .or_reply(req)?;
    Ok(json!({ "summary": summary }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let reply = match req.method.as_str() {
        "cron.updateOverdue" => handle_update_overdue(state, req),
        _ => return None,
    };
    Some(respond(req, reply))
}
