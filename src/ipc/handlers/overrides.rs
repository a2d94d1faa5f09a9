use serde_json::json;

use crate::assessment;
use crate::ipc::error::err;
use crate::ipc::helpers::{bad_params, db_conn, parse_param, required_str, respond, OrReply, Reply};
use crate::ipc::types::{AppState, Request};
use crate::overrides::{self, Override};

fn handle_overrides_list(state: &mut AppState, req: &Request) -> Reply {
    let conn = db_conn(state, req)?;
    let assessment_id = required_str(req, "assessmentId")?;
    let rows = overrides::list(conn, &assessment_id).or_reply(req)?;
    Ok(json!({ "overrides": rows }))
}

fn handle_overrides_save(state: &mut AppState, req: &Request) -> Reply {
    let conn = db_conn(state, req)?;
    let o: Override =
        serde_json::from_value(req.params.clone()).map_err(|e| bad_params(req, e.to_string()))?;
    if o.assessment_id.trim().is_empty() {
        return Err(bad_params(req, "missing assessmentId"));
    }
    // Surface a missing assessment as not_found rather than a foreign key failure.
    assessment::get(conn, &o.assessment_id).or_reply(req)?;
    let saved = overrides::save(conn, &o).or_reply(req)?;
    Ok(json!({ "override": saved }))
}

fn handle_overrides_delete(state: &mut AppState, req: &Request) -> Reply {
    let conn = db_conn(state, req)?;
    let id = required_str(req, "overrideId")?;
    if !overrides::delete(conn, &id).or_reply(req)? {
        return Err(err(&req.id, "not_found", "override not found", None));
    }
    Ok(json!({ "deleted": id }))
}

fn handle_overrides_resolve(state: &mut AppState, req: &Request) -> Reply {
    let conn = db_conn(state, req)?;
    let assessment_id = required_str(req, "assessmentId")?;
    let user_id = required_str(req, "userId")?;
    let a = assessment::get(conn, &assessment_id).or_reply(req)?;
    let settings = overrides::resolve(conn, &a, &user_id).or_reply(req)?;
    Ok(json!({ "settings": settings }))
}

fn handle_groups_set_members(state: &mut AppState, req: &Request) -> Reply {
    let conn = db_conn(state, req)?;
    let group_id = required_str(req, "groupId")?;
    let user_ids: Vec<String> = parse_param(req, "userIds")?;
    overrides::set_group_members(conn, &group_id, &user_ids).or_reply(req)?;
    Ok(json!({ "groupId": group_id, "members": user_ids.len() }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let reply = match req.method.as_str() {
        "overrides.list" => handle_overrides_list(state, req),
        "overrides.save" => handle_overrides_save(state, req),
        "overrides.delete" => handle_overrides_delete(state, req),
        "overrides.resolve" => handle_overrides_resolve(state, req),
        "groups.setMembers" => handle_groups_set_members(state, req),
        _ => return None,
    };
    Some(respond(req, reply))
}
