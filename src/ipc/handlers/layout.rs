use serde_json::json;

use crate::ipc::helpers::{bad_params, opt_bool, opt_i64, required_i64, required_str, respond, seed_param, Reply};
use crate::ipc::types::{AppState, Request};
use crate::layout;
use crate::random;

fn describe(l: &str) -> serde_json::Value {
    json!({
        "layout": l,
        "pages": layout::pages(l),
        "numberOfPages": layout::number_of_pages(l),
        "numberOfQuestions": layout::number_of_questions(l),
        "duplicates": layout::duplicate_ids(l),
    })
}

fn shift_param(req: &Request) -> Result<i64, serde_json::Value> {
    match required_i64(req, "shift")? {
        s @ (-1 | 1) => Ok(s),
        _ => Err(bad_params(req, "shift must be -1 or 1")),
    }
}

fn handle_clean(req: &Request) -> Reply {
    let l = required_str(req, "layout")?;
    let remove_empty = opt_bool(req, "removeEmptyPages", false)?;
    Ok(describe(&layout::clean(&l, remove_empty)))
}

fn handle_repaginate(req: &Request) -> Reply {
    let l = required_str(req, "layout")?;
    let per_page = opt_i64(req, "perPage")?.unwrap_or(1);
    if per_page < 0 {
        return Err(bad_params(req, "perPage must not be negative"));
    }
    let out = if opt_bool(req, "shuffle", false)? {
        let mut rng = random::source_for(seed_param(req)?);
        layout::repaginate(&l, per_page as usize, Some(rng.as_mut()))
    } else {
        layout::repaginate(&l, per_page as usize, None)
    };
    Ok(describe(&out))
}

fn handle_add_page_break(req: &Request) -> Reply {
    let l = required_str(req, "layout")?;
    let out = match (opt_i64(req, "index")?, opt_i64(req, "afterQuestion")?) {
        (Some(index), None) => layout::add_page_break_at(&l, index),
        (None, Some(question_id)) => layout::add_page_break_after(&l, question_id),
        _ => return Err(bad_params(req, "expected exactly one of index or afterQuestion")),
    };
    Ok(describe(&out))
}

fn handle_delete_empty_page(req: &Request) -> Reply {
    let l = required_str(req, "layout")?;
    let index = required_i64(req, "index")?;
    Ok(describe(&layout::delete_empty_page(&l, index)))
}

fn handle_move_question(req: &Request) -> Reply {
    let l = required_str(req, "layout")?;
    let question_id = required_i64(req, "questionId")?;
    Ok(describe(&layout::move_question(&l, question_id, shift_param(req)?)))
}

fn handle_move_page_break(req: &Request) -> Reply {
    let l = required_str(req, "layout")?;
    let index = required_i64(req, "index")?;
    Ok(describe(&layout::move_page_break(&l, index, shift_param(req)?)))
}

/// Layout edits are pure string transforms; no workspace needed.
pub fn try_handle(_state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let reply = match req.method.as_str() {
        "layout.clean" => handle_clean(req),
        "layout.repaginate" => handle_repaginate(req),
        "layout.addPageBreak" => handle_add_page_break(req),
        "layout.deleteEmptyPage" => handle_delete_empty_page(req),
        "layout.moveQuestion" => handle_move_question(req),
        "layout.movePageBreak" => handle_move_page_break(req),
        _ => return None,
    };
    Some(respond(req, reply))
}
