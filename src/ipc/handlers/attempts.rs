use rusqlite::Connection;
use serde_json::json;

use crate::access;
use crate::attempt::{self, AssessmentView, QuizAttempt, SlotResponse};
use crate::error::QuizResult;
use crate::feedback;
use crate::grading::{self, round_grade, AttemptScore};
use crate::ipc::helpers::{
    db_conn, now_param, opt_bool, opt_i64, opt_str, parse_opt_param, required_str,
    respond, seed_param, OrReply, Reply,
};
use crate::ipc::types::{AppState, Request};
use crate::random;
use crate::services::Services;

/// The attempt with its timing, grade and per-slot question state.
fn attempt_json(
    conn: &Connection,
    services: &Services,
    qa: &QuizAttempt<'_>,
    page: Option<usize>,
) -> QuizResult<serde_json::Value> {
    let a = &qa.attempt;
    let assessment = &qa.view.assessment;
    let usage = services.usage.load_usage(conn, &a.usage_id)?;
    let slots: Vec<serde_json::Value> = qa
        .get_slots(page)
        .into_iter()
        .filter_map(|n| usage.slot(n))
        .map(|s| {
            json!({
                "slot": s.slot,
                "questionId": s.question_id,
                "maxMark": s.max_mark,
                "state": s.state.as_str(),
                "response": s.response_summary,
                "mark": s.mark,
            })
        })
        .collect();

    let grade = AttemptScore {
        attempt: a.attempt,
        sum_grades: a.sum_grades,
        num_questions: a.num_questions,
    }
    .score()
    .filter(|_| a.is_finished())
    .map(|s| grading::rescale(s, assessment));
    let overall_feedback = match grade {
        Some(g) => feedback::for_grade(conn, &assessment.id, g)?,
        None => None,
    };
    let due_date = if a.is_finished() { None } else { qa.due_date()? };

    Ok(json!({
        "attempt": a,
        "numberOfPages": qa.number_of_pages(),
        "isLastPage": page.map(|p| qa.is_last_page(p)),
        "page": page,
        "endTime": qa.end_time(),
        "dueDate": due_date,
        "grade": grade.map(|g| round_grade(g, assessment.decimal_points)),
        "feedback": overall_feedback,
        "slots": slots,
    }))
}

fn responses_param(req: &Request) -> Result<Vec<SlotResponse>, serde_json::Value> {
    Ok(parse_opt_param(req, "responses")?.unwrap_or_default())
}

fn handle_attempts_start(state: &mut AppState, req: &Request) -> Reply {
    let conn = db_conn(state, req)?;
    let now = now_param(req)?;
    let assessment_id = required_str(req, "assessmentId")?;
    let user_id = required_str(req, "userId")?;
    let preview = opt_bool(req, "preview", false)?;
    let mut rng = random::source_for(seed_param(req)?);

    let outcome = attempt::start_attempt(
        conn,
        &state.services,
        &assessment_id,
        &user_id,
        now,
        preview,
        rng.as_mut(),
    )
    .or_reply(req)?;
    let qa = QuizAttempt::load(conn, &state.services, &outcome.attempt.id).or_reply(req)?;
    let page = qa.force_page_number_into_range(qa.attempt.current_page);
    let mut out = attempt_json(conn, &state.services, &qa, Some(page)).or_reply(req)?;
    out["resumed"] = json!(outcome.resumed);
    Ok(out)
}

/// Loads an attempt as a page view does: time expiry is applied first.
fn handle_attempts_get(state: &mut AppState, req: &Request) -> Reply {
    let conn = db_conn(state, req)?;
    let now = now_param(req)?;
    let id = required_str(req, "attemptId")?;
    let mut qa = QuizAttempt::load(conn, &state.services, &id).or_reply(req)?;
    qa.handle_if_time_expired(conn, now, true).or_reply(req)?;
    attempt_json(conn, &state.services, &qa, None).or_reply(req)
}

fn handle_attempts_page(state: &mut AppState, req: &Request) -> Reply {
    let conn = db_conn(state, req)?;
    let now = now_param(req)?;
    let id = required_str(req, "attemptId")?;
    let mut qa = QuizAttempt::load(conn, &state.services, &id).or_reply(req)?;
    qa.handle_if_time_expired(conn, now, true).or_reply(req)?;
    let requested = opt_i64(req, "page")?.unwrap_or(qa.attempt.current_page);
    let page = qa.set_current_page(conn, requested).or_reply(req)?;
    attempt_json(conn, &state.services, &qa, Some(page)).or_reply(req)
}

fn handle_attempts_process(state: &mut AppState, req: &Request) -> Reply {
    let conn = db_conn(state, req)?;
    let now = now_param(req)?;
    let id = required_str(req, "attemptId")?;
    let finish = opt_bool(req, "finishAttempt", false)?;
    let time_up = opt_bool(req, "timeUp", false)?;
    let responses = responses_param(req)?;
    let mut qa = QuizAttempt::load(conn, &state.services, &id).or_reply(req)?;
    let st = qa
        .process_attempt(conn, &state.config, now, finish, time_up, &responses)
        .or_reply(req)?;
    let mut out = attempt_json(conn, &state.services, &qa, None).or_reply(req)?;
    out["state"] = json!(st.as_str());
    Ok(out)
}

fn handle_attempts_autosave(state: &mut AppState, req: &Request) -> Reply {
    let conn = db_conn(state, req)?;
    let id = required_str(req, "attemptId")?;
    let responses = responses_param(req)?;
    let mut qa = QuizAttempt::load(conn, &state.services, &id).or_reply(req)?;
    qa.process_auto_save(conn, &responses).or_reply(req)?;
    Ok(json!({ "attemptId": id, "saved": responses.len() }))
}

fn handle_attempts_finish(state: &mut AppState, req: &Request) -> Reply {
    let conn = db_conn(state, req)?;
    let now = now_param(req)?;
    let id = required_str(req, "attemptId")?;
    let responses: Option<Vec<SlotResponse>> = parse_opt_param(req, "responses")?;
    let mut qa = QuizAttempt::load(conn, &state.services, &id).or_reply(req)?;
    qa.process_finish(conn, now, responses.as_deref()).or_reply(req)?;
    attempt_json(conn, &state.services, &qa, None).or_reply(req)
}

fn handle_attempts_abandon(state: &mut AppState, req: &Request) -> Reply {
    let conn = db_conn(state, req)?;
    let now = now_param(req)?;
    let id = required_str(req, "attemptId")?;
    let mut qa = QuizAttempt::load(conn, &state.services, &id).or_reply(req)?;
    qa.process_abandon(conn, now).or_reply(req)?;
    attempt_json(conn, &state.services, &qa, None).or_reply(req)
}

fn handle_attempts_check_state(state: &mut AppState, req: &Request) -> Reply {
    let conn = db_conn(state, req)?;
    let now = now_param(req)?;
    let id = required_str(req, "attemptId")?;
    let online = opt_bool(req, "online", true)?;
    let mut qa = QuizAttempt::load(conn, &state.services, &id).or_reply(req)?;
    qa.handle_if_time_expired(conn, now, online).or_reply(req)?;
    attempt_json(conn, &state.services, &qa, None).or_reply(req)
}

fn handle_attempts_delete(state: &mut AppState, req: &Request) -> Reply {
    let conn = db_conn(state, req)?;
    let now = now_param(req)?;
    let id = required_str(req, "attemptId")?;
    attempt::delete_attempt(conn, &state.services, &id, now).or_reply(req)?;
    Ok(json!({ "deleted": id }))
}

fn handle_attempts_delete_previews(state: &mut AppState, req: &Request) -> Reply {
    let conn = db_conn(state, req)?;
    let now = now_param(req)?;
    let assessment_id = required_str(req, "assessmentId")?;
    let user_id = opt_str(req, "userId")?;
    let n = attempt::delete_previews(conn, &state.services, &assessment_id, user_id.as_deref(), now)
        .or_reply(req)?;
    Ok(json!({ "deleted": n }))
}

fn handle_attempts_list(state: &mut AppState, req: &Request) -> Reply {
    let conn = db_conn(state, req)?;
    let assessment_id = required_str(req, "assessmentId")?;
    let user_id = opt_str(req, "userId")?;
    let include_previews = opt_bool(req, "includePreviews", false)?;
    let rows = attempt::list(conn, &assessment_id, user_id.as_deref(), include_previews)
        .or_reply(req)?;
    Ok(json!({ "attempts": rows }))
}

fn handle_preflight_check(state: &mut AppState, req: &Request) -> Reply {
    let conn = db_conn(state, req)?;
    let now = now_param(req)?;
    let assessment_id = required_str(req, "assessmentId")?;
    let user_id = required_str(req, "userId")?;
    let password = opt_str(req, "password")?;
    let view = AssessmentView::load(conn, &assessment_id, &user_id).or_reply(req)?;
    access::preflight_check(
        conn,
        &view.settings,
        &assessment_id,
        &user_id,
        password.as_deref(),
        now,
    )
    .or_reply(req)?;
    Ok(json!({ "passed": true }))
}

fn handle_preflight_status(state: &mut AppState, req: &Request) -> Reply {
    let conn = db_conn(state, req)?;
    let now = now_param(req)?;
    let assessment_id = required_str(req, "assessmentId")?;
    let user_id = required_str(req, "userId")?;
    let view = AssessmentView::load(conn, &assessment_id, &user_id).or_reply(req)?;
    let required = state
        .services
        .access
        .is_preflight_required(conn, &view.settings, &assessment_id, &user_id)
        .or_reply(req)?;
    let used = attempt::list(conn, &assessment_id, Some(&user_id), false)
        .or_reply(req)?
        .iter()
        .filter(|a| a.is_finished())
        .count() as i64;
    let prevented = state
        .services
        .access
        .prevent_new_attempt(&view.settings, used, now);
    Ok(json!({
        "required": required,
        "preventNewAttempt": prevented,
        "settings": view.settings,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let reply = match req.method.as_str() {
        "attempts.start" => handle_attempts_start(state, req),
        "attempts.get" => handle_attempts_get(state, req),
        "attempts.page" => handle_attempts_page(state, req),
        "attempts.process" => handle_attempts_process(state, req),
        "attempts.autosave" => handle_attempts_autosave(state, req),
        "attempts.finish" => handle_attempts_finish(state, req),
        "attempts.abandon" => handle_attempts_abandon(state, req),
        "attempts.checkState" => handle_attempts_check_state(state, req),
        "attempts.delete" => handle_attempts_delete(state, req),
        "attempts.deletePreviews" => handle_attempts_delete_previews(state, req),
        "attempts.list" => handle_attempts_list(state, req),
        "preflight.check" => handle_preflight_check(state, req),
        "preflight.status" => handle_preflight_status(state, req),
        _ => return None,
    };
    Some(respond(req, reply))
}
