use std::collections::HashMap;

use serde_json::json;
use uuid::Uuid;

use crate::assessment::{self, Assessment};
use crate::db;
use crate::error::QuizResult;
use crate::feedback::{self, Boundary};
use crate::grading::{self, round_grade};
use crate::ipc::helpers::{
    bad_params, db_conn, now_param, opt_f64, opt_i64, parse_opt_param, parse_param, required_i64,
    required_str, respond, OrReply, Reply,
};
use crate::ipc::types::{AppState, Request};
use crate::layout;
use crate::questions::{self, Question};

fn assessment_json(conn: &rusqlite::Connection, a: &Assessment) -> QuizResult<serde_json::Value> {
    let marks = assessment::slot_marks(conn, &a.id)?;
    let slots: Vec<serde_json::Value> = layout::questions(&a.layout)
        .into_iter()
        .enumerate()
        .map(|(i, qid)| {
            json!({
                "slot": i + 1,
                "questionId": qid,
                "maxMark": marks.get(&qid).copied(),
            })
        })
        .collect();
    Ok(json!({
        "assessment": a,
        "numberOfPages": layout::number_of_pages(&a.layout),
        "slots": slots,
        "hasAttempts": assessment::has_attempts(conn, &a.id)?,
    }))
}

/// Question ids arrive as JSON object keys.
fn parse_marks(req: &Request) -> Result<HashMap<i64, f64>, serde_json::Value> {
    let raw: Option<HashMap<String, f64>> = parse_opt_param(req, "marks")?;
    let mut marks = HashMap::new();
    for (k, v) in raw.unwrap_or_default() {
        let id = k
            .trim()
            .parse::<i64>()
            .map_err(|_| bad_params(req, format!("marks key '{}' is not a question id", k)))?;
        marks.insert(id, v);
    }
    Ok(marks)
}

fn handle_assessments_create(state: &mut AppState, req: &Request) -> Reply {
    let conn = db_conn(state, req)?;
    let now = now_param(req)?;
    let mut a: Assessment = serde_json::from_value(req.params.clone())
        .map_err(|e| bad_params(req, e.to_string()))?;
    if a.id.trim().is_empty() {
        a.id = Uuid::new_v4().to_string();
    }
    let raw_layout = std::mem::replace(&mut a.layout, layout::PAGE_BREAK.to_string());
    a.sum_grades = 0.0;
    a.time_modified = now;
    let marks = parse_marks(req)?;

    let created = db::with_transaction(conn, |tx| {
        assessment::insert(tx, &a)?;
        if layout::number_of_questions(&raw_layout) == 0 {
            return Ok(a.clone());
        }
        assessment::set_layout_in(tx, &state.services, &a.id, &raw_layout, &marks, now)
    })
    .or_reply(req)?;
    assessment_json(conn, &created).or_reply(req)
}

fn handle_assessments_get(state: &mut AppState, req: &Request) -> Reply {
    let conn = db_conn(state, req)?;
    let id = required_str(req, "assessmentId")?;
    let a = assessment::get(conn, &id).or_reply(req)?;
    let mut out = assessment_json(conn, &a).or_reply(req)?;
    out["feedback"] = json!(feedback::list(conn, &id).or_reply(req)?);
    Ok(out)
}

fn handle_assessments_update(state: &mut AppState, req: &Request) -> Reply {
    let conn = db_conn(state, req)?;
    let now = now_param(req)?;
    let id = required_str(req, "assessmentId")?;
    let current = assessment::get(conn, &id).or_reply(req)?;

    let mut merged = serde_json::to_value(&current).map_err(|e| bad_params(req, e.to_string()))?;
    if let (Some(target), Some(changes)) = (merged.as_object_mut(), req.params.as_object()) {
        for (k, v) in changes {
            if k != "assessmentId" && k != "now" {
                target.insert(k.clone(), v.clone());
            }
        }
    }
    let mut next: Assessment =
        serde_json::from_value(merged).map_err(|e| bad_params(req, e.to_string()))?;
    next.id = id;

    let updated = assessment::update_settings(conn, &next, now).or_reply(req)?;
    let regraded = if updated.grade_method != current.grade_method {
        Some(
            grading::update_all_final_grades(conn, &state.services, &updated, now)
                .or_reply(req)?,
        )
    } else {
        None
    };
    let mut out = assessment_json(conn, &updated).or_reply(req)?;
    out["regraded"] = json!(regraded);
    Ok(out)
}

fn handle_assessments_set_layout(state: &mut AppState, req: &Request) -> Reply {
    let conn = db_conn(state, req)?;
    let now = now_param(req)?;
    let id = required_str(req, "assessmentId")?;
    let raw = required_str(req, "layout")?;
    let raw = match opt_i64(req, "questionsPerPage")? {
        Some(per_page) if per_page >= 0 => layout::repaginate(&raw, per_page as usize, None),
        Some(_) => return Err(bad_params(req, "questionsPerPage must not be negative")),
        None => raw,
    };
    let marks = parse_marks(req)?;
    let a = assessment::set_layout(conn, &state.services, &id, &raw, &marks, now).or_reply(req)?;
    assessment_json(conn, &a).or_reply(req)
}

fn handle_assessments_set_max_grade(state: &mut AppState, req: &Request) -> Reply {
    let conn = db_conn(state, req)?;
    let now = now_param(req)?;
    let id = required_str(req, "assessmentId")?;
    let grade = opt_f64(req, "grade")?
        .ok_or_else(|| bad_params(req, "missing grade"))?;
    let a = grading::set_max_grade(conn, &state.services, &id, grade, now).or_reply(req)?;
    Ok(json!({
        "assessmentId": a.id,
        "grade": round_grade(a.grade, a.decimal_points),
        "sumGrades": a.sum_grades,
    }))
}

fn handle_questions_upsert(state: &mut AppState, req: &Request) -> Reply {
    let conn = db_conn(state, req)?;
    let q: Question =
        serde_json::from_value(req.params.clone()).map_err(|e| bad_params(req, e.to_string()))?;
    questions::upsert(conn, &q).or_reply(req)?;
    Ok(json!({ "question": q }))
}

fn handle_questions_delete(state: &mut AppState, req: &Request) -> Reply {
    let conn = db_conn(state, req)?;
    let id = required_i64(req, "questionId")?;
    questions::delete(conn, state.services.usage.as_ref(), id).or_reply(req)?;
    Ok(json!({ "deleted": id }))
}

fn handle_feedback_set(state: &mut AppState, req: &Request) -> Reply {
    let conn = db_conn(state, req)?;
    let id = required_str(req, "assessmentId")?;
    let texts: Vec<String> = parse_param(req, "texts")?;
    let boundaries: Vec<Boundary> = parse_opt_param(req, "boundaries")?.unwrap_or_default();
    let bands = feedback::set_feedback(conn, &id, &texts, &boundaries).or_reply(req)?;
    Ok(json!({ "feedback": bands }))
}

fn handle_feedback_for_grade(state: &mut AppState, req: &Request) -> Reply {
    let conn = db_conn(state, req)?;
    let id = required_str(req, "assessmentId")?;
    let grade = opt_f64(req, "grade")?
        .ok_or_else(|| bad_params(req, "missing grade"))?;
    let text = feedback::for_grade(conn, &id, grade).or_reply(req)?;
    Ok(json!({ "feedback": text }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let reply = match req.method.as_str() {
        "assessments.create" => handle_assessments_create(state, req),
        "assessments.get" => handle_assessments_get(state, req),
        "assessments.update" => handle_assessments_update(state, req),
        "assessments.setLayout" => handle_assessments_set_layout(state, req),
        "assessments.setMaxGrade" => handle_assessments_set_max_grade(state, req),
        "questions.upsert" => handle_questions_upsert(state, req),
        "questions.delete" => handle_questions_delete(state, req),
        "feedback.set" => handle_feedback_set(state, req),
        "feedback.forGrade" => handle_feedback_for_grade(state, req),
        _ => return None,
    };
    Some(respond(req, reply))
}
