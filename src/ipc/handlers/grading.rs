use rusqlite::Connection;
use serde_json::json;

use crate::assessment;
use crate::error::QuizResult;
use crate::grading::{self, round_grade};
use crate::ipc::helpers::{db_conn, now_param, opt_str, required_str, respond, OrReply, Reply};
use crate::ipc::types::{AppState, Request};

fn grade_rows(
    conn: &Connection,
    assessment_id: &str,
    user_id: Option<&str>,
    decimal_points: i64,
) -> QuizResult<Vec<serde_json::Value>> {
    let mut stmt = conn.prepare(
        "SELECT user_id, grade, time_modified FROM grades
         WHERE assessment_id = ?1 AND (?2 IS NULL OR user_id = ?2)
         ORDER BY user_id",
    )?;
    let rows = stmt
        .query_map((assessment_id, user_id), |r| {
            let grade: f64 = r.get(1)?;
            Ok(json!({
                "userId": r.get::<_, String>(0)?,
                "grade": round_grade(grade, decimal_points),
                "timeModified": r.get::<_, i64>(2)?,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn handle_grades_get(state: &mut AppState, req: &Request) -> Reply {
    let conn = db_conn(state, req)?;
    let assessment_id = required_str(req, "assessmentId")?;
    let user_id = opt_str(req, "userId")?;
    let a = assessment::get(conn, &assessment_id).or_reply(req)?;
    let grades = grade_rows(conn, &a.id, user_id.as_deref(), a.decimal_points).or_reply(req)?;
    Ok(json!({ "maxGrade": round_grade(a.grade, a.decimal_points), "grades": grades }))
}

fn handle_grades_recompute(state: &mut AppState, req: &Request) -> Reply {
    let conn = db_conn(state, req)?;
    let now = now_param(req)?;
    let assessment_id = required_str(req, "assessmentId")?;
    let user_id = required_str(req, "userId")?;
    let a = assessment::get(conn, &assessment_id).or_reply(req)?;
    let grade = crate::db::with_transaction(conn, |tx| {
        grading::save_best_grade(tx, &state.services, &a, &user_id, None, now)
    })
    .or_reply(req)?;
    Ok(json!({
        "userId": user_id,
        "grade": grade.map(|g| round_grade(g, a.decimal_points)),
    }))
}

fn handle_grades_update_all(state: &mut AppState, req: &Request) -> Reply {
    let conn = db_conn(state, req)?;
    let now = now_param(req)?;
    let assessment_id = required_str(req, "assessmentId")?;
    let a = assessment::get(conn, &assessment_id).or_reply(req)?;
    let summary = grading::update_all_final_grades(conn, &state.services, &a, now).or_reply(req)?;
    Ok(json!({ "summary": summary }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let reply = match req.method.as_str() {
        "grades.get" => handle_grades_get(state, req),
        "grades.recompute" => handle_grades_recompute(state, req),
        "grades.updateAll" => handle_grades_update_all(state, req),
        _ => return None,
    };
    Some(respond(req, reply))
}
