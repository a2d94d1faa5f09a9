use serde_json::json;

use crate::assessment;
use crate::ipc::helpers::{db_conn, now_param, opt_bool, opt_str, required_str, respond, OrReply, Reply};
use crate::ipc::types::{AppState, Request};
use crate::stats::{self, cache, responses, StatsReport, WhichAttempts};

fn report_json(report: &StatsReport, sum_grades: f64) -> serde_json::Value {
    let rows: Vec<serde_json::Value> = report
        .responses
        .iter()
        .map(|r| {
            json!({
                "questionId": r.question_id,
                "response": r.response,
                "fraction": r.fraction,
                "count": r.count,
                "share": responses::share(r, &report.responses),
            })
        })
        .collect();
    json!({
        "quiz": report.quiz,
        "percentages": {
            "firstAttemptsAvg": stats::percentage(report.quiz.first_attempts_avg, sum_grades),
            "allAttemptsAvg": stats::percentage(report.quiz.all_attempts_avg, sum_grades),
            "median": stats::percentage(report.quiz.median, sum_grades),
            "standardDeviation": stats::percentage(report.quiz.standard_deviation, sum_grades),
            "standardError": stats::percentage(report.quiz.standard_error, sum_grades),
        },
        "questions": report.questions,
        "subQuestions": report.sub_questions,
        "responses": rows,
        "sampleSize": report.sample_size,
        "fromCache": report.from_cache,
    })
}

fn which_param(req: &Request) -> Result<WhichAttempts, serde_json::Value> {
    Ok(WhichAttempts::from_all(opt_bool(req, "useAllAttempts", false)?))
}

fn stats_for(state: &mut AppState, req: &Request, recalculate: bool) -> Reply {
    let conn = db_conn(state, req)?;
    let now = now_param(req)?;
    let assessment_id = required_str(req, "assessmentId")?;
    let group_id = opt_str(req, "groupId")?;
    let which = which_param(req)?;
    let a = assessment::get(conn, &assessment_id).or_reply(req)?;
    let report = stats::get_assessment_and_question_stats(
        conn,
        &a,
        group_id.as_deref(),
        which,
        now,
        state.config.stats_cache_ttl_s,
        recalculate,
    )
    .or_reply(req)?;
    Ok(report_json(&report, a.sum_grades))
}

fn handle_stats_clear(state: &mut AppState, req: &Request) -> Reply {
    let conn = db_conn(state, req)?;
    let assessment_id = required_str(req, "assessmentId")?;
    let cleared = cache::clear_assessment(conn, &assessment_id).or_reply(req)?;
    Ok(json!({ "cleared": cleared }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let reply = match req.method.as_str() {
        "stats.get" => stats_for(state, req, false),
        "stats.recalculate" => stats_for(state, req, true),
        "stats.clear" => handle_stats_clear(state, req),
        _ => return None,
    };
    Some(respond(req, reply))
}
