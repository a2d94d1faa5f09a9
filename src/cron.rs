//! The overdue sweep: re-checks every open attempt whose timer has come due.

use rusqlite::Connection;
use serde::Serialize;
use tracing::{error, info};

use crate::attempt::QuizAttempt;
use crate::config::EnvVars;
use crate::error::QuizResult;
use crate::services::Services;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepSummary {
    pub processed: usize,
    pub assessments: usize,
    pub failed: usize,
}

/// Attempts still open whose `time_check_state` is at or before
/// `process_up_to`, grouped by assessment.
fn due_attempts(conn: &Connection, process_up_to: i64, limit: usize) -> QuizResult<Vec<(String, String)>> {
    let mut stmt = conn.prepare(
        "SELECT id, assessment_id FROM attempts
         WHERE state IN ('inprogress', 'overdue')
           AND time_check_state IS NOT NULL AND time_check_state <= ?1
         ORDER BY assessment_id, time_check_state, id
         LIMIT ?2",
    )?;
    // SQLite treats a negative LIMIT as no limit.
    let limit = if limit == 0 { -1 } else { limit as i64 };
    let rows = stmt
        .query_map((process_up_to, limit), |r| Ok((r.get(0)?, r.get(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Runs time-expiry handling for due attempts as if their students were
/// offline. `process_up_to` defaults to `now` less the minimum grace period,
/// leaving students who are still online a chance to submit themselves.
///
/// One attempt failing is logged and skipped; the rest are still processed.
#[tracing::instrument(skip_all, fields(now = now), err(Debug))]
pub fn update_overdue_attempts(
    conn: &Connection,
    services: &Services,
    config: &EnvVars,
    now: i64,
    process_up_to: Option<i64>,
) -> QuizResult<SweepSummary> {
    let process_up_to = process_up_to.unwrap_or(now - config.grace_period_min_s);
    let due = due_attempts(conn, process_up_to, config.overdue_batch_limit)?;

    let mut summary = SweepSummary::default();
    let mut last_assessment: Option<&str> = None;
    for (attempt_id, assessment_id) in &due {
        if last_assessment != Some(assessment_id.as_str()) {
            summary.assessments += 1;
            last_assessment = Some(assessment_id.as_str());
        }
        let outcome = QuizAttempt::load(conn, services, attempt_id)
            .and_then(|mut qa| qa.handle_if_time_expired(conn, now, false));
        match outcome {
            Ok(()) => summary.processed += 1,
            Err(e) => {
                summary.failed += 1;
                error!(
                    attempt = %attempt_id,
                    assessment = %assessment_id,
                    error = %e,
                    "overdue processing failed"
                );
            }
        }
    }

    info!(
        processed = summary.processed,
        assessments = summary.assessments,
        failed = summary.failed,
        "overdue sweep done"
    );
    Ok(summary)
}
