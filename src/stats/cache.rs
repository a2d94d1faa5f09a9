//! Persisted statistics snapshots keyed by a hash of what was computed.

use rusqlite::{Connection, OptionalExtension};
use sha2::{Digest, Sha256};

use super::responses::ResponseCount;
use super::{AssessmentStats, QuestionStats, StatsReport, WhichAttempts};
use crate::db;
use crate::error::QuizResult;

/// Stable key for one (assessment, group, attempt selection) combination.
pub fn hash_code(assessment_id: &str, group_id: Option<&str>, which: WhichAttempts) -> String {
    let mut h = Sha256::new();
    h.update(assessment_id.as_bytes());
    h.update(b"\n");
    h.update(group_id.unwrap_or("").as_bytes());
    h.update(b"\n");
    h.update(which.as_str().as_bytes());
    format!("{:x}", h.finalize())
}

fn load_snapshot(conn: &Connection, hash: &str) -> QuizResult<Option<AssessmentStats>> {
    let row = conn
        .query_row(
            "SELECT assessment_id, group_id, which_attempts, time_modified,
                    first_attempts_count, all_attempts_count, first_attempts_avg, all_attempts_avg,
                    median, standard_deviation, skewness, kurtosis, cic, error_ratio, standard_error
             FROM stats_snapshots WHERE hash_code = ?",
            [hash],
            |r| {
                let which: String = r.get(2)?;
                Ok(AssessmentStats {
                    hash_code: hash.to_string(),
                    assessment_id: r.get(0)?,
                    group_id: r.get(1)?,
                    which_attempts: if which == "first" {
                        WhichAttempts::First
                    } else {
                        WhichAttempts::All
                    },
                    time_modified: r.get(3)?,
                    first_attempts_count: r.get(4)?,
                    all_attempts_count: r.get(5)?,
                    first_attempts_avg: r.get(6)?,
                    all_attempts_avg: r.get(7)?,
                    median: r.get(8)?,
                    standard_deviation: r.get(9)?,
                    skewness: r.get(10)?,
                    kurtosis: r.get(11)?,
                    cic: r.get(12)?,
                    error_ratio: r.get(13)?,
                    standard_error: r.get(14)?,
                })
            },
        )
        .optional()?;
    Ok(row)
}

fn load_questions(conn: &Connection, hash: &str) -> QuizResult<Vec<QuestionStats>> {
    let mut stmt = conn.prepare(
        "SELECT slot, question_id, sub_question, s, max_mark, facility, sd, random_guess_score,
                discrimination_index, discriminative_efficiency, effective_weight, mark_variance
         FROM stats_questions WHERE hash_code = ?
         ORDER BY sub_question, slot, question_id",
    )?;
    let rows = stmt
        .query_map([hash], |r| {
            Ok(QuestionStats {
                slot: r.get(0)?,
                question_id: r.get(1)?,
                sub_question: r.get::<_, i64>(2)? != 0,
                s: r.get(3)?,
                max_mark: r.get(4)?,
                facility: r.get(5)?,
                sd: r.get(6)?,
                random_guess_score: r.get(7)?,
                discrimination_index: r.get(8)?,
                discriminative_efficiency: r.get(9)?,
                effective_weight: r.get(10)?,
                mark_variance: r.get(11)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn load_responses(conn: &Connection, hash: &str) -> QuizResult<Vec<ResponseCount>> {
    let mut stmt = conn.prepare(
        "SELECT question_id, response, fraction, count FROM stats_responses
         WHERE hash_code = ? ORDER BY question_id, response",
    )?;
    let rows = stmt
        .query_map([hash], |r| {
            Ok(ResponseCount {
                question_id: r.get(0)?,
                response: r.get(1)?,
                fraction: r.get(2)?,
                count: r.get(3)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// The cached report, unless it is missing or older than `ttl_s`.
pub fn load(conn: &Connection, hash: &str, now: i64, ttl_s: i64) -> QuizResult<Option<StatsReport>> {
    let Some(quiz) = load_snapshot(conn, hash)? else {
        return Ok(None);
    };
    if now - quiz.time_modified > ttl_s {
        return Ok(None);
    }
    let (sub_questions, questions): (Vec<_>, Vec<_>) = load_questions(conn, hash)?
        .into_iter()
        .partition(|q| q.sub_question);
    Ok(Some(StatsReport {
        sample_size: quiz.sample_size(),
        quiz,
        questions,
        sub_questions,
        responses: load_responses(conn, hash)?,
        from_cache: true,
    }))
}

fn delete_rows(conn: &Connection, hash: &str) -> QuizResult<usize> {
    conn.execute("DELETE FROM stats_questions WHERE hash_code = ?", [hash])?;
    conn.execute("DELETE FROM stats_responses WHERE hash_code = ?", [hash])?;
    Ok(conn.execute("DELETE FROM stats_snapshots WHERE hash_code = ?", [hash])?)
}

/// Replaces whatever is stored under the report's hash.
pub fn store(conn: &Connection, report: &StatsReport) -> QuizResult<()> {
    let q = &report.quiz;
    db::with_transaction(conn, |tx| {
        let conn: &Connection = tx;
        delete_rows(conn, &q.hash_code)?;
        conn.execute(
            "INSERT INTO stats_snapshots(hash_code, assessment_id, group_id, which_attempts,
                time_modified, first_attempts_count, all_attempts_count, first_attempts_avg,
                all_attempts_avg, median, standard_deviation, skewness, kurtosis, cic,
                error_ratio, standard_error)
             VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            rusqlite::params![
                q.hash_code,
                q.assessment_id,
                q.group_id,
                q.which_attempts.as_str(),
                q.time_modified,
                q.first_attempts_count,
                q.all_attempts_count,
                q.first_attempts_avg,
                q.all_attempts_avg,
                q.median,
                q.standard_deviation,
                q.skewness,
                q.kurtosis,
                q.cic,
                q.error_ratio,
                q.standard_error,
            ],
        )?;

        let mut insert_question = conn.prepare(
            "INSERT INTO stats_questions(hash_code, slot, question_id, sub_question, s, max_mark,
                facility, sd, random_guess_score, discrimination_index,
                discriminative_efficiency, effective_weight, mark_variance)
             VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )?;
        for s in report.questions.iter().chain(&report.sub_questions) {
            insert_question.execute(rusqlite::params![
                q.hash_code,
                s.slot,
                s.question_id,
                s.sub_question as i64,
                s.s,
                s.max_mark,
                s.facility,
                s.sd,
                s.random_guess_score,
                s.discrimination_index,
                s.discriminative_efficiency,
                s.effective_weight,
                s.mark_variance,
            ])?;
        }

        let mut insert_response = conn.prepare(
            "INSERT INTO stats_responses(hash_code, question_id, response, fraction, count)
             VALUES(?, ?, ?, ?, ?)",
        )?;
        for r in &report.responses {
            insert_response.execute((&q.hash_code, r.question_id, &r.response, r.fraction, r.count))?;
        }
        Ok(())
    })
}

pub fn clear(conn: &Connection, hash: &str) -> QuizResult<usize> {
    db::with_transaction(conn, |tx| delete_rows(tx, hash))
}

/// Drops every snapshot of an assessment, whatever group or selection it was for.
pub fn clear_assessment(conn: &Connection, assessment_id: &str) -> QuizResult<usize> {
    db::with_transaction(conn, |tx| {
        tx.execute(
            "DELETE FROM stats_questions WHERE hash_code IN
               (SELECT hash_code FROM stats_snapshots WHERE assessment_id = ?)",
            [assessment_id],
        )?;
        tx.execute(
            "DELETE FROM stats_responses WHERE hash_code IN
               (SELECT hash_code FROM stats_snapshots WHERE assessment_id = ?)",
            [assessment_id],
        )?;
        Ok(tx.execute(
            "DELETE FROM stats_snapshots WHERE assessment_id = ?",
            [assessment_id],
        )?)
    })
}
