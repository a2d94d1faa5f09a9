//! Per-attempt scores and the per-user best grade.
//!
//! An attempt's score is its raw mark divided by the number of questions it
//! contained. The stored grade is that score aggregated over the user's
//! finished attempts by the assessment's grade method, then rescaled.

use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use tracing::{debug, info};

use crate::assessment::{self, Assessment, GradeMethod};
use crate::db;
use crate::error::{QuizError, QuizResult};
use crate::services::Services;

/// Totals below this are treated as zero.
pub const GRADE_EPSILON: f64 = 5e-6;
/// Maximum-grade changes smaller than this are ignored.
const MAX_GRADE_EPSILON: f64 = 1e-7;

pub fn rescale(raw: f64, assessment: &Assessment) -> f64 {
    if assessment.sum_grades >= GRADE_EPSILON {
        raw * assessment.grade
    } else {
        0.0
    }
}

pub fn round_grade(grade: f64, decimal_points: i64) -> f64 {
    let factor = 10f64.powi(decimal_points.clamp(0, 10) as i32);
    (grade * factor).round() / factor
}

/// The fields of a finished attempt that grading looks at.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AttemptScore {
    pub attempt: i64,
    pub sum_grades: Option<f64>,
    pub num_questions: i64,
}

impl AttemptScore {
    /// `None` when the attempt is ungraded or had no questions.
    pub fn score(&self) -> Option<f64> {
        let sum = self.sum_grades?;
        (self.num_questions > 0).then(|| sum / self.num_questions as f64)
    }
}

pub fn calculate_best_grade(method: GradeMethod, attempts: &[AttemptScore]) -> Option<f64> {
    if attempts.is_empty() {
        return None;
    }
    let mut ordered = attempts.to_vec();
    ordered.sort_by_key(|a| a.attempt);

    match method {
        GradeMethod::First => ordered.first().and_then(AttemptScore::score),
        GradeMethod::Last => ordered.last().and_then(AttemptScore::score),
        GradeMethod::Average => {
            let scores: Vec<f64> = ordered.iter().filter_map(AttemptScore::score).collect();
            if scores.is_empty() {
                None
            } else {
                Some(scores.iter().sum::<f64>() / scores.len() as f64)
            }
        }
        GradeMethod::Highest => ordered
            .iter()
            .filter_map(AttemptScore::score)
            .fold(None, |best: Option<f64>, s| Some(best.map_or(s, |b| b.max(s)))),
    }
}

/// Finished, non-preview attempts of one user, in attempt order.
pub fn finished_attempt_scores(
    conn: &Connection,
    assessment_id: &str,
    user_id: &str,
) -> QuizResult<Vec<AttemptScore>> {
    let mut stmt = conn.prepare(
        "SELECT attempt, sum_grades, num_questions FROM attempts
         WHERE assessment_id = ? AND user_id = ? AND state = 'finished' AND preview = 0
         ORDER BY attempt",
    )?;
    let rows = stmt
        .query_map((assessment_id, user_id), |r| {
            Ok(AttemptScore {
                attempt: r.get(0)?,
                sum_grades: r.get(1)?,
                num_questions: r.get(2)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn get_grade(conn: &Connection, assessment_id: &str, user_id: &str) -> QuizResult<Option<f64>> {
    Ok(conn
        .query_row(
            "SELECT grade FROM grades WHERE assessment_id = ? AND user_id = ?",
            (assessment_id, user_id),
            |r| r.get(0),
        )
        .optional()?)
}

fn grade_differs(old: Option<f64>, new: Option<f64>) -> bool {
    match (old, new) {
        (Some(o), Some(n)) => (o - n).abs() > GRADE_EPSILON,
        (None, None) => false,
        _ => true,
    }
}

fn write_grade(
    conn: &Connection,
    services: &Services,
    assessment_id: &str,
    user_id: &str,
    grade: Option<f64>,
    now: i64,
) -> QuizResult<()> {
    match grade {
        Some(g) => {
            conn.execute(
                "INSERT INTO grades(assessment_id, user_id, grade, time_modified) VALUES(?, ?, ?, ?)
                 ON CONFLICT(assessment_id, user_id) DO UPDATE SET
                   grade = excluded.grade,
                   time_modified = excluded.time_modified",
                (assessment_id, user_id, g, now),
            )?;
        }
        None => {
            conn.execute(
                "DELETE FROM grades WHERE assessment_id = ? AND user_id = ?",
                (assessment_id, user_id),
            )?;
        }
    }
    services
        .gradebook
        .publish_grade(conn, assessment_id, user_id, grade, now)
}

/// Recomputes and stores one user's grade. Runs on the caller's connection;
/// attempt transitions call it inside their own unit of work. Nothing is
/// written when the grade is unchanged.
pub fn save_best_grade(
    conn: &Connection,
    services: &Services,
    assessment: &Assessment,
    user_id: &str,
    attempts: Option<&[AttemptScore]>,
    now: i64,
) -> QuizResult<Option<f64>> {
    let loaded;
    let attempts = match attempts {
        Some(a) => a,
        None => {
            loaded = finished_attempt_scores(conn, &assessment.id, user_id)?;
            &loaded
        }
    };

    let best = calculate_best_grade(assessment.grade_method, attempts);
    let grade = best.map(|b| rescale(b, assessment));
    let existing = get_grade(conn, &assessment.id, user_id)?;
    if grade_differs(existing, grade) {
        write_grade(conn, services, &assessment.id, user_id, grade, now)?;
        debug!(assessment = %assessment.id, user = user_id, ?grade, "best grade saved");
    }
    Ok(grade)
}

#[derive(Debug, Clone, PartialEq)]
struct GradeChange {
    user_id: String,
    new_grade: Option<f64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalGradesSummary {
    pub users: usize,
    pub updated: usize,
    pub deleted: usize,
}

fn best_score_sql(method: GradeMethod) -> String {
    let finished = "assessment_id = ?1 AND state = 'finished' AND preview = 0";
    // `sum_grades * 1.0 / 0` is NULL in SQLite, matching an attempt without questions.
    let pick = |agg: &str| {
        format!(
            "SELECT a.user_id, a.sum_grades * 1.0 / a.num_questions AS score FROM attempts a
             JOIN (SELECT user_id, {agg}(attempt) AS pick FROM attempts WHERE {finished} GROUP BY user_id) p
               ON p.user_id = a.user_id AND p.pick = a.attempt
             WHERE a.assessment_id = ?1"
        )
    };
    match method {
        GradeMethod::Highest => format!(
            "SELECT user_id, MAX(sum_grades * 1.0 / num_questions) AS score FROM attempts
             WHERE {finished} GROUP BY user_id"
        ),
        GradeMethod::Average => format!(
            "SELECT user_id, AVG(sum_grades * 1.0 / num_questions) AS score FROM attempts
             WHERE {finished} GROUP BY user_id"
        ),
        GradeMethod::First => pick("MIN"),
        GradeMethod::Last => pick("MAX"),
    }
}

fn final_grade_changes(conn: &Connection, assessment: &Assessment) -> QuizResult<(usize, Vec<GradeChange>)> {
    let sql = format!(
        "WITH best AS ({})
         SELECT u.user_id, best.score, g.grade
         FROM (SELECT user_id FROM best UNION SELECT user_id FROM grades WHERE assessment_id = ?1) u
         LEFT JOIN best ON best.user_id = u.user_id
         LEFT JOIN grades g ON g.assessment_id = ?1 AND g.user_id = u.user_id
         ORDER BY u.user_id",
        best_score_sql(assessment.grade_method)
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([&assessment.id], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, Option<f64>>(1)?,
                r.get::<_, Option<f64>>(2)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let users = rows.len();
    let changes = rows
        .into_iter()
        .filter_map(|(user_id, score, old)| {
            let new_grade = score.map(|s| rescale(s, assessment));
            grade_differs(old, new_grade).then_some(GradeChange { user_id, new_grade })
        })
        .collect();
    Ok((users, changes))
}

fn apply_final_grade_changes(
    conn: &Connection,
    services: &Services,
    assessment: &Assessment,
    users: usize,
    changes: &[GradeChange],
    now: i64,
) -> QuizResult<FinalGradesSummary> {
    let mut summary = FinalGradesSummary {
        users,
        ..FinalGradesSummary::default()
    };
    for change in changes {
        write_grade(conn, services, &assessment.id, &change.user_id, change.new_grade, now)?;
        if change.new_grade.is_some() {
            summary.updated += 1;
        } else {
            summary.deleted += 1;
        }
    }
    publish_all(conn, services, &assessment.id, now)?;
    Ok(summary)
}

/// Recomputes every user's grade with one aggregate query and writes only
/// the rows that changed. The read happens outside the write transaction.
#[tracing::instrument(skip_all, fields(assessment = %assessment.id), err(Debug))]
pub fn update_all_final_grades(
    conn: &Connection,
    services: &Services,
    assessment: &Assessment,
    now: i64,
) -> QuizResult<FinalGradesSummary> {
    let (users, changes) = final_grade_changes(conn, assessment)?;
    let summary = db::with_transaction(conn, |tx| {
        apply_final_grade_changes(tx, services, assessment, users, &changes, now)
    })?;
    info!(
        users = summary.users,
        updated = summary.updated,
        deleted = summary.deleted,
        "final grades updated"
    );
    Ok(summary)
}

/// Pushes every stored grade of the assessment to the gradebook.
pub fn publish_all(
    conn: &Connection,
    services: &Services,
    assessment_id: &str,
    now: i64,
) -> QuizResult<usize> {
    let mut stmt =
        conn.prepare("SELECT user_id, grade FROM grades WHERE assessment_id = ? ORDER BY user_id")?;
    let rows = stmt
        .query_map([assessment_id], |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, f64>(1)?))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    for (user_id, grade) in &rows {
        services
            .gradebook
            .publish_grade(conn, assessment_id, user_id, Some(*grade), now)?;
    }
    Ok(rows.len())
}

/// Changes the maximum grade as one unit of work.
pub fn set_max_grade(
    conn: &Connection,
    services: &Services,
    assessment_id: &str,
    new_grade: f64,
    now: i64,
) -> QuizResult<Assessment> {
    db::with_transaction(conn, |tx| {
        let current = assessment::get(tx, assessment_id)?;
        set_max_grade_in(tx, services, new_grade, &current, now)
    })
}

/// Body of [`set_max_grade`] for callers that already hold a transaction.
///
/// Stored grades and feedback boundaries scale by `new / old`. When the old
/// maximum was effectively zero the ratio is undefined, so every grade is
/// recomputed from the attempts instead.
pub fn set_max_grade_in(
    conn: &Connection,
    services: &Services,
    new_grade: f64,
    assessment: &Assessment,
    now: i64,
) -> QuizResult<Assessment> {
    if new_grade < 0.0 || !new_grade.is_finite() {
        return Err(QuizError::Config("maximum grade must be >= 0".into()));
    }
    let old_grade = assessment.grade;
    if (old_grade - new_grade).abs() < MAX_GRADE_EPSILON {
        return Ok(assessment.clone());
    }

    conn.execute(
        "UPDATE assessments SET grade = ?, time_modified = ? WHERE id = ?",
        (new_grade, now, &assessment.id),
    )?;
    let updated = Assessment {
        grade: new_grade,
        time_modified: now,
        ..assessment.clone()
    };

    if old_grade < MAX_GRADE_EPSILON {
        let (users, changes) = final_grade_changes(conn, &updated)?;
        apply_final_grade_changes(conn, services, &updated, users, &changes, now)?;
    } else {
        let factor = new_grade / old_grade;
        conn.execute(
            "UPDATE grades SET grade = grade * ?, time_modified = ? WHERE assessment_id = ?",
            (factor, now, &assessment.id),
        )?;
        conn.execute(
            "UPDATE feedback_boundaries SET min_grade = min_grade * ?1, max_grade = max_grade * ?1
             WHERE assessment_id = ?2",
            (factor, &assessment.id),
        )?;
        publish_all(conn, services, &assessment.id, now)?;
    }
    info!(assessment = %assessment.id, old_grade, new_grade, "maximum grade changed");
    Ok(updated)
}
