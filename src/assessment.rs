use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::warn;

use crate::error::{QuizError, QuizResult};
use crate::grading;
use crate::layout;
use crate::overrides::EffectiveSettings;
use crate::questions;
use crate::services::Services;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum GradeMethod {
    #[default]
    Highest,
    Average,
    First,
    Last,
}

impl GradeMethod {
    pub fn as_i64(self) -> i64 {
        match self {
            GradeMethod::Highest => 1,
            GradeMethod::Average => 2,
            GradeMethod::First => 3,
            GradeMethod::Last => 4,
        }
    }

    pub fn from_i64(v: i64) -> Self {
        match v {
            2 => GradeMethod::Average,
            3 => GradeMethod::First,
            4 => GradeMethod::Last,
            _ => GradeMethod::Highest,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverdueHandling {
    #[default]
    AutoSubmit,
    GracePeriod,
    AutoAbandon,
}

impl OverdueHandling {
    pub fn as_str(self) -> &'static str {
        match self {
            OverdueHandling::AutoSubmit => "autosubmit",
            OverdueHandling::GracePeriod => "graceperiod",
            OverdueHandling::AutoAbandon => "autoabandon",
        }
    }

    /// Unknown stored values abandon expired attempts.
    pub fn parse(raw: &str) -> Self {
        match raw {
            "autosubmit" => OverdueHandling::AutoSubmit,
            "graceperiod" => OverdueHandling::GracePeriod,
            "autoabandon" => OverdueHandling::AutoAbandon,
            other => {
                warn!(value = other, "unrecognised overdue handling; treating as autoabandon");
                OverdueHandling::AutoAbandon
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Assessment {
    pub id: String,
    pub course_id: String,
    pub name: String,
    pub grade_method: GradeMethod,
    /// Zero means unlimited.
    pub attempts_allowed: i64,
    pub attempt_on_last: bool,
    pub time_open: i64,
    pub time_close: i64,
    pub time_limit: i64,
    pub grace_period: i64,
    pub overdue_handling: OverdueHandling,
    pub layout: String,
    pub questions_per_page: i64,
    pub shuffle_questions: bool,
    pub sum_grades: f64,
    pub grade: f64,
    pub decimal_points: i64,
    pub password: Option<String>,
    pub time_modified: i64,
}

impl Default for Assessment {
    fn default() -> Self {
        Self {
            id: String::new(),
            course_id: String::new(),
            name: String::new(),
            grade_method: GradeMethod::Highest,
            attempts_allowed: 0,
            attempt_on_last: false,
            time_open: 0,
            time_close: 0,
            time_limit: 0,
            grace_period: 0,
            overdue_handling: OverdueHandling::AutoSubmit,
            layout: "0".to_string(),
            questions_per_page: 1,
            shuffle_questions: false,
            sum_grades: 0.0,
            grade: 10.0,
            decimal_points: 2,
            password: None,
            time_modified: 0,
        }
    }
}

impl Assessment {
    /// A copy with one user's effective access settings applied.
    pub fn for_user(&self, settings: &EffectiveSettings) -> Assessment {
        Assessment {
            time_open: settings.time_open,
            time_close: settings.time_close,
            time_limit: settings.time_limit,
            attempts_allowed: settings.attempts,
            password: settings.password.clone(),
            ..self.clone()
        }
    }

    pub fn validate(&self) -> QuizResult<()> {
        if self.id.trim().is_empty() {
            return Err(QuizError::Config("assessment id must not be empty".into()));
        }
        if self.grade < 0.0 || !self.grade.is_finite() {
            return Err(QuizError::Config("maximum grade must be >= 0".into()));
        }
        if self.sum_grades < 0.0 {
            return Err(QuizError::Config("sumgrades must not be negative".into()));
        }
        if self.time_open != 0 && self.time_close != 0 && self.time_close < self.time_open {
            return Err(QuizError::Config("assessment closes before it opens".into()));
        }
        if self.time_limit < 0 || self.grace_period < 0 || self.attempts_allowed < 0 {
            return Err(QuizError::Config(
                "time limit, grace period and attempts must not be negative".into(),
            ));
        }
        if self.questions_per_page < 0 {
            return Err(QuizError::Config("questions per page must be >= 0".into()));
        }
        if !(0..=5).contains(&self.decimal_points) {
            return Err(QuizError::Config("decimal points must be between 0 and 5".into()));
        }
        Ok(())
    }
}

const ASSESSMENT_COLUMNS: &str = "id, course_id, name, grade_method, attempts_allowed, attempt_on_last,
    time_open, time_close, time_limit, grace_period, overdue_handling, layout, questions_per_page,
    shuffle_questions, sum_grades, grade, decimal_points, password, time_modified";

fn map_assessment(r: &rusqlite::Row<'_>) -> rusqlite::Result<Assessment> {
    let overdue: String = r.get(10)?;
    Ok(Assessment {
        id: r.get(0)?,
        course_id: r.get(1)?,
        name: r.get(2)?,
        grade_method: GradeMethod::from_i64(r.get(3)?),
        attempts_allowed: r.get(4)?,
        attempt_on_last: r.get::<_, i64>(5)? != 0,
        time_open: r.get(6)?,
        time_close: r.get(7)?,
        time_limit: r.get(8)?,
        grace_period: r.get(9)?,
        overdue_handling: OverdueHandling::parse(&overdue),
        layout: r.get(11)?,
        questions_per_page: r.get(12)?,
        shuffle_questions: r.get::<_, i64>(13)? != 0,
        sum_grades: r.get(14)?,
        grade: r.get(15)?,
        decimal_points: r.get(16)?,
        password: r.get(17)?,
        time_modified: r.get(18)?,
    })
}

pub fn get(conn: &Connection, id: &str) -> QuizResult<Assessment> {
    conn.query_row(
        &format!("SELECT {} FROM assessments WHERE id = ?", ASSESSMENT_COLUMNS),
        [id],
        map_assessment,
    )
    .optional()?
    .ok_or_else(|| QuizError::not_found(format!("assessment {}", id)))
}

pub fn insert(conn: &Connection, a: &Assessment) -> QuizResult<()> {
    a.validate()?;
    conn.execute(
        &format!(
            "INSERT INTO assessments({}) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            ASSESSMENT_COLUMNS
        ),
        rusqlite::params![
            a.id,
            a.course_id,
            a.name,
            a.grade_method.as_i64(),
            a.attempts_allowed,
            a.attempt_on_last as i64,
            a.time_open,
            a.time_close,
            a.time_limit,
            a.grace_period,
            a.overdue_handling.as_str(),
            layout::clean(&a.layout, false),
            a.questions_per_page,
            a.shuffle_questions as i64,
            a.sum_grades,
            a.grade,
            a.decimal_points,
            a.password,
            a.time_modified,
        ],
    )?;
    Ok(())
}

/// Saves the settings fields. Layout, sumgrades and the maximum grade have
/// their own operations because changing them has knock-on effects.
pub fn update_settings(conn: &Connection, a: &Assessment, now: i64) -> QuizResult<Assessment> {
    a.validate()?;
    let existing = get(conn, &a.id)?;
    conn.execute(
        "UPDATE assessments SET
           course_id = ?, name = ?, grade_method = ?, attempts_allowed = ?, attempt_on_last = ?,
           time_open = ?, time_close = ?, time_limit = ?, grace_period = ?, overdue_handling = ?,
           questions_per_page = ?, shuffle_questions = ?, decimal_points = ?, password = ?,
           time_modified = ?
         WHERE id = ?",
        rusqlite::params![
            a.course_id,
            a.name,
            a.grade_method.as_i64(),
            a.attempts_allowed,
            a.attempt_on_last as i64,
            a.time_open,
            a.time_close,
            a.time_limit,
            a.grace_period,
            a.overdue_handling.as_str(),
            a.questions_per_page,
            a.shuffle_questions as i64,
            a.decimal_points,
            a.password,
            now,
            a.id,
        ],
    )?;
    Ok(Assessment {
        layout: existing.layout,
        sum_grades: existing.sum_grades,
        grade: existing.grade,
        time_modified: now,
        ..a.clone()
    })
}

pub fn has_attempts(conn: &Connection, assessment_id: &str) -> QuizResult<bool> {
    let n: i64 = conn.query_row(
        "SELECT COUNT(*) FROM attempts WHERE assessment_id = ? AND preview = 0",
        [assessment_id],
        |r| r.get(0),
    )?;
    Ok(n > 0)
}

/// Max mark per question id for the assessment's slots.
pub fn slot_marks(conn: &Connection, assessment_id: &str) -> QuizResult<HashMap<i64, f64>> {
    let mut stmt = conn.prepare(
        "SELECT question_id, max_mark FROM assessment_questions WHERE assessment_id = ?",
    )?;
    let rows = stmt
        .query_map([assessment_id], |r| Ok((r.get::<_, i64>(0)?, r.get::<_, f64>(1)?)))?
        .collect::<Result<HashMap<_, _>, _>>()?;
    Ok(rows)
}

/// Stores a new question layout and slot marks, then brings sumgrades up to date.
///
/// Unknown question ids are rejected. Once real attempts exist, pages and
/// marks may change but the set of questions may not.
pub fn set_layout(
    conn: &Connection,
    services: &Services,
    assessment_id: &str,
    raw_layout: &str,
    marks: &HashMap<i64, f64>,
    now: i64,
) -> QuizResult<Assessment> {
    crate::db::with_transaction(conn, |tx| {
        set_layout_in(tx, services, assessment_id, raw_layout, marks, now)
    })
}

/// Body of [`set_layout`] for callers that already hold a transaction.
pub fn set_layout_in(
    conn: &Connection,
    services: &Services,
    assessment_id: &str,
    raw_layout: &str,
    marks: &HashMap<i64, f64>,
    now: i64,
) -> QuizResult<Assessment> {
    let assessment = get(conn, assessment_id)?;
    let cleaned = layout::clean(raw_layout, false);
    let ids = layout::questions(&cleaned);

    let known = questions::get_many(conn, &ids)?;
    let missing: Vec<i64> = ids
        .iter()
        .copied()
        .filter(|id| !known.iter().any(|q| q.id == *id))
        .collect();
    if !missing.is_empty() {
        return Err(QuizError::Config(format!(
            "layout references unknown questions: {}",
            layout::join(&missing)
        )));
    }
    if let Some((id, mark)) = marks.iter().find(|(_, m)| **m < 0.0 || !m.is_finite()) {
        return Err(QuizError::Config(format!(
            "invalid max mark {} for question {}",
            mark, id
        )));
    }

    if has_attempts(conn, assessment_id)? {
        let mut before = layout::questions(&assessment.layout);
        let mut after = ids.clone();
        before.sort_unstable();
        after.sort_unstable();
        if before != after {
            return Err(QuizError::Config(
                "questions cannot be added or removed once the assessment has attempts".into(),
            ));
        }
    }

    let current_marks = slot_marks(conn, assessment_id)?;
    conn.execute(
        "DELETE FROM assessment_questions WHERE assessment_id = ?",
        [assessment_id],
    )?;
    for q in &known {
        let max_mark = marks
            .get(&q.id)
            .or_else(|| current_marks.get(&q.id))
            .copied()
            .unwrap_or(q.default_mark);
        conn.execute(
            "INSERT INTO assessment_questions(assessment_id, question_id, max_mark) VALUES(?, ?, ?)",
            (assessment_id, q.id, max_mark),
        )?;
    }
    conn.execute(
        "UPDATE assessments SET layout = ?, time_modified = ? WHERE id = ?",
        (&cleaned, now, assessment_id),
    )?;
    update_sum_grades(conn, services, assessment_id, now)
}

/// Recomputes sumgrades from the slot marks. If real attempts exist and the
/// total has become zero, the maximum grade is forced to zero as well so that
/// nothing downstream divides by zero.
pub fn update_sum_grades(
    conn: &Connection,
    services: &Services,
    assessment_id: &str,
    now: i64,
) -> QuizResult<Assessment> {
    let assessment = get(conn, assessment_id)?;
    let ids = layout::questions(&assessment.layout);
    let marks = slot_marks(conn, assessment_id)?;
    let sum_grades: f64 = ids.iter().filter_map(|id| marks.get(id)).sum();
    conn.execute(
        "UPDATE assessments SET sum_grades = ? WHERE id = ?",
        (sum_grades, assessment_id),
    )?;
    let assessment = Assessment {
        sum_grades,
        ..assessment
    };

    if sum_grades < grading::GRADE_EPSILON && has_attempts(conn, assessment_id)? {
        return grading::set_max_grade_in(conn, services, 0.0, &assessment, now);
    }
    Ok(assessment)
}
