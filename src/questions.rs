use rusqlite::{params_from_iter, types::Value, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::error::{QuizError, QuizResult};
use crate::usage::QuestionUsageStore;

/// Placeholder type; a concrete question is drawn from its category per attempt.
pub const QTYPE_RANDOM: &str = "random";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Question {
    pub id: i64,
    pub name: String,
    pub qtype: String,
    pub category: String,
    #[serde(default = "default_mark")]
    pub default_mark: f64,
    #[serde(default)]
    pub random_guess_score: Option<f64>,
}

fn default_mark() -> f64 {
    1.0
}

impl Question {
    pub fn is_random(&self) -> bool {
        self.qtype == QTYPE_RANDOM
    }
}

fn map_question(r: &rusqlite::Row<'_>) -> rusqlite::Result<Question> {
    Ok(Question {
        id: r.get(0)?,
        name: r.get(1)?,
        qtype: r.get(2)?,
        category: r.get(3)?,
        default_mark: r.get(4)?,
        random_guess_score: r.get(5)?,
    })
}

pub fn upsert(conn: &Connection, q: &Question) -> QuizResult<()> {
    if q.id <= 0 {
        return Err(QuizError::Config("question ids must be positive".into()));
    }
    if q.default_mark < 0.0 {
        return Err(QuizError::Config(format!(
            "question {} has a negative default mark",
            q.id
        )));
    }
    conn.execute(
        "INSERT INTO questions(id, name, qtype, category, default_mark, random_guess_score)
         VALUES(?, ?, ?, ?, ?, ?)
         ON CONFLICT(id) DO UPDATE SET
           name = excluded.name,
           qtype = excluded.qtype,
           category = excluded.category,
           default_mark = excluded.default_mark,
           random_guess_score = excluded.random_guess_score",
        (
            q.id,
            &q.name,
            &q.qtype,
            &q.category,
            q.default_mark,
            q.random_guess_score,
        ),
    )?;
    Ok(())
}

pub fn get(conn: &Connection, id: i64) -> QuizResult<Question> {
    conn.query_row(
        "SELECT id, name, qtype, category, default_mark, random_guess_score
         FROM questions WHERE id = ?",
        [id],
        map_question,
    )
    .optional()?
    .ok_or_else(|| QuizError::not_found(format!("question {}", id)))
}

/// Loads the given questions. Ids that do not exist are simply absent.
pub fn get_many(conn: &Connection, ids: &[i64]) -> QuizResult<Vec<Question>> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let placeholders = std::iter::repeat("?")
        .take(ids.len())
        .collect::<Vec<_>>()
        .join(",");
    let sql = format!(
        "SELECT id, name, qtype, category, default_mark, random_guess_score
         FROM questions WHERE id IN ({}) ORDER BY id",
        placeholders
    );
    let values: Vec<Value> = ids.iter().map(|id| Value::Integer(*id)).collect();
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(values), map_question)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Concrete (non-random) questions that a random slot in `category` may draw.
pub fn drawable_in_category(conn: &Connection, category: &str) -> QuizResult<Vec<i64>> {
    let mut stmt = conn.prepare(
        "SELECT id FROM questions WHERE category = ? AND qtype <> ? ORDER BY id",
    )?;
    let ids = stmt
        .query_map((category, QTYPE_RANDOM), |r| r.get::<_, i64>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ids)
}

/// Removes a question from the bank. Refused while any attempt or
/// assessment layout still refers to it.
pub fn delete(conn: &Connection, usage: &dyn QuestionUsageStore, id: i64) -> QuizResult<()> {
    if usage.questions_in_use(conn, &[id])? {
        return Err(QuizError::Config(format!(
            "question {} has been attempted and cannot be deleted",
            id
        )));
    }
    let in_layout: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM assessment_questions WHERE question_id = ?)",
        [id],
        |r| r.get(0),
    )?;
    if in_layout {
        return Err(QuizError::Config(format!(
            "question {} is still used by an assessment",
            id
        )));
    }
    if conn.execute("DELETE FROM questions WHERE id = ?", [id])? == 0 {
        return Err(QuizError::not_found(format!("question {}", id)));
    }
    Ok(())
}
