//! Overall feedback bands keyed on the final grade.

use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::assessment;
use crate::error::{QuizError, QuizResult};

/// A boundary as entered: an absolute grade or a percentage string like `"75%"`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum Boundary {
    Grade(f64),
    Text(String),
}

impl Boundary {
    fn resolve(&self, max_grade: f64) -> QuizResult<f64> {
        match self {
            Boundary::Grade(g) => Ok(*g),
            Boundary::Text(raw) => {
                let raw = raw.trim();
                let parsed = match raw.strip_suffix('%') {
                    Some(pct) => pct.trim().parse::<f64>().map(|p| p * max_grade / 100.0),
                    None => raw.parse::<f64>(),
                };
                parsed.map_err(|_| {
                    QuizError::Config(format!("feedback boundary '{}' is not a number", raw))
                })
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedbackBand {
    pub feedback_text: String,
    pub min_grade: f64,
    pub max_grade: f64,
}

/// Turns `texts` (one more than `boundaries`) into grade bands. Boundaries
/// must lie in `(0, max_grade]` and strictly decrease.
pub fn build_bands(
    max_grade: f64,
    texts: &[String],
    boundaries: &[Boundary],
) -> QuizResult<Vec<FeedbackBand>> {
    if texts.len() != boundaries.len() + 1 {
        return Err(QuizError::Config(format!(
            "expected {} feedback texts for {} boundaries, got {}",
            boundaries.len() + 1,
            boundaries.len(),
            texts.len()
        )));
    }

    let mut resolved = Vec::with_capacity(boundaries.len());
    for (i, b) in boundaries.iter().enumerate() {
        let value = b.resolve(max_grade)?;
        if value <= 0.0 || value > max_grade {
            return Err(QuizError::Config(format!(
                "feedback boundary {} ({}) is outside (0, {}]",
                i + 1,
                value,
                max_grade
            )));
        }
        if let Some(prev) = resolved.last() {
            if value >= *prev {
                return Err(QuizError::Config(format!(
                    "feedback boundary {} must be lower than the one before it",
                    i + 1
                )));
            }
        }
        resolved.push(value);
    }

    // The top band is open-ended so the maximum grade itself falls inside it.
    let mut upper = max_grade + 1.0;
    let mut bands = Vec::with_capacity(texts.len());
    for (i, text) in texts.iter().enumerate() {
        let lower = resolved.get(i).copied().unwrap_or(0.0);
        bands.push(FeedbackBand {
            feedback_text: text.clone(),
            min_grade: lower,
            max_grade: upper,
        });
        upper = lower;
    }
    Ok(bands)
}

/// Replaces the assessment's feedback. Validation happens before any write.
pub fn set_feedback(
    conn: &Connection,
    assessment_id: &str,
    texts: &[String],
    boundaries: &[Boundary],
) -> QuizResult<Vec<FeedbackBand>> {
    let a = assessment::get(conn, assessment_id)?;
    let bands = build_bands(a.grade, texts, boundaries)?;
    crate::db::with_transaction(conn, |tx| {
        tx.execute(
            "DELETE FROM feedback_boundaries WHERE assessment_id = ?",
            [assessment_id],
        )?;
        for band in &bands {
            tx.execute(
                "INSERT INTO feedback_boundaries(id, assessment_id, feedback_text, min_grade, max_grade)
                 VALUES(?, ?, ?, ?, ?)",
                (
                    Uuid::new_v4().to_string(),
                    assessment_id,
                    &band.feedback_text,
                    band.min_grade,
                    band.max_grade,
                ),
            )?;
        }
        Ok(())
    })?;
    Ok(bands)
}

pub fn list(conn: &Connection, assessment_id: &str) -> QuizResult<Vec<FeedbackBand>> {
    let mut stmt = conn.prepare(
        "SELECT feedback_text, min_grade, max_grade FROM feedback_boundaries
         WHERE assessment_id = ? ORDER BY min_grade DESC",
    )?;
    let rows = stmt
        .query_map([assessment_id], |r| {
            Ok(FeedbackBand {
                feedback_text: r.get(0)?,
                min_grade: r.get(1)?,
                max_grade: r.get(2)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Text of the band with `min <= grade < max`. Negative grades count as 0.
pub fn for_grade(conn: &Connection, assessment_id: &str, grade: f64) -> QuizResult<Option<String>> {
    let grade = grade.max(0.0);
    Ok(conn
        .query_row(
            "SELECT feedback_text FROM feedback_boundaries
             WHERE assessment_id = ?1 AND min_grade <= ?2 AND ?2 < max_grade
             ORDER BY min_grade DESC LIMIT 1",
            (assessment_id, grade),
            |r| r.get(0),
        )
        .optional()?)
}
