//! Per-attempt question interaction state.
//!
//! A usage holds one question attempt per slot. Responses arrive either as
//! page submissions (pending until the actions are processed) or as
//! autosaves. Grading fractions are supplied with the response; finishing
//! turns them into marks.

use rusqlite::{params_from_iter, types::Value, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{QuizError, QuizResult};

const FRACTION_EPSILON: f64 = 1e-7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuestionState {
    Todo,
    Complete,
    GradedRight,
    GradedPartial,
    GradedWrong,
    GaveUp,
}

impl QuestionState {
    pub fn as_str(self) -> &'static str {
        match self {
            QuestionState::Todo => "todo",
            QuestionState::Complete => "complete",
            QuestionState::GradedRight => "gradedright",
            QuestionState::GradedPartial => "gradedpartial",
            QuestionState::GradedWrong => "gradedwrong",
            QuestionState::GaveUp => "gaveup",
        }
    }

    pub fn parse(raw: &str) -> QuizResult<Self> {
        Ok(match raw {
            "todo" => QuestionState::Todo,
            "complete" => QuestionState::Complete,
            "gradedright" => QuestionState::GradedRight,
            "gradedpartial" => QuestionState::GradedPartial,
            "gradedwrong" => QuestionState::GradedWrong,
            "gaveup" => QuestionState::GaveUp,
            other => {
                return Err(QuizError::Consistency(format!(
                    "unknown question state {}",
                    other
                )))
            }
        })
    }

    pub fn is_finished(self) -> bool {
        !matches!(self, QuestionState::Todo | QuestionState::Complete)
    }

    fn graded_for(fraction: f64) -> Self {
        if fraction >= 1.0 - FRACTION_EPSILON {
            QuestionState::GradedRight
        } else if fraction <= FRACTION_EPSILON {
            QuestionState::GradedWrong
        } else {
            QuestionState::GradedPartial
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuestionAttempt {
    pub slot: i64,
    pub question_id: i64,
    pub max_mark: f64,
    pub state: QuestionState,
    pub fraction: Option<f64>,
    pub mark: Option<f64>,
    pub response_summary: Option<String>,
    #[serde(skip)]
    pub pending_response: Option<String>,
    #[serde(skip)]
    pub pending_fraction: Option<f64>,
    #[serde(skip)]
    pub autosave_response: Option<String>,
    #[serde(skip)]
    pub autosave_fraction: Option<f64>,
    pub time_modified: i64,
}

impl QuestionAttempt {
    pub fn new(slot: i64, question_id: i64, max_mark: f64, now: i64) -> Self {
        Self {
            slot,
            question_id,
            max_mark,
            state: QuestionState::Todo,
            fraction: None,
            mark: None,
            response_summary: None,
            pending_response: None,
            pending_fraction: None,
            autosave_response: None,
            autosave_fraction: None,
            time_modified: now,
        }
    }

    fn commit_response(&mut self, response: String, fraction: Option<f64>, now: i64) {
        self.state = if response.trim().is_empty() {
            QuestionState::Todo
        } else {
            QuestionState::Complete
        };
        self.response_summary = Some(response).filter(|r| !r.trim().is_empty());
        self.fraction = fraction.map(|f| f.clamp(0.0, 1.0));
        self.time_modified = now;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuestionUsage {
    pub id: String,
    pub assessment_id: String,
    pub slots: Vec<QuestionAttempt>,
}

impl QuestionUsage {
    /// Builds a fresh usage; `slots` are (question id, max mark) in slot order from 1.
    pub fn new(assessment_id: &str, slots: &[(i64, f64)], now: i64) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            assessment_id: assessment_id.to_string(),
            slots: slots
                .iter()
                .enumerate()
                .map(|(i, (qid, max))| QuestionAttempt::new(i as i64 + 1, *qid, *max, now))
                .collect(),
        }
    }

    pub fn slot(&self, slot: i64) -> Option<&QuestionAttempt> {
        self.slots.iter().find(|s| s.slot == slot)
    }

    fn slot_mut(&mut self, slot: i64) -> QuizResult<&mut QuestionAttempt> {
        self.slots
            .iter_mut()
            .find(|s| s.slot == slot)
            .ok_or_else(|| QuizError::not_found(format!("slot {}", slot)))
    }

    /// Queues a page submission for `slot`. It replaces any autosave.
    pub fn record_pending(
        &mut self,
        slot: i64,
        response: &str,
        fraction: Option<f64>,
    ) -> QuizResult<()> {
        let qa = self.slot_mut(slot)?;
        if qa.state.is_finished() {
            return Ok(());
        }
        qa.pending_response = Some(response.to_string());
        qa.pending_fraction = fraction;
        qa.autosave_response = None;
        qa.autosave_fraction = None;
        Ok(())
    }

    pub fn record_autosave(
        &mut self,
        slot: i64,
        response: &str,
        fraction: Option<f64>,
    ) -> QuizResult<()> {
        let qa = self.slot_mut(slot)?;
        if qa.state.is_finished() {
            return Ok(());
        }
        qa.autosave_response = Some(response.to_string());
        qa.autosave_fraction = fraction;
        Ok(())
    }

    /// Commits every pending submission. Returns how many slots changed.
    pub fn process_all_actions(&mut self, now: i64) -> usize {
        let mut changed = 0;
        for qa in self.slots.iter_mut().filter(|qa| !qa.state.is_finished()) {
            if let Some(response) = qa.pending_response.take() {
                let fraction = qa.pending_fraction.take();
                qa.commit_response(response, fraction, now);
                changed += 1;
            }
        }
        changed
    }

    /// Commits autosaved responses. A slot with a pending submission keeps it.
    pub fn process_all_autosaves(&mut self, now: i64) -> usize {
        let mut changed = 0;
        for qa in self.slots.iter_mut().filter(|qa| !qa.state.is_finished()) {
            if qa.pending_response.is_some() {
                continue;
            }
            if let Some(response) = qa.autosave_response.take() {
                let fraction = qa.autosave_fraction.take();
                if qa.response_summary.as_deref() != Some(response.as_str())
                    || qa.fraction != fraction
                {
                    qa.commit_response(response, fraction, now);
                    changed += 1;
                }
            }
        }
        changed
    }

    /// Grades every open slot. Answered questions get `fraction * max_mark`;
    /// unanswered ones give up with no mark.
    pub fn finish_all_questions(&mut self, now: i64) {
        self.process_all_autosaves(now);
        for qa in self.slots.iter_mut().filter(|qa| !qa.state.is_finished()) {
            qa.pending_response = None;
            qa.pending_fraction = None;
            qa.time_modified = now;
            if qa.response_summary.is_none() {
                qa.state = QuestionState::GaveUp;
                qa.fraction = None;
                qa.mark = None;
                continue;
            }
            let fraction = qa.fraction.unwrap_or(0.0);
            qa.fraction = Some(fraction);
            qa.mark = Some(fraction * qa.max_mark);
            qa.state = QuestionState::graded_for(fraction);
        }
    }

    /// Sum of marks; ungraded slots count as zero.
    pub fn total_mark(&self) -> f64 {
        self.slots.iter().filter_map(|qa| qa.mark).sum()
    }
}

/// Persistence of question usages. All calls run on the caller's connection
/// so they join whatever unit of work is open.
pub trait QuestionUsageStore {
    fn load_usage(&self, conn: &Connection, id: &str) -> QuizResult<QuestionUsage>;
    fn save(&self, conn: &Connection, usage: &QuestionUsage) -> QuizResult<()>;
    fn delete_usage(&self, conn: &Connection, id: &str) -> QuizResult<()>;
    fn questions_in_use(&self, conn: &Connection, question_ids: &[i64]) -> QuizResult<bool>;
}

pub struct SqliteUsageStore;

impl QuestionUsageStore for SqliteUsageStore {
    fn load_usage(&self, conn: &Connection, id: &str) -> QuizResult<QuestionUsage> {
        let assessment_id: String = conn
            .query_row(
                "SELECT assessment_id FROM question_usages WHERE id = ?",
                [id],
                |r| r.get(0),
            )
            .optional()?
            .ok_or_else(|| QuizError::not_found(format!("question usage {}", id)))?;

        let mut stmt = conn.prepare(
            "SELECT slot, question_id, max_mark, state, fraction, mark, response_summary,
                    pending_response, pending_fraction, autosave_response, autosave_fraction,
                    time_modified
             FROM question_attempts WHERE usage_id = ? ORDER BY slot",
        )?;
        let rows = stmt
            .query_map([id], |r| {
                Ok((
                    r.get::<_, String>(3)?,
                    QuestionAttempt {
                        slot: r.get(0)?,
                        question_id: r.get(1)?,
                        max_mark: r.get(2)?,
                        state: QuestionState::Todo,
                        fraction: r.get(4)?,
                        mark: r.get(5)?,
                        response_summary: r.get(6)?,
                        pending_response: r.get(7)?,
                        pending_fraction: r.get(8)?,
                        autosave_response: r.get(9)?,
                        autosave_fraction: r.get(10)?,
                        time_modified: r.get(11)?,
                    },
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut slots = Vec::with_capacity(rows.len());
        for (state, mut qa) in rows {
            qa.state = QuestionState::parse(&state)?;
            slots.push(qa);
        }
        Ok(QuestionUsage {
            id: id.to_string(),
            assessment_id,
            slots,
        })
    }

    fn save(&self, conn: &Connection, usage: &QuestionUsage) -> QuizResult<()> {
        conn.execute(
            "INSERT OR IGNORE INTO question_usages(id, assessment_id) VALUES(?, ?)",
            (&usage.id, &usage.assessment_id),
        )?;
        let mut stmt = conn.prepare(
            "INSERT INTO question_attempts(
                usage_id, slot, question_id, max_mark, state, fraction, mark, response_summary,
                pending_response, pending_fraction, autosave_response, autosave_fraction, time_modified)
             VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(usage_id, slot) DO UPDATE SET
                question_id = excluded.question_id,
                max_mark = excluded.max_mark,
                state = excluded.state,
                fraction = excluded.fraction,
                mark = excluded.mark,
                response_summary = excluded.response_summary,
                pending_response = excluded.pending_response,
                pending_fraction = excluded.pending_fraction,
                autosave_response = excluded.autosave_response,
                autosave_fraction = excluded.autosave_fraction,
                time_modified = excluded.time_modified",
        )?;
        for qa in &usage.slots {
            stmt.execute(rusqlite::params![
                usage.id,
                qa.slot,
                qa.question_id,
                qa.max_mark,
                qa.state.as_str(),
                qa.fraction,
                qa.mark,
                qa.response_summary,
                qa.pending_response,
                qa.pending_fraction,
                qa.autosave_response,
                qa.autosave_fraction,
                qa.time_modified,
            ])?;
        }
        Ok(())
    }

    fn delete_usage(&self, conn: &Connection, id: &str) -> QuizResult<()> {
        conn.execute("DELETE FROM question_attempts WHERE usage_id = ?", [id])?;
        conn.execute("DELETE FROM question_usages WHERE id = ?", [id])?;
        Ok(())
    }

    fn questions_in_use(&self, conn: &Connection, question_ids: &[i64]) -> QuizResult<bool> {
        if question_ids.is_empty() {
            return Ok(false);
        }
        let placeholders = std::iter::repeat("?")
            .take(question_ids.len())
            .collect::<Vec<_>>()
            .join(",");
        let sql = format!(
            "SELECT EXISTS(SELECT 1 FROM question_attempts WHERE question_id IN ({}))",
            placeholders
        );
        let values: Vec<Value> = question_ids.iter().map(|id| Value::Integer(*id)).collect();
        let used: i64 = conn.query_row(&sql, params_from_iter(values), |r| r.get(0))?;
        Ok(used != 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usage() -> QuestionUsage {
        QuestionUsage::new("a1", &[(11, 2.0), (12, 1.0), (13, 4.0)], 100)
    }

    #[test]
    fn finish_grades_answered_and_gives_up_the_rest() {
        let mut u = usage();
        u.record_pending(1, "B", Some(1.0)).expect("pending");
        u.record_pending(2, "C", Some(0.5)).expect("pending");
        assert_eq!(u.process_all_actions(110), 2);
        u.finish_all_questions(120);

        assert_eq!(u.slots[0].state, QuestionState::GradedRight);
        assert_eq!(u.slots[1].state, QuestionState::GradedPartial);
        assert_eq!(u.slots[2].state, QuestionState::GaveUp);
        assert_eq!(u.slots[2].mark, None);
        assert!((u.total_mark() - 2.5).abs() < 1e-9);
    }

    #[test]
    fn autosave_does_not_override_pending_submission() {
        let mut u = usage();
        u.record_autosave(1, "A", Some(0.0)).expect("autosave");
        u.record_pending(1, "B", Some(1.0)).expect("pending");
        // A submit clears the autosave for that slot.
        assert_eq!(u.slots[0].autosave_response, None);
        u.record_autosave(2, "C", Some(1.0)).expect("autosave");
        assert_eq!(u.process_all_autosaves(105), 1);
        assert_eq!(u.slots[0].response_summary, None);
        assert_eq!(u.slots[1].response_summary.as_deref(), Some("C"));
    }

    #[test]
    fn finish_promotes_outstanding_autosaves() {
        let mut u = usage();
        u.record_autosave(3, "D", Some(0.25)).expect("autosave");
        u.finish_all_questions(130);
        assert_eq!(u.slots[2].state, QuestionState::GradedPartial);
        assert!((u.total_mark() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn finished_slots_ignore_new_input() {
        let mut u = usage();
        u.finish_all_questions(130);
        u.record_pending(1, "late", Some(1.0)).expect("pending");
        assert_eq!(u.process_all_actions(140), 0);
        assert_eq!(u.total_mark(), 0.0);
    }

    #[test]
    fn sqlite_store_round_trips_usage() {
        let conn = crate::db::open_in_memory().expect("db");
        crate::assessment::insert(
            &conn,
            &crate::assessment::Assessment {
                id: "a1".into(),
                ..Default::default()
            },
        )
        .expect("assessment");
        let store = SqliteUsageStore;
        let mut u = usage();
        u.record_autosave(2, "x", Some(0.5)).expect("autosave");
        store.save(&conn, &u).expect("save");

        let loaded = store.load_usage(&conn, &u.id).expect("load");
        assert_eq!(loaded.slots[1].autosave_response.as_deref(), Some("x"));
        assert!(store.questions_in_use(&conn, &[12]).expect("in use"));
        assert!(!store.questions_in_use(&conn, &[99]).expect("in use"));

        store.delete_usage(&conn, &u.id).expect("delete");
        assert_eq!(
            store.load_usage(&conn, &u.id).unwrap_err().code(),
            "not_found"
        );
    }
}
