//! Attempt lifecycle.
//!
//! ```text
//! inprogress ──> overdue ──> finished
//!      │            │
//!      └────────────┴──────> abandoned
//! ```
//!
//! `finished` and `abandoned` are terminal. Every transition runs as one
//! unit of work together with the question usage flush, and its UPDATE is
//! guarded by the state it was computed from. Losing that race, or asking a
//! terminal attempt to move, is a no-op.

use std::collections::{HashMap, HashSet};

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};
use uuid::Uuid;

use crate::assessment::{self, Assessment, OverdueHandling};
use crate::config::EnvVars;
use crate::db;
use crate::error::{QuizError, QuizResult};
use crate::grading::{self, GRADE_EPSILON};
use crate::layout;
use crate::overrides::{self, EffectiveSettings};
use crate::questions;
use crate::random::RandomSource;
use crate::services::{
    Event, Services, EVENT_ATTEMPT_ABANDONED, EVENT_ATTEMPT_DELETED, EVENT_ATTEMPT_OVERDUE,
    EVENT_ATTEMPT_STARTED, EVENT_ATTEMPT_SUBMITTED,
};
use crate::usage::{QuestionState, QuestionUsage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttemptState {
    InProgress,
    Overdue,
    Finished,
    Abandoned,
}

impl AttemptState {
    pub fn as_str(self) -> &'static str {
        match self {
            AttemptState::InProgress => "inprogress",
            AttemptState::Overdue => "overdue",
            AttemptState::Finished => "finished",
            AttemptState::Abandoned => "abandoned",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "inprogress" => Some(AttemptState::InProgress),
            "overdue" => Some(AttemptState::Overdue),
            "finished" => Some(AttemptState::Finished),
            "abandoned" => Some(AttemptState::Abandoned),
            _ => None,
        }
    }

    pub fn is_finished(self) -> bool {
        matches!(self, AttemptState::Finished | AttemptState::Abandoned)
    }
}

impl FromSql for AttemptState {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let raw = value.as_str()?;
        AttemptState::parse(raw)
            .ok_or_else(|| FromSqlError::Other(format!("unknown attempt state {}", raw).into()))
    }
}

impl ToSql for AttemptState {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(self.as_str().into())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Attempt {
    pub id: String,
    pub assessment_id: String,
    pub user_id: String,
    pub attempt: i64,
    pub usage_id: String,
    /// Slot numbers with `0` page breaks.
    pub layout: String,
    pub num_questions: i64,
    pub current_page: i64,
    pub preview: bool,
    pub state: AttemptState,
    pub time_start: i64,
    pub time_finish: i64,
    pub time_modified: i64,
    pub time_check_state: Option<i64>,
    pub sum_grades: Option<f64>,
}

impl Attempt {
    pub fn is_finished(&self) -> bool {
        self.state.is_finished()
    }

    pub fn number_of_pages(&self) -> usize {
        layout::number_of_pages(&self.layout)
    }
}

/// One response as submitted from a page or an autosave.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SlotResponse {
    pub slot: i64,
    pub response: String,
    #[serde(default)]
    pub fraction: Option<f64>,
}

const ATTEMPT_COLUMNS: &str = "id, assessment_id, user_id, attempt, usage_id, layout, num_questions,
    current_page, preview, state, time_start, time_finish, time_modified, time_check_state, sum_grades";

fn map_attempt(r: &rusqlite::Row<'_>) -> rusqlite::Result<Attempt> {
    Ok(Attempt {
        id: r.get(0)?,
        assessment_id: r.get(1)?,
        user_id: r.get(2)?,
        attempt: r.get(3)?,
        usage_id: r.get(4)?,
        layout: r.get(5)?,
        num_questions: r.get(6)?,
        current_page: r.get(7)?,
        preview: r.get::<_, i64>(8)? != 0,
        state: r.get(9)?,
        time_start: r.get(10)?,
        time_finish: r.get(11)?,
        time_modified: r.get(12)?,
        time_check_state: r.get(13)?,
        sum_grades: r.get(14)?,
    })
}

pub fn get(conn: &Connection, id: &str) -> QuizResult<Attempt> {
    conn.query_row(
        &format!("SELECT {} FROM attempts WHERE id = ?", ATTEMPT_COLUMNS),
        [id],
        map_attempt,
    )
    .optional()?
    .ok_or_else(|| QuizError::not_found(format!("attempt {}", id)))
}

fn insert(conn: &Connection, a: &Attempt) -> QuizResult<()> {
    conn.execute(
        &format!(
            "INSERT INTO attempts({}) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            ATTEMPT_COLUMNS
        ),
        rusqlite::params![
            a.id,
            a.assessment_id,
            a.user_id,
            a.attempt,
            a.usage_id,
            a.layout,
            a.num_questions,
            a.current_page,
            a.preview as i64,
            a.state,
            a.time_start,
            a.time_finish,
            a.time_modified,
            a.time_check_state,
            a.sum_grades,
        ],
    )?;
    Ok(())
}

/// Attempts of an assessment in (user, attempt) order.
pub fn list(
    conn: &Connection,
    assessment_id: &str,
    user_id: Option<&str>,
    include_previews: bool,
) -> QuizResult<Vec<Attempt>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM attempts
         WHERE assessment_id = ?1 AND (?2 IS NULL OR user_id = ?2) AND (?3 = 1 OR preview = 0)
         ORDER BY user_id, attempt",
        ATTEMPT_COLUMNS
    ))?;
    let rows = stmt
        .query_map((assessment_id, user_id, include_previews as i64), map_attempt)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn unfinished_for_user(
    conn: &Connection,
    assessment_id: &str,
    user_id: &str,
) -> QuizResult<Option<Attempt>> {
    Ok(conn
        .query_row(
            &format!(
                "SELECT {} FROM attempts
                 WHERE assessment_id = ? AND user_id = ? AND state IN ('inprogress', 'overdue')
                 ORDER BY attempt DESC LIMIT 1",
                ATTEMPT_COLUMNS
            ),
            (assessment_id, user_id),
            map_attempt,
        )
        .optional()?)
}

fn last_finished_for_user(
    conn: &Connection,
    assessment_id: &str,
    user_id: &str,
) -> QuizResult<Option<Attempt>> {
    Ok(conn
        .query_row(
            &format!(
                "SELECT {} FROM attempts
                 WHERE assessment_id = ? AND user_id = ? AND state = 'finished' AND preview = 0
                 ORDER BY attempt DESC LIMIT 1",
                ATTEMPT_COLUMNS
            ),
            (assessment_id, user_id),
            map_attempt,
        )
        .optional()?)
}

/// An assessment as one user sees it: base settings with their overrides applied.
#[derive(Debug, Clone, PartialEq)]
pub struct AssessmentView {
    pub assessment: Assessment,
    pub settings: EffectiveSettings,
}

impl AssessmentView {
    pub fn load(conn: &Connection, assessment_id: &str, user_id: &str) -> QuizResult<Self> {
        let base = assessment::get(conn, assessment_id)?;
        let settings = overrides::resolve(conn, &base, user_id)?;
        Ok(Self {
            assessment: base.for_user(&settings),
            settings,
        })
    }
}

/// Builds a new attempt and its question usage without storing either.
///
/// The layout comes from `last_attempt` when the assessment builds on the
/// previous attempt, otherwise from the assessment layout, shuffled and
/// repaginated when asked. Random slots draw a question from their category
/// that the attempt does not already use.
#[allow(clippy::too_many_arguments)]
pub fn create_attempt(
    conn: &Connection,
    services: &Services,
    view: &AssessmentView,
    user_id: &str,
    attempt_number: i64,
    last_attempt: Option<&Attempt>,
    now: i64,
    preview: bool,
    rng: &mut dyn RandomSource,
) -> QuizResult<(Attempt, QuestionUsage)> {
    let a = &view.assessment;
    if a.sum_grades < GRADE_EPSILON && a.grade > GRADE_EPSILON {
        return Err(QuizError::Config(format!(
            "assessment {} has no marks to grade against but a maximum grade of {}",
            a.id, a.grade
        )));
    }
    let question_ids = layout::questions(&a.layout);
    if question_ids.is_empty() {
        return Err(QuizError::Config(format!(
            "assessment {} has no questions",
            a.id
        )));
    }

    let (attempt_layout, usage) = match last_attempt.filter(|_| a.attempt_on_last) {
        Some(last) => build_on_last(services, conn, a, last, now)?,
        None => fresh_layout(conn, a, &question_ids, now, rng)?,
    };

    let time_check_state = if preview {
        None
    } else {
        services.access.end_time(&view.settings, now)
    };
    let attempt = Attempt {
        id: Uuid::new_v4().to_string(),
        assessment_id: a.id.clone(),
        user_id: user_id.to_string(),
        attempt: attempt_number,
        usage_id: usage.id.clone(),
        num_questions: usage.slots.len() as i64,
        layout: attempt_layout,
        current_page: 0,
        preview,
        state: AttemptState::InProgress,
        time_start: now,
        time_finish: 0,
        time_modified: now,
        time_check_state,
        sum_grades: None,
    };
    Ok((attempt, usage))
}

fn fresh_layout(
    conn: &Connection,
    a: &Assessment,
    question_ids: &[i64],
    now: i64,
    rng: &mut dyn RandomSource,
) -> QuizResult<(String, QuestionUsage)> {
    let mut page_layout = layout::clean(&a.layout, true);
    if a.shuffle_questions {
        page_layout = layout::repaginate(
            &page_layout,
            a.questions_per_page.max(0) as usize,
            Some(rng),
        );
    }

    // Slots are numbered in assessment order; the attempt layout may list them shuffled.
    let slot_of: HashMap<i64, i64> = question_ids
        .iter()
        .enumerate()
        .map(|(i, id)| (*id, i as i64 + 1))
        .collect();
    let slot_layout: Vec<i64> = layout::parse(&page_layout)
        .into_iter()
        .map(|item| {
            if item == layout::PAGE_BREAK {
                layout::PAGE_BREAK
            } else {
                slot_of.get(&item).copied().unwrap_or(layout::PAGE_BREAK)
            }
        })
        .collect();

    let bank: HashMap<i64, questions::Question> = questions::get_many(conn, question_ids)?
        .into_iter()
        .map(|q| (q.id, q))
        .collect();
    let marks = assessment::slot_marks(conn, &a.id)?;
    let mut used: HashSet<i64> = bank
        .values()
        .filter(|q| !q.is_random())
        .map(|q| q.id)
        .collect();

    let mut slots = Vec::with_capacity(question_ids.len());
    for qid in question_ids {
        let q = bank
            .get(qid)
            .ok_or_else(|| QuizError::not_found(format!("question {}", qid)))?;
        let max_mark = marks.get(qid).copied().unwrap_or(q.default_mark);
        let concrete = if q.is_random() {
            let candidates: Vec<i64> = questions::drawable_in_category(conn, &q.category)?
                .into_iter()
                .filter(|id| !used.contains(id))
                .collect();
            if candidates.is_empty() {
                return Err(QuizError::Config(format!(
                    "not enough questions in category {} for random slot {}",
                    q.category, qid
                )));
            }
            let drawn = candidates[rng.pick(candidates.len())];
            used.insert(drawn);
            drawn
        } else {
            *qid
        };
        slots.push((concrete, max_mark));
    }

    Ok((
        layout::join(&slot_layout),
        QuestionUsage::new(&a.id, &slots, now),
    ))
}

fn build_on_last(
    services: &Services,
    conn: &Connection,
    a: &Assessment,
    last: &Attempt,
    now: i64,
) -> QuizResult<(String, QuestionUsage)> {
    let previous = services.usage.load_usage(conn, &last.usage_id)?;
    let slots: Vec<(i64, f64)> = previous
        .slots
        .iter()
        .map(|qa| (qa.question_id, qa.max_mark))
        .collect();
    let mut usage = QuestionUsage::new(&a.id, &slots, now);
    for (new, old) in usage.slots.iter_mut().zip(previous.slots.iter()) {
        if let Some(response) = &old.response_summary {
            new.response_summary = Some(response.clone());
            new.fraction = old.fraction;
            new.state = QuestionState::Complete;
        }
    }
    Ok((last.layout.clone(), usage))
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartOutcome {
    pub attempt: Attempt,
    pub resumed: bool,
}

/// Starts a new attempt, or resumes the user's unfinished one if it is still
/// open once time expiry has been applied.
pub fn start_attempt(
    conn: &Connection,
    services: &Services,
    assessment_id: &str,
    user_id: &str,
    now: i64,
    preview: bool,
    rng: &mut dyn RandomSource,
) -> QuizResult<StartOutcome> {
    let view = AssessmentView::load(conn, assessment_id, user_id)?;

    if let Some(existing) = unfinished_for_user(conn, assessment_id, user_id)? {
        let mut current = QuizAttempt::new(services, view.clone(), existing);
        current.handle_if_time_expired(conn, now, true)?;
        if !current.attempt.is_finished() {
            return Ok(StartOutcome {
                attempt: current.attempt,
                resumed: true,
            });
        }
    }

    if preview {
        delete_previews(conn, services, assessment_id, Some(user_id), now)?;
    } else {
        let previous: i64 = conn.query_row(
            "SELECT COUNT(*) FROM attempts
             WHERE assessment_id = ? AND user_id = ? AND preview = 0
               AND state IN ('finished', 'abandoned')",
            (assessment_id, user_id),
            |r| r.get(0),
        )?;
        if let Some(reason) = services
            .access
            .prevent_new_attempt(&view.settings, previous, now)
        {
            return Err(QuizError::Access(reason));
        }
        if services
            .access
            .is_preflight_required(conn, &view.settings, assessment_id, user_id)?
        {
            return Err(QuizError::Access("preflight check required".into()));
        }
    }

    let attempt_number: i64 = conn.query_row(
        "SELECT COALESCE(MAX(attempt), 0) + 1 FROM attempts WHERE assessment_id = ? AND user_id = ?",
        (assessment_id, user_id),
        |r| r.get(0),
    )?;
    let last = if !preview && view.assessment.attempt_on_last {
        last_finished_for_user(conn, assessment_id, user_id)?
    } else {
        None
    };

    let (attempt, usage) = create_attempt(
        conn,
        services,
        &view,
        user_id,
        attempt_number,
        last.as_ref(),
        now,
        preview,
        rng,
    )?;
    db::with_transaction(conn, |tx| {
        services.usage.save(tx, &usage)?;
        insert(tx, &attempt)?;
        services.events.fire(
            tx,
            &Event {
                name: EVENT_ATTEMPT_STARTED,
                assessment_id: attempt.assessment_id.clone(),
                attempt_id: Some(attempt.id.clone()),
                user_id: attempt.user_id.clone(),
                time: now,
                payload: json!({ "attempt": attempt.attempt, "preview": attempt.preview }),
            },
        )
    })?;
    info!(
        attempt = %attempt.id,
        assessment = assessment_id,
        user = user_id,
        number = attempt.attempt,
        preview,
        "attempt started"
    );
    Ok(StartOutcome {
        attempt,
        resumed: false,
    })
}

/// An attempt together with the settings that govern it.
pub struct QuizAttempt<'s> {
    services: &'s Services,
    pub view: AssessmentView,
    pub attempt: Attempt,
}

impl<'s> QuizAttempt<'s> {
    pub fn new(services: &'s Services, view: AssessmentView, attempt: Attempt) -> Self {
        Self {
            services,
            view,
            attempt,
        }
    }

    pub fn load(conn: &Connection, services: &'s Services, attempt_id: &str) -> QuizResult<Self> {
        let attempt = get(conn, attempt_id)?;
        let view = AssessmentView::load(conn, &attempt.assessment_id, &attempt.user_id)?;
        Ok(Self::new(services, view, attempt))
    }

    pub fn number_of_pages(&self) -> usize {
        self.attempt.number_of_pages()
    }

    pub fn force_page_number_into_range(&self, page: i64) -> usize {
        let last = self.number_of_pages().saturating_sub(1) as i64;
        page.clamp(0, last) as usize
    }

    /// Slots on `page`, or every slot in layout order for `None`.
    pub fn get_slots(&self, page: Option<usize>) -> Vec<i64> {
        match page {
            None => layout::questions(&self.attempt.layout),
            Some(p) => layout::pages(&self.attempt.layout)
                .into_iter()
                .nth(p)
                .unwrap_or_default(),
        }
    }

    pub fn is_last_page(&self, page: usize) -> bool {
        page + 1 == self.number_of_pages()
    }

    pub fn end_time(&self) -> Option<i64> {
        self.services
            .access
            .end_time(&self.view.settings, self.attempt.time_start)
    }

    /// Deadline for an open attempt, extended by the grace period once overdue.
    pub fn due_date(&self) -> QuizResult<Option<i64>> {
        let Some(due) = self.end_time() else {
            return Ok(None);
        };
        match self.attempt.state {
            AttemptState::InProgress => Ok(Some(due)),
            AttemptState::Overdue => Ok(Some(due + self.view.assessment.grace_period)),
            other => Err(QuizError::Consistency(format!(
                "attempt {} has no due date in state {}",
                self.attempt.id,
                other.as_str()
            ))),
        }
    }

    pub fn set_current_page(&mut self, conn: &Connection, page: i64) -> QuizResult<usize> {
        let page = self.force_page_number_into_range(page);
        if !self.attempt.is_finished() && self.attempt.current_page != page as i64 {
            conn.execute(
                "UPDATE attempts SET current_page = ? WHERE id = ?",
                (page as i64, &self.attempt.id),
            )?;
            self.attempt.current_page = page as i64;
        }
        Ok(page)
    }

    fn update_time_check_state(&mut self, conn: &Connection, value: Option<i64>) -> QuizResult<()> {
        if self.attempt.time_check_state == value {
            return Ok(());
        }
        conn.execute(
            "UPDATE attempts SET time_check_state = ? WHERE id = ? AND state = ?",
            (value, &self.attempt.id, self.attempt.state),
        )?;
        self.attempt.time_check_state = value;
        Ok(())
    }

    /// Re-evaluates a time-limited attempt against the clock.
    ///
    /// Both page loads and the overdue sweep call this with their own `now`;
    /// the outcome depends only on the stored attempt and `now`.
    pub fn handle_if_time_expired(
        &mut self,
        conn: &Connection,
        now: i64,
        student_online: bool,
    ) -> QuizResult<()> {
        if self.attempt.is_finished() {
            return self.update_time_check_state(conn, None);
        }
        let end_time = if self.attempt.preview {
            None
        } else {
            self.end_time()
        };
        let Some(time_close) = end_time else {
            return self.update_time_check_state(conn, None);
        };
        if now < time_close {
            return self.update_time_check_state(conn, Some(time_close));
        }

        if self.attempt.state == AttemptState::Overdue {
            let grace = self.view.assessment.grace_period;
            if now - time_close >= grace {
                return self.process_abandon(conn, now);
            }
            return self.update_time_check_state(conn, Some(time_close + grace));
        }

        match self.view.assessment.overdue_handling {
            OverdueHandling::AutoSubmit => {
                // Offline students are taken to have stopped at the deadline.
                let time_finish = if student_online { now } else { time_close };
                self.run_transition(conn, |qa, tx| qa.finish_in(tx, now, None, time_finish))
            }
            OverdueHandling::GracePeriod => self.process_going_overdue(conn, now),
            OverdueHandling::AutoAbandon => self.process_abandon(conn, now),
        }
    }

    /// Runs `f` in one unit of work and adopts the attempt it returns. A
    /// guarded update that lost a race reloads the attempt instead.
    fn run_transition<F>(&mut self, conn: &Connection, f: F) -> QuizResult<()>
    where
        F: FnOnce(&Self, &Connection) -> QuizResult<Attempt>,
    {
        let outcome = db::with_transaction(conn, |tx| {
            let conn: &Connection = tx;
            f(self, conn)
        });
        match outcome {
            Ok(updated) => {
                self.attempt = updated;
                Ok(())
            }
            Err(QuizError::StaleState(msg)) => {
                debug!(attempt = %self.attempt.id, reason = %msg, "transition skipped");
                self.attempt = get(conn, &self.attempt.id)?;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn store_transition(&self, conn: &Connection, updated: &Attempt) -> QuizResult<()> {
        let n = conn.execute(
            "UPDATE attempts SET state = ?, time_modified = ?, time_finish = ?,
                time_check_state = ?, sum_grades = ?
             WHERE id = ? AND state = ?",
            rusqlite::params![
                updated.state,
                updated.time_modified,
                updated.time_finish,
                updated.time_check_state,
                updated.sum_grades,
                updated.id,
                self.attempt.state,
            ],
        )?;
        if n == 0 {
            return Err(QuizError::StaleState(format!(
                "attempt {} is no longer {}",
                updated.id,
                self.attempt.state.as_str()
            )));
        }
        Ok(())
    }

    fn fire(&self, conn: &Connection, name: &'static str, now: i64, payload: serde_json::Value) -> QuizResult<()> {
        self.services.events.fire(
            conn,
            &Event {
                name,
                assessment_id: self.attempt.assessment_id.clone(),
                attempt_id: Some(self.attempt.id.clone()),
                user_id: self.attempt.user_id.clone(),
                time: now,
                payload,
            },
        )
    }

    /// `responses` are flushed into the usage first when given.
    fn finish_in(
        &self,
        conn: &Connection,
        now: i64,
        responses: Option<&[SlotResponse]>,
        time_finish: i64,
    ) -> QuizResult<Attempt> {
        if self.attempt.is_finished() {
            return Ok(self.attempt.clone());
        }
        let mut usage = self.services.usage.load_usage(conn, &self.attempt.usage_id)?;
        if let Some(responses) = responses {
            for r in responses {
                usage.record_pending(r.slot, &r.response, r.fraction)?;
            }
            usage.process_all_actions(now);
        }
        usage.finish_all_questions(now);
        self.services.usage.save(conn, &usage)?;

        let updated = Attempt {
            state: AttemptState::Finished,
            time_modified: now,
            time_finish,
            time_check_state: None,
            sum_grades: Some(usage.total_mark()),
            ..self.attempt.clone()
        };
        self.store_transition(conn, &updated)?;

        if !updated.preview {
            grading::save_best_grade(
                conn,
                self.services,
                &self.view.assessment,
                &updated.user_id,
                None,
                now,
            )?;
            self.fire(
                conn,
                EVENT_ATTEMPT_SUBMITTED,
                now,
                json!({ "attempt": updated.attempt, "sumGrades": updated.sum_grades }),
            )?;
            self.services.access.current_attempt_finished(
                conn,
                &updated.assessment_id,
                &updated.user_id,
            )?;
        }
        info!(
            attempt = %updated.id,
            assessment = %updated.assessment_id,
            user = %updated.user_id,
            sum_grades = ?updated.sum_grades,
            "attempt finished"
        );
        Ok(updated)
    }

    fn abandon_in(&self, conn: &Connection, now: i64) -> QuizResult<Attempt> {
        if self.attempt.is_finished() {
            return Ok(self.attempt.clone());
        }
        let updated = Attempt {
            state: AttemptState::Abandoned,
            time_modified: now,
            time_check_state: None,
            ..self.attempt.clone()
        };
        self.store_transition(conn, &updated)?;
        self.fire(conn, EVENT_ATTEMPT_ABANDONED, now, json!({ "attempt": updated.attempt }))?;
        info!(
            attempt = %updated.id,
            assessment = %updated.assessment_id,
            user = %updated.user_id,
            "attempt abandoned"
        );
        Ok(updated)
    }

    fn going_overdue_in(&self, conn: &Connection, now: i64) -> QuizResult<Attempt> {
        if self.attempt.state != AttemptState::InProgress {
            return Ok(self.attempt.clone());
        }
        // The sweep works out when the grace period ends on its next pass.
        let updated = Attempt {
            state: AttemptState::Overdue,
            time_modified: now,
            time_check_state: Some(now),
            ..self.attempt.clone()
        };
        self.store_transition(conn, &updated)?;
        self.fire(conn, EVENT_ATTEMPT_OVERDUE, now, json!({ "attempt": updated.attempt }))?;
        info!(
            attempt = %updated.id,
            assessment = %updated.assessment_id,
            user = %updated.user_id,
            "attempt overdue"
        );
        Ok(updated)
    }

    fn submitted_actions_in(
        &self,
        conn: &Connection,
        now: i64,
        becoming_overdue: bool,
        responses: &[SlotResponse],
    ) -> QuizResult<Attempt> {
        if self.attempt.is_finished() {
            return Ok(self.attempt.clone());
        }
        let mut usage = self.services.usage.load_usage(conn, &self.attempt.usage_id)?;
        for r in responses {
            usage.record_pending(r.slot, &r.response, r.fraction)?;
        }
        usage.process_all_actions(now);
        self.services.usage.save(conn, &usage)?;

        if becoming_overdue {
            return self.going_overdue_in(conn, now);
        }
        let updated = Attempt {
            time_modified: now,
            ..self.attempt.clone()
        };
        self.store_transition(conn, &updated)?;
        Ok(updated)
    }

    /// Finishes the attempt. With `responses` the submitted answers are
    /// processed first; without, any pending input is discarded.
    pub fn process_finish(
        &mut self,
        conn: &Connection,
        now: i64,
        responses: Option<&[SlotResponse]>,
    ) -> QuizResult<()> {
        self.run_transition(conn, |qa, tx| qa.finish_in(tx, now, responses, now))
    }

    pub fn process_abandon(&mut self, conn: &Connection, now: i64) -> QuizResult<()> {
        self.run_transition(conn, |qa, tx| qa.abandon_in(tx, now))
    }

    pub fn process_going_overdue(&mut self, conn: &Connection, now: i64) -> QuizResult<()> {
        self.run_transition(conn, |qa, tx| qa.going_overdue_in(tx, now))
    }

    pub fn process_submitted_actions(
        &mut self,
        conn: &Connection,
        now: i64,
        becoming_overdue: bool,
        responses: &[SlotResponse],
    ) -> QuizResult<()> {
        self.run_transition(conn, |qa, tx| {
            qa.submitted_actions_in(tx, now, becoming_overdue, responses)
        })
    }

    /// Stores autosaved responses. They are committed when the attempt finishes
    /// unless a later submission replaces them.
    pub fn process_auto_save(
        &mut self,
        conn: &Connection,
        responses: &[SlotResponse],
    ) -> QuizResult<()> {
        if self.attempt.is_finished() {
            return Ok(());
        }
        db::with_transaction(conn, |tx| {
            let mut usage = self.services.usage.load_usage(tx, &self.attempt.usage_id)?;
            for r in responses {
                usage.record_autosave(r.slot, &r.response, r.fraction)?;
            }
            self.services.usage.save(tx, &usage)
        })
    }

    /// Handles a page submission. Close to the deadline the submission counts
    /// as time up; well past it (more than the minimum grace) it is too late
    /// and its responses are dropped.
    pub fn process_attempt(
        &mut self,
        conn: &Connection,
        config: &EnvVars,
        now: i64,
        finish_attempt: bool,
        time_up: bool,
        responses: &[SlotResponse],
    ) -> QuizResult<AttemptState> {
        if self.attempt.is_finished() {
            return Ok(self.attempt.state);
        }
        let time_close = if self.attempt.preview {
            None
        } else {
            self.end_time()
        };

        let mut time_up = time_up;
        let mut too_late = false;
        if let Some(close) = time_close {
            if now > close - config.min_time_to_continue_s {
                time_up = true;
                too_late = now > close + config.grace_period_min_s;
            }
        }

        let grace_handling = self.view.assessment.overdue_handling == OverdueHandling::GracePeriod;
        let mut finish_attempt = finish_attempt;
        let mut becoming_overdue = false;
        let mut becoming_abandoned = false;
        if time_up {
            if grace_handling {
                let close = time_close.unwrap_or(now);
                if now > close + self.view.assessment.grace_period + config.grace_period_min_s {
                    finish_attempt = true;
                    becoming_abandoned = true;
                } else {
                    becoming_overdue = true;
                }
            } else {
                finish_attempt = true;
            }
        }

        if !finish_attempt {
            if too_late {
                self.process_going_overdue(conn, now)?;
            } else {
                self.process_submitted_actions(conn, now, becoming_overdue, responses)?;
            }
            return Ok(self.attempt.state);
        }

        if becoming_abandoned {
            self.process_abandon(conn, now)?;
        } else if !too_late {
            self.run_transition(conn, |qa, tx| qa.finish_in(tx, now, Some(responses), now))?;
        } else {
            let time_finish = time_close.unwrap_or(now);
            self.run_transition(conn, |qa, tx| qa.finish_in(tx, now, None, time_finish))?;
        }
        Ok(self.attempt.state)
    }
}

fn delete_in(conn: &Connection, services: &Services, attempt: &Attempt, now: i64) -> QuizResult<()> {
    conn.execute("DELETE FROM attempts WHERE id = ?", [&attempt.id])?;
    services.usage.delete_usage(conn, &attempt.usage_id)?;
    if attempt.preview {
        return Ok(());
    }
    services.events.fire(
        conn,
        &Event {
            name: EVENT_ATTEMPT_DELETED,
            assessment_id: attempt.assessment_id.clone(),
            attempt_id: Some(attempt.id.clone()),
            user_id: attempt.user_id.clone(),
            time: now,
            payload: json!({ "attempt": attempt.attempt }),
        },
    )?;
    let a = assessment::get(conn, &attempt.assessment_id)?;
    // With no finished attempts left this clears the grade record.
    grading::save_best_grade(conn, services, &a, &attempt.user_id, None, now)?;
    Ok(())
}

/// Removes an attempt and its question usage, then brings the user's grade
/// back in line.
pub fn delete_attempt(
    conn: &Connection,
    services: &Services,
    attempt_id: &str,
    now: i64,
) -> QuizResult<()> {
    let attempt = get(conn, attempt_id)?;
    db::with_transaction(conn, |tx| delete_in(tx, services, &attempt, now))?;
    info!(
        attempt = attempt_id,
        assessment = %attempt.assessment_id,
        user = %attempt.user_id,
        "attempt deleted"
    );
    Ok(())
}

/// Deletes preview attempts, optionally only one user's. Returns how many.
pub fn delete_previews(
    conn: &Connection,
    services: &Services,
    assessment_id: &str,
    user_id: Option<&str>,
    now: i64,
) -> QuizResult<usize> {
    let previews: Vec<Attempt> = list(conn, assessment_id, user_id, true)?
        .into_iter()
        .filter(|a| a.preview)
        .collect();
    if previews.is_empty() {
        return Ok(0);
    }
    db::with_transaction(conn, |tx| {
        for p in &previews {
            delete_in(tx, services, p, now)?;
        }
        Ok(())
    })?;
    debug!(assessment = assessment_id, count = previews.len(), "previews deleted");
    Ok(previews.len())
}
