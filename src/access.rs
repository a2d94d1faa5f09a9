//! Access rules applied to a user's effective settings.

use rusqlite::{Connection, OptionalExtension};

use crate::error::{QuizError, QuizResult};
use crate::overrides::EffectiveSettings;

pub trait AccessManager {
    /// When the attempt must end, or `None` when neither a time limit nor a
    /// close time applies.
    fn end_time(&self, settings: &EffectiveSettings, time_start: i64) -> Option<i64>;

    /// Reason a new attempt may not start, if any.
    fn prevent_new_attempt(
        &self,
        settings: &EffectiveSettings,
        finished_attempts: i64,
        now: i64,
    ) -> Option<String>;

    fn is_preflight_required(
        &self,
        conn: &Connection,
        settings: &EffectiveSettings,
        assessment_id: &str,
        user_id: &str,
    ) -> QuizResult<bool>;

    fn current_attempt_finished(
        &self,
        conn: &Connection,
        assessment_id: &str,
        user_id: &str,
    ) -> QuizResult<()>;
}

/// Open/close window, time limit, attempt count and password rules.
pub struct RuleAccessManager;

impl AccessManager for RuleAccessManager {
    fn end_time(&self, settings: &EffectiveSettings, time_start: i64) -> Option<i64> {
        let by_limit = (settings.time_limit > 0).then(|| time_start + settings.time_limit);
        let by_close = (settings.time_close > 0).then_some(settings.time_close);
        match (by_limit, by_close) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn prevent_new_attempt(
        &self,
        settings: &EffectiveSettings,
        finished_attempts: i64,
        now: i64,
    ) -> Option<String> {
        if settings.time_open > 0 && now < settings.time_open {
            return Some(format!("assessment opens at {}", settings.time_open));
        }
        if settings.time_close > 0 && now > settings.time_close {
            return Some(format!("assessment closed at {}", settings.time_close));
        }
        if settings.attempts > 0 && finished_attempts >= settings.attempts {
            return Some(format!(
                "no more attempts allowed ({} of {} used)",
                finished_attempts, settings.attempts
            ));
        }
        None
    }

    fn is_preflight_required(
        &self,
        conn: &Connection,
        settings: &EffectiveSettings,
        assessment_id: &str,
        user_id: &str,
    ) -> QuizResult<bool> {
        if settings.password.is_none() && settings.time_limit <= 0 {
            return Ok(false);
        }
        Ok(!preflight_passed(conn, assessment_id, user_id)?)
    }

    fn current_attempt_finished(
        &self,
        conn: &Connection,
        assessment_id: &str,
        user_id: &str,
    ) -> QuizResult<()> {
        conn.execute(
            "DELETE FROM preflight_checks WHERE assessment_id = ? AND user_id = ?",
            (assessment_id, user_id),
        )?;
        Ok(())
    }
}

pub fn preflight_passed(conn: &Connection, assessment_id: &str, user_id: &str) -> QuizResult<bool> {
    let row: Option<i64> = conn
        .query_row(
            "SELECT time_passed FROM preflight_checks WHERE assessment_id = ? AND user_id = ?",
            (assessment_id, user_id),
            |r| r.get(0),
        )
        .optional()?;
    Ok(row.is_some())
}

/// Validates the preflight form. A wrong password is an access error;
/// otherwise the pass is remembered until the current attempt finishes.
pub fn preflight_check(
    conn: &Connection,
    settings: &EffectiveSettings,
    assessment_id: &str,
    user_id: &str,
    password: Option<&str>,
    now: i64,
) -> QuizResult<()> {
    if settings.password.is_some() && !settings.accepts_password(password.unwrap_or_default()) {
        return Err(QuizError::Access("the password entered was incorrect".into()));
    }
    conn.execute(
        "INSERT INTO preflight_checks(assessment_id, user_id, time_passed) VALUES(?, ?, ?)
         ON CONFLICT(assessment_id, user_id) DO UPDATE SET time_passed = excluded.time_passed",
        (assessment_id, user_id, now),
    )?;
    Ok(())
}
