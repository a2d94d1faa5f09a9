//! Collaborators the engine depends on abstractly, plus the SQLite-backed
//! implementations the sidecar runs with.

use rusqlite::Connection;
use serde_json::Value;
use tracing::info;

use crate::access::{AccessManager, RuleAccessManager};
use crate::error::QuizResult;
use crate::usage::{QuestionUsageStore, SqliteUsageStore};

pub const EVENT_ATTEMPT_STARTED: &str = "attempt_started";
pub const EVENT_ATTEMPT_SUBMITTED: &str = "attempt_submitted";
pub const EVENT_ATTEMPT_OVERDUE: &str = "attempt_becameoverdue";
pub const EVENT_ATTEMPT_ABANDONED: &str = "attempt_abandoned";
pub const EVENT_ATTEMPT_DELETED: &str = "attempt_deleted";

#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub name: &'static str,
    pub assessment_id: String,
    pub attempt_id: Option<String>,
    pub user_id: String,
    pub time: i64,
    pub payload: Value,
}

pub trait EventSink {
    fn fire(&self, conn: &Connection, event: &Event) -> QuizResult<()>;
}

/// Appends events to `event_log` on the caller's connection, so an event is
/// only kept if the transition that fired it commits.
pub struct SqliteEventLog;

impl EventSink for SqliteEventLog {
    fn fire(&self, conn: &Connection, event: &Event) -> QuizResult<()> {
        conn.execute(
            "INSERT INTO event_log(name, assessment_id, attempt_id, user_id, time, payload)
             VALUES(?, ?, ?, ?, ?, ?)",
            (
                event.name,
                &event.assessment_id,
                &event.attempt_id,
                &event.user_id,
                event.time,
                serde_json::to_string(&event.payload)?,
            ),
        )?;
        info!(
            event = event.name,
            assessment = %event.assessment_id,
            attempt = event.attempt_id.as_deref().unwrap_or("-"),
            user = %event.user_id,
            "event fired"
        );
        Ok(())
    }
}

pub trait Gradebook {
    /// `None` removes the user's published grade.
    fn publish_grade(
        &self,
        conn: &Connection,
        assessment_id: &str,
        user_id: &str,
        grade: Option<f64>,
        now: i64,
    ) -> QuizResult<()>;
}

pub struct SqliteGradebook;

impl Gradebook for SqliteGradebook {
    fn publish_grade(
        &self,
        conn: &Connection,
        assessment_id: &str,
        user_id: &str,
        grade: Option<f64>,
        now: i64,
    ) -> QuizResult<()> {
        match grade {
            Some(g) => {
                conn.execute(
                    "INSERT INTO gradebook_grades(assessment_id, user_id, grade, time_published)
                     VALUES(?, ?, ?, ?)
                     ON CONFLICT(assessment_id, user_id) DO UPDATE SET
                       grade = excluded.grade,
                       time_published = excluded.time_published",
                    (assessment_id, user_id, g, now),
                )?;
            }
            None => {
                conn.execute(
                    "DELETE FROM gradebook_grades WHERE assessment_id = ? AND user_id = ?",
                    (assessment_id, user_id),
                )?;
            }
        }
        Ok(())
    }
}

pub struct Services {
    pub usage: Box<dyn QuestionUsageStore>,
    pub events: Box<dyn EventSink>,
    pub gradebook: Box<dyn Gradebook>,
    pub access: Box<dyn AccessManager>,
}

impl Services {
    pub fn sqlite() -> Self {
        Self {
            usage: Box::new(SqliteUsageStore),
            events: Box::new(SqliteEventLog),
            gradebook: Box::new(SqliteGradebook),
            access: Box::new(RuleAccessManager),
        }
    }
}

#[cfg(test)]
pub mod testing {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;

    /// Keeps fired events in memory for assertions.
    #[derive(Clone, Default)]
    pub struct RecordingEvents(pub Rc<RefCell<Vec<Event>>>);

    impl RecordingEvents {
        pub fn names(&self) -> Vec<&'static str> {
            self.0.borrow().iter().map(|e| e.name).collect()
        }
    }

    impl EventSink for RecordingEvents {
        fn fire(&self, _conn: &Connection, event: &Event) -> QuizResult<()> {
            self.0.borrow_mut().push(event.clone());
            Ok(())
        }
    }

    pub fn services_with_events() -> (Services, RecordingEvents) {
        let events = RecordingEvents::default();
        let services = Services {
            events: Box::new(events.clone()),
            ..Services::sqlite()
        };
        (services, events)
    }
}
