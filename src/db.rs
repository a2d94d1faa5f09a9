use rusqlite::{Connection, Transaction};
use std::path::Path;

use crate::error::QuizError;

pub const DB_FILE_NAME: &str = "quiz.sqlite3";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join(DB_FILE_NAME);
    let conn = Connection::open(db_path)?;
    init_schema(&conn)?;
    Ok(conn)
}

#[cfg(test)]
pub fn open_in_memory() -> anyhow::Result<Connection> {
    let conn = Connection::open_in_memory()?;
    init_schema(&conn)?;
    Ok(conn)
}

/// Runs `f` as one unit of work. The transaction commits only when `f`
/// returns `Ok`; any error (or panic) drops it, which rolls back.
pub fn with_transaction<T, F>(conn: &Connection, f: F) -> Result<T, QuizError>
where
    F: FnOnce(&Transaction<'_>) -> Result<T, QuizError>,
{
    let tx = conn.unchecked_transaction()?;
    let out = f(&tx)?;
    tx.commit()?;
    Ok(out)
}

pub fn init_schema(conn: &Connection) -> anyhow::Result<()> {
    conn.execute("PRAGMA foreign_keys = ON", [])?;
    // Lazy page loads and the cron sweep may hit the same file concurrently.
    conn.busy_timeout(std::time::Duration::from_secs(5))?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS assessments(
            id TEXT PRIMARY KEY,
            course_id TEXT NOT NULL,
            name TEXT NOT NULL,
            grade_method INTEGER NOT NULL DEFAULT 1,
            attempts_allowed INTEGER NOT NULL DEFAULT 0,
            attempt_on_last INTEGER NOT NULL DEFAULT 0,
            time_open INTEGER NOT NULL DEFAULT 0,
            time_close INTEGER NOT NULL DEFAULT 0,
            time_limit INTEGER NOT NULL DEFAULT 0,
            grace_period INTEGER NOT NULL DEFAULT 0,
            overdue_handling TEXT NOT NULL DEFAULT 'autosubmit',
            layout TEXT NOT NULL DEFAULT '0',
            questions_per_page INTEGER NOT NULL DEFAULT 1,
            shuffle_questions INTEGER NOT NULL DEFAULT 0,
            sum_grades REAL NOT NULL DEFAULT 0,
            grade REAL NOT NULL DEFAULT 10,
            decimal_points INTEGER NOT NULL DEFAULT 2,
            password TEXT,
            time_modified INTEGER NOT NULL DEFAULT 0
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS questions(
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            qtype TEXT NOT NULL,
            category TEXT NOT NULL,
            default_mark REAL NOT NULL DEFAULT 1,
            random_guess_score REAL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_questions_category ON questions(category)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS assessment_questions(
            assessment_id TEXT NOT NULL,
            question_id INTEGER NOT NULL,
            max_mark REAL NOT NULL,
            PRIMARY KEY(assessment_id, question_id),
            FOREIGN KEY(assessment_id) REFERENCES assessments(id),
            FOREIGN KEY(question_id) REFERENCES questions(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS feedback_boundaries(
            id TEXT PRIMARY KEY,
            assessment_id TEXT NOT NULL,
            feedback_text TEXT NOT NULL,
            min_grade REAL NOT NULL,
            max_grade REAL NOT NULL,
            FOREIGN KEY(assessment_id) REFERENCES assessments(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_feedback_assessment ON feedback_boundaries(assessment_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS overrides(
            id TEXT PRIMARY KEY,
            assessment_id TEXT NOT NULL,
            user_id TEXT,
            group_id TEXT,
            time_open INTEGER,
            time_close INTEGER,
            time_limit INTEGER,
            attempts INTEGER,
            password TEXT,
            FOREIGN KEY(assessment_id) REFERENCES assessments(id),
            CHECK((user_id IS NULL) <> (group_id IS NULL))
        )",
        [],
    )?;
    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_overrides_user ON overrides(assessment_id, user_id)
         WHERE user_id IS NOT NULL",
        [],
    )?;
    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_overrides_group ON overrides(assessment_id, group_id)
         WHERE group_id IS NOT NULL",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS group_members(
            group_id TEXT NOT NULL,
            user_id TEXT NOT NULL,
            PRIMARY KEY(group_id, user_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_group_members_user ON group_members(user_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS question_usages(
            id TEXT PRIMARY KEY,
            assessment_id TEXT NOT NULL,
            FOREIGN KEY(assessment_id) REFERENCES assessments(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS question_attempts(
            usage_id TEXT NOT NULL,
            slot INTEGER NOT NULL,
            question_id INTEGER NOT NULL,
            max_mark REAL NOT NULL,
            state TEXT NOT NULL,
            fraction REAL,
            mark REAL,
            response_summary TEXT,
            pending_response TEXT,
            pending_fraction REAL,
            autosave_response TEXT,
            autosave_fraction REAL,
            time_modified INTEGER NOT NULL,
            PRIMARY KEY(usage_id, slot),
            FOREIGN KEY(usage_id) REFERENCES question_usages(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_question_attempts_question ON question_attempts(question_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS attempts(
            id TEXT PRIMARY KEY,
            assessment_id TEXT NOT NULL,
            user_id TEXT NOT NULL,
            attempt INTEGER NOT NULL,
            usage_id TEXT NOT NULL,
            layout TEXT NOT NULL,
            num_questions INTEGER NOT NULL,
            current_page INTEGER NOT NULL DEFAULT 0,
            preview INTEGER NOT NULL DEFAULT 0,
            state TEXT NOT NULL,
            time_start INTEGER NOT NULL,
            time_finish INTEGER NOT NULL DEFAULT 0,
            time_modified INTEGER NOT NULL,
            time_check_state INTEGER,
            sum_grades REAL,
            FOREIGN KEY(assessment_id) REFERENCES assessments(id),
            FOREIGN KEY(usage_id) REFERENCES question_usages(id),
            UNIQUE(assessment_id, user_id, attempt)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_attempts_check_state ON attempts(state, time_check_state)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_attempts_user ON attempts(assessment_id, user_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS grades(
            assessment_id TEXT NOT NULL,
            user_id TEXT NOT NULL,
            grade REAL NOT NULL,
            time_modified INTEGER NOT NULL,
            PRIMARY KEY(assessment_id, user_id),
            FOREIGN KEY(assessment_id) REFERENCES assessments(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS gradebook_grades(
            assessment_id TEXT NOT NULL,
            user_id TEXT NOT NULL,
            grade REAL NOT NULL,
            time_published INTEGER NOT NULL,
            PRIMARY KEY(assessment_id, user_id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS event_log(
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            assessment_id TEXT NOT NULL,
            attempt_id TEXT,
            user_id TEXT NOT NULL,
            time INTEGER NOT NULL,
            payload TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_event_log_attempt ON event_log(attempt_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS preflight_checks(
            assessment_id TEXT NOT NULL,
            user_id TEXT NOT NULL,
            time_passed INTEGER NOT NULL,
            PRIMARY KEY(assessment_id, user_id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS stats_snapshots(
            hash_code TEXT PRIMARY KEY,
            assessment_id TEXT NOT NULL,
            group_id TEXT,
            which_attempts TEXT NOT NULL,
            time_modified INTEGER NOT NULL,
            first_attempts_count INTEGER NOT NULL,
            all_attempts_count INTEGER NOT NULL,
            first_attempts_avg REAL,
            all_attempts_avg REAL,
            median REAL,
            standard_deviation REAL,
            skewness REAL,
            kurtosis REAL,
            cic REAL,
            error_ratio REAL,
            standard_error REAL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_stats_snapshots_assessment ON stats_snapshots(assessment_id)",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS stats_questions(
            hash_code TEXT NOT NULL,
            slot INTEGER NOT NULL,
            question_id INTEGER NOT NULL,
            sub_question INTEGER NOT NULL,
            s INTEGER NOT NULL,
            max_mark REAL NOT NULL,
            facility REAL,
            sd REAL,
            random_guess_score REAL,
            discrimination_index REAL,
            discriminative_efficiency REAL,
            effective_weight REAL,
            mark_variance REAL,
            PRIMARY KEY(hash_code, slot, question_id, sub_question)
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS stats_responses(
            hash_code TEXT NOT NULL,
            question_id INTEGER NOT NULL,
            response TEXT NOT NULL,
            fraction REAL,
            count INTEGER NOT NULL,
            PRIMARY KEY(hash_code, question_id, response)
        )",
        [],
    )?;

    ensure_assessments_password(conn)?;

    Ok(())
}

// Workspaces created before password support lack the column.
fn ensure_assessments_password(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "assessments", "password")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE assessments ADD COLUMN password TEXT", [])?;
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_setup_is_idempotent() {
        let conn = open_in_memory().expect("open");
        init_schema(&conn).expect("second init");
        assert!(table_has_column(&conn, "attempts", "time_check_state").expect("pragma"));
    }

    #[test]
    fn failed_unit_of_work_rolls_back() {
        let conn = open_in_memory().expect("open");
        let res: Result<(), QuizError> = with_transaction(&conn, |tx| {
            tx.execute(
                "INSERT INTO group_members(group_id, user_id) VALUES('g1','u1')",
                [],
            )?;
            Err(QuizError::Consistency("boom".into()))
        });
        assert!(res.is_err());
        let n: i64 = conn
            .query_row("SELECT COUNT(*) FROM group_members", [], |r| r.get(0))
            .expect("count");
        assert_eq!(n, 0);
    }
}
