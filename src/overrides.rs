//! Per-user and per-group replacement of assessment access settings.
//!
//! A user override's fields win outright. Fields it leaves unset are filled
//! from the user's group overrides, most lenient value first. Anything still
//! unset keeps the assessment default.

use rusqlite::{params_from_iter, types::Value, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::assessment::Assessment;
use crate::error::{QuizError, QuizResult};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Override {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub assessment_id: String,
    pub user_id: Option<String>,
    pub group_id: Option<String>,
    pub time_open: Option<i64>,
    pub time_close: Option<i64>,
    pub time_limit: Option<i64>,
    pub attempts: Option<i64>,
    pub password: Option<String>,
}

impl Override {
    fn is_empty(&self) -> bool {
        self.time_open.is_none()
            && self.time_close.is_none()
            && self.time_limit.is_none()
            && self.attempts.is_none()
            && self.password.is_none()
    }
}

/// The settings that apply to one user once overrides are merged in.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EffectiveSettings {
    pub time_open: i64,
    pub time_close: i64,
    pub time_limit: i64,
    pub attempts: i64,
    pub password: Option<String>,
    pub extra_passwords: Vec<String>,
}

impl EffectiveSettings {
    pub fn defaults(assessment: &Assessment) -> Self {
        Self {
            time_open: assessment.time_open,
            time_close: assessment.time_close,
            time_limit: assessment.time_limit,
            attempts: assessment.attempts_allowed,
            password: assessment.password.clone(),
            extra_passwords: Vec::new(),
        }
    }

    pub fn accepts_password(&self, candidate: &str) -> bool {
        match &self.password {
            None => true,
            Some(p) => p == candidate || self.extra_passwords.iter().any(|x| x == candidate),
        }
    }
}

/// Zero means "unlimited" and beats any finite value; otherwise the largest wins.
fn most_lenient_limit(values: &[i64]) -> Option<i64> {
    if values.is_empty() {
        None
    } else if values.contains(&0) {
        Some(0)
    } else {
        values.iter().copied().max()
    }
}

pub fn merge(
    assessment: &Assessment,
    user_override: Option<&Override>,
    group_overrides: &[Override],
) -> EffectiveSettings {
    let mut merged = user_override.cloned().unwrap_or_default();
    let mut extra_passwords = Vec::new();

    if !group_overrides.is_empty() {
        let opens: Vec<i64> = group_overrides.iter().filter_map(|o| o.time_open).collect();
        let closes: Vec<i64> = group_overrides.iter().filter_map(|o| o.time_close).collect();
        let limits: Vec<i64> = group_overrides.iter().filter_map(|o| o.time_limit).collect();
        let attempts: Vec<i64> = group_overrides.iter().filter_map(|o| o.attempts).collect();
        let mut passwords: Vec<String> = group_overrides
            .iter()
            .filter_map(|o| o.password.clone())
            .collect();

        if merged.time_open.is_none() {
            merged.time_open = opens.iter().copied().min();
        }
        if merged.time_close.is_none() {
            merged.time_close = most_lenient_limit(&closes);
        }
        if merged.time_limit.is_none() {
            merged.time_limit = most_lenient_limit(&limits);
        }
        if merged.attempts.is_none() {
            merged.attempts = most_lenient_limit(&attempts);
        }
        if merged.password.is_none() && !passwords.is_empty() {
            merged.password = Some(passwords.remove(0));
            extra_passwords = passwords;
        }
    }

    let defaults = EffectiveSettings::defaults(assessment);
    EffectiveSettings {
        time_open: merged.time_open.unwrap_or(defaults.time_open),
        time_close: merged.time_close.unwrap_or(defaults.time_close),
        time_limit: merged.time_limit.unwrap_or(defaults.time_limit),
        attempts: merged.attempts.unwrap_or(defaults.attempts),
        password: merged.password.or(defaults.password),
        extra_passwords,
    }
}

fn map_override(r: &rusqlite::Row<'_>) -> rusqlite::Result<Override> {
    Ok(Override {
        id: r.get(0)?,
        assessment_id: r.get(1)?,
        user_id: r.get(2)?,
        group_id: r.get(3)?,
        time_open: r.get(4)?,
        time_close: r.get(5)?,
        time_limit: r.get(6)?,
        attempts: r.get(7)?,
        password: r.get(8)?,
    })
}

const OVERRIDE_COLUMNS: &str =
    "id, assessment_id, user_id, group_id, time_open, time_close, time_limit, attempts, password";

pub fn user_groups(conn: &Connection, user_id: &str) -> QuizResult<Vec<String>> {
    let mut stmt =
        conn.prepare("SELECT group_id FROM group_members WHERE user_id = ? ORDER BY group_id")?;
    let groups = stmt
        .query_map([user_id], |r| r.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(groups)
}

pub fn resolve(
    conn: &Connection,
    assessment: &Assessment,
    user_id: &str,
) -> QuizResult<EffectiveSettings> {
    let user_override: Option<Override> = conn
        .query_row(
            &format!(
                "SELECT {} FROM overrides WHERE assessment_id = ? AND user_id = ?",
                OVERRIDE_COLUMNS
            ),
            (&assessment.id, user_id),
            map_override,
        )
        .optional()?;

    let groups = user_groups(conn, user_id)?;
    let mut group_overrides = Vec::new();
    if !groups.is_empty() {
        let placeholders = std::iter::repeat("?")
            .take(groups.len())
            .collect::<Vec<_>>()
            .join(",");
        let sql = format!(
            "SELECT {} FROM overrides WHERE assessment_id = ? AND group_id IN ({}) ORDER BY group_id",
            OVERRIDE_COLUMNS, placeholders
        );
        let mut values: Vec<Value> = Vec::with_capacity(groups.len() + 1);
        values.push(Value::Text(assessment.id.clone()));
        for g in groups {
            values.push(Value::Text(g));
        }
        let mut stmt = conn.prepare(&sql)?;
        group_overrides = stmt
            .query_map(params_from_iter(values), map_override)?
            .collect::<Result<Vec<_>, _>>()?;
    }

    Ok(merge(assessment, user_override.as_ref(), &group_overrides))
}

pub fn list(conn: &Connection, assessment_id: &str) -> QuizResult<Vec<Override>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM overrides WHERE assessment_id = ? ORDER BY user_id, group_id",
        OVERRIDE_COLUMNS
    ))?;
    let rows = stmt
        .query_map([assessment_id], map_override)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Inserts or replaces the override for the given user or group.
pub fn save(conn: &Connection, o: &Override) -> QuizResult<Override> {
    if o.user_id.is_some() == o.group_id.is_some() {
        return Err(QuizError::Config(
            "an override applies to exactly one of userId or groupId".into(),
        ));
    }
    if o.is_empty() {
        return Err(QuizError::Config("override changes no settings".into()));
    }
    if let (Some(open), Some(close)) = (o.time_open, o.time_close) {
        if close != 0 && close < open {
            return Err(QuizError::Config("override closes before it opens".into()));
        }
    }
    if o.time_limit.map(|v| v < 0).unwrap_or(false) || o.attempts.map(|v| v < 0).unwrap_or(false)
    {
        return Err(QuizError::Config(
            "override limits must not be negative".into(),
        ));
    }

    let existing: Option<String> = match (&o.user_id, &o.group_id) {
        (Some(user_id), _) => conn
            .query_row(
                "SELECT id FROM overrides WHERE assessment_id = ? AND user_id = ?",
                (&o.assessment_id, user_id),
                |r| r.get(0),
            )
            .optional()?,
        (_, Some(group_id)) => conn
            .query_row(
                "SELECT id FROM overrides WHERE assessment_id = ? AND group_id = ?",
                (&o.assessment_id, group_id),
                |r| r.get(0),
            )
            .optional()?,
        _ => None,
    };
    let id = existing.unwrap_or_else(|| Uuid::new_v4().to_string());

    conn.execute(
        "INSERT OR REPLACE INTO overrides(id, assessment_id, user_id, group_id, time_open, time_close, time_limit, attempts, password)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &id,
            &o.assessment_id,
            &o.user_id,
            &o.group_id,
            o.time_open,
            o.time_close,
            o.time_limit,
            o.attempts,
            &o.password,
        ),
    )?;
    Ok(Override { id, ..o.clone() })
}

pub fn delete(conn: &Connection, override_id: &str) -> QuizResult<bool> {
    let n = conn.execute("DELETE FROM overrides WHERE id = ?", [override_id])?;
    Ok(n > 0)
}

pub fn set_group_members(conn: &Connection, group_id: &str, user_ids: &[String]) -> QuizResult<()> {
    crate::db::with_transaction(conn, |tx| {
        tx.execute("DELETE FROM group_members WHERE group_id = ?", [group_id])?;
        for user_id in user_ids {
            tx.execute(
                "INSERT OR IGNORE INTO group_members(group_id, user_id) VALUES(?, ?)",
                (group_id, user_id),
            )?;
        }
        Ok(())
    })
}
