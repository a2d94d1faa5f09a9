//! Cohort statistics for an assessment.
//!
//! The population is every finished, non-preview attempt, optionally limited
//! to one group's members and to each user's first finished attempt. Results
//! are cached per (assessment, group, attempt selection) for a fixed TTL.

pub mod cache;
pub mod descriptive;
pub mod questions;
pub mod responses;

use std::collections::{BTreeMap, HashMap, HashSet};

use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::assessment::{self, Assessment};
use crate::error::QuizResult;
use crate::layout;
use crate::questions as bank;
use responses::{ResponseCount, ResponseRow};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WhichAttempts {
    First,
    All,
}

impl WhichAttempts {
    pub fn as_str(self) -> &'static str {
        match self {
            WhichAttempts::First => "first",
            WhichAttempts::All => "all",
        }
    }

    pub fn from_all(use_all_attempts: bool) -> Self {
        if use_all_attempts {
            WhichAttempts::All
        } else {
            WhichAttempts::First
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AssessmentStats {
    pub hash_code: String,
    pub assessment_id: String,
    pub group_id: Option<String>,
    pub which_attempts: WhichAttempts,
    pub time_modified: i64,
    pub first_attempts_count: i64,
    pub all_attempts_count: i64,
    pub first_attempts_avg: Option<f64>,
    pub all_attempts_avg: Option<f64>,
    pub median: Option<f64>,
    pub standard_deviation: Option<f64>,
    pub skewness: Option<f64>,
    pub kurtosis: Option<f64>,
    pub cic: Option<f64>,
    pub error_ratio: Option<f64>,
    pub standard_error: Option<f64>,
}

impl AssessmentStats {
    pub fn sample_size(&self) -> i64 {
        match self.which_attempts {
            WhichAttempts::First => self.first_attempts_count,
            WhichAttempts::All => self.all_attempts_count,
        }
    }

    pub fn mean(&self) -> Option<f64> {
        match self.which_attempts {
            WhichAttempts::First => self.first_attempts_avg,
            WhichAttempts::All => self.all_attempts_avg,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuestionStats {
    pub slot: i64,
    pub question_id: i64,
    pub sub_question: bool,
    pub s: i64,
    pub max_mark: f64,
    pub facility: Option<f64>,
    pub sd: Option<f64>,
    pub random_guess_score: Option<f64>,
    pub discrimination_index: Option<f64>,
    pub discriminative_efficiency: Option<f64>,
    pub effective_weight: Option<f64>,
    pub mark_variance: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsReport {
    pub quiz: AssessmentStats,
    pub questions: Vec<QuestionStats>,
    pub sub_questions: Vec<QuestionStats>,
    pub responses: Vec<ResponseCount>,
    pub sample_size: i64,
    pub from_cache: bool,
}

/// `100 * raw / sum_grades`, or `None` when there is nothing to scale against.
pub fn percentage(raw: Option<f64>, sum_grades: f64) -> Option<f64> {
    let raw = raw?;
    (sum_grades >= crate::grading::GRADE_EPSILON).then(|| 100.0 * raw / sum_grades)
}

#[derive(Debug, Clone, PartialEq)]
struct PopulationAttempt {
    user_id: String,
    usage_id: String,
    total: f64,
}

#[derive(Debug, Clone, PartialEq)]
struct SlotRow {
    slot: i64,
    question_id: i64,
    max_mark: f64,
    mark: Option<f64>,
    fraction: Option<f64>,
    response: Option<String>,
}

fn load_population(
    conn: &Connection,
    assessment_id: &str,
    group_id: Option<&str>,
) -> QuizResult<Vec<PopulationAttempt>> {
    let mut stmt = conn.prepare(
        "SELECT a.user_id, a.usage_id, COALESCE(a.sum_grades, 0) FROM attempts a
         WHERE a.assessment_id = ?1 AND a.state = 'finished' AND a.preview = 0
           AND (?2 IS NULL OR a.user_id IN (SELECT user_id FROM group_members WHERE group_id = ?2))
         ORDER BY a.user_id, a.attempt",
    )?;
    let rows = stmt
        .query_map((assessment_id, group_id), |r| {
            Ok(PopulationAttempt {
                user_id: r.get(0)?,
                usage_id: r.get(1)?,
                total: r.get(2)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Each user's earliest finished attempt; relies on (user, attempt) ordering.
fn first_attempts(all: &[PopulationAttempt]) -> Vec<&PopulationAttempt> {
    let mut seen = HashSet::new();
    all.iter()
        .filter(|a| seen.insert(a.user_id.as_str()))
        .collect()
}

fn load_slot_rows(
    conn: &Connection,
    assessment_id: &str,
) -> QuizResult<HashMap<String, Vec<SlotRow>>> {
    let mut stmt = conn.prepare(
        "SELECT qa.usage_id, qa.slot, qa.question_id, qa.max_mark, qa.mark, qa.fraction,
                qa.response_summary
         FROM question_attempts qa
         JOIN attempts a ON a.usage_id = qa.usage_id
         WHERE a.assessment_id = ? AND a.state = 'finished' AND a.preview = 0
         ORDER BY qa.usage_id, qa.slot",
    )?;
    let mut by_usage: HashMap<String, Vec<SlotRow>> = HashMap::new();
    let rows = stmt.query_map([assessment_id], |r| {
        Ok((
            r.get::<_, String>(0)?,
            SlotRow {
                slot: r.get(1)?,
                question_id: r.get(2)?,
                max_mark: r.get(3)?,
                mark: r.get(4)?,
                fraction: r.get(5)?,
                response: r.get(6)?,
            },
        ))
    })?;
    for row in rows {
        let (usage_id, slot_row) = row?;
        by_usage.entry(usage_id).or_default().push(slot_row);
    }
    Ok(by_usage)
}

fn to_question_stats(
    slot: i64,
    question_id: i64,
    sub_question: bool,
    max_mark: f64,
    random_guess_score: Option<f64>,
    item: &questions::ItemStats,
) -> QuestionStats {
    QuestionStats {
        slot,
        question_id,
        sub_question,
        s: item.s as i64,
        max_mark,
        facility: item.facility,
        sd: item.sd,
        random_guess_score,
        discrimination_index: item.discrimination_index,
        discriminative_efficiency: item.discriminative_efficiency,
        effective_weight: None,
        mark_variance: item.mark_variance,
    }
}

/// Computes a fresh report without touching the cache.
pub fn calculate(
    conn: &Connection,
    a: &Assessment,
    group_id: Option<&str>,
    which: WhichAttempts,
    now: i64,
) -> QuizResult<StatsReport> {
    let all = load_population(conn, &a.id, group_id)?;
    let first = first_attempts(&all);
    let selected: Vec<&PopulationAttempt> = match which {
        WhichAttempts::First => first.clone(),
        WhichAttempts::All => all.iter().collect(),
    };

    let slot_rows = load_slot_rows(conn, &a.id)?;
    let slot_questions = layout::questions(&a.layout);
    let marks = assessment::slot_marks(conn, &a.id)?;

    let mut drawn_ids: Vec<i64> = slot_questions.clone();
    for rows in slot_rows.values() {
        drawn_ids.extend(rows.iter().map(|r| r.question_id));
    }
    drawn_ids.sort_unstable();
    drawn_ids.dedup();
    let questions_by_id: HashMap<i64, bank::Question> = bank::get_many(conn, &drawn_ids)?
        .into_iter()
        .map(|q| (q.id, q))
        .collect();

    let mut question_stats = Vec::with_capacity(slot_questions.len());
    let mut covariances = Vec::with_capacity(slot_questions.len());
    let mut sub_questions = Vec::new();
    for (i, placeholder) in slot_questions.iter().enumerate() {
        let slot = i as i64 + 1;
        let q = questions_by_id.get(placeholder);
        let is_random = q.map(|q| q.is_random()).unwrap_or(false);
        let max_mark = marks
            .get(placeholder)
            .copied()
            .or_else(|| q.map(|q| q.default_mark))
            .unwrap_or(0.0);

        let mut observations = Vec::with_capacity(selected.len());
        let mut per_drawn: BTreeMap<i64, (f64, Vec<questions::Observation>)> = BTreeMap::new();
        for attempt in &selected {
            let Some(row) = slot_rows
                .get(&attempt.usage_id)
                .and_then(|rows| rows.iter().find(|r| r.slot == slot))
            else {
                continue;
            };
            let obs = questions::Observation {
                mark: row.mark.unwrap_or(0.0),
                total: attempt.total,
            };
            observations.push(obs);
            if is_random {
                per_drawn
                    .entry(row.question_id)
                    .or_insert_with(|| (row.max_mark, Vec::new()))
                    .1
                    .push(obs);
            }
        }

        let item = questions::analyse(max_mark, &observations);
        covariances.push(item.covariance_with_overall);
        let guess = if is_random {
            None
        } else {
            q.and_then(|q| q.random_guess_score)
        };
        question_stats.push(to_question_stats(slot, *placeholder, false, max_mark, guess, &item));

        for (question_id, (sub_max, obs)) in per_drawn {
            let sub = questions::analyse(sub_max, &obs);
            let sub_guess = questions_by_id
                .get(&question_id)
                .and_then(|q| q.random_guess_score);
            sub_questions.push(to_question_stats(slot, question_id, true, sub_max, sub_guess, &sub));
        }
    }
    for (qs, weight) in question_stats
        .iter_mut()
        .zip(questions::effective_weights(&covariances))
    {
        qs.effective_weight = weight;
    }

    let sum_of_mark_variance: f64 = question_stats.iter().filter_map(|q| q.mark_variance).sum();
    let totals: Vec<f64> = selected.iter().map(|a| a.total).collect();
    let summary = descriptive::describe(&totals, slot_questions.len(), sum_of_mark_variance);

    let first_totals: Vec<f64> = first.iter().map(|a| a.total).collect();
    let all_totals: Vec<f64> = all.iter().map(|a| a.total).collect();

    let response_rows: Vec<ResponseRow> = selected
        .iter()
        .filter_map(|a| slot_rows.get(&a.usage_id))
        .flatten()
        .map(|r| ResponseRow {
            question_id: r.question_id,
            response: r.response.clone(),
            fraction: r.fraction,
        })
        .collect();

    let quiz = AssessmentStats {
        hash_code: cache::hash_code(&a.id, group_id, which),
        assessment_id: a.id.clone(),
        group_id: group_id.map(String::from),
        which_attempts: which,
        time_modified: now,
        first_attempts_count: first_totals.len() as i64,
        all_attempts_count: all_totals.len() as i64,
        first_attempts_avg: descriptive::mean(&first_totals),
        all_attempts_avg: descriptive::mean(&all_totals),
        median: summary.median,
        standard_deviation: summary.standard_deviation,
        skewness: summary.skewness,
        kurtosis: summary.kurtosis,
        cic: summary.cic,
        error_ratio: summary.error_ratio,
        standard_error: summary.standard_error,
    };
    Ok(StatsReport {
        sample_size: quiz.sample_size(),
        quiz,
        questions: question_stats,
        sub_questions,
        responses: responses::analyse(&response_rows),
        from_cache: false,
    })
}

/// Cached statistics, recomputed when missing, older than `ttl_s`, or when
/// `recalculate` asks for it.
#[tracing::instrument(skip_all, fields(assessment = %a.id, which = which.as_str()), err(Debug))]
pub fn get_assessment_and_question_stats(
    conn: &Connection,
    a: &Assessment,
    group_id: Option<&str>,
    which: WhichAttempts,
    now: i64,
    ttl_s: i64,
    recalculate: bool,
) -> QuizResult<StatsReport> {
    let hash = cache::hash_code(&a.id, group_id, which);
    if recalculate {
        cache::clear(conn, &hash)?;
    } else if let Some(report) = cache::load(conn, &hash, now, ttl_s)? {
        debug!(hash = %hash, "statistics cache hit");
        return Ok(report);
    }

    debug!(hash = %hash, "computing statistics");
    let report = calculate(conn, a, group_id, which, now)?;
    cache::store(conn, &report)?;
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assessment::Assessment;
    use crate::db;
    use crate::questions::Question;
    use crate::services::Services;
    use crate::usage::{QuestionUsage, QuestionUsageStore, SqliteUsageStore};

    /// Stores a finished attempt with the given per-slot marks.
    fn finished(conn: &Connection, user: &str, number: i64, marks: &[f64]) {
        let slots: Vec<(i64, f64)> = (1..=marks.len() as i64).map(|q| (q, 10.0)).collect();
        let mut usage = QuestionUsage::new("a1", &slots, 0);
        for (qa, m) in usage.slots.iter_mut().zip(marks) {
            qa.response_summary = Some(format!("r{m}"));
            qa.fraction = Some(m / 10.0);
        }
        usage.finish_all_questions(0);
        SqliteUsageStore.save(conn, &usage).expect("usage");
        conn.execute(
            "INSERT INTO attempts(id, assessment_id, user_id, attempt, usage_id, layout, num_questions,
                state, time_start, time_finish, time_modified, sum_grades)
             VALUES(?, 'a1', ?, ?, ?, '1,0', ?, 'finished', 0, 1, 1, ?)",
            rusqlite::params![
                format!("{user}-{number}"),
                user,
                number,
                usage.id,
                marks.len() as i64,
                usage.total_mark()
            ],
        )
        .expect("attempt");
    }

    fn setup(slots: usize) -> (Connection, Assessment) {
        let conn = db::open_in_memory().expect("db");
        let layout: Vec<i64> = (1..=slots as i64).collect();
        for id in &layout {
            bank::upsert(
                &conn,
                &Question {
                    id: *id,
                    name: format!("Q{id}"),
                    qtype: "multichoice".into(),
                    category: "c".into(),
                    default_mark: 10.0,
                    random_guess_score: Some(0.25),
                },
            )
            .expect("question");
        }
        assessment::insert(
            &conn,
            &Assessment {
                id: "a1".into(),
                ..Assessment::default()
            },
        )
        .expect("assessment");
        let a = assessment::set_layout(
            &conn,
            &Services::sqlite(),
            "a1",
            &layout::join(&layout),
            &HashMap::new(),
            0,
        )
        .expect("layout");
        (conn, a)
    }

    #[test]
    fn fixed_population_is_deterministic() {
        let (conn, a) = setup(1);
        for (user, total) in [("u1", 10.0), ("u2", 20.0), ("u3", 20.0), ("u4", 30.0)] {
            finished(&conn, user, 1, &[total]);
        }

        let one = calculate(&conn, &a, None, WhichAttempts::All, 100).expect("stats");
        let two = calculate(&conn, &a, None, WhichAttempts::All, 100).expect("stats");
        assert_eq!(one, two);
        assert_eq!(one.sample_size, 4);
        let mean = one.quiz.mean().expect("mean");
        assert!((mean - 20.0).abs() < 1e-9);
        assert!((one.quiz.median.expect("median") - 20.0).abs() < 1e-9);
        assert!((one.quiz.standard_deviation.expect("sd") - 8.164965809).abs() < 1e-6);
    }

    #[test]
    fn first_attempts_only_counts_one_per_user() {
        let (conn, a) = setup(2);
        finished(&conn, "u1", 1, &[2.0, 4.0]);
        finished(&conn, "u1", 2, &[8.0, 10.0]);
        finished(&conn, "u2", 1, &[5.0, 5.0]);

        let first = calculate(&conn, &a, None, WhichAttempts::First, 0).expect("first");
        assert_eq!(first.sample_size, 2);
        assert_eq!(first.quiz.first_attempts_count, 2);
        assert_eq!(first.quiz.all_attempts_count, 3);
        assert!((first.quiz.first_attempts_avg.expect("avg") - 8.0).abs() < 1e-9);
        assert!((first.quiz.all_attempts_avg.expect("avg") - 34.0 / 3.0).abs() < 1e-9);
        assert_eq!(first.questions.len(), 2);
        assert_eq!(first.questions[0].random_guess_score, Some(0.25));

        let all = calculate(&conn, &a, None, WhichAttempts::All, 0).expect("all");
        assert_eq!(all.sample_size, 3);
        assert_eq!(all.questions[0].s, 3);
        let weights: f64 = all.questions.iter().filter_map(|q| q.effective_weight).sum();
        assert!((weights - 100.0).abs() < 1e-6);
    }

    #[test]
    fn group_filter_limits_population() {
        let (conn, a) = setup(1);
        finished(&conn, "u1", 1, &[3.0]);
        finished(&conn, "u2", 1, &[9.0]);
        crate::overrides::set_group_members(&conn, "g1", &["u2".to_string()]).expect("group");

        let report = calculate(&conn, &a, Some("g1"), WhichAttempts::All, 0).expect("stats");
        assert_eq!(report.sample_size, 1);
        assert_eq!(report.quiz.all_attempts_avg, Some(9.0));
        assert_eq!(report.responses.len(), 1);
    }

    #[test]
    fn empty_population_is_an_empty_report() {
        let (conn, a) = setup(2);
        let report = calculate(&conn, &a, None, WhichAttempts::All, 0).expect("stats");
        assert_eq!(report.sample_size, 0);
        assert_eq!(report.quiz.all_attempts_avg, None);
        assert!(report.responses.is_empty());
        assert_eq!(report.questions[0].facility, None);
    }

    #[test]
    fn percentages_scale_by_sumgrades() {
        assert_eq!(percentage(Some(5.0), 20.0), Some(25.0));
        assert_eq!(percentage(Some(5.0), 0.0), None);
        assert_eq!(percentage(None, 20.0), None);
    }
}
