use std::collections::BTreeMap;

use serde::Serialize;

pub const NO_RESPONSE: &str = "[No response]";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseCount {
    pub question_id: i64,
    pub response: String,
    pub fraction: Option<f64>,
    pub count: i64,
}

/// One answered (or skipped) question in one attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseRow {
    pub question_id: i64,
    pub response: Option<String>,
    pub fraction: Option<f64>,
}

/// Counts distinct responses per question, ordered by question then response.
/// A response seen with different fractions keeps the highest.
pub fn analyse(rows: &[ResponseRow]) -> Vec<ResponseCount> {
    let mut grouped: BTreeMap<(i64, String), (Option<f64>, i64)> = BTreeMap::new();
    for row in rows {
        let response = row
            .response
            .as_deref()
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .unwrap_or(NO_RESPONSE)
            .to_string();
        let entry = grouped
            .entry((row.question_id, response))
            .or_insert((row.fraction, 0));
        entry.0 = match (entry.0, row.fraction) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        entry.1 += 1;
    }
    grouped
        .into_iter()
        .map(|((question_id, response), (fraction, count))| ResponseCount {
            question_id,
            response,
            fraction,
            count,
        })
        .collect()
}

/// Share of a question's responses that `row` accounts for.
pub fn share(row: &ResponseCount, all: &[ResponseCount]) -> f64 {
    let total: i64 = all
        .iter()
        .filter(|r| r.question_id == row.question_id)
        .map(|r| r.count)
        .sum();
    if total == 0 {
        0.0
    } else {
        row.count as f64 / total as f64
    }
}
