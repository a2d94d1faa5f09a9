//! Population statistics over attempt totals.

use serde::Serialize;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptive {
    pub count: usize,
    pub mean: Option<f64>,
    pub median: Option<f64>,
    pub standard_deviation: Option<f64>,
    pub skewness: Option<f64>,
    pub kurtosis: Option<f64>,
    /// Coefficient of internal consistency, as a percentage.
    pub cic: Option<f64>,
    pub error_ratio: Option<f64>,
    pub standard_error: Option<f64>,
}

pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

pub fn median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        Some((sorted[mid - 1] + sorted[mid]) / 2.0)
    } else {
        Some(sorted[mid])
    }
}

/// Describes attempt totals. `num_questions` and `sum_of_mark_variance`
/// (the per-slot mark variances added up) feed the consistency index.
pub fn describe(totals: &[f64], num_questions: usize, sum_of_mark_variance: f64) -> Descriptive {
    let s = totals.len();
    let mut out = Descriptive {
        count: s,
        mean: mean(totals),
        median: median(totals),
        ..Descriptive::default()
    };
    let Some(avg) = out.mean else {
        return out;
    };
    if s < 2 {
        return out;
    }

    let (mut p2, mut p3, mut p4) = (0.0, 0.0, 0.0);
    for x in totals {
        let d = x - avg;
        p2 += d * d;
        p3 += d * d * d;
        p4 += d * d * d * d;
    }
    let n = s as f64;
    let sd = (p2 / (n - 1.0)).sqrt();
    out.standard_deviation = Some(sd);
    if s < 3 {
        return out;
    }

    let m2 = p2 / n;
    let m3 = p3 / n;
    let m4 = p4 / n;
    let k2 = n * m2 / (n - 1.0);
    let k3 = n * n * m3 / ((n - 1.0) * (n - 2.0));
    if k2 == 0.0 {
        return out;
    }
    out.skewness = Some(k3 / k2.powf(1.5));
    if s > 3 {
        let k4 = n * n * ((n + 1.0) * m4 - 3.0 * (n - 1.0) * m2 * m2)
            / ((n - 1.0) * (n - 2.0) * (n - 3.0));
        out.kurtosis = Some(k4 / (k2 * k2));
    }

    if num_questions > 1 {
        let p = num_questions as f64;
        let cic = (100.0 * p / (p - 1.0)) * (1.0 - sum_of_mark_variance / k2);
        out.cic = Some(cic);
        // Above 100 the error ratio would take the root of a negative number.
        if cic <= 100.0 {
            let error_ratio = 100.0 * (1.0 - cic / 100.0).sqrt();
            out.error_ratio = Some(error_ratio);
            out.standard_error = Some(error_ratio * sd / 100.0);
        }
    }
    out
}
