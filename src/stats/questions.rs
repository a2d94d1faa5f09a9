//! Item analysis for one slot (or one drawn sub-question).
//!
//! Each observation pairs the mark earned on the question with the attempt
//! total. "Other mark" is the total minus the question's own mark, so the
//! discrimination index is not inflated by the question correlating with
//! itself.

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Observation {
    pub mark: f64,
    pub total: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemStats {
    pub s: usize,
    pub facility: Option<f64>,
    pub sd: Option<f64>,
    pub mark_variance: Option<f64>,
    pub discrimination_index: Option<f64>,
    pub discriminative_efficiency: Option<f64>,
    /// Covariance of the mark with the attempt total; `None` below two observations.
    #[serde(skip)]
    pub covariance_with_overall: Option<f64>,
}

pub fn analyse(max_mark: f64, observations: &[Observation]) -> ItemStats {
    let s = observations.len();
    let mut stats = ItemStats {
        s,
        ..ItemStats::default()
    };
    if s == 0 {
        return stats;
    }
    let n = s as f64;

    let marks: Vec<f64> = observations.iter().map(|o| o.mark).collect();
    let others: Vec<f64> = observations.iter().map(|o| o.total - o.mark).collect();
    let mark_avg = marks.iter().sum::<f64>() / n;
    let other_avg = others.iter().sum::<f64>() / n;
    let total_avg = observations.iter().map(|o| o.total).sum::<f64>() / n;

    if max_mark > 0.0 {
        stats.facility = Some(mark_avg / max_mark);
    }
    if s < 2 {
        return stats;
    }

    let mut covariance_sum = 0.0;
    let mut covariance_overall_sum = 0.0;
    let mut mark_var_sum = 0.0;
    let mut other_var_sum = 0.0;
    for (o, other) in observations.iter().zip(&others) {
        let md = o.mark - mark_avg;
        let od = other - other_avg;
        let overall = o.total - total_avg;
        covariance_sum += md * od;
        covariance_overall_sum += md * overall;
        mark_var_sum += md * md;
        other_var_sum += od * od;
    }

    // The largest covariance possible for these marks pairs them in sorted order.
    let mut sorted_marks = marks.clone();
    let mut sorted_others = others.clone();
    sorted_marks.sort_by(|a, b| a.total_cmp(b));
    sorted_others.sort_by(|a, b| a.total_cmp(b));
    let covariance_max_sum: f64 = sorted_marks
        .iter()
        .zip(&sorted_others)
        .map(|(m, o)| (m - mark_avg) * (o - other_avg))
        .sum();

    let d = n - 1.0;
    let mark_variance = mark_var_sum / d;
    let other_variance = other_var_sum / d;
    let covariance = covariance_sum / d;
    let covariance_max = covariance_max_sum / d;

    stats.mark_variance = Some(mark_variance);
    stats.sd = Some(mark_variance.sqrt());
    stats.covariance_with_overall = Some(covariance_overall_sum / d);
    if mark_variance * other_variance != 0.0 {
        stats.discrimination_index =
            Some(100.0 * covariance / (mark_variance * other_variance).sqrt());
    }
    if covariance_max != 0.0 {
        stats.discriminative_efficiency = Some(100.0 * covariance / covariance_max);
    }
    stats
}

/// Each slot's share of the spread in totals, as percentages. Slots whose
/// mark moves against the total get no weight.
pub fn effective_weights(covariances: &[Option<f64>]) -> Vec<Option<f64>> {
    let sum: f64 = covariances
        .iter()
        .flatten()
        .filter(|c| **c >= 0.0)
        .map(|c| c.sqrt())
        .sum();
    covariances
        .iter()
        .map(|c| match c {
            Some(c) if *c >= 0.0 && sum > 0.0 => Some(100.0 * c.sqrt() / sum),
            _ => None,
        })
        .collect()
}
