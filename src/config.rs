use std::env::var;
use std::path::PathBuf;
use tracing::warn;

pub const DEFAULT_STATS_CACHE_TTL_S: i64 = 15 * 60;
pub const DEFAULT_GRACE_PERIOD_MIN_S: i64 = 60;
pub const DEFAULT_MIN_TIME_TO_CONTINUE_S: i64 = 2;

#[derive(Clone, Debug)]
pub struct EnvVars {
    pub workspace: Option<PathBuf>,
    pub stats_cache_ttl_s: i64,
    pub grace_period_min_s: i64,
    pub min_time_to_continue_s: i64,
    /// Zero means no limit.
    pub overdue_batch_limit: usize,
}

impl Default for EnvVars {
    fn default() -> Self {
        Self {
            workspace: None,
            stats_cache_ttl_s: DEFAULT_STATS_CACHE_TTL_S,
            grace_period_min_s: DEFAULT_GRACE_PERIOD_MIN_S,
            min_time_to_continue_s: DEFAULT_MIN_TIME_TO_CONTINUE_S,
            overdue_batch_limit: 0,
        }
    }
}

impl EnvVars {
    pub fn new() -> Self {
        let defaults = Self::default();

        let workspace = match var("QUIZD_WORKSPACE") {
            Ok(v) if !v.trim().is_empty() => Some(PathBuf::from(v)),
            Ok(_) => {
                warn!("QUIZD_WORKSPACE is empty; no workspace opened at startup");
                None
            }
            Err(_e) => None,
        };

        let stats_cache_ttl_s = seconds_var("QUIZD_STATS_CACHE_TTL_S", defaults.stats_cache_ttl_s);
        let grace_period_min_s =
            seconds_var("QUIZD_GRACE_PERIOD_MIN_S", defaults.grace_period_min_s);
        let min_time_to_continue_s =
            seconds_var("QUIZD_MIN_TIME_TO_CONTINUE_S", defaults.min_time_to_continue_s);

        let overdue_batch_limit = match var("QUIZD_OVERDUE_BATCH_LIMIT") {
            Ok(val) => match val.parse::<usize>() {
                Ok(n) => n,
                Err(e) => {
                    warn!("Failed to parse QUIZD_OVERDUE_BATCH_LIMIT ('{val}'): {e}; ignoring");
                    0
                }
            },
            Err(_) => 0,
        };

        Self {
            workspace,
            stats_cache_ttl_s,
            grace_period_min_s,
            min_time_to_continue_s,
            overdue_batch_limit,
        }
    }
}

fn seconds_var(name: &str, default: i64) -> i64 {
    match var(name) {
        Ok(val) => match val.parse::<i64>() {
            Ok(secs) if secs >= 0 => secs,
            Ok(_) => {
                warn!("{name} provided but negative; using {default}");
                default
            }
            Err(e) => {
                warn!("Failed to parse {name} ('{val}'): {e}; using {default}");
                default
            }
        },
        Err(_) => default,
    }
}
