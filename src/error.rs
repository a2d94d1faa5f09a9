use serde_json::json;

#[derive(thiserror::Error, Debug)]
pub enum QuizError {
    /// Settings that cannot be honoured, detected before anything is written.
    #[error("{0}")]
    Config(String),
    /// An invariant was broken upstream; callers should not try to recover.
    #[error("{0}")]
    Consistency(String),
    #[error("{0} not found")]
    NotFound(String),
    /// An access rule refused the operation (closed, too many attempts, bad password).
    #[error("{0}")]
    Access(String),
    /// A guarded state transition found the row already moved on.
    #[error("{0}")]
    StaleState(String),
    // Froms
    #[error("{0}")]
    Db(#[from] rusqlite::Error),
    #[error("{0}")]
    Json(#[from] serde_json::Error),
}

impl QuizError {
    pub fn not_found(what: impl Into<String>) -> Self {
        QuizError::NotFound(what.into())
    }

    pub fn code(&self) -> &'static str {
        match self {
            QuizError::Config(_) => "config_error",
            QuizError::Consistency(_) => "consistency_error",
            QuizError::NotFound(_) => "not_found",
            QuizError::Access(_) => "access_denied",
            QuizError::StaleState(_) => "stale_state",
            QuizError::Db(_) => "db_query_failed",
            QuizError::Json(_) => "bad_json",
        }
    }

    pub fn details(&self) -> Option<serde_json::Value> {
        match self {
            QuizError::NotFound(what) => Some(json!({ "entity": what })),
            _ => None,
        }
    }
}

pub type QuizResult<T> = Result<T, QuizError>;
