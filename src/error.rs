use std::path::PathBuf;

use crate::model::ReviewAction;

/// Failure of a single review call. The session and its audit trail are left
/// exactly as they were before the call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReviewError {
    #[error("candidate {candidate_id} is already closed by {action:?}; re-deciding is not allowed")]
    Conflict {
        candidate_id: String,
        action: ReviewAction,
    },

    #[error("candidate {candidate_id} not found in session {session_id}")]
    CandidateNotFound {
        session_id: String,
        candidate_id: String,
    },

    #[error("session {session_id} is no longer in progress")]
    SessionClosed { session_id: String },

    #[error("candidate {candidate_id} has no computed value to approve")]
    NothingToApprove { candidate_id: String },

    #[error("modify on candidate {candidate_id} requires corrected_date")]
    MissingCorrectedDate { candidate_id: String },

    #[error("action must be one of approve, reject, modify, skip; got {value:?}")]
    InvalidAction { value: String },

    #[error("corrected_date must be YYYY-MM-DD, got {value:?}")]
    InvalidDate { value: String },
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("rule file {path}: {reason}")]
    RuleFile { path: PathBuf, reason: String },

    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),

    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("review session {0} not found")]
    SessionNotFound(String),

    #[error(transparent)]
    Review(#[from] ReviewError),
}

impl EngineError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
