use crate::core::runs::RunStatus;

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("run `{run_id}` not found")]
    RunNotFound { run_id: String },
    #[error("run `{run_id}` cannot move from `{from}` to `{to}`")]
    InvalidTransition {
        run_id: String,
        from: RunStatus,
        to: RunStatus,
    },
    #[error("confirmation request mismatch: pending `{expected}`, received `{received}`")]
    ConfirmationConflict { expected: String, received: String },
    #[error("run `{run_id}` is not waiting for a tool confirmation")]
    NotWaitingForConfirmation { run_id: String },
    #[error("a reason is required to decide this confirmation")]
    ReasonRequired,
    #[error("invalid stored value `{value}` for {field}")]
    Corrupt { field: &'static str, value: String },
    #[error("config error: {0}")]
    Config(String),
    #[error("queue error: {0}")]
    Queue(String),
    #[error(transparent)]
    Llm(#[from] crate::core::llm::LlmError),
}

impl CoreError {
    /// Errors the job runner should retry rather than surface to the run.
    pub fn is_transient(&self) -> bool {
        match self {
            CoreError::Store(_) | CoreError::Queue(_) => true,
            CoreError::Llm(e) => e.is_fallback_eligible(),
            _ => false,
        }
    }

    /// HTTP-equivalent status for collaborators that expose the core over a transport.
    pub fn status_code(&self) -> u16 {
        match self {
            CoreError::RunNotFound { .. } => 404,
            CoreError::ConfirmationConflict { .. }
            | CoreError::NotWaitingForConfirmation { .. }
            | CoreError::InvalidTransition { .. } => 409,
            CoreError::Config(_) | CoreError::ReasonRequired => 400,
            _ => 500,
        }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn confirmation_conflict_maps_to_409() {
        let err = CoreError::ConfirmationConflict {
            expected: "a".into(),
            received: "b".into(),
        };
        assert_eq!(err.status_code(), 409);
        assert!(!err.is_transient());
    }

    #[test]
    fn store_errors_are_transient() {
        let err = CoreError::Store(rusqlite::Error::QueryReturnedNoRows);
        assert!(err.is_transient());
        assert_eq!(err.status_code(), 500);
    }
}
