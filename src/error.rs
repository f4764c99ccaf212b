use thiserror::Error;

use crate::llm::LlmError;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Unit not found: {0}")]
    UnitNotFound(String),

    #[error("Step not found: {unit_ref}/{step}")]
    StepNotFound { unit_ref: String, step: String },

    #[error("Unit {unit_ref} is {status}: {reason}")]
    InvalidState {
        unit_ref: String,
        status: String,
        reason: String,
    },

    #[error("Another run is already in flight")]
    Busy,

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Translation error: {0}")]
    Translate(#[from] crate::translate::TranslateError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Persistence failures. Callers log and continue; none of these is fatal
/// to the daemon.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("store lock poisoned")]
    Poisoned,

    #[error("unit not found: {0}")]
    UnitNotFound(String),

    #[error("step not found: {unit_ref}/{step}")]
    StepNotFound { unit_ref: String, step: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures of the external command-line tools (fetcher, publisher).
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    #[error("{program} exited with {code:?}: {stderr}")]
    Failed {
        program: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("{0}")]
    Output(String),
}

impl From<StoreError> for crate::pipeline::StepError {
    fn from(err: StoreError) -> Self {
        crate::pipeline::StepError::System(err.to_string())
    }
}

impl From<ToolError> for crate::pipeline::StepError {
    fn from(err: ToolError) -> Self {
        crate::pipeline::StepError::System(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_not_found_display() {
        let err = StoreError::StepNotFound {
            unit_ref: "abc".into(),
            step: "fetch_cover".into(),
        };
        assert_eq!(err.to_string(), "step not found: abc/fetch_cover");
    }

    #[test]
    fn store_error_converts_into_relay_error() {
        let err: RelayError = StoreError::Poisoned.into();
        assert!(matches!(err, RelayError::Store(StoreError::Poisoned)));
    }

    #[test]
    fn tool_failure_display() {
        let err = ToolError::Failed {
            program: "yt-dlp".into(),
            code: Some(1),
            stderr: "video unavailable".into(),
        };
        assert_eq!(
            err.to_string(),
            "yt-dlp exited with Some(1): video unavailable"
        );
    }

    #[test]
    fn errors_are_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<RelayError>();
        assert_send_sync::<StoreError>();
        assert_send_sync::<ToolError>();
    }
}
