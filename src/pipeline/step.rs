use async_trait::async_trait;
use thiserror::Error;

use super::context::{ContextKey, PipelineContext};

/// How a step finished when it did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Completed,
    /// Nothing to do for this unit. Counts as success.
    Skipped { reason: String },
    /// Already completed in an earlier run; its snapshot was merged instead.
    Resumed,
}

impl StepOutcome {
    pub fn skipped(reason: impl Into<String>) -> Self {
        StepOutcome::Skipped {
            reason: reason.into(),
        }
    }
}

/// Why a step failed. Both kinds are retryable by an operator.
#[derive(Debug, Error)]
pub enum StepError {
    /// Logic or validation failure (bad input, unusable output).
    #[error("{0}")]
    Business(String),
    /// Infrastructure failure (tool crash, network, storage).
    #[error("{0}")]
    System(String),
    #[error("step panicked: {0}")]
    Panicked(String),
}

impl From<std::io::Error> for StepError {
    fn from(err: std::io::Error) -> Self {
        StepError::System(err.to_string())
    }
}

impl From<crate::llm::LlmError> for StepError {
    fn from(err: crate::llm::LlmError) -> Self {
        StepError::System(err.to_string())
    }
}

impl From<crate::translate::TranslateError> for StepError {
    fn from(err: crate::translate::TranslateError) -> Self {
        StepError::System(err.to_string())
    }
}

/// One unit of work in a chain.
#[async_trait]
pub trait Step: Send + Sync {
    fn name(&self) -> &str;

    /// Context slots this step may consume.
    fn reads(&self) -> &'static [ContextKey] {
        &[]
    }

    /// Context slots this step may populate.
    fn writes(&self) -> &'static [ContextKey] {
        &[]
    }

    async fn execute(&self, ctx: &mut PipelineContext) -> Result<StepOutcome, StepError>;
}
