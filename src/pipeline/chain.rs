use std::any::Any;
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use tracing::{debug, error, info};

use super::context::{ContextKey, PipelineContext};
use super::step::{Step, StepError, StepOutcome};

/// Runs a step with panics converted into [`StepError::Panicked`].
pub async fn run_guarded(
    step: &dyn Step,
    ctx: &mut PipelineContext,
) -> Result<StepOutcome, StepError> {
    match AssertUnwindSafe(step.execute(ctx)).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => Err(StepError::Panicked(panic_message(payload.as_ref()))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// A read with no earlier writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsatisfiedRead {
    pub step: String,
    pub key: ContextKey,
}

/// Checks that every slot a step reads is written by an earlier step or is
/// already present in `initial`.
pub fn validate_chain(
    steps: &[Box<dyn Step>],
    initial: &PipelineContext,
) -> Result<(), UnsatisfiedRead> {
    let mut written: HashSet<ContextKey> = HashSet::new();
    for step in steps {
        for key in step.reads() {
            if !written.contains(key) && !initial.has(*key) {
                return Err(UnsatisfiedRead {
                    step: step.name().to_string(),
                    key: *key,
                });
            }
        }
        written.extend(step.writes().iter().copied());
    }
    Ok(())
}

/// Executes steps in order over one shared context.
#[derive(Debug, Clone, Copy)]
pub struct ChainExecutor {
    stop_on_failure: bool,
}

impl ChainExecutor {
    /// Full ingestion runs: the first failure ends the chain.
    pub fn stop_on_failure() -> Self {
        Self {
            stop_on_failure: true,
        }
    }

    /// Single-step retries and publish tasks.
    pub fn continue_on_failure() -> Self {
        Self {
            stop_on_failure: false,
        }
    }

    /// Runs the chain and returns the final context. Step failures are
    /// recorded in `ctx.error` (the first one wins) and never propagate.
    pub async fn run(
        &self,
        unit_ref: &str,
        steps: &[Box<dyn Step>],
        mut ctx: PipelineContext,
    ) -> PipelineContext {
        let total = steps.len();
        for (i, step) in steps.iter().enumerate() {
            let name = step.name();
            info!(unit = unit_ref, step = name, position = i + 1, total, "executing step");
            match run_guarded(step.as_ref(), &mut ctx).await {
                Ok(StepOutcome::Completed) => info!(unit = unit_ref, step = name, "step completed"),
                Ok(StepOutcome::Skipped { reason }) => {
                    info!(unit = unit_ref, step = name, %reason, "step skipped")
                }
                Ok(StepOutcome::Resumed) => {
                    debug!(unit = unit_ref, step = name, "step already done, resumed")
                }
                Err(e) => {
                    error!(unit = unit_ref, step = name, error = %e, "step failed");
                    if ctx.error.is_none() {
                        ctx.error = Some(format!("{name}: {e}"));
                    }
                    if self.stop_on_failure {
                        break;
                    }
                }
            }
        }
        ctx
    }
}
