use async_trait::async_trait;
use tracing::warn;

use super::chain::run_guarded;
use super::context::{ContextKey, PipelineContext};
use super::step::{Step, StepError, StepOutcome};
use crate::store::StepStatus;
use crate::tracker::StepTracker;

/// Wraps a step with durable bookkeeping.
///
/// Before: `running`. After: `completed` plus a context snapshot, `skipped`,
/// or `failed` with the message. A step whose record is already completed or
/// skipped is not run again; its snapshot is merged into the context.
/// Tracker write failures are logged and never fail the step.
pub struct TrackedStep {
    inner: Box<dyn Step>,
    tracker: StepTracker,
    unit_ref: String,
}

impl TrackedStep {
    pub fn new(inner: Box<dyn Step>, tracker: StepTracker, unit_ref: &str) -> Self {
        Self {
            inner,
            tracker,
            unit_ref: unit_ref.to_string(),
        }
    }

    fn record(&self, status: StepStatus, error: Option<&str>) {
        if let Err(e) = self
            .tracker
            .update_status(&self.unit_ref, self.inner.name(), status, error)
        {
            warn!(
                unit = %self.unit_ref,
                step = self.inner.name(),
                %status,
                error = %e,
                "failed to record step status"
            );
        }
    }

    fn save_snapshot(&self, ctx: &PipelineContext) {
        if let Err(e) = self
            .tracker
            .update_result(&self.unit_ref, self.inner.name(), ctx)
        {
            warn!(unit = %self.unit_ref, step = self.inner.name(), error = %e, "failed to store step result");
        }
    }

    /// Merges the stored snapshot and returns true if the step is already done.
    fn resume(&self, ctx: &mut PipelineContext) -> bool {
        let record = match self.tracker.step(&self.unit_ref, self.inner.name()) {
            Ok(Some(record)) => record,
            Ok(None) => return false,
            Err(e) => {
                warn!(unit = %self.unit_ref, step = self.inner.name(), error = %e, "failed to read step record");
                return false;
            }
        };
        if !record.status.is_done() {
            return false;
        }
        if let Some(data) = record.result_data.as_deref().filter(|d| !d.is_empty()) {
            match serde_json::from_str::<PipelineContext>(data) {
                Ok(snapshot) => ctx.absorb(snapshot),
                Err(e) => warn!(unit = %self.unit_ref, step = self.inner.name(), error = %e, "ignoring unreadable snapshot"),
            }
        }
        true
    }
}

#[async_trait]
impl Step for TrackedStep {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn reads(&self) -> &'static [ContextKey] {
        self.inner.reads()
    }

    fn writes(&self) -> &'static [ContextKey] {
        self.inner.writes()
    }

    async fn execute(&self, ctx: &mut PipelineContext) -> Result<StepOutcome, StepError> {
        if self.resume(ctx) {
            return Ok(StepOutcome::Resumed);
        }

        self.record(StepStatus::Running, None);
        let result = run_guarded(self.inner.as_ref(), ctx).await;
        match &result {
            Ok(StepOutcome::Completed) | Ok(StepOutcome::Resumed) => {
                self.save_snapshot(ctx);
                self.record(StepStatus::Completed, None);
            }
            Ok(StepOutcome::Skipped { .. }) => {
                self.save_snapshot(ctx);
                self.record(StepStatus::Skipped, None);
            }
            Err(e) => self.record(StepStatus::Failed, Some(&e.to_string())),
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::pipeline::ChainExecutor;
    use crate::pipeline::chain::test_support::{Behavior, ScriptedStep};
    use crate::store::test_support::{INGEST, submit};
    use crate::store::Store;

    fn tracker() -> StepTracker {
        let store = Store::open_in_memory().unwrap();
        submit(&store, "u");
        let tracker = StepTracker::new(store);
        tracker.initialize_steps("u", INGEST).unwrap();
        tracker
    }

    #[tokio::test]
    async fn records_completion_with_snapshot() {
        let tracker = tracker();
        let step = TrackedStep::new(
            Box::new(ScriptedStep::new("first", Behavior::Complete)),
            tracker.clone(),
            "u",
        );
        let mut ctx = PipelineContext::default();
        let outcome = step.execute(&mut ctx).await.unwrap();

        assert_eq!(outcome, StepOutcome::Completed);
        let record = tracker.step("u", "first").unwrap().unwrap();
        assert_eq!(record.status, StepStatus::Completed);
        assert!(record.start_time.is_some());
        assert!(record.end_time.is_some());
        assert_eq!(record.result_data.as_deref(), Some(r#"{"subtitle_count":1}"#));
    }

    #[tokio::test]
    async fn records_failure_message() {
        let tracker = tracker();
        let steps: Vec<Box<dyn Step>> = vec![Box::new(TrackedStep::new(
            Box::new(ScriptedStep::new("second", Behavior::Fail)),
            tracker.clone(),
            "u",
        ))];
        let ctx = ChainExecutor::stop_on_failure()
            .run("u", &steps, PipelineContext::default())
            .await;

        assert!(ctx.failed());
        let record = tracker.step("u", "second").unwrap().unwrap();
        assert_eq!(record.status, StepStatus::Failed);
        assert_eq!(record.error_message.as_deref(), Some("second failed"));
    }

    #[tokio::test]
    async fn panicking_step_is_recorded_as_failed() {
        let tracker = tracker();
        let step = TrackedStep::new(
            Box::new(ScriptedStep::new("third", Behavior::Panic)),
            tracker.clone(),
            "u",
        );
        let err = step
            .execute(&mut PipelineContext::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StepError::Panicked(_)));
        let record = tracker.step("u", "third").unwrap().unwrap();
        assert_eq!(record.status, StepStatus::Failed);
    }

    #[tokio::test]
    async fn completed_step_is_resumed_not_rerun() {
        let tracker = tracker();
        let first = ScriptedStep::new("first", Behavior::Complete);
        let runs = first.runs.clone();
        let step = TrackedStep::new(Box::new(first), tracker.clone(), "u");

        step.execute(&mut PipelineContext::default()).await.unwrap();

        let mut ctx = PipelineContext::default();
        let outcome = step.execute(&mut ctx).await.unwrap();
        assert_eq!(outcome, StepOutcome::Resumed);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(ctx.subtitle_count, Some(1));
    }

    #[tokio::test]
    async fn skipped_step_is_recorded() {
        let tracker = tracker();
        let step = TrackedStep::new(
            Box::new(ScriptedStep::new("second", Behavior::Skip)),
            tracker.clone(),
            "u",
        );
        step.execute(&mut PipelineContext::default()).await.unwrap();
        assert_eq!(
            tracker.step("u", "second").unwrap().unwrap().status,
            StepStatus::Skipped
        );
    }
}
