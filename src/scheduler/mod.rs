//! Fixed-interval drivers of the unit lifecycle.
//!
//! [`IngestScheduler`] takes units from `pending-ingestion` to `ready` or
//! `failed`; [`PublishScheduler`] takes `ready` units through the two
//! publication phases. Each owns a [`SingleFlight`] guard so its ticks never
//! overlap with themselves.

pub mod ingest;
pub mod publish;

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::warn;

pub use ingest::{IngestScheduler, TickOutcome};
pub use publish::{PhaseOutcome, PublishPhase, PublishScheduler, PublishTick};

use crate::error::StoreError;
use crate::pipeline::{ChainExecutor, PipelineContext, PipelineFactory, Step, TrackedStep};
use crate::store::{StepStatus, WorkUnit};
use crate::tracker::StepTracker;
use crate::workspace::Workspace;

/// Non-blocking, instance-owned tick lock.
#[derive(Debug, Default)]
pub struct SingleFlight {
    busy: AtomicBool,
}

impl SingleFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a guard if no other holder exists. Never waits.
    pub fn try_acquire(&self) -> Option<FlightGuard<'_>> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| FlightGuard { flag: &self.busy })
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }
}

/// Releases the flight on drop, including on panic.
pub struct FlightGuard<'a> {
    flag: &'a AtomicBool,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// Runs a store operation, trying once more if the first attempt fails.
pub(crate) fn retry_once<T>(
    what: &str,
    mut op: impl FnMut() -> Result<T, StoreError>,
) -> Result<T, StoreError> {
    op().or_else(|e| {
        warn!(operation = what, error = %e, "store operation failed, retrying once");
        op()
    })
}

/// Runs one named step of `unit` as a single-step, non-stop-on-failure chain.
///
/// The record is reset first and the context is rebuilt from the snapshots
/// of the unit's finished steps. An unknown step name is marked failed.
pub(crate) async fn run_single_step(
    tracker: &StepTracker,
    factory: &dyn PipelineFactory,
    work_dir: &Path,
    unit: &WorkUnit,
    step_name: &str,
) -> Result<PipelineContext, StoreError> {
    let unit_ref = unit.source_ref.as_str();
    tracker.initialize_steps(unit_ref, factory.definitions())?;

    let workspace = Workspace::for_unit(work_dir, unit);
    let Some(step) = factory.step(step_name, unit, &workspace) else {
        let message = format!("unknown step {step_name}");
        warn!(unit = unit_ref, step = step_name, "no implementation for step");
        if let Err(e) = tracker.update_status(unit_ref, step_name, StepStatus::Failed, Some(&message)) {
            warn!(unit = unit_ref, step = step_name, error = %e, "failed to mark unknown step");
        }
        return Ok(PipelineContext {
            error: Some(message),
            ..PipelineContext::default()
        });
    };

    tracker.reset_step(unit_ref, step_name)?;
    let ctx = tracker.hydrate_context(unit_ref)?;
    let chain: Vec<Box<dyn Step>> = vec![Box::new(TrackedStep::new(
        step,
        tracker.clone(),
        unit_ref,
    ))];
    Ok(ChainExecutor::continue_on_failure()
        .run(unit_ref, &chain, ctx)
        .await)
}


#[cfg(test)]
mod tests {
    use super::test_support::{FakeFactory, Script};
    use super::*;
    use crate::steps::{FETCH_COVER, FETCH_SOURCE};
    use crate::store::Store;
    use crate::store::test_support::submit;

    #[test]
    fn single_flight_is_exclusive_until_dropped() {
        let flight = SingleFlight::new();
        let guard = flight.try_acquire().unwrap();
        assert!(flight.is_busy());
        assert!(flight.try_acquire().is_none());
        drop(guard);
        assert!(!flight.is_busy());
        assert!(flight.try_acquire().is_some());
    }

    #[test]
    fn store_operation_is_retried_once() {
        let mut calls = 0;
        let result = retry_once("transition", || {
            calls += 1;
            if calls == 1 {
                Err(StoreError::Poisoned)
            } else {
                Ok(true)
            }
        });
        assert!(result.unwrap());
        assert_eq!(calls, 2);

        let mut calls = 0;
        let result: Result<bool, _> = retry_once("transition", || {
            calls += 1;
            Err(StoreError::Poisoned)
        });
        assert!(matches!(result, Err(StoreError::Poisoned)));
        assert_eq!(calls, 2);
    }

    #[tokio::test]
    async fn single_step_runs_with_hydrated_context() {
        let store = Store::open_in_memory().unwrap();
        let unit = submit(&store, "u1");
        let tracker = StepTracker::new(store);
        let factory = FakeFactory::new();
        let dir = tempfile::tempdir().unwrap();

        tracker
            .initialize_steps("u1", factory.definitions())
            .unwrap();
        let mut earlier = PipelineContext::default();
        earlier.subtitle_count = Some(9);
        tracker.update_result("u1", FETCH_SOURCE, &earlier).unwrap();
        tracker
            .update_status("u1", FETCH_SOURCE, StepStatus::Completed, None)
            .unwrap();

        let ctx = run_single_step(&tracker, &factory, dir.path(), &unit, FETCH_COVER)
            .await
            .unwrap();
        assert!(!ctx.failed());
        assert_eq!(ctx.subtitle_count, Some(9));
        assert_eq!(factory.runs(), vec![FETCH_COVER.to_string()]);
        assert_eq!(
            tracker.step("u1", FETCH_COVER).unwrap().unwrap().status,
            StepStatus::Completed
        );
    }

    #[tokio::test]
    async fn single_step_failure_is_recorded() {
        let store = Store::open_in_memory().unwrap();
        let unit = submit(&store, "u1");
        let tracker = StepTracker::new(store);
        let factory = FakeFactory::new();
        factory.script(FETCH_COVER, Script::Panic);
        let dir = tempfile::tempdir().unwrap();

        let ctx = run_single_step(&tracker, &factory, dir.path(), &unit, FETCH_COVER)
            .await
            .unwrap();
        assert!(ctx.error.as_deref().unwrap().contains("exploded"));
        let record = tracker.step("u1", FETCH_COVER).unwrap().unwrap();
        assert_eq!(record.status, StepStatus::Failed);
    }
}
