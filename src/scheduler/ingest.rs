use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use super::{SingleFlight, retry_once, run_single_step};
use crate::error::RelayError;
use crate::pipeline::{
    ChainExecutor, PipelineContext, PipelineFactory, Step, TrackedStep, validate_chain,
};
use crate::store::{LifecycleStatus, StartupReset, StepPhase, StepRecord, StepStatus, WorkUnit};
use crate::tracker::StepTracker;
use crate::workspace::Workspace;

/// What one ingestion tick did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// A previous tick was still running; nothing was done.
    Busy,
    /// No retry and no pending unit.
    Idle,
    /// This many pending retry steps were executed; new work was deferred.
    Retried(usize),
    Processed {
        unit_ref: String,
        status: LifecycleStatus,
    },
}

pub struct IngestScheduler {
    tracker: StepTracker,
    factory: Arc<dyn PipelineFactory>,
    work_dir: PathBuf,
    interval: Duration,
    flight: SingleFlight,
}

impl IngestScheduler {
    pub fn new(
        tracker: StepTracker,
        factory: Arc<dyn PipelineFactory>,
        work_dir: PathBuf,
        interval: Duration,
    ) -> Self {
        Self {
            tracker,
            factory,
            work_dir,
            interval,
            flight: SingleFlight::new(),
        }
    }

    /// Returns interrupted steps and units to pending. Must run before the
    /// first tick.
    pub fn recover(&self) -> Result<StartupReset, RelayError> {
        let reset = self.tracker.reset_all_running_on_startup()?;
        if reset.steps > 0 || reset.units > 0 {
            warn!(
                steps = reset.steps,
                units = reset.units,
                "reset work interrupted by a restart"
            );
        }
        Ok(reset)
    }

    /// Spawns a tick every interval, forever.
    pub async fn run(self: Arc<Self>) {
        info!(interval_secs = self.interval.as_secs(), "ingestion scheduler started");
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            ticker.tick().await;
            let scheduler = Arc::clone(&self);
            tokio::spawn(async move {
                match scheduler.tick().await {
                    Ok(TickOutcome::Idle) | Ok(TickOutcome::Busy) => {}
                    Ok(outcome) => debug!(?outcome, "ingestion tick finished"),
                    Err(e) => error!(error = %e, "ingestion tick failed"),
                }
            });
        }
    }

    /// One scheduling decision. Overlapping calls return [`TickOutcome::Busy`].
    pub async fn tick(&self) -> Result<TickOutcome, RelayError> {
        let Some(_flight) = self.flight.try_acquire() else {
            debug!("ingestion tick skipped, previous tick still running");
            return Ok(TickOutcome::Busy);
        };

        // RETRY: pending retry steps take priority over new units
        let retries = self.tracker.pending_retry_steps()?;
        if !retries.is_empty() {
            let count = retries.len();
            info!(count, "running pending retry steps");
            for record in &retries {
                if let Err(e) = self.retry_step(record).await {
                    error!(
                        unit = %record.unit_ref,
                        step = %record.step_name,
                        error = %e,
                        "retry failed"
                    );
                }
            }
            return Ok(TickOutcome::Retried(count));
        }

        // NEW WORK: the single oldest pending unit
        let store = self.tracker.store();
        let Some(unit) = store.oldest_unit_with_status(LifecycleStatus::PendingIngestion)? else {
            return Ok(TickOutcome::Idle);
        };
        let unit_ref = unit.source_ref.clone();
        if !store.compare_and_set_status(
            &unit_ref,
            LifecycleStatus::PendingIngestion,
            LifecycleStatus::Processing,
        )? {
            return Ok(TickOutcome::Idle);
        }
        info!(unit = %unit_ref, "ingesting unit");

        // FINISH: every path ends in ready or failed
        let status = match self.ingest(&unit).await {
            Ok(ctx) => match ctx.error {
                None => LifecycleStatus::Ready,
                Some(reason) => {
                    warn!(unit = %unit_ref, %reason, "ingestion failed");
                    LifecycleStatus::Failed
                }
            },
            Err(e) => {
                error!(unit = %unit_ref, error = %e, "ingestion aborted");
                self.record_abort(&unit_ref, &e.to_string());
                LifecycleStatus::Failed
            }
        };
        retry_once("final status transition", || {
            store.compare_and_set_status(&unit_ref, LifecycleStatus::Processing, status)
        })?;
        info!(unit = %unit_ref, %status, "unit ingestion finished");
        Ok(TickOutcome::Processed { unit_ref, status })
    }

    async fn ingest(&self, unit: &WorkUnit) -> Result<PipelineContext, RelayError> {
        let unit_ref = unit.source_ref.as_str();
        self.tracker
            .initialize_steps(unit_ref, self.factory.definitions())?;

        let workspace = Workspace::for_unit(&self.work_dir, unit);
        workspace.prepare().await?;

        let chain = self.factory.ingest_chain(unit, &workspace);
        let initial = PipelineContext::default();
        validate_chain(&chain, &initial).map_err(|missing| {
            RelayError::Config(format!(
                "step {} reads {:?} which no earlier step writes",
                missing.step, missing.key
            ))
        })?;

        let tracked: Vec<Box<dyn Step>> = chain
            .into_iter()
            .map(|step| {
                Box::new(TrackedStep::new(step, self.tracker.clone(), unit_ref)) as Box<dyn Step>
            })
            .collect();
        Ok(ChainExecutor::stop_on_failure()
            .run(unit_ref, &tracked, initial)
            .await)
    }

    /// A chain that never started leaves its reason on the first unfinished
    /// ingest step, so the unit is not picked up as a retry and the operator
    /// sees why it failed.
    fn record_abort(&self, unit_ref: &str, reason: &str) {
        let steps = match self.tracker.steps(unit_ref) {
            Ok(steps) => steps,
            Err(e) => {
                warn!(unit = unit_ref, error = %e, "cannot load steps to record abort");
                return;
            }
        };
        let Some(first) = steps
            .iter()
            .filter(|s| s.phase == StepPhase::Ingest && !s.status.is_done())
            .min_by_key(|s| s.step_order)
        else {
            return;
        };
        if let Err(e) =
            self.tracker
                .update_status(unit_ref, &first.step_name, StepStatus::Failed, Some(reason))
        {
            warn!(unit = unit_ref, step = %first.step_name, error = %e, "failed to record abort");
        }
    }

    /// Re-executes one reset step and settles the unit's status: a `failed`
    /// unit whose ingest steps are now all done becomes `ready`, a `ready`
    /// unit whose retried step failed becomes `failed`.
    async fn retry_step(&self, record: &StepRecord) -> Result<(), RelayError> {
        let store = self.tracker.store();
        let unit = store.require_unit(&record.unit_ref)?;
        info!(unit = %unit.source_ref, step = %record.step_name, "retrying step");

        let ctx = run_single_step(
            &self.tracker,
            self.factory.as_ref(),
            &self.work_dir,
            &unit,
            &record.step_name,
        )
        .await?;

        if ctx.failed() {
            store.compare_and_set_status(
                &unit.source_ref,
                LifecycleStatus::Ready,
                LifecycleStatus::Failed,
            )?;
            return Ok(());
        }

        let ingest_done = self
            .tracker
            .steps(&unit.source_ref)?
            .iter()
            .filter(|s| s.phase == StepPhase::Ingest)
            .all(|s| s.status.is_done());
        if ingest_done
            && store.compare_and_set_status(
                &unit.source_ref,
                LifecycleStatus::Failed,
                LifecycleStatus::Ready,
            )?
        {
            info!(unit = %unit.source_ref, "all ingest steps done after retry, unit ready");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::test_support::{FakeFactory, Gate, Script};
    use crate::steps::{
        FETCH_COVER, FETCH_SOURCE, GENERATE_METADATA, GENERATE_SUBTITLES, TRANSLATE_SUBTITLES,
    };
    use crate::store::test_support::submit;
    use crate::store::Store;

    struct Fixture {
        scheduler: Arc<IngestScheduler>,
        tracker: StepTracker,
        factory: Arc<FakeFactory>,
        _dir: tempfile::TempDir,
    }

    fn fixture(factory: FakeFactory) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let tracker = StepTracker::new(Store::open_in_memory().unwrap());
        let factory = Arc::new(factory);
        let scheduler = Arc::new(IngestScheduler::new(
            tracker.clone(),
            factory.clone(),
            dir.path().to_path_buf(),
            Duration::from_secs(5),
        ));
        Fixture {
            scheduler,
            tracker,
            factory,
            _dir: dir,
        }
    }

    fn status_of(tracker: &StepTracker, unit_ref: &str) -> LifecycleStatus {
        tracker.store().require_unit(unit_ref).unwrap().status
    }

    fn step_status(tracker: &StepTracker, unit_ref: &str, step: &str) -> StepStatus {
        tracker.step(unit_ref, step).unwrap().unwrap().status
    }

    #[tokio::test]
    async fn idle_without_work() {
        let f = fixture(FakeFactory::new());
        assert_eq!(f.scheduler.tick().await.unwrap(), TickOutcome::Idle);
    }

    #[tokio::test]
    async fn successful_chain_makes_unit_ready() {
        let f = fixture(FakeFactory::new());
        submit(f.tracker.store(), "u1");

        let outcome = f.scheduler.tick().await.unwrap();
        assert_eq!(
            outcome,
            TickOutcome::Processed {
                unit_ref: "u1".into(),
                status: LifecycleStatus::Ready
            }
        );
        assert_eq!(f.factory.runs().len(), 5);
        let progress = f.tracker.progress("u1").unwrap();
        assert_eq!(progress.completed, 5);
        assert_eq!(progress.current_step.as_deref(), Some("publish_primary"));
    }

    #[tokio::test]
    async fn failing_step_stops_chain_and_fails_unit() {
        let factory = FakeFactory::new();
        factory.script(FETCH_COVER, Script::Fail);
        let f = fixture(factory);
        submit(f.tracker.store(), "u1");

        f.scheduler.tick().await.unwrap();

        assert_eq!(status_of(&f.tracker, "u1"), LifecycleStatus::Failed);
        assert_eq!(step_status(&f.tracker, "u1", FETCH_SOURCE), StepStatus::Completed);
        assert_eq!(step_status(&f.tracker, "u1", GENERATE_SUBTITLES), StepStatus::Completed);
        let cover = f.tracker.step("u1", FETCH_COVER).unwrap().unwrap();
        assert_eq!(cover.status, StepStatus::Failed);
        assert_eq!(cover.error_message.as_deref(), Some("fetch_cover failed"));
        assert_eq!(step_status(&f.tracker, "u1", TRANSLATE_SUBTITLES), StepStatus::Pending);
        assert_eq!(f.factory.runs().len(), 3);
    }

    #[tokio::test]
    async fn aborted_chain_is_recorded_and_not_retried() {
        let dir = tempfile::tempdir().unwrap();
        let not_a_dir = dir.path().join("work");
        std::fs::write(&not_a_dir, "occupied").unwrap();
        let tracker = StepTracker::new(Store::open_in_memory().unwrap());
        let factory = Arc::new(FakeFactory::new());
        let scheduler = IngestScheduler::new(
            tracker.clone(),
            factory.clone(),
            not_a_dir,
            Duration::from_secs(5),
        );
        submit(tracker.store(), "u1");

        let outcome = scheduler.tick().await.unwrap();
        assert!(matches!(
            outcome,
            TickOutcome::Processed { status: LifecycleStatus::Failed, .. }
        ));
        let first = tracker.step("u1", FETCH_SOURCE).unwrap().unwrap();
        assert_eq!(first.status, StepStatus::Failed);
        assert!(first.error_message.is_some_and(|m| !m.is_empty()));

        // Failed stays failed until an operator resets a step.
        assert_eq!(scheduler.tick().await.unwrap(), TickOutcome::Idle);
        assert!(factory.runs().is_empty());
        assert_eq!(status_of(&tracker, "u1"), LifecycleStatus::Failed);
    }

    #[tokio::test]
    async fn panicking_step_fails_unit_without_escaping() {
        let factory = FakeFactory::new();
        factory.script(GENERATE_SUBTITLES, Script::Panic);
        let f = fixture(factory);
        submit(f.tracker.store(), "u1");

        f.scheduler.tick().await.unwrap();
        assert_eq!(status_of(&f.tracker, "u1"), LifecycleStatus::Failed);
        let record = f.tracker.step("u1", GENERATE_SUBTITLES).unwrap().unwrap();
        assert!(record.error_message.unwrap().contains("exploded"));
    }

    #[tokio::test]
    async fn restart_recovery_then_resume_skips_completed_steps() {
        let f = fixture(FakeFactory::new());
        let store = f.tracker.store();
        submit(store, "u1");
        f.tracker
            .initialize_steps("u1", f.factory.definitions())
            .unwrap();
        store
            .compare_and_set_status("u1", LifecycleStatus::PendingIngestion, LifecycleStatus::Processing)
            .unwrap();
        for step in [FETCH_SOURCE, GENERATE_SUBTITLES] {
            f.tracker
                .update_status("u1", step, StepStatus::Completed, None)
                .unwrap();
        }
        f.tracker
            .update_status("u1", FETCH_COVER, StepStatus::Running, None)
            .unwrap();

        let reset = f.scheduler.recover().unwrap();
        assert_eq!((reset.steps, reset.units), (1, 1));
        assert_eq!(step_status(&f.tracker, "u1", FETCH_COVER), StepStatus::Pending);
        assert_eq!(status_of(&f.tracker, "u1"), LifecycleStatus::PendingIngestion);

        f.scheduler.tick().await.unwrap();
        assert_eq!(status_of(&f.tracker, "u1"), LifecycleStatus::Ready);
        assert_eq!(
            f.factory.runs(),
            vec![FETCH_COVER, TRANSLATE_SUBTITLES, GENERATE_METADATA]
        );
    }

    #[tokio::test]
    async fn retry_takes_priority_over_new_units() {
        let factory = FakeFactory::new();
        factory.script(FETCH_COVER, Script::Fail);
        let f = fixture(factory);
        submit(f.tracker.store(), "u1");
        f.scheduler.tick().await.unwrap();
        assert_eq!(status_of(&f.tracker, "u1"), LifecycleStatus::Failed);

        submit(f.tracker.store(), "u2");
        f.factory.script(FETCH_COVER, Script::Complete);
        f.tracker.reset_step("u1", FETCH_COVER).unwrap();

        assert_eq!(f.scheduler.tick().await.unwrap(), TickOutcome::Retried(1));
        assert_eq!(step_status(&f.tracker, "u1", FETCH_COVER), StepStatus::Completed);
        assert_eq!(status_of(&f.tracker, "u2"), LifecycleStatus::PendingIngestion);
        assert!(f.tracker.steps("u2").unwrap().is_empty());
    }

    #[tokio::test]
    async fn retries_continue_until_unit_is_ready() {
        let factory = FakeFactory::new();
        factory.script(FETCH_COVER, Script::Fail);
        let f = fixture(factory);
        submit(f.tracker.store(), "u1");
        f.scheduler.tick().await.unwrap();

        f.factory.script(FETCH_COVER, Script::Complete);
        f.tracker.reset_step("u1", FETCH_COVER).unwrap();

        // cover, then translate, then metadata
        for _ in 0..3 {
            assert_eq!(f.scheduler.tick().await.unwrap(), TickOutcome::Retried(1));
        }
        assert_eq!(status_of(&f.tracker, "u1"), LifecycleStatus::Ready);
        assert_eq!(f.scheduler.tick().await.unwrap(), TickOutcome::Idle);
    }

    #[tokio::test]
    async fn failed_retry_of_ready_unit_marks_it_failed() {
        let f = fixture(FakeFactory::new());
        submit(f.tracker.store(), "u1");
        f.scheduler.tick().await.unwrap();
        assert_eq!(status_of(&f.tracker, "u1"), LifecycleStatus::Ready);

        f.factory.script(GENERATE_METADATA, Script::Fail);
        f.tracker.reset_step("u1", GENERATE_METADATA).unwrap();
        f.scheduler.tick().await.unwrap();

        assert_eq!(status_of(&f.tracker, "u1"), LifecycleStatus::Failed);
    }

    #[tokio::test]
    async fn overlapping_tick_is_a_no_op() {
        let gate = Gate::default();
        let factory = FakeFactory {
            gate: Some(gate.clone()),
            ..FakeFactory::default()
        };
        let f = fixture(factory);
        submit(f.tracker.store(), "u1");

        let first = {
            let scheduler = Arc::clone(&f.scheduler);
            tokio::spawn(async move { scheduler.tick().await.unwrap() })
        };
        gate.entered.notified().await;

        assert_eq!(f.scheduler.tick().await.unwrap(), TickOutcome::Busy);
        assert_eq!(f.factory.runs().len(), 1);

        while !first.is_finished() {
            gate.release.notify_one();
            tokio::task::yield_now().await;
        }
        let outcome = first.await.unwrap();
        assert!(matches!(outcome, TickOutcome::Processed { .. }));
    }
}
